//! Calibration reference records and the trace geometry derived from them.

pub mod geometry;
pub mod kernel;

pub use geometry::{
    OrderReference, ReferenceBundle, Throughput, align_shapes, build_reference_bundle,
};
pub use kernel::{ConvolutionMatrix, Kernel, KernelError, WebbKernel};

use crate::domain::{SossError, SossResult, SpectralOrder, Subarray};
use crate::numerics::{CubicSpline, deterministic_argsort};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Trace control points for one spectral order, in detector pixel coordinates
/// at the nominal pupil wheel position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReference {
    pub spectral_order: SpectralOrder,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub wavelength: Vec<f64>,
    #[serde(default)]
    pub padding: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputReference {
    pub spectral_order: SpectralOrder,
    pub wavelength: Vec<f64>,
    pub throughput: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceGeometry {
    pub nominal_pupil_position: f64,
    pub pivot_x: f64,
    pub pivot_y: f64,
    pub substrip96_offset: f64,
    pub substrip256_offset: f64,
    pub full_offset: f64,
}

impl Default for TraceGeometry {
    fn default() -> Self {
        Self {
            nominal_pupil_position: 245.76,
            pivot_x: 1024.0,
            pivot_y: 128.0,
            substrip96_offset: -10.0,
            substrip256_offset: 0.0,
            full_offset: 1792.0,
        }
    }
}

impl TraceGeometry {
    pub const fn row_offset(&self, subarray: Subarray) -> f64 {
        match subarray {
            Subarray::Substrip96 => self.substrip96_offset,
            Subarray::Substrip256 => self.substrip256_offset,
            Subarray::Full => self.full_offset,
        }
    }
}

/// Wavelength limits (microns) of the separately modelled blue end of order 2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order2Extension {
    /// No order 2 flux is modelled below this wavelength.
    pub short_cutoff: f64,
    /// Upper edge of the single-order blue model.
    pub blue_max: f64,
    /// Lower edge of the jointly fitted decontamination grid.
    pub decontamination_min: f64,
}

impl Default for Order2Extension {
    fn default() -> Self {
        Self {
            short_cutoff: 0.58,
            blue_max: 0.95,
            decontamination_min: 0.77,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceTableReference {
    pub traces: Vec<TraceReference>,
    #[serde(default)]
    pub throughputs: Vec<ThroughputReference>,
    #[serde(default)]
    pub geometry: TraceGeometry,
    #[serde(default)]
    pub order2: Order2Extension,
}

impl TraceTableReference {
    pub fn trace(&self, order: SpectralOrder) -> SossResult<&TraceReference> {
        self.traces
            .iter()
            .find(|trace| trace.spectral_order == order)
            .ok_or_else(|| unknown_order("trace", order))
    }

    pub fn throughput(&self, order: SpectralOrder) -> SossResult<&ThroughputReference> {
        self.throughputs
            .iter()
            .find(|entry| entry.spectral_order == order)
            .ok_or_else(|| unknown_order("throughput", order))
    }

    pub fn has_order(&self, order: SpectralOrder) -> bool {
        self.traces.iter().any(|trace| trace.spectral_order == order)
    }

    /// Orders with a trace solution, ascending.
    pub fn orders(&self) -> Vec<SpectralOrder> {
        let mut orders: Vec<SpectralOrder> =
            self.traces.iter().map(|trace| trace.spectral_order).collect();
        orders.sort_unstable();
        orders.dedup();
        orders
    }
}

/// Spatial profile images; entry `i` belongs to order `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecProfileReference {
    pub profiles: Vec<Array2<f64>>,
}

impl SpecProfileReference {
    pub fn profile(&self, order: SpectralOrder) -> SossResult<&Array2<f64>> {
        usize::from(order)
            .checked_sub(1)
            .and_then(|index| self.profiles.get(index))
            .ok_or_else(|| unknown_order("spatial profile", order))
    }
}

/// Line-spread kernels tabulated per wavelength. Each kernel holds
/// `2 * halfwidth * oversampling + 1` samples centred on the zero offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecKernelReference {
    pub wavelengths: Vec<f64>,
    pub kernels: Vec<Vec<f64>>,
    pub halfwidth: usize,
    #[serde(default = "default_kernel_oversampling")]
    pub oversampling: usize,
}

fn default_kernel_oversampling() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFiles {
    pub trace_table: TraceTableReference,
    pub spec_profile: SpecProfileReference,
    pub spec_kernel: SpecKernelReference,
    pub subarray: Subarray,
    pub pupil_position: f64,
}

/// Trace centre and wavelength sampled on integer detector columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace1d {
    pub columns: Vec<usize>,
    pub y: Vec<f64>,
    pub wavelength: Vec<f64>,
}

impl Trace1d {
    /// Per-column wavelength over `n_columns`, zero where the trace is absent.
    pub fn wave_centroid(&self, n_columns: usize) -> Vec<f64> {
        let mut centroid = vec![0.0; n_columns];
        for (&column, &wavelength) in self.columns.iter().zip(&self.wavelength) {
            if column < n_columns {
                centroid[column] = if wavelength.is_finite() { wavelength } else { 0.0 };
            }
        }
        centroid
    }
}

fn unknown_order(what: &str, order: SpectralOrder) -> SossError {
    SossError::reference_mismatch(
        "REF.UNKNOWN_ORDER",
        format!("no {what} reference for spectral order {order}"),
    )
}

/// Trace centre and wavelength as smooth functions of the rotated detector column.
struct TraceCurve {
    y_of_x: CubicSpline,
    wave_of_x: CubicSpline,
}

impl TraceCurve {
    fn slope(&self, x: f64) -> f64 {
        self.y_of_x.evaluate(x + 0.5) - self.y_of_x.evaluate(x - 0.5)
    }

    /// Wavelength at `(row, column)`, taken from the trace point whose normal
    /// passes through the pixel.
    fn wavelength_at(&self, row: f64, column: f64) -> f64 {
        let slope = self.slope(column);
        let along = slope * (row - self.y_of_x.evaluate(column)) / (1.0 + slope * slope);
        self.wave_of_x.evaluate(column + along)
    }
}

fn trace_curve(refs: &ReferenceFiles, order: SpectralOrder) -> SossResult<TraceCurve> {
    let trace = refs.trace_table.trace(order)?;
    if trace.x.len() != trace.y.len() || trace.x.len() != trace.wavelength.len() {
        return Err(SossError::reference_mismatch(
            "REF.TRACE_TABLE",
            format!(
                "order {order} trace columns have lengths x={}, y={}, wavelength={}",
                trace.x.len(),
                trace.y.len(),
                trace.wavelength.len()
            ),
        ));
    }

    let geometry = refs.trace_table.geometry;
    let angle = (refs.pupil_position - geometry.nominal_pupil_position).to_radians();
    let (sin, cos) = angle.sin_cos();
    let offset = geometry.row_offset(refs.subarray);

    let mut x = Vec::with_capacity(trace.x.len());
    let mut y = Vec::with_capacity(trace.y.len());
    for (&xv, &yv) in trace.x.iter().zip(&trace.y) {
        let dx = xv - geometry.pivot_x;
        let dy = yv - geometry.pivot_y;
        x.push(geometry.pivot_x + cos * dx - sin * dy);
        y.push(geometry.pivot_y + sin * dx + cos * dy + offset);
    }

    let order_index = deterministic_argsort(&x);
    let x_sorted: Vec<f64> = order_index.iter().map(|&i| x[i]).collect();
    let y_sorted: Vec<f64> = order_index.iter().map(|&i| y[i]).collect();
    let wave_sorted: Vec<f64> = order_index.iter().map(|&i| trace.wavelength[i]).collect();

    let spline_error = |error: crate::numerics::SplineError| {
        SossError::reference_mismatch(
            "REF.TRACE_TABLE",
            format!("order {order} trace cannot be interpolated: {error}"),
        )
    };
    Ok(TraceCurve {
        y_of_x: CubicSpline::new(&x_sorted, &y_sorted).map_err(spline_error)?,
        wave_of_x: CubicSpline::new(&x_sorted, &wave_sorted).map_err(spline_error)?,
    })
}

pub fn trace_1d(refs: &ReferenceFiles, order: SpectralOrder, n_columns: usize) -> SossResult<Trace1d> {
    let curve = trace_curve(refs, order)?;
    let (x_min, x_max) = curve.y_of_x.x_range();
    let first = x_min.ceil().max(0.0) as usize;
    let last = x_max.floor();
    let columns: Vec<usize> = if last < 0.0 {
        Vec::new()
    } else {
        (first..=(last as usize)).filter(|&c| c < n_columns).collect()
    };
    if columns.is_empty() {
        return Err(SossError::reference_mismatch(
            "REF.TRACE_OFF_DETECTOR",
            format!("order {order} trace does not cross any of the {n_columns} detector columns"),
        ));
    }

    let y = columns.iter().map(|&c| curve.y_of_x.evaluate(c as f64)).collect();
    let wavelength = columns
        .iter()
        .map(|&c| curve.wave_of_x.evaluate(c as f64))
        .collect();
    Ok(Trace1d {
        columns,
        y,
        wavelength,
    })
}

/// Wavelength of every pixel, padded by the trace padding on each side.
/// Pixels take the wavelength of the trace point whose normal crosses them, so
/// a tilted trace tilts the iso-wavelength lines with it. Columns the trace
/// does not cover are NaN.
pub fn wave_map(
    refs: &ReferenceFiles,
    order: SpectralOrder,
    shape: (usize, usize),
) -> SossResult<Array2<f64>> {
    let padding = refs.trace_table.trace(order)?.padding;
    let trace = trace_1d(refs, order, shape.1)?;
    let curve = trace_curve(refs, order)?;

    let padded = (shape.0 + 2 * padding, shape.1 + 2 * padding);
    let mut map = Array2::from_elem(padded, f64::NAN);
    for (&column, &centre) in trace.columns.iter().zip(&trace.wavelength) {
        if !(centre.is_finite() && centre > 0.0) {
            continue;
        }
        for (row, value) in map.column_mut(column + padding).iter_mut().enumerate() {
            let detector_row = row as f64 - padding as f64;
            let wavelength = curve.wavelength_at(detector_row, column as f64);
            if wavelength.is_finite() && wavelength > 0.0 {
                *value = wavelength;
            }
        }
    }
    Ok(map)
}
