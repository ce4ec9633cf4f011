use super::{ReferenceFiles, WebbKernel, Kernel, trace_1d, wave_map};
use crate::domain::{SossError, SossResult, SpectralOrder, Subarray};
use crate::numerics::MonotoneInterpolator;
use ndarray::{Array2, ArrayView2, s};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Throughput {
    Unity,
    Curve(MonotoneInterpolator),
}

impl Throughput {
    pub fn evaluate(&self, wavelength: f64) -> f64 {
        match self {
            Self::Unity => 1.0,
            Self::Curve(curve) => curve.evaluate(wavelength),
        }
    }
}

/// Everything the forward model needs for one spectral order, aligned to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReference {
    pub order: SpectralOrder,
    pub wave_map: Array2<f64>,
    pub profile: Array2<f64>,
    pub throughput: Throughput,
    pub kernel: Kernel,
}

impl OrderReference {
    /// Same geometry with unit throughput and no line-spread convolution.
    pub fn without_response(&self) -> Self {
        Self {
            order: self.order,
            wave_map: self.wave_map.clone(),
            profile: self.profile.clone(),
            throughput: Throughput::Unity,
            kernel: Kernel::Identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceBundle {
    pub subarray: Subarray,
    pub orders: Vec<OrderReference>,
}

impl ReferenceBundle {
    pub fn order_index(&self, order: SpectralOrder) -> Option<usize> {
        self.orders.iter().position(|entry| entry.order == order)
    }

    pub fn get(&self, order: SpectralOrder) -> Option<&OrderReference> {
        self.orders.iter().find(|entry| entry.order == order)
    }

    pub fn spectral_orders(&self) -> Vec<SpectralOrder> {
        self.orders.iter().map(|entry| entry.order).collect()
    }
}

/// Crops the larger of the two images symmetrically, per axis, so both share a shape.
pub fn align_shapes(
    wave_map: ArrayView2<'_, f64>,
    profile: ArrayView2<'_, f64>,
) -> SossResult<(Array2<f64>, Array2<f64>)> {
    let (wave_rows, wave_cols) = wave_map.dim();
    let (prof_rows, prof_cols) = profile.dim();

    let crop = |larger: usize, smaller: usize, axis: &str| -> SossResult<usize> {
        let difference = larger - smaller;
        if difference % 2 != 0 {
            return Err(SossError::reference_mismatch(
                "REF.SHAPE_MISMATCH",
                format!(
                    "wave map {:?} and spatial profile {:?} differ by an odd number of {axis}",
                    (wave_rows, wave_cols),
                    (prof_rows, prof_cols)
                ),
            ));
        }
        Ok(difference / 2)
    };

    let rows = wave_rows.min(prof_rows);
    let cols = wave_cols.min(prof_cols);
    let wave_row0 = crop(wave_rows, rows, "rows")?;
    let wave_col0 = crop(wave_cols, cols, "columns")?;
    let prof_row0 = crop(prof_rows, rows, "rows")?;
    let prof_col0 = crop(prof_cols, cols, "columns")?;

    let wave = wave_map
        .slice(s![wave_row0..wave_row0 + rows, wave_col0..wave_col0 + cols])
        .to_owned();
    let prof = profile
        .slice(s![prof_row0..prof_row0 + rows, prof_col0..prof_col0 + cols])
        .to_owned();
    Ok((wave, prof))
}

/// Builds the aligned per-order references for the modelled orders (1, and 2
/// when the trace table has it).
pub fn build_reference_bundle(
    refs: &ReferenceFiles,
    detector_shape: (usize, usize),
) -> SossResult<ReferenceBundle> {
    if !refs.trace_table.has_order(1) {
        return Err(SossError::reference_mismatch(
            "REF.UNKNOWN_ORDER",
            "trace table has no spectral order 1",
        ));
    }

    let mut orders = Vec::new();
    for order in [1, 2] {
        if !refs.trace_table.has_order(order) {
            continue;
        }
        orders.push(build_order_reference(refs, order, detector_shape)?);
    }

    Ok(ReferenceBundle {
        subarray: refs.subarray,
        orders,
    })
}

fn build_order_reference(
    refs: &ReferenceFiles,
    order: SpectralOrder,
    detector_shape: (usize, usize),
) -> SossResult<OrderReference> {
    let map = wave_map(refs, order, detector_shape)?;
    let profile = refs.spec_profile.profile(order)?;
    let (mut map, profile) = align_shapes(map.view(), profile.view())?;
    if map.dim() != detector_shape {
        return Err(SossError::reference_mismatch(
            "REF.SHAPE_MISMATCH",
            format!(
                "order {order} references align to {:?}, detector is {:?}",
                map.dim(),
                detector_shape
            ),
        ));
    }

    let table = refs.trace_table.throughput(order)?;
    let curve = MonotoneInterpolator::new(&table.wavelength, &table.throughput).map_err(|error| {
        SossError::reference_mismatch(
            "REF.THROUGHPUT",
            format!("order {order} throughput table: {error}"),
        )
    })?;

    let trace = trace_1d(refs, order, detector_shape.1)?;
    let kernel = WebbKernel::new(&refs.spec_kernel, &trace.wave_centroid(detector_shape.1))?;

    let (kernel_min, kernel_max) = kernel.wavelength_range();
    let mut zeroed = 0usize;
    map.mapv_inplace(|wavelength| {
        if wavelength.is_finite() && (wavelength < kernel_min || wavelength > kernel_max) {
            zeroed += 1;
            0.0
        } else {
            wavelength
        }
    });
    debug!(order, zeroed, "wave map pixels outside the kernel range set to zero");

    Ok(OrderReference {
        order,
        wave_map: map,
        profile,
        throughput: Throughput::Curve(curve),
        kernel: Kernel::Webb(kernel),
    })
}

#[cfg(test)]
mod tests {
    use super::{Throughput, align_shapes, build_reference_bundle};
    use crate::domain::SossErrorCategory;
    use crate::reference::Kernel;
    use crate::reference::fixtures::{
        gaussian_profile, linear_trace, single_order_refs, unity_throughput,
    };
    use ndarray::Array2;

    #[test]
    fn larger_image_is_cropped_symmetrically() {
        let wave = Array2::from_shape_fn((6, 8), |(r, c)| (r * 10 + c) as f64);
        let profile = Array2::<f64>::ones((4, 8));
        let (wave, profile) = align_shapes(wave.view(), profile.view()).expect("aligned");

        assert_eq!(wave.dim(), (4, 8));
        assert_eq!(profile.dim(), (4, 8));
        assert_eq!(wave[(0, 0)], 10.0);
    }

    #[test]
    fn odd_size_difference_is_a_shape_mismatch() {
        let wave = Array2::<f64>::zeros((5, 8));
        let profile = Array2::<f64>::ones((4, 8));
        let error = align_shapes(wave.view(), profile.view()).expect_err("odd difference");
        assert_eq!(error.code(), "REF.SHAPE_MISMATCH");
        assert_eq!(error.category(), SossErrorCategory::ReferenceMismatch);
    }

    #[test]
    fn bundle_holds_aligned_order_references() {
        let shape = (20, 30);
        let mut refs = single_order_refs(shape);
        refs.trace_table.traces[0].padding = 3;
        let bundle = build_reference_bundle(&refs, shape).expect("bundle");

        assert_eq!(bundle.spectral_orders(), vec![1]);
        let order = &bundle.orders[0];
        assert_eq!(order.wave_map.dim(), shape);
        assert!((order.wave_map[(4, 0)] - 1.6).abs() < 1.0e-12);
        assert!(matches!(order.kernel, Kernel::Webb(_)));
        assert!((order.throughput.evaluate(1.3) - 1.0).abs() < 1.0e-12);
        assert_eq!(order.throughput.evaluate(5.0), 0.0);
        assert_eq!(Throughput::Unity.evaluate(5.0), 1.0);
    }

    #[test]
    fn wavelengths_outside_kernel_table_are_zeroed() {
        let shape = (20, 30);
        let mut refs = single_order_refs(shape);
        refs.spec_kernel.wavelengths = vec![1.3, 3.0];
        let bundle = build_reference_bundle(&refs, shape).expect("bundle");
        let map = &bundle.orders[0].wave_map;

        // The trace runs from 1.6 micron at column 0 to 1.2 micron at column 29.
        assert_eq!(map[(0, 29)], 0.0);
        assert!((map[(0, 0)] - 1.6).abs() < 1.0e-12);
    }

    #[test]
    fn second_order_is_included_when_present() {
        let shape = (20, 30);
        let mut refs = single_order_refs(shape);
        refs.trace_table.traces.push(linear_trace(2, 5.0, 0.9, 0.7, shape.1));
        refs.trace_table.throughputs.push(unity_throughput(2));
        refs.spec_profile.profiles.push(gaussian_profile(shape, 5.0, 1.5));
        let bundle = build_reference_bundle(&refs, shape).expect("bundle");

        assert_eq!(bundle.spectral_orders(), vec![1, 2]);
        assert_eq!(bundle.order_index(2), Some(1));

        refs.spec_profile.profiles.pop();
        let error = build_reference_bundle(&refs, shape).expect_err("missing profile");
        assert_eq!(error.code(), "REF.UNKNOWN_ORDER");
    }
}
