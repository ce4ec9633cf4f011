use ndarray::{Array2, ArrayView2};

/// Column sums of one box aperture.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxExtraction {
    pub flux: Vec<f64>,
    pub flux_err: Vec<f64>,
    pub npix: Vec<f64>,
}

/// Fraction of every pixel row covered by `[y - width / 2, y + width / 2]`
/// around the trace centre of each listed column.
pub fn box_weights(
    ytrace: &[f64],
    columns: &[usize],
    width: f64,
    shape: (usize, usize),
) -> Array2<f64> {
    let (rows, cols) = shape;
    let mut weights = Array2::zeros(shape);
    for (&column, &y) in columns.iter().zip(ytrace) {
        if column >= cols || !y.is_finite() {
            continue;
        }
        let lower = y - 0.5 * width;
        let upper = y + 0.5 * width;
        for row in 0..rows {
            let top = upper.min(row as f64 + 0.5);
            let bottom = lower.max(row as f64 - 0.5);
            let overlap = (top - bottom).clamp(0.0, 1.0);
            if overlap > 0.0 {
                weights[(row, column)] = overlap;
            }
        }
    }
    weights
}

/// Weighted column sums of `data` over unmasked pixels, errors in quadrature.
/// Columns without a usable pixel are NaN.
pub fn box_extract(
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    mask: ArrayView2<'_, bool>,
    weights: ArrayView2<'_, f64>,
) -> BoxExtraction {
    let cols = data.ncols();
    let mut flux = vec![0.0; cols];
    let mut variance = vec![0.0; cols];
    let mut npix = vec![0.0; cols];

    for ((row, col), &weight) in weights.indexed_iter() {
        if !(weight > 0.0) || mask[(row, col)] {
            continue;
        }
        let (value, sigma) = (data[(row, col)], err[(row, col)]);
        if !value.is_finite() || !sigma.is_finite() {
            continue;
        }
        flux[col] += weight * value;
        variance[col] += (weight * sigma).powi(2);
        npix[col] += weight;
    }

    let flux_err = variance
        .iter()
        .zip(&npix)
        .map(|(&var, &n)| if n > 0.0 { var.sqrt() } else { f64::NAN })
        .collect();
    for (value, &n) in flux.iter_mut().zip(&npix) {
        if !(n > 0.0) {
            *value = f64::NAN;
        }
    }

    BoxExtraction {
        flux,
        flux_err,
        npix,
    }
}

/// Replaces the error of every pixel in `to_estimate` by the error of the
/// valid pixel whose data value is closest.
pub fn estimate_error_nearest_data(
    err: ArrayView2<'_, f64>,
    data: ArrayView2<'_, f64>,
    to_estimate: ArrayView2<'_, bool>,
    valid: ArrayView2<'_, bool>,
) -> Array2<f64> {
    let mut reference: Vec<(f64, f64)> = data
        .indexed_iter()
        .filter(|(pixel, value)| valid[*pixel] && value.is_finite() && err[*pixel].is_finite())
        .map(|(pixel, &value)| (value, err[pixel]))
        .collect();
    let mut out = err.to_owned();
    if reference.is_empty() {
        return out;
    }
    reference.sort_unstable_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));

    for ((pixel, &value), estimated) in data.indexed_iter().zip(out.iter_mut()) {
        if !to_estimate[pixel] || !value.is_finite() {
            continue;
        }
        let upper = reference.partition_point(|(reference_value, _)| *reference_value < value);
        let nearest = match (upper.checked_sub(1), reference.get(upper)) {
            (Some(lower), Some(above)) => {
                if value - reference[lower].0 <= above.0 - value {
                    reference[lower]
                } else {
                    *above
                }
            }
            (Some(lower), None) => reference[lower],
            (None, Some(above)) => *above,
            (None, None) => continue,
        };
        *estimated = nearest.1;
    }
    out
}
