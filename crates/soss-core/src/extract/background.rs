use crate::numerics::{percentile, sigma_clipped_mean};
use ndarray::{Array2, ArrayView2};

const CLIP_SIGMA: f64 = 3.0;
const CLIP_ITERATIONS: usize = 10;

/// True for pixels that must not enter the background estimate: everything
/// brighter than the fraction of the image a trace of `width` rows can cover,
/// and every non-finite pixel.
pub fn make_background_mask(data: ArrayView2<'_, f64>, width: f64) -> Array2<bool> {
    let rows = data.nrows().max(1) as f64;
    let quantile = if data.nrows() == 96 {
        100.0 * (1.0 - width / 96.0)
    } else {
        100.0 * (1.0 - 2.0 * width / rows)
    };

    let values: Vec<f64> = data.iter().copied().collect();
    match percentile(&values, quantile.clamp(0.0, 100.0)) {
        Some(threshold) => data.mapv(|value| !value.is_finite() || value > threshold),
        None => Array2::from_elem(data.dim(), true),
    }
}

/// Subtracts a per-column sigma-clipped mean of the pixels outside both masks.
/// Columns with no such pixel get a zero background.
pub fn soss_background(
    data: ArrayView2<'_, f64>,
    scimask: ArrayView2<'_, bool>,
    background_mask: ArrayView2<'_, bool>,
) -> (Array2<f64>, Vec<f64>) {
    let column_background: Vec<f64> = (0..data.ncols())
        .map(|col| {
            let samples: Vec<f64> = (0..data.nrows())
                .filter(|&row| !scimask[(row, col)] && !background_mask[(row, col)])
                .map(|row| data[(row, col)])
                .collect();
            sigma_clipped_mean(&samples, CLIP_SIGMA, CLIP_ITERATIONS).unwrap_or(0.0)
        })
        .collect();

    let mut subtracted = data.to_owned();
    for (mut column, background) in subtracted.columns_mut().into_iter().zip(&column_background) {
        column.mapv_inplace(|value| value - background);
    }
    (subtracted, column_background)
}

#[cfg(test)]
mod tests {
    use super::{make_background_mask, soss_background};
    use ndarray::Array2;

    fn image() -> Array2<f64> {
        // Flat background of 2 with a bright trace on rows 4..6.
        Array2::from_shape_fn((20, 5), |(row, col)| {
            if (4..6).contains(&row) { 100.0 } else { 2.0 + 0.1 * col as f64 }
        })
    }

    #[test]
    fn bright_rows_are_excluded_from_the_background() {
        let mut data = image();
        data[(10, 2)] = f64::NAN;
        let mask = make_background_mask(data.view(), 2.0);

        assert!(mask[(4, 0)] && mask[(5, 3)]);
        assert!(mask[(10, 2)]);
        assert!(!mask[(12, 1)]);
    }

    #[test]
    fn column_background_is_removed() {
        let data = image();
        let mut scimask = Array2::from_elem(data.dim(), false);
        scimask.column_mut(4).fill(true);
        let bkg_mask = make_background_mask(data.view(), 2.0);

        let (subtracted, background) = soss_background(data.view(), scimask.view(), bkg_mask.view());
        assert!((background[0] - 2.0).abs() < 1.0e-12);
        assert!((background[3] - 2.3).abs() < 1.0e-12);
        assert_eq!(background[4], 0.0);
        assert!(subtracted[(0, 1)].abs() < 1.0e-12);
        assert!((subtracted[(4, 1)] - 97.9).abs() < 1.0e-12);
    }
}
