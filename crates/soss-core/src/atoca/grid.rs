use crate::domain::SossError;
use crate::numerics::{CubicSpline, SplineError, deterministic_argsort, is_strictly_increasing};
use ndarray::{Array2, ArrayView2};

/// Relative floor of the adaptive-grid error denominator, in units of the
/// peak estimate times the interval width.
const ADAPTIVE_ABSOLUTE_FLOOR: f64 = 1.0e-3;
const MAX_EXTRAPOLATED_NODES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GridError {
    #[error("wavelength grid needs at least two nodes, got {actual}")]
    TooFewPoints { actual: usize },
    #[error("wavelength grid must be finite and strictly increasing")]
    NotIncreasing,
    #[error("wavelength range [{min}, {max}] is empty")]
    EmptyRange { min: f64, max: f64 },
    #[error("{grids} grids were given with {estimates} estimates")]
    EstimateCountMismatch { grids: usize, estimates: usize },
    #[error("flux estimate cannot be built: {0}")]
    Estimate(#[from] SplineError),
}

impl From<GridError> for SossError {
    fn from(error: GridError) -> Self {
        match error {
            GridError::TooFewPoints { .. } | GridError::Estimate(_) => {
                SossError::insufficient_data("GRID.TOO_FEW_POINTS", error.to_string())
            }
            _ => SossError::computation("GRID.BUILD", error.to_string()),
        }
    }
}

/// Rough spectrum used to drive grid refinement and seed the Tikhonov search.
#[derive(Debug, Clone, PartialEq)]
pub enum FluxEstimate {
    Spline(CubicSpline),
    Flat,
}

impl FluxEstimate {
    /// Interpolating spline through the finite samples of a wavelength/flux table.
    pub fn from_samples(wavelength: &[f64], flux: &[f64]) -> Result<Self, GridError> {
        let (mut x, mut y): (Vec<f64>, Vec<f64>) = wavelength
            .iter()
            .zip(flux)
            .filter(|(w, f)| w.is_finite() && f.is_finite())
            .map(|(&w, &f)| (w, f))
            .unzip();
        let order = deterministic_argsort(&x);
        x = order.iter().map(|&i| x[i]).collect();
        y = order.iter().map(|&i| y[i]).collect();

        let mut keep = vec![true; x.len()];
        for i in 1..x.len() {
            keep[i] = x[i] > x[i - 1];
        }
        let x: Vec<f64> = x.iter().zip(&keep).filter(|(_, k)| **k).map(|(v, _)| *v).collect();
        let y: Vec<f64> = y.iter().zip(&keep).filter(|(_, k)| **k).map(|(v, _)| *v).collect();

        Ok(Self::Spline(CubicSpline::new(&x, &y)?))
    }

    pub fn evaluate(&self, wavelength: f64) -> f64 {
        match self {
            Self::Spline(spline) => spline.evaluate(wavelength),
            Self::Flat => 1.0,
        }
    }

    pub fn evaluate_many(&self, wavelengths: &[f64]) -> Vec<f64> {
        wavelengths.iter().map(|&w| self.evaluate(w)).collect()
    }
}

fn is_valid_wavelength(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Lower and upper bounds of a sequence of pixel centres: midpoints between
/// neighbours, mirrored at the edges. Invalid centres give NaN.
fn bounds_1d(centers: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = centers.len();
    let mut lower = vec![f64::NAN; n];
    let mut upper = vec![f64::NAN; n];

    for i in 0..n {
        let center = centers[i];
        if !is_valid_wavelength(center) {
            continue;
        }
        let left = (i > 0)
            .then(|| centers[i - 1])
            .filter(|v| is_valid_wavelength(*v))
            .map(|v| 0.5 * (center + v));
        let right = (i + 1 < n)
            .then(|| centers[i + 1])
            .filter(|v| is_valid_wavelength(*v))
            .map(|v| 0.5 * (center + v));

        let (left, right) = match (left, right) {
            (Some(left), Some(right)) => (left, right),
            (Some(left), None) => (left, 2.0 * center - left),
            (None, Some(right)) => (2.0 * center - right, right),
            (None, None) => continue,
        };
        lower[i] = left.min(right);
        upper[i] = left.max(right);
    }

    (lower, upper)
}

/// Per-pixel wavelength bounds along the dispersion (column) axis.
pub fn wave_bounds(wave_map: ArrayView2<'_, f64>) -> (Array2<f64>, Array2<f64>) {
    let mut lower = Array2::from_elem(wave_map.dim(), f64::NAN);
    let mut upper = Array2::from_elem(wave_map.dim(), f64::NAN);
    for (row_index, row) in wave_map.outer_iter().enumerate() {
        let centers: Vec<f64> = row.iter().copied().collect();
        let (lo, hi) = bounds_1d(&centers);
        for (col, (l, h)) in lo.into_iter().zip(hi).enumerate() {
            lower[(row_index, col)] = l;
            upper[(row_index, col)] = h;
        }
    }
    (lower, upper)
}

/// Grid of pixel boundaries from sorted pixel-centre wavelengths.
pub fn native_grid_from_centers(centers: &[f64]) -> Result<Vec<f64>, GridError> {
    if centers.len() < 2 {
        return Err(GridError::TooFewPoints {
            actual: centers.len(),
        });
    }
    let (mut lower, mut upper) = bounds_1d(centers);
    if lower.iter().chain(&upper).any(|v| !v.is_finite()) {
        return Err(GridError::NotIncreasing);
    }
    lower.sort_unstable_by(f64::total_cmp);
    upper.sort_unstable_by(f64::total_cmp);

    let mut grid = lower;
    if let Some(&last) = upper.last() {
        grid.push(last);
    }
    if !is_strictly_increasing(&grid) {
        return Err(GridError::NotIncreasing);
    }
    Ok(grid)
}

/// Inserts `n_os - 1` evenly spaced nodes inside every interval.
pub fn oversample_grid(grid: &[f64], n_os: usize) -> Vec<f64> {
    if n_os <= 1 || grid.len() < 2 {
        return grid.to_vec();
    }

    let mut out = Vec::with_capacity((grid.len() - 1) * n_os + 1);
    for window in grid.windows(2) {
        let step = (window[1] - window[0]) / n_os as f64;
        for k in 0..n_os {
            out.push(window[0] + step * k as f64);
        }
    }
    if let Some(&last) = grid.last() {
        out.push(last);
    }
    out
}

/// Grid of profile-weighted column centres, extended with the edge spacing
/// until it covers every pixel of the map, then oversampled.
pub fn grid_from_map_with_extrapolation(
    wave_map: ArrayView2<'_, f64>,
    profile: ArrayView2<'_, f64>,
    n_os: usize,
) -> Result<Vec<f64>, GridError> {
    let mut centers = Vec::new();
    for (column, wave_column) in wave_map.columns().into_iter().enumerate() {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (row, &wavelength) in wave_column.iter().enumerate() {
            let weight = profile[(row, column)];
            if is_valid_wavelength(wavelength) && weight.is_finite() && weight > 0.0 {
                weighted += weight * wavelength;
                total += weight;
            }
        }
        if total > 0.0 {
            centers.push(weighted / total);
        }
    }
    centers.sort_unstable_by(f64::total_cmp);
    centers.dedup();
    if centers.len() < 2 {
        return Err(GridError::TooFewPoints {
            actual: centers.len(),
        });
    }

    let (lower, upper) = wave_bounds(wave_map);
    let covered_min = lower.iter().copied().filter(|v| v.is_finite() && *v > 0.0).fold(f64::INFINITY, f64::min);
    let covered_max = upper.iter().copied().filter(|v| v.is_finite()).fold(f64::NEG_INFINITY, f64::max);

    let first_step = centers[1] - centers[0];
    let mut head = Vec::new();
    let mut node = centers[0];
    while covered_min.is_finite() && node > covered_min && head.len() < MAX_EXTRAPOLATED_NODES {
        node -= first_step;
        head.push(node);
    }
    head.reverse();

    let n = centers.len();
    let last_step = centers[n - 1] - centers[n - 2];
    let mut node = centers[n - 1];
    let mut tail = Vec::new();
    while covered_max.is_finite() && node < covered_max && tail.len() < MAX_EXTRAPOLATED_NODES {
        node += last_step;
        tail.push(node);
    }

    let grid: Vec<f64> = head.into_iter().chain(centers).chain(tail).filter(|v| *v > 0.0).collect();
    if !is_strictly_increasing(&grid) {
        return Err(GridError::NotIncreasing);
    }
    Ok(oversample_grid(&grid, n_os))
}

/// Refines `grid` by inserting interval midpoints wherever the trapezoid
/// integral of the estimate departs from Simpson's rule by more than `rtol`.
/// Worst intervals are refined first; the grid never grows beyond `max_size`.
pub fn adapt_grid(
    grid: &[f64],
    estimate: &FluxEstimate,
    max_iter: usize,
    rtol: f64,
    max_size: usize,
) -> Vec<f64> {
    let mut grid = grid.to_vec();
    for _ in 0..max_iter {
        if grid.len() < 2 || grid.len() >= max_size {
            break;
        }

        let values = estimate.evaluate_many(&grid);
        let peak = values
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0f64, |acc, v| acc.max(v.abs()));

        let mut flagged: Vec<(f64, f64)> = Vec::new();
        for i in 0..grid.len() - 1 {
            let h = grid[i + 1] - grid[i];
            let mid = grid[i] + 0.5 * h;
            if !(mid > grid[i] && mid < grid[i + 1]) {
                continue;
            }
            let f_mid = estimate.evaluate(mid);
            let trapezoid = 0.5 * h * (values[i] + values[i + 1]);
            let simpson = h * (values[i] + 4.0 * f_mid + values[i + 1]) / 6.0;
            let denominator = simpson.abs().max(ADAPTIVE_ABSOLUTE_FLOOR * peak * h);
            if !(denominator > 0.0) {
                continue;
            }
            let error = (trapezoid - simpson).abs() / denominator;
            if error.is_finite() && error > rtol {
                flagged.push((error, mid));
            }
        }
        if flagged.is_empty() {
            break;
        }

        flagged.sort_unstable_by(|lhs, rhs| rhs.0.total_cmp(&lhs.0).then(lhs.1.total_cmp(&rhs.1)));
        flagged.truncate(max_size - grid.len());
        grid.extend(flagged.into_iter().map(|(_, mid)| mid));
        grid.sort_unstable_by(f64::total_cmp);
    }
    grid
}

fn merge_sorted(into: &mut Vec<f64>, values: &[f64]) {
    into.extend_from_slice(values);
    into.sort_unstable_by(f64::total_cmp);
    into.dedup_by(|next, kept| (*next - *kept).abs() <= 1.0e-12 * kept.abs());
}

/// Builds one grid from several `(grid, estimate)` pairs listed by decreasing
/// priority. Each pair only contributes outside the span already fixed by the
/// pairs before it, so lower priority refinement never lands inside it.
pub fn make_combined_adaptive_grid(
    grids: &[Vec<f64>],
    estimates: &[FluxEstimate],
    wv_range: (f64, f64),
    rtol: f64,
    max_total_size: usize,
    max_iter: usize,
) -> Result<Vec<f64>, GridError> {
    if grids.len() != estimates.len() {
        return Err(GridError::EstimateCountMismatch {
            grids: grids.len(),
            estimates: estimates.len(),
        });
    }
    let (min, max) = wv_range;
    if !(min < max) {
        return Err(GridError::EmptyRange { min, max });
    }

    let mut combined: Vec<f64> = Vec::new();
    for (grid, estimate) in grids.iter().zip(estimates) {
        let mut clipped: Vec<f64> = grid
            .iter()
            .copied()
            .filter(|w| w.is_finite() && *w >= min && *w <= max)
            .collect();
        clipped.sort_unstable_by(f64::total_cmp);
        clipped.dedup();
        if clipped.is_empty() {
            continue;
        }

        let segments = match (combined.first().copied(), combined.last().copied()) {
            (Some(span_min), Some(span_max)) => {
                let mut below: Vec<f64> = clipped.iter().copied().filter(|w| *w < span_min).collect();
                let mut above: Vec<f64> = clipped.iter().copied().filter(|w| *w > span_max).collect();
                if !below.is_empty() {
                    below.push(span_min);
                }
                if !above.is_empty() {
                    above.insert(0, span_max);
                }
                vec![below, above]
            }
            _ => vec![clipped],
        };

        for segment in segments.into_iter().filter(|segment| !segment.is_empty()) {
            let allowed = max_total_size
                .saturating_sub(combined.len())
                .max(segment.len());
            let refined = adapt_grid(&segment, estimate, max_iter, rtol, allowed);
            merge_sorted(&mut combined, &refined);
        }
    }

    if combined.len() < 2 {
        return Err(GridError::TooFewPoints {
            actual: combined.len(),
        });
    }
    Ok(combined)
}
