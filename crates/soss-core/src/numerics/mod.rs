pub mod linalg;
pub mod spline;

pub use linalg::{SolveError, SparseCholesky, SymmetricSparse, solve_symmetric};
pub use spline::{CubicSpline, MonotoneInterpolator, SplineError};

/// Kahan-compensated sum; pixel sums mix bright trace cores with faint wings.
pub fn stable_sum(values: &[f64]) -> f64 {
    let (sum, _) = values.iter().fold((0.0_f64, 0.0_f64), |(sum, carry), &value| {
        let adjusted = value - carry;
        let total = sum + adjusted;
        (total, (total - sum) - adjusted)
    });
    sum
}

/// Indices that sort `values` ascending; ties keep their original order and
/// NaN sorts last.
pub fn deterministic_argsort(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    order
}

pub fn is_strictly_increasing(values: &[f64]) -> bool {
    values.iter().all(|value| value.is_finite()) && values.windows(2).all(|w| w[0] < w[1])
}

/// `count` evenly spaced values from `start` to `end`, both exact.
pub fn linear_grid(start: f64, end: f64, count: usize) -> Option<Vec<f64>> {
    if count < 2 {
        return None;
    }
    let last = count - 1;
    let step = (end - start) / last as f64;
    Some(
        (0..count)
            .map(|index| if index == last { end } else { start + step * index as f64 })
            .collect(),
    )
}

/// `count` values from `10^start` to `10^end`, both included.
pub fn logspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => linear_grid(start, end, count)
            .unwrap_or_default()
            .into_iter()
            .map(|exponent| 10f64.powf(exponent))
            .collect(),
    }
}

/// Linear interpolation, clamped to the end values outside the grid.
pub fn interpolate_linear(x: f64, x_grid: &[f64], y_grid: &[f64]) -> Option<f64> {
    let n = x_grid.len();
    if n < 2 || n != y_grid.len() || x_grid.windows(2).any(|w| w[0] > w[1]) {
        return None;
    }
    if x <= x_grid[0] {
        return Some(y_grid[0]);
    }
    if x >= x_grid[n - 1] {
        return Some(y_grid[n - 1]);
    }

    let upper = x_grid.partition_point(|&node| node < x).max(1);
    let (x0, x1) = (x_grid[upper - 1], x_grid[upper]);
    if x1 == x0 {
        return Some(y_grid[upper]);
    }
    let t = (x - x0) / (x1 - x0);
    Some(y_grid[upper - 1] + t * (y_grid[upper] - y_grid[upper - 1]))
}

/// Derivative of `y` with respect to `x`: second-order central differences on
/// non-uniform spacing, one-sided differences at both ends.
pub fn gradient(y: &[f64], x: &[f64]) -> Option<Vec<f64>> {
    let n = y.len();
    if n < 2 || x.len() != n {
        return None;
    }

    let mut out = vec![0.0; n];
    out[0] = (y[1] - y[0]) / (x[1] - x[0]);
    out[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        let hm = x[i] - x[i - 1];
        let hp = x[i + 1] - x[i];
        out[i] = (hm * hm * y[i + 1] - hp * hp * y[i - 1] + (hp * hp - hm * hm) * y[i])
            / (hm * hp * (hm + hp));
    }
    Some(out)
}

/// Median of the finite values, `None` when there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Percentile with linear interpolation between closest ranks over the finite values.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_unstable_by(f64::total_cmp);

    let q = q.clamp(0.0, 100.0);
    let position = q / 100.0 * ((finite.len() - 1) as f64);
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(finite[lower] + fraction * (finite[upper] - finite[lower]))
}

/// Finite values left after iteratively rejecting those further than `sigma`
/// standard deviations from the median.
pub fn sigma_clip(values: &[f64], sigma: f64, max_iterations: usize) -> Vec<f64> {
    let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    for _ in 0..max_iterations {
        let Some(center) = median(&kept) else {
            break;
        };
        let mean = stable_sum(&kept) / kept.len() as f64;
        let deviations: Vec<f64> = kept.iter().map(|v| (v - mean) * (v - mean)).collect();
        let std = (stable_sum(&deviations) / kept.len() as f64).sqrt();

        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= sigma * std);
        if kept.len() == before || kept.is_empty() {
            break;
        }
    }
    kept
}

/// Mean of the sigma-clipped values, `None` when nothing survives.
pub fn sigma_clipped_mean(values: &[f64], sigma: f64, max_iterations: usize) -> Option<f64> {
    let kept = sigma_clip(values, sigma, max_iterations);
    if kept.is_empty() {
        return None;
    }
    Some(stable_sum(&kept) / kept.len() as f64)
}
