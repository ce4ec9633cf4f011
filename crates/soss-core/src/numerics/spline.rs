use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplineError {
    #[error("spline requires at least {required} points, got {actual}")]
    TooFewPoints { required: usize, actual: usize },
    #[error("spline abscissa length {x_len} does not match ordinate length {y_len}")]
    LengthMismatch { x_len: usize, y_len: usize },
    #[error("spline abscissa must be strictly increasing (index {index})")]
    NotIncreasing { index: usize },
    #[error("spline input holds a non-finite value at index {index}")]
    NonFinite { index: usize },
}

fn validate_nodes(x: &[f64], y: &[f64], required: usize) -> Result<(), SplineError> {
    if x.len() != y.len() {
        return Err(SplineError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    if x.len() < required {
        return Err(SplineError::TooFewPoints {
            required,
            actual: x.len(),
        });
    }
    if let Some(index) = x
        .iter()
        .zip(y)
        .position(|(xv, yv)| !xv.is_finite() || !yv.is_finite())
    {
        return Err(SplineError::NonFinite { index });
    }
    if let Some(index) = x.windows(2).position(|w| w[0] >= w[1]) {
        return Err(SplineError::NotIncreasing { index: index + 1 });
    }
    Ok(())
}

fn segment_index(x: &[f64], value: f64) -> usize {
    let last_segment = x.len() - 2;
    x.partition_point(|&node| node <= value)
        .saturating_sub(1)
        .min(last_segment)
}

/// Natural interpolating cubic spline. Outside the node range the end
/// polynomials are extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    second_derivatives: Vec<f64>,
}

impl CubicSpline {
    pub fn new(x: &[f64], y: &[f64]) -> Result<Self, SplineError> {
        validate_nodes(x, y, 2)?;
        let n = x.len();
        let mut second_derivatives = vec![0.0; n];

        if n > 2 {
            // Thomas algorithm on the interior equations, natural end conditions.
            let mut diag = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            let mut upper = vec![0.0; n];
            for i in 1..n - 1 {
                let h_prev = x[i] - x[i - 1];
                let h_next = x[i + 1] - x[i];
                diag[i] = 2.0 * (h_prev + h_next);
                upper[i] = h_next;
                rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h_next - (y[i] - y[i - 1]) / h_prev);
                if i > 1 {
                    let factor = h_prev / diag[i - 1];
                    diag[i] -= factor * upper[i - 1];
                    rhs[i] -= factor * rhs[i - 1];
                }
            }
            for i in (1..n - 1).rev() {
                let next = if i + 1 < n - 1 {
                    second_derivatives[i + 1]
                } else {
                    0.0
                };
                second_derivatives[i] = (rhs[i] - upper[i] * next) / diag[i];
            }
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            second_derivatives,
        })
    }

    pub fn x_range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    pub fn evaluate(&self, value: f64) -> f64 {
        let i = segment_index(&self.x, value);
        let h = self.x[i + 1] - self.x[i];
        let m0 = self.second_derivatives[i];
        let m1 = self.second_derivatives[i + 1];
        let a = (self.x[i + 1] - value) / h;
        let b = (value - self.x[i]) / h;

        a * self.y[i]
            + b * self.y[i + 1]
            + ((a * a * a - a) * m0 + (b * b * b - b) * m1) * h * h / 6.0
    }

    pub fn evaluate_many(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&value| self.evaluate(value)).collect()
    }
}

/// Piecewise cubic Hermite interpolation with Fritsch-Carlson slopes.
/// Evaluates to zero outside the tabulated range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonotoneInterpolator {
    x: Vec<f64>,
    y: Vec<f64>,
    slopes: Vec<f64>,
}

impl MonotoneInterpolator {
    pub fn new(x: &[f64], y: &[f64]) -> Result<Self, SplineError> {
        validate_nodes(x, y, 2)?;
        let n = x.len();
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        let delta: Vec<f64> = (0..n - 1).map(|i| (y[i + 1] - y[i]) / h[i]).collect();

        let mut slopes = vec![0.0; n];
        if n == 2 {
            slopes[0] = delta[0];
            slopes[1] = delta[0];
        } else {
            for k in 1..n - 1 {
                if delta[k - 1] * delta[k] > 0.0 {
                    let w1 = 2.0 * h[k] + h[k - 1];
                    let w2 = h[k] + 2.0 * h[k - 1];
                    slopes[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
                }
            }
            slopes[0] = end_slope(h[0], h[1], delta[0], delta[1]);
            slopes[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
        }

        Ok(Self {
            x: x.to_vec(),
            y: y.to_vec(),
            slopes,
        })
    }

    pub fn evaluate(&self, value: f64) -> f64 {
        let n = self.x.len();
        if !(value >= self.x[0] && value <= self.x[n - 1]) {
            return 0.0;
        }

        let i = segment_index(&self.x, value);
        let h = self.x[i + 1] - self.x[i];
        let t = (value - self.x[i]) / h;
        let t2 = t * t;
        let t3 = t2 * t;

        (2.0 * t3 - 3.0 * t2 + 1.0) * self.y[i]
            + (t3 - 2.0 * t2 + t) * h * self.slopes[i]
            + (-2.0 * t3 + 3.0 * t2) * self.y[i + 1]
            + (t3 - t2) * h * self.slopes[i + 1]
    }
}

fn end_slope(h0: f64, h1: f64, delta0: f64, delta1: f64) -> f64 {
    let slope = ((2.0 * h0 + h1) * delta0 - h0 * delta1) / (h0 + h1);
    if slope.signum() != delta0.signum() {
        0.0
    } else if delta0.signum() != delta1.signum() && slope.abs() > 3.0 * delta0.abs() {
        3.0 * delta0
    } else {
        slope
    }
}
