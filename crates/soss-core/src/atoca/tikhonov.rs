use super::engine::{EngineError, LinearModel};
use super::grid::FluxEstimate;
use crate::numerics::{gradient, logspace, stable_sum};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const STAGE_ONE_FACTORS: usize = 10;
pub const STAGE_TWO_FACTORS: usize = 20;
/// Half width, in decades, of the refinement around the first-stage winner.
pub const REFINE_HALF_RANGE_DEX: f64 = 2.0;
/// Half width, in decades, of the first stage around the scale estimate.
pub const SEED_HALF_RANGE_DEX: f64 = 4.0;
/// Largest mean relative excess over the best chi2 variants accepted by [`FitMode::All`].
pub const ALL_MODE_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Largest factor whose three chi2 variants all stay close to their best value.
    #[default]
    All,
    /// Smallest chi2.
    Chi2,
    /// Elbow of log chi2 against log factor.
    #[serde(rename = "d_chi2")]
    DChi2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TikhonovTest {
    pub factor: f64,
    pub solution: Vec<f64>,
    pub chi2: f64,
    pub chi2_soft_l1: f64,
    pub chi2_cauchy: f64,
    /// First differences of the solution.
    pub reg: Vec<f64>,
}

impl TikhonovTest {
    /// Squared norm of the regularisation vector, ignoring NaN.
    pub fn penalty(&self) -> f64 {
        let squares: Vec<f64> = self
            .reg
            .iter()
            .filter(|value| value.is_finite())
            .map(|value| value * value)
            .collect();
        stable_sum(&squares)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TikhonovTests {
    pub tests: Vec<TikhonovTest>,
}

impl TikhonovTests {
    pub fn append(&mut self, other: TikhonovTests) {
        self.tests.extend(other.tests);
    }

    pub fn factors(&self) -> Vec<f64> {
        self.tests.iter().map(|test| test.factor).collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn best_factor(&self, mode: FitMode) -> Option<f64> {
        let mut usable: Vec<&TikhonovTest> = self
            .tests
            .iter()
            .filter(|test| {
                test.factor.is_finite()
                    && test.factor > 0.0
                    && test.chi2.is_finite()
                    && test.chi2_soft_l1.is_finite()
                    && test.chi2_cauchy.is_finite()
            })
            .collect();
        if usable.is_empty() {
            return None;
        }
        usable.sort_by(|lhs, rhs| lhs.factor.total_cmp(&rhs.factor));

        match mode {
            FitMode::All => best_all(&usable),
            FitMode::Chi2 => usable
                .iter()
                .rev()
                .min_by(|lhs, rhs| lhs.chi2.total_cmp(&rhs.chi2))
                .map(|test| test.factor),
            FitMode::DChi2 => best_curvature(&usable).or_else(|| best_all(&usable)),
        }
    }
}

fn best_all(tests: &[&TikhonovTest]) -> Option<f64> {
    let variants: [fn(&TikhonovTest) -> f64; 3] = [
        |test| test.chi2,
        |test| test.chi2_soft_l1,
        |test| test.chi2_cauchy,
    ];
    let minima: Vec<f64> = variants
        .iter()
        .map(|variant| tests.iter().map(|test| variant(test)).fold(f64::INFINITY, f64::min))
        .collect();

    let scores: Vec<f64> = tests
        .iter()
        .map(|test| {
            variants
                .iter()
                .zip(&minima)
                .map(|(variant, &min)| (variant(test) - min) / min.abs().max(f64::MIN_POSITIVE))
                .sum::<f64>()
                / variants.len() as f64
        })
        .collect();

    tests
        .iter()
        .zip(&scores)
        .rev()
        .find(|(_, score)| **score <= ALL_MODE_TOLERANCE)
        .or_else(|| {
            tests
                .iter()
                .zip(&scores)
                .min_by(|lhs, rhs| lhs.1.total_cmp(rhs.1))
        })
        .map(|(test, _)| test.factor)
}

fn best_curvature(tests: &[&TikhonovTest]) -> Option<f64> {
    if tests.len() < 3 || tests.iter().any(|test| test.chi2 <= 0.0) {
        return None;
    }
    let log_factor: Vec<f64> = tests.iter().map(|test| test.factor.log10()).collect();
    let log_chi2: Vec<f64> = tests.iter().map(|test| test.chi2.log10()).collect();
    let first = gradient(&log_chi2, &log_factor)?;
    let second = gradient(&first, &log_factor)?;

    (1..tests.len() - 1)
        .filter(|&i| second[i].is_finite())
        .max_by(|&lhs, &rhs| second[lhs].total_cmp(&second[rhs]))
        .map(|i| tests[i].factor)
}

pub fn first_differences(flux: &[f64]) -> Vec<f64> {
    flux.windows(2).map(|pair| pair[1] - pair[0]).collect()
}

/// Scale seed for the factor search: `sqrt(N_pix / ‖D f_est‖²)`, 1 when degenerate.
pub fn estimate_tikhonov_factor<M: LinearModel + ?Sized>(model: &M, estimate: &FluxEstimate) -> f64 {
    let flux = estimate.evaluate_many(model.wave_grid());
    let squares: Vec<f64> = first_differences(&flux)
        .into_iter()
        .filter(|value| value.is_finite())
        .map(|value| value * value)
        .collect();
    let norm = stable_sum(&squares);
    let factor = (model.valid_pixel_count() as f64 / norm).sqrt();
    if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        1.0
    }
}

pub fn run_tikhonov_tests<M: LinearModel + ?Sized>(
    model: &M,
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    factors: &[f64],
) -> Result<TikhonovTests, EngineError> {
    let solutions = model.solve_many(data, err, factors)?;
    let mut tests = Vec::with_capacity(factors.len());
    for (&factor, solution) in factors.iter().zip(solutions) {
        let z: Vec<f64> = model
            .normalized_residuals(&solution, data, err)?
            .into_iter()
            .filter(|value| value.is_finite())
            .map(|value| value * value)
            .collect();
        let count = z.len().max(1) as f64;
        let soft_l1: Vec<f64> = z.iter().map(|z| 2.0 * ((1.0 + z).sqrt() - 1.0)).collect();
        let cauchy: Vec<f64> = z.iter().map(|z| z.ln_1p()).collect();

        tests.push(TikhonovTest {
            factor,
            reg: first_differences(&solution),
            solution,
            chi2: stable_sum(&z) / count,
            chi2_soft_l1: stable_sum(&soft_l1) / count,
            chi2_cauchy: stable_sum(&cauchy) / count,
        });
    }
    Ok(TikhonovTests { tests })
}

/// Coarse pass over `log_range` picked with [`FitMode::All`], then a finer pass
/// around the winner picked with [`FitMode::DChi2`]. Returns the chosen factor
/// and every test of both passes.
pub fn two_stage_search<M: LinearModel + ?Sized>(
    model: &M,
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    log_range: (f64, f64),
) -> Result<(f64, TikhonovTests), EngineError> {
    let coarse = logspace(log_range.0, log_range.1, STAGE_ONE_FACTORS);
    let mut all_tests = run_tikhonov_tests(model, data, err, &coarse)?;
    let first = all_tests
        .best_factor(FitMode::All)
        .unwrap_or_else(|| 10f64.powf(0.5 * (log_range.0 + log_range.1)));
    debug!(factor = first, "coarse Tikhonov pass");

    let center = first.log10();
    let fine = logspace(
        center - REFINE_HALF_RANGE_DEX,
        center + REFINE_HALF_RANGE_DEX,
        STAGE_TWO_FACTORS,
    );
    let refined = run_tikhonov_tests(model, data, err, &fine)?;
    let best = refined.best_factor(FitMode::DChi2).unwrap_or(first);
    debug!(factor = best, "refined Tikhonov pass");

    all_tests.append(refined);
    Ok((best, all_tests))
}
