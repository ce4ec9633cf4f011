use super::grid::wave_bounds;
use crate::domain::{SossError, SpectralOrder};
use crate::numerics::{
    SolveError, SparseCholesky, SymmetricSparse, is_strictly_increasing, solve_symmetric,
    stable_sum,
};
use crate::reference::{ConvolutionMatrix, Kernel, OrderReference, Throughput};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeMap;

/// Spatial-profile level below which a pixel is not modelled, for engines
/// that are only used to project a known flux.
pub const DEFAULT_ENGINE_THRESHOLD: f64 = 1.0e-5;
/// Relative ridge added to the unregularised normal equations.
const UNREGULARIZED_RIDGE: f64 = 1.0e-10;
/// Largest system retried densely when the sparse LLᵀ breaks down.
const DENSE_FALLBACK_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not enough unmasked pixels to model spectral orders {orders:?}")]
pub struct MaskOverlapError {
    pub orders: Vec<SpectralOrder>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    MaskOverlap(#[from] MaskOverlapError),
    #[error("extraction engine needs at least one spectral order")]
    NoOrders,
    #[error("{masks} trace masks were given for {orders} orders")]
    MaskCount { orders: usize, masks: usize },
    #[error("order {order} arrays have shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        order: SpectralOrder,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("image has shape {actual:?}, engine models {expected:?}")]
    ImageShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("wavelength grid must hold at least two finite, strictly increasing nodes")]
    InvalidGrid,
    #[error("flux vector holds {actual} values, the grid holds {expected}")]
    FluxLength { expected: usize, actual: usize },
    #[error("no modelled pixel has a finite value and a positive error")]
    NoValidData,
    #[error(transparent)]
    Solve(#[from] SolveError),
}

impl From<EngineError> for SossError {
    fn from(error: EngineError) -> Self {
        match &error {
            EngineError::MaskOverlap(_) | EngineError::NoValidData => {
                SossError::insufficient_data("ENGINE.MASK_OVERLAP", error.to_string())
            }
            EngineError::Solve(_) => SossError::computation("ENGINE.SOLVE", error.to_string()),
            EngineError::InvalidGrid => SossError::computation("ENGINE.GRID", error.to_string()),
            _ => SossError::internal("ENGINE.SHAPE", error.to_string()),
        }
    }
}

/// Borrowed per-order inputs of the forward model.
#[derive(Debug, Clone, Copy)]
pub struct EngineOrder<'a> {
    pub order: SpectralOrder,
    pub wave_map: ArrayView2<'a, f64>,
    pub profile: ArrayView2<'a, f64>,
    pub throughput: &'a Throughput,
    pub kernel: &'a Kernel,
}

impl<'a> From<&'a OrderReference> for EngineOrder<'a> {
    fn from(reference: &'a OrderReference) -> Self {
        Self {
            order: reference.order,
            wave_map: reference.wave_map.view(),
            profile: reference.profile.view(),
            throughput: &reference.throughput,
            kernel: &reference.kernel,
        }
    }
}

/// Linear map from a flux sampled on a wavelength grid to detector pixels.
pub trait LinearModel {
    fn wave_grid(&self) -> &[f64];

    /// Number of pixels the model is fitted to.
    fn valid_pixel_count(&self) -> usize;

    /// Least-squares flux. `None` solves without regularisation; grid nodes no
    /// pixel constrains are then NaN.
    fn solve(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
        factor: Option<f64>,
    ) -> Result<Vec<f64>, EngineError>;

    fn solve_many(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
        factors: &[f64],
    ) -> Result<Vec<Vec<f64>>, EngineError> {
        factors
            .iter()
            .map(|&factor| self.solve(data, err, Some(factor)))
            .collect()
    }

    /// Projects `flux` onto the detector; pixels outside the model get `fill_value`.
    fn rebuild(&self, flux: &[f64], fill_value: f64) -> Result<Array2<f64>, EngineError>;

    /// `(data - model) / err` over fitted pixels with usable data.
    fn normalized_residuals(
        &self,
        flux: &[f64],
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
    ) -> Result<Vec<f64>, EngineError>;

    /// Gaussian log-likelihood up to a constant.
    fn loglikelihood(
        &self,
        flux: &[f64],
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
    ) -> Result<f64, EngineError> {
        let squares: Vec<f64> = self
            .normalized_residuals(flux, data, err)?
            .into_iter()
            .filter(|r| r.is_finite())
            .map(|r| r * r)
            .collect();
        Ok(-0.5 * stable_sum(&squares))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SparseRow {
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseRow {
    fn dot(&self, flux: &[f64]) -> f64 {
        self.indices
            .iter()
            .zip(&self.values)
            .map(|(&i, &value)| value * flux[i])
            .sum()
    }
}

/// `AᵀWA` in sparse lower storage. The first off-diagonal is always stored so
/// the Tikhonov term shares the data term's pattern.
struct NormalSystem {
    matrix: SymmetricSparse,
    rhs: Vec<f64>,
}

/// ATOCA forward model: every modelled pixel integrates
/// `P · T(λ) · λ · (K f)(λ)` over its wavelength bounds, summed over orders.
#[derive(Debug, Clone)]
pub struct ExtractionEngine {
    shape: (usize, usize),
    wave_grid: Vec<f64>,
    orders: Vec<SpectralOrder>,
    convolutions: Vec<ConvolutionMatrix>,
    masks: Vec<Array2<bool>>,
    pixels: Vec<(usize, usize)>,
    rows: Vec<SparseRow>,
}

impl ExtractionEngine {
    /// `mask_trace_profile[i]` and `global_mask` are true where a pixel must not be modelled.
    pub fn new(
        orders: &[EngineOrder<'_>],
        wave_grid: &[f64],
        mask_trace_profile: &[Array2<bool>],
        global_mask: Option<ArrayView2<'_, bool>>,
        threshold: f64,
    ) -> Result<Self, EngineError> {
        let first = orders.first().ok_or(EngineError::NoOrders)?;
        if mask_trace_profile.len() != orders.len() {
            return Err(EngineError::MaskCount {
                orders: orders.len(),
                masks: mask_trace_profile.len(),
            });
        }
        if wave_grid.len() < 2 || !is_strictly_increasing(wave_grid) {
            return Err(EngineError::InvalidGrid);
        }

        let shape = first.wave_map.dim();
        for (order, mask) in orders.iter().zip(mask_trace_profile) {
            for actual in [order.wave_map.dim(), order.profile.dim(), mask.dim()] {
                if actual != shape {
                    return Err(EngineError::ShapeMismatch {
                        order: order.order,
                        expected: shape,
                        actual,
                    });
                }
            }
        }
        if let Some(global) = &global_mask {
            if global.dim() != shape {
                return Err(EngineError::ShapeMismatch {
                    order: first.order,
                    expected: shape,
                    actual: global.dim(),
                });
            }
        }

        let mut convolutions = Vec::with_capacity(orders.len());
        let mut convolved_grids = Vec::with_capacity(orders.len());
        let mut masks = Vec::with_capacity(orders.len());
        let mut bounds = Vec::with_capacity(orders.len());
        let mut empty_orders = Vec::new();
        for (order, trace_mask) in orders.iter().zip(mask_trace_profile) {
            let convolution = order.kernel.convolution_matrix(wave_grid);
            let convolved = convolution.convolved_grid(wave_grid);
            let (lower, upper) = wave_bounds(order.wave_map);

            let mask = Array2::from_shape_fn(shape, |pixel| {
                let excluded = trace_mask[pixel]
                    || global_mask.as_ref().is_some_and(|global| global[pixel])
                    || !(order.profile[pixel] >= threshold)
                    || !(order.wave_map[pixel].is_finite() && order.wave_map[pixel] > 0.0);
                excluded
                    || convolved.len() < 2
                    || !(lower[pixel] >= convolved[0])
                    || !(upper[pixel] <= convolved[convolved.len() - 1])
            });
            if mask.iter().all(|&masked| masked) {
                empty_orders.push(order.order);
            }

            convolutions.push(convolution);
            convolved_grids.push(convolved);
            masks.push(mask);
            bounds.push((lower, upper));
        }
        if !empty_orders.is_empty() {
            return Err(MaskOverlapError {
                orders: empty_orders,
            }
            .into());
        }

        let pixels: Vec<(usize, usize)> = (0..shape.0)
            .flat_map(|row| (0..shape.1).map(move |col| (row, col)))
            .filter(|&pixel| masks.iter().any(|mask| !mask[pixel]))
            .collect();

        let responses: Vec<Vec<f64>> = orders
            .iter()
            .zip(&convolved_grids)
            .map(|(order, convolved)| {
                convolved
                    .iter()
                    .map(|&wavelength| order.throughput.evaluate(wavelength) * wavelength)
                    .collect()
            })
            .collect();

        let n = wave_grid.len();
        let mut scratch = vec![0.0; n];
        let mut touched = vec![false; n];
        let mut rows = Vec::with_capacity(pixels.len());
        for &pixel in &pixels {
            let mut indices = Vec::new();
            for (i, order) in orders.iter().enumerate() {
                if masks[i][pixel] {
                    continue;
                }
                let convolution = &convolutions[i];
                let weights =
                    segment_weights(&convolved_grids[i], bounds[i].0[pixel], bounds[i].1[pixel]);
                let profile = order.profile[pixel];
                for (q, weight) in weights {
                    let coefficient = profile * weight * responses[i][q];
                    for &(g, kernel_weight) in &convolution.rows()[q] {
                        if !touched[g] {
                            touched[g] = true;
                            indices.push(g);
                        }
                        scratch[g] += coefficient * kernel_weight;
                    }
                }
            }
            indices.sort_unstable();
            let values = indices.iter().map(|&g| scratch[g]).collect();
            for &g in &indices {
                scratch[g] = 0.0;
                touched[g] = false;
            }
            rows.push(SparseRow { indices, values });
        }

        Ok(Self {
            shape,
            wave_grid: wave_grid.to_vec(),
            orders: orders.iter().map(|order| order.order).collect(),
            convolutions,
            masks,
            pixels,
            rows,
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn orders(&self) -> &[SpectralOrder] {
        &self.orders
    }

    /// True where order `i` is not modelled.
    pub fn order_mask(&self, i: usize) -> &Array2<bool> {
        &self.masks[i]
    }

    /// Grid nodes on which order `i`'s convolved flux is defined.
    pub fn convolved_grid(&self, i: usize) -> Vec<f64> {
        self.convolutions[i].convolved_grid(&self.wave_grid)
    }

    /// Order `i`'s kernel applied to `flux`.
    pub fn convolve(&self, i: usize, flux: &[f64]) -> Result<Vec<f64>, EngineError> {
        self.check_flux(flux)?;
        Ok(self.convolutions[i].apply(flux))
    }

    fn check_flux(&self, flux: &[f64]) -> Result<(), EngineError> {
        if flux.len() != self.wave_grid.len() {
            return Err(EngineError::FluxLength {
                expected: self.wave_grid.len(),
                actual: flux.len(),
            });
        }
        Ok(())
    }

    fn check_image(&self, image: ArrayView2<'_, f64>) -> Result<(), EngineError> {
        if image.dim() != self.shape {
            return Err(EngineError::ImageShape {
                expected: self.shape,
                actual: image.dim(),
            });
        }
        Ok(())
    }

    fn normal_system(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
    ) -> Result<NormalSystem, EngineError> {
        self.check_image(data)?;
        self.check_image(err)?;

        let n = self.wave_grid.len();
        let mut columns: Vec<BTreeMap<usize, f64>> = (0..n)
            .map(|j| {
                let mut column = BTreeMap::new();
                if j + 1 < n {
                    column.insert(j + 1, 0.0);
                }
                column
            })
            .collect();
        let mut rhs = vec![0.0; n];
        let mut used = 0usize;
        for (&pixel, row) in self.pixels.iter().zip(&self.rows) {
            let (value, sigma) = (data[pixel], err[pixel]);
            if !value.is_finite() || !(sigma.is_finite() && sigma > 0.0) {
                continue;
            }
            let weight = 1.0 / (sigma * sigma);
            for (a, (&i, &ai)) in row.indices.iter().zip(&row.values).enumerate() {
                rhs[i] += weight * ai * value;
                for (&j, &aj) in row.indices[..=a].iter().zip(&row.values[..=a]) {
                    *columns[j].entry(i).or_insert(0.0) += weight * ai * aj;
                }
            }
            used += 1;
        }
        if used == 0 {
            return Err(EngineError::NoValidData);
        }

        Ok(NormalSystem {
            matrix: SymmetricSparse::from_columns(columns),
            rhs,
        })
    }

    /// Adds `factor² DᵀD` for the first-difference operator `D` to a copy of the values.
    fn solve_regularized(
        &self,
        system: &NormalSystem,
        cholesky: &SparseCholesky,
        factor: f64,
    ) -> Result<Vec<f64>, EngineError> {
        let matrix = &system.matrix;
        let n = matrix.dimension();
        let alpha2 = factor * factor;
        let mut values = matrix.values().to_vec();
        for i in 0..n {
            let neighbours = if i == 0 || i == n - 1 { 1.0 } else { 2.0 };
            if let Some(k) = matrix.position(i, i) {
                values[k] += alpha2 * neighbours;
            }
            if let Some(k) = matrix.position(i + 1, i) {
                values[k] -= alpha2;
            }
        }
        Ok(solve_sparse(matrix, cholesky, &values, &system.rhs)?)
    }

    /// Least squares on the nodes the data constrain, with a tiny ridge.
    fn solve_unregularized(&self, system: &NormalSystem) -> Result<Vec<f64>, EngineError> {
        let matrix = &system.matrix;
        let n = matrix.dimension();
        let active: Vec<usize> = (0..n).filter(|&i| matrix.diagonal(i) > 0.0).collect();
        if active.is_empty() {
            return Err(EngineError::NoValidData);
        }
        let max_diagonal = active
            .iter()
            .map(|&i| matrix.diagonal(i))
            .fold(0.0, f64::max);
        let ridge = UNREGULARIZED_RIDGE * max_diagonal;

        let reduced = matrix.submatrix(&active);
        let mut values = reduced.values().to_vec();
        for a in 0..active.len() {
            if let Some(k) = reduced.position(a, a) {
                values[k] += ridge;
            }
        }
        let rhs: Vec<f64> = active.iter().map(|&i| system.rhs[i]).collect();
        let cholesky = SparseCholesky::analyze(&reduced)?;
        let solution = solve_sparse(&reduced, &cholesky, &values, &rhs)?;

        let mut flux = vec![f64::NAN; n];
        for (&i, value) in active.iter().zip(solution) {
            flux[i] = value;
        }
        Ok(flux)
    }

    /// Stored entries of the lower triangle of `AᵀWA` for `data` and `err`.
    pub fn normal_nonzeros(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
    ) -> Result<usize, EngineError> {
        Ok(self.normal_system(data, err)?.matrix.nonzeros())
    }
}

fn solve_sparse(
    matrix: &SymmetricSparse,
    cholesky: &SparseCholesky,
    values: &[f64],
    rhs: &[f64],
) -> Result<Vec<f64>, SolveError> {
    match cholesky.solve(values, rhs) {
        Err(SolveError::FactorizationFailed { .. })
            if matrix.dimension() <= DENSE_FALLBACK_LIMIT =>
        {
            solve_symmetric(&matrix.to_dense_lower(values), rhs)
        }
        result => result,
    }
}

/// Integration weights on `nodes` of a function linear between nodes, over `[lower, upper]`.
fn segment_weights(nodes: &[f64], lower: f64, upper: f64) -> Vec<(usize, f64)> {
    let mut weights: Vec<(usize, f64)> = Vec::new();
    if nodes.len() < 2 || !(upper > lower) {
        return weights;
    }
    let mut add = |index: usize, weight: f64| match weights.last_mut() {
        Some((last, value)) if *last == index => *value += weight,
        _ => weights.push((index, weight)),
    };

    let mut k = nodes.partition_point(|&node| node <= lower).saturating_sub(1);
    while k + 1 < nodes.len() && nodes[k] < upper {
        let a = lower.max(nodes[k]);
        let b = upper.min(nodes[k + 1]);
        if b > a {
            let width = nodes[k + 1] - nodes[k];
            let ta = (a - nodes[k]) / width;
            let tb = (b - nodes[k]) / width;
            let half = 0.5 * (b - a);
            add(k, half * (2.0 - ta - tb));
            add(k + 1, half * (ta + tb));
        }
        k += 1;
    }
    weights
}

impl LinearModel for ExtractionEngine {
    fn wave_grid(&self) -> &[f64] {
        &self.wave_grid
    }

    fn valid_pixel_count(&self) -> usize {
        self.pixels.len()
    }

    fn solve(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
        factor: Option<f64>,
    ) -> Result<Vec<f64>, EngineError> {
        let system = self.normal_system(data, err)?;
        match factor {
            Some(factor) if factor > 0.0 => {
                let cholesky = SparseCholesky::analyze(&system.matrix)?;
                self.solve_regularized(&system, &cholesky, factor)
            }
            _ => self.solve_unregularized(&system),
        }
    }

    fn solve_many(
        &self,
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
        factors: &[f64],
    ) -> Result<Vec<Vec<f64>>, EngineError> {
        let system = self.normal_system(data, err)?;
        let cholesky = SparseCholesky::analyze(&system.matrix)?;
        factors
            .iter()
            .map(|&factor| {
                if factor > 0.0 {
                    self.solve_regularized(&system, &cholesky, factor)
                } else {
                    self.solve_unregularized(&system)
                }
            })
            .collect()
    }

    fn rebuild(&self, flux: &[f64], fill_value: f64) -> Result<Array2<f64>, EngineError> {
        self.check_flux(flux)?;
        let mut image = Array2::from_elem(self.shape, fill_value);
        for (&pixel, row) in self.pixels.iter().zip(&self.rows) {
            image[pixel] = row.dot(flux);
        }
        Ok(image)
    }

    fn normalized_residuals(
        &self,
        flux: &[f64],
        data: ArrayView2<'_, f64>,
        err: ArrayView2<'_, f64>,
    ) -> Result<Vec<f64>, EngineError> {
        self.check_flux(flux)?;
        self.check_image(data)?;
        self.check_image(err)?;
        Ok(self
            .pixels
            .iter()
            .zip(&self.rows)
            .filter(|(pixel, _)| {
                data[**pixel].is_finite() && err[**pixel].is_finite() && err[**pixel] > 0.0
            })
            .map(|(&pixel, row)| (data[pixel] - row.dot(flux)) / err[pixel])
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::reference::{Kernel, Throughput};
    use ndarray::Array2;

    pub(crate) const SHAPE: (usize, usize) = (8, 24);

    /// Wavelength increasing by 0.01 micron per column from 1.0.
    pub(crate) fn wave_map() -> Array2<f64> {
        Array2::from_shape_fn(SHAPE, |(_, col)| 1.0 + 0.01 * col as f64)
    }

    /// Uniform illumination of rows 2..6.
    pub(crate) fn profile() -> Array2<f64> {
        Array2::from_shape_fn(SHAPE, |(row, _)| if (2..6).contains(&row) { 0.25 } else { 0.0 })
    }

    pub(crate) fn unity() -> Throughput {
        Throughput::Unity
    }

    pub(crate) fn identity() -> Kernel {
        Kernel::Identity
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{SHAPE, identity, profile, unity, wave_map};
    use super::{
        DEFAULT_ENGINE_THRESHOLD, EngineError, EngineOrder, ExtractionEngine, LinearModel,
        MaskOverlapError, segment_weights,
    };
    use crate::atoca::grid::native_grid_from_centers;
    use crate::domain::SossErrorCategory;
    use crate::domain::SossError;
    use ndarray::Array2;

    fn native_grid() -> Vec<f64> {
        let centers: Vec<f64> = (0..SHAPE.1).map(|c| 1.0 + 0.01 * c as f64).collect();
        native_grid_from_centers(&centers).expect("grid")
    }

    fn engine(grid: &[f64], mask: Array2<bool>) -> Result<ExtractionEngine, EngineError> {
        let wave = wave_map();
        let prof = profile();
        let throughput = unity();
        let kernel = identity();
        let order = EngineOrder {
            order: 1,
            wave_map: wave.view(),
            profile: prof.view(),
            throughput: &throughput,
            kernel: &kernel,
        };
        ExtractionEngine::new(&[order], grid, &[mask], None, DEFAULT_ENGINE_THRESHOLD)
    }

    #[test]
    fn segment_weights_integrate_linear_functions_exactly() {
        let nodes = [0.0, 1.0, 2.0, 4.0];
        let weights = segment_weights(&nodes, 0.5, 3.0);
        let integral: f64 = weights.iter().map(|&(i, w)| w * (2.0 * nodes[i] + 1.0)).sum();
        // Integral of 2x + 1 over [0.5, 3.0].
        assert!((integral - 11.25).abs() < 1.0e-12);
    }

    #[test]
    fn engine_models_only_illuminated_pixels() {
        let engine = engine(&native_grid(), Array2::from_elem(SHAPE, false)).expect("engine");
        assert_eq!(engine.valid_pixel_count(), 4 * SHAPE.1);
        assert!(engine.order_mask(0)[(0, 3)]);
        assert!(!engine.order_mask(0)[(3, 3)]);
        assert_eq!(engine.orders(), &[1]);
    }

    #[test]
    fn regularized_solve_reproduces_noiseless_data() {
        let grid = native_grid();
        let engine = engine(&grid, Array2::from_elem(SHAPE, false)).expect("engine");
        let truth: Vec<f64> = grid.iter().map(|w| 3.0 + 20.0 * (w - 1.1)).collect();
        let data = engine.rebuild(&truth, 0.0).expect("model");
        let err = Array2::from_elem(SHAPE, 0.01);

        let flux = engine.solve(data.view(), err.view(), Some(1.0e-6)).expect("solve");
        let logl = engine.loglikelihood(&flux, data.view(), err.view()).expect("logl");
        assert!(logl.abs() < 1.0e-6, "log-likelihood {logl}");
        assert!(logl <= 0.0);
    }

    #[test]
    fn rebuild_is_repeatable_and_fills_unmodelled_pixels() {
        let grid = native_grid();
        let engine = engine(&grid, Array2::from_elem(SHAPE, false)).expect("engine");
        let flux = vec![2.0; grid.len()];

        let first = engine.rebuild(&flux, f64::NAN).expect("first");
        let second = engine.rebuild(&flux, f64::NAN).expect("second");
        assert!(first[(0, 0)].is_nan());
        assert!((first[(3, 5)] - 0.25 * 2.0 * 1.05 * 0.01).abs() < 1.0e-12);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(a.to_bits() == b.to_bits());
        }
    }

    #[test]
    fn unregularized_solve_leaves_unconstrained_nodes_nan() {
        let mut grid = vec![0.9, 0.95];
        grid.extend(native_grid());
        grid.extend([1.3, 1.35]);
        let engine = engine(&grid, Array2::from_elem(SHAPE, false)).expect("engine");
        let truth = vec![1.0; grid.len()];
        let data = engine.rebuild(&truth, 0.0).expect("model");
        let err = Array2::from_elem(SHAPE, 1.0);

        let flux = engine.solve(data.view(), err.view(), None).expect("solve");
        assert!(flux[0].is_nan() && flux[1].is_nan());
        assert!(flux[grid.len() - 1].is_nan() && flux[grid.len() - 2].is_nan());
        assert!(flux[2..grid.len() - 2].iter().all(|value| value.is_finite()));
        let logl = engine.loglikelihood(&flux, data.view(), err.view()).expect("logl");
        assert!(logl.abs() < 1.0e-8, "log-likelihood {logl}");
    }

    #[test]
    fn fully_masked_order_is_a_mask_overlap() {
        let error = engine(&native_grid(), Array2::from_elem(SHAPE, true)).expect_err("masked");
        assert_eq!(error, EngineError::MaskOverlap(MaskOverlapError { orders: vec![1] }));
        let converted = SossError::from(error);
        assert_eq!(converted.category(), SossErrorCategory::InsufficientData);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        let engine = engine(&native_grid(), Array2::from_elem(SHAPE, false)).expect("engine");
        assert_eq!(
            engine.rebuild(&[1.0], 0.0),
            Err(EngineError::FluxLength {
                expected: SHAPE.1 + 1,
                actual: 1
            })
        );
        let small = Array2::<f64>::zeros((2, 2));
        assert!(matches!(
            engine.solve(small.view(), small.view(), Some(1.0)),
            Err(EngineError::ImageShape { .. })
        ));
    }

    #[test]
    fn wide_grids_keep_a_banded_normal_system() {
        let shape = (4, 4000);
        let wave = Array2::from_shape_fn(shape, |(_, col)| 1.0 + 1.0e-4 * col as f64);
        let prof = Array2::from_elem(shape, 0.25);
        let centers: Vec<f64> = (0..shape.1).map(|c| 1.0 + 1.0e-4 * c as f64).collect();
        let grid = native_grid_from_centers(&centers).expect("grid");
        let throughput = unity();
        let kernel = identity();
        let order = EngineOrder {
            order: 1,
            wave_map: wave.view(),
            profile: prof.view(),
            throughput: &throughput,
            kernel: &kernel,
        };
        let engine = ExtractionEngine::new(
            &[order],
            &grid,
            &[Array2::from_elem(shape, false)],
            None,
            DEFAULT_ENGINE_THRESHOLD,
        )
        .expect("engine");

        let truth: Vec<f64> = grid.iter().map(|w| 5.0 + 2.0 * (w - 1.2)).collect();
        let data = engine.rebuild(&truth, 0.0).expect("model");
        let err = Array2::from_elem(shape, 0.01);

        let n = grid.len();
        let stored = engine.normal_nonzeros(data.view(), err.view()).expect("system");
        assert!(stored < 4 * n, "{stored} entries for {n} nodes");

        let single = engine.solve(data.view(), err.view(), Some(1.0e-6)).expect("solve");
        let many = engine
            .solve_many(data.view(), err.view(), &[1.0e-6, 1.0e-3])
            .expect("solve many");
        assert_eq!(many.len(), 2);
        for (a, b) in single.iter().zip(&many[0]) {
            assert!((a - b).abs() < 1.0e-9 * a.abs().max(1.0));
        }
        let logl = engine.loglikelihood(&single, data.view(), err.view()).expect("logl");
        assert!(logl.abs() < 1.0e-4, "log-likelihood {logl}");
    }
}
