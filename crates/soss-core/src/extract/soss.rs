use super::boxextract::{BoxExtraction, box_extract, box_weights, estimate_error_nearest_data};
use super::{ExtractionSession, SossExtractConfig};
use crate::atoca::tikhonov::SEED_HALF_RANGE_DEX;
use crate::atoca::{
    DEFAULT_ENGINE_THRESHOLD, EngineError, EngineOrder, ExtractionEngine, FluxEstimate,
    LinearModel, adapt_grid, estimate_tikhonov_factor, grid_from_map_with_extrapolation,
    make_combined_adaptive_grid, native_grid_from_centers, oversample_grid, two_stage_search,
};
use crate::domain::{BadPixelMode, DO_NOT_USE, SossError, SossResult, SpectralOrder, Subarray};
use crate::products::{
    ColorRange, SpecTable, SpectrumRecord, observation_spectrum, test_spectrum,
};
use crate::reference::{
    Kernel, OrderReference, ReferenceBundle, ReferenceFiles, Throughput, Trace1d,
    TraceTableReference, trace_1d,
};
use ndarray::{Array2, ArrayView2, Zip};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Order 2 profile level above which order 1 pixels count as contaminated
/// when bootstrapping the flux estimate.
pub const FIRST_ORDER_CONTAMINATION_THRESHOLD: f64 = 1.0e-4;
pub const ADAPTIVE_MAX_ITER: usize = 30;
const SINGLE_ORDER_OVERSAMPLING: usize = 3;
/// Decades around the joint factor searched for the order 2 blue end.
const EXTENSION_LOG_RANGE: (f64, f64) = (-2.0, 8.0);

pub type OrderImages = BTreeMap<SpectralOrder, Array2<f64>>;

/// Box aperture of one order and the trace it follows.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAperture {
    pub weights: Array2<f64>,
    pub trace: Trace1d,
}

/// One background-subtracted integration with its pixel masks.
#[derive(Debug, Clone, Copy)]
pub struct ImageInputs<'a> {
    pub data: ArrayView2<'a, f64>,
    pub err: ArrayView2<'a, f64>,
    /// Pixels excluded from every fit and sum.
    pub scimask: ArrayView2<'a, bool>,
    /// Pixels never reconstructed.
    pub refmask: ArrayView2<'a, bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelImage {
    pub tracemodels: OrderImages,
    pub tikfac: f64,
    pub logl: f64,
    pub wave_grid: Vec<f64>,
    pub spectra: Vec<SpectrumRecord>,
}

/// Pixel-centre wavelengths of the trace, sorted, with their columns.
pub fn native_grid_from_trace(
    refs: &ReferenceFiles,
    order: SpectralOrder,
    n_columns: usize,
) -> SossResult<(Vec<f64>, Vec<usize>)> {
    let trace = trace_1d(refs, order, n_columns)?;
    let (columns, wave): (Vec<usize>, Vec<f64>) = trace
        .columns
        .iter()
        .zip(&trace.wavelength)
        .filter(|(_, wavelength)| wavelength.is_finite())
        .map(|(&column, &wavelength)| (column, wavelength))
        .unzip();
    if columns.windows(2).any(|pair| pair[1] != pair[0] + 1) {
        warn!(order, "wavelength solution contains gaps");
    }
    if let (Some(first), Some(last)) = (wave.first(), wave.last()) {
        debug!(order, first, last, "native wavelength range");
    }

    let mut pairs: Vec<(f64, usize)> = wave.into_iter().zip(columns).collect();
    pairs.sort_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
    Ok(pairs.into_iter().unzip())
}

/// Pixel-boundary grid of the trace, oversampled `n_os` times.
pub fn grid_from_trace(
    refs: &ReferenceFiles,
    order: SpectralOrder,
    n_columns: usize,
    n_os: usize,
) -> SossResult<Vec<f64>> {
    let (wave, _) = native_grid_from_trace(refs, order, n_columns)?;
    let grid = native_grid_from_centers(&wave)?;
    Ok(oversample_grid(&grid, n_os))
}

/// Rough order 1 spectrum: unregularised solve at native resolution, no
/// kernel, pixels contaminated by order 2 masked.
pub fn estimate_flux_first_order(
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    scimask: ArrayView2<'_, bool>,
    bundle: &ReferenceBundle,
    mask_trace_profile: &[Array2<bool>],
    threshold: f64,
) -> SossResult<FluxEstimate> {
    let first = bundle.get(1).ok_or_else(|| {
        SossError::reference_mismatch("REF.UNKNOWN_ORDER", "flux estimate needs spectral order 1")
    })?;
    let trace_mask = bundle
        .order_index(1)
        .and_then(|index| mask_trace_profile.get(index))
        .ok_or_else(|| SossError::internal("MODEL.MASK_COUNT", "no trace mask for order 1"))?;

    let grid = grid_from_map_with_extrapolation(first.wave_map.view(), first.profile.view(), 1)?;
    let contaminant = bundle.get(2);
    let mask = Array2::from_shape_fn(first.wave_map.dim(), |pixel| {
        trace_mask[pixel] || contaminant.is_some_and(|order| order.profile[pixel] >= threshold)
    });

    let kernel = Kernel::Identity;
    let orders = [EngineOrder {
        kernel: &kernel,
        ..EngineOrder::from(first)
    }];
    let engine =
        ExtractionEngine::new(&orders, &grid, &[mask], Some(scimask), DEFAULT_ENGINE_THRESHOLD)?;
    let flux = engine.solve(data, err, None)?;
    Ok(FluxEstimate::from_samples(&grid, &flux)?)
}

/// Joint grid for orders 1 and 2, refined by priority: the wavelengths both
/// orders share, then the rest of order 1, then the blue end of order 2.
pub fn make_decontamination_grid(
    refs: &ReferenceFiles,
    n_columns: usize,
    rtol: f64,
    max_grid_size: usize,
    estimate: &FluxEstimate,
    n_os: usize,
) -> SossResult<Vec<f64>> {
    let order1 = grid_from_trace(refs, 1, n_columns, n_os)?;
    if !refs.trace_table.has_order(2) {
        let cap = max_grid_size.max(order1.len());
        return Ok(adapt_grid(&order1, estimate, ADAPTIVE_MAX_ITER, rtol, cap));
    }
    let order2 = grid_from_trace(refs, 2, n_columns, n_os)?;

    let (min1, max1) = (order1[0], order1[order1.len() - 1]);
    let (shared, blue): (Vec<f64>, Vec<f64>) = order2.iter().copied().partition(|&w| w >= min1);
    let (grids, estimates) = match shared.first().copied() {
        Some(shared_min) => {
            let red: Vec<f64> = order1.into_iter().filter(|&w| w > shared_min).collect();
            (
                vec![shared, red, blue],
                vec![estimate.clone(), estimate.clone(), FluxEstimate::Flat],
            )
        }
        None => (vec![order1, blue], vec![estimate.clone(), FluxEstimate::Flat]),
    };

    let low = refs.trace_table.order2.decontamination_min;
    let range = if low < max1 {
        (low, max1)
    } else {
        let lowest = grids
            .iter()
            .filter_map(|grid| grid.first().copied())
            .fold(max1, f64::min);
        (lowest, max1)
    };
    let grid = make_combined_adaptive_grid(
        &grids,
        &estimates,
        range,
        rtol,
        max_grid_size,
        ADAPTIVE_MAX_ITER,
    )?;
    debug!(
        min = grid[0],
        max = grid[grid.len() - 1],
        size = grid.len(),
        "decontamination grid"
    );
    Ok(grid)
}

fn columns_fully_masked(mask: &Array2<bool>, columns: &[usize]) -> Vec<bool> {
    columns
        .iter()
        .map(|&column| mask.column(column).iter().all(|&masked| masked))
        .collect()
}

/// Integrates `flux` over the pixels of a one-row detector whose centres are
/// `pixel_wave`. Pixels that cannot be modelled are dropped.
pub fn bin_to_pixel_grid(
    flux: &[f64],
    grid: &[f64],
    throughput: &Throughput,
    pixel_wave: &[f64],
    column_mask: &[bool],
    order: SpectralOrder,
) -> Result<SpecTable, EngineError> {
    let n = pixel_wave.len();
    let wave_map = Array2::from_shape_fn((1, n), |(_, column)| pixel_wave[column]);
    let profile = Array2::<f64>::ones((1, n));
    let mask = Array2::from_shape_fn((1, n), |(_, column)| {
        column_mask.get(column).copied().unwrap_or(true)
    });
    let kernel = Kernel::Identity;
    let orders = [EngineOrder {
        order,
        wave_map: wave_map.view(),
        profile: profile.view(),
        throughput,
        kernel: &kernel,
    }];

    let engine = match ExtractionEngine::new(&orders, grid, &[mask], None, DEFAULT_ENGINE_THRESHOLD) {
        Ok(engine) => engine,
        Err(EngineError::MaskOverlap(_)) => return Ok(SpecTable::default()),
        Err(error) => return Err(error),
    };
    let binned = engine.rebuild(flux, f64::NAN)?;
    let (wavelength, values): (Vec<f64>, Vec<f64>) = pixel_wave
        .iter()
        .zip(binned.row(0))
        .filter(|(_, value)| value.is_finite())
        .map(|(&wavelength, &value)| (wavelength, value))
        .unzip();
    Ok(SpecTable::modelled(wavelength, values))
}

/// Isolated model of order `i_order`: the flux is convolved with that order's
/// kernel once, then projected without convolution over the pixels `mask`
/// leaves open. Also returns the matching binned spectrum.
pub fn build_trace_model_order(
    engine: &ExtractionEngine,
    i_order: usize,
    order_ref: &OrderReference,
    flux: &[f64],
    mask: &Array2<bool>,
    refs: &ReferenceFiles,
) -> SossResult<(Array2<f64>, SpecTable)> {
    let convolved = engine.convolve(i_order, flux)?;
    let (grid, convolved): (Vec<f64>, Vec<f64>) = engine
        .convolved_grid(i_order)
        .into_iter()
        .zip(convolved)
        .filter(|(_, value)| value.is_finite())
        .unzip();

    let kernel = Kernel::Identity;
    let orders = [EngineOrder {
        kernel: &kernel,
        ..EngineOrder::from(order_ref)
    }];
    let model_engine = ExtractionEngine::new(
        &orders,
        &grid,
        std::slice::from_ref(mask),
        None,
        DEFAULT_ENGINE_THRESHOLD,
    )?;
    let tracemodel = model_engine.rebuild(&convolved, f64::NAN)?;

    let (pixel_wave, valid_cols) = native_grid_from_trace(refs, order_ref.order, mask.ncols())?;
    let column_mask = columns_fully_masked(mask, &valid_cols);
    let table = bin_to_pixel_grid(
        &convolved,
        &grid,
        &order_ref.throughput,
        &pixel_wave,
        &column_mask,
        order_ref.order,
    )?;
    Ok((tracemodel, table))
}

/// Spectrum of the order 2 blue end when it cannot be modelled.
pub fn null_spectrum(pixel_wave: &[f64], trace_table: &TraceTableReference) -> SpectrumRecord {
    let wavelength: Vec<f64> = pixel_wave
        .iter()
        .copied()
        .filter(|&w| w > trace_table.order2.short_cutoff)
        .collect();
    let n = wavelength.len();
    let table = SpecTable {
        dq: vec![DO_NOT_USE; n],
        ..SpecTable::modelled(wavelength, vec![f64::NAN; n])
    };
    observation_spectrum(2, ColorRange::Blue, None, table)
}

/// Fits one order alone on its own pixel-centre grid, with unit throughput and
/// no kernel, searching the Tikhonov factor over `log_range`. The model is
/// rebuilt over every pixel `mask_rebuild` leaves open, bad pixels included.
#[allow(clippy::too_many_arguments)]
pub fn model_single_order(
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    order_ref: &OrderReference,
    mask_fit: &Array2<bool>,
    mask_rebuild: &Array2<bool>,
    pixel_wave: &[f64],
    valid_cols: &[usize],
    log_range: (f64, f64),
    keep_tests: bool,
    short_cutoff: f64,
) -> Result<(Array2<f64>, Vec<SpectrumRecord>), EngineError> {
    let order = order_ref.order;
    let single = order_ref.without_response();
    let grid: Vec<f64> = oversample_grid(pixel_wave, SINGLE_ORDER_OVERSAMPLING)
        .into_iter()
        .filter(|&w| w > short_cutoff)
        .collect();
    let orders = [EngineOrder::from(&single)];

    let engine = ExtractionEngine::new(
        &orders,
        &grid,
        std::slice::from_ref(mask_fit),
        None,
        DEFAULT_ENGINE_THRESHOLD,
    )?;
    let (tikfac, tests) = two_stage_search(&engine, data, err, log_range)?;
    let flux = engine.solve(data, err, Some(tikfac))?;

    let column_mask = columns_fully_masked(mask_rebuild, valid_cols);
    let mut spectra = Vec::new();
    if keep_tests {
        for test in &tests.tests {
            let table = bin_to_pixel_grid(
                &test.solution,
                &grid,
                &Throughput::Unity,
                pixel_wave,
                &column_mask,
                order,
            )?;
            spectra.push(test_spectrum(order, ColorRange::Blue, test, table));
        }
    }

    let rebuild_engine = ExtractionEngine::new(
        &orders,
        &grid,
        std::slice::from_ref(mask_rebuild),
        None,
        DEFAULT_ENGINE_THRESHOLD,
    )?;
    let model = rebuild_engine.rebuild(&flux, f64::NAN)?;
    let table = bin_to_pixel_grid(&flux, &grid, &Throughput::Unity, pixel_wave, &column_mask, order)?;
    spectra.push(observation_spectrum(order, ColorRange::Blue, Some(tikfac), table));
    Ok((model, spectra))
}

/// Joint ATOCA model of every order in the bundle, plus the separately
/// modelled blue end of order 2 outside SUBSTRIP96.
pub fn model_image(
    image: &ImageInputs<'_>,
    refs: &ReferenceFiles,
    bundle: &ReferenceBundle,
    box_weights: &OrderImages,
    session: &ExtractionSession,
    config: &SossExtractConfig,
) -> SossResult<ModelImage> {
    let shape = image.data.dim();
    let scimask = Array2::from_shape_fn(shape, |pixel| {
        image.scimask[pixel] || !(image.err[pixel] > 0.0)
    });

    let mask_trace_profile: Vec<Array2<bool>> = bundle
        .orders
        .iter()
        .map(|order| {
            let weights = box_weights.get(&order.order);
            Array2::from_shape_fn(shape, |pixel| {
                image.refmask[pixel] || !weights.is_some_and(|weights| weights[pixel] > 0.0)
            })
        })
        .collect();
    let global_mask =
        Array2::from_shape_fn(shape, |pixel| mask_trace_profile.iter().all(|mask| mask[pixel]));

    let estimate = match (&session.estimate, session.tikfac, &session.wave_grid) {
        (Some(estimate), _, _) => estimate.clone(),
        (None, Some(_), Some(_)) => FluxEstimate::Flat,
        _ => estimate_flux_first_order(
            image.data,
            image.err,
            scimask.view(),
            bundle,
            &mask_trace_profile,
            FIRST_ORDER_CONTAMINATION_THRESHOLD,
        )?,
    };

    let wave_grid = match &session.wave_grid {
        Some(grid) => {
            info!("using the previously computed or supplied wavelength grid");
            grid.clone()
        }
        None => {
            info!(rtol = config.rtol, "building the wavelength grid");
            make_decontamination_grid(
                refs,
                shape.1,
                config.rtol,
                config.max_grid_size,
                &estimate,
                config.n_os,
            )?
        }
    };

    let orders: Vec<EngineOrder<'_>> = bundle.orders.iter().map(EngineOrder::from).collect();
    let engine = ExtractionEngine::new(
        &orders,
        &wave_grid,
        &mask_trace_profile,
        Some(scimask.view()),
        config.threshold,
    )?;

    let mut spectra = Vec::new();
    let tikfac = match session.tikfac {
        Some(factor) => factor,
        None => {
            info!("solving for the optimal Tikhonov factor");
            let log_guess = estimate_tikhonov_factor(&engine, &estimate).log10();
            let (factor, tests) = two_stage_search(
                &engine,
                image.data,
                image.err,
                (log_guess - SEED_HALF_RANGE_DEX, log_guess + SEED_HALF_RANGE_DEX),
            )?;
            if config.keep_tikhonov_tests {
                for (i, order) in bundle.orders.iter().enumerate() {
                    for test in &tests.tests {
                        let (_, table) = build_trace_model_order(
                            &engine,
                            i,
                            order,
                            &test.solution,
                            &global_mask,
                            refs,
                        )?;
                        spectra.push(test_spectrum(order.order, ColorRange::Red, test, table));
                    }
                }
            }
            factor
        }
    };
    info!(tikfac, "using Tikhonov factor");

    let flux = engine.solve(image.data, image.err, Some(tikfac))?;
    let logl = engine.loglikelihood(&flux, image.data, image.err)?;
    info!(logl, "optimal solution log-likelihood");

    let mut tracemodels = OrderImages::new();
    for (i, order) in bundle.orders.iter().enumerate() {
        debug!(order = order.order, "building the trace model");
        let (tracemodel, table) =
            build_trace_model_order(&engine, i, order, &flux, &global_mask, refs)?;
        tracemodels.insert(order.order, tracemodel);
        spectra.push(observation_spectrum(order.order, ColorRange::Red, Some(tikfac), table));
    }

    if bundle.subarray != Subarray::Substrip96 {
        if let Some(i2) = bundle.order_index(2) {
            let keep_tests = config.keep_tikhonov_tests && session.tikfac.is_none();
            let blue = model_order2_extension(
                image,
                refs,
                &bundle.orders[i2],
                &mask_trace_profile[i2],
                &scimask,
                &global_mask,
                tikfac,
                keep_tests,
            )?;
            if let Some((model, blue_spectra)) = blue {
                if let Some(existing) = tracemodels.get_mut(&2) {
                    Zip::from(existing).and(&model).for_each(|current, &extension| {
                        if !current.is_finite() && extension.is_finite() {
                            *current = extension;
                        }
                    });
                }
                spectra.extend(blue_spectra);
            }
        }
    }

    Ok(ModelImage {
        tracemodels,
        tikfac,
        logl,
        wave_grid,
        spectra,
    })
}

#[allow(clippy::too_many_arguments)]
fn model_order2_extension(
    image: &ImageInputs<'_>,
    refs: &ReferenceFiles,
    order_ref: &OrderReference,
    trace_mask: &Array2<bool>,
    scimask: &Array2<bool>,
    global_mask: &Array2<bool>,
    tikfac: f64,
    keep_tests: bool,
) -> SossResult<Option<(Array2<f64>, Vec<SpectrumRecord>)>> {
    info!("modelling the blue end of order 2");
    let extension = refs.trace_table.order2;
    let (pixel_wave, valid_cols) = native_grid_from_trace(refs, 2, image.data.ncols())?;
    let (pixel_wave, valid_cols): (Vec<f64>, Vec<usize>) = pixel_wave
        .into_iter()
        .zip(valid_cols)
        .filter(|(wavelength, _)| *wavelength < extension.blue_max)
        .unzip();
    if pixel_wave.len() < 2 {
        debug!("order 2 does not reach the blue extension range");
        return Ok(None);
    }

    let mask_fit = Array2::from_shape_fn(scimask.dim(), |pixel| trace_mask[pixel] || scimask[pixel]);
    let log_tikfac = tikfac.log10();
    let log_range = (
        log_tikfac + EXTENSION_LOG_RANGE.0,
        log_tikfac + EXTENSION_LOG_RANGE.1,
    );

    match model_single_order(
        image.data,
        image.err,
        order_ref,
        &mask_fit,
        global_mask,
        &pixel_wave,
        &valid_cols,
        log_range,
        keep_tests,
        extension.short_cutoff,
    ) {
        Ok(result) => Ok(Some(result)),
        Err(EngineError::MaskOverlap(_) | EngineError::NoValidData) => {
            error!(
                "not enough unmasked pixels to model the blue end of order 2; \
                 model and spectrum are NaN in that range"
            );
            Ok(Some((
                Array2::from_elem(image.data.dim(), f64::NAN),
                vec![null_spectrum(&pixel_wave, &refs.trace_table)],
            )))
        }
        Err(error) => Err(error.into()),
    }
}

/// Box apertures of `orders` around their traces.
pub fn compute_box_weights(
    refs: &ReferenceFiles,
    shape: (usize, usize),
    width: f64,
    orders: &[SpectralOrder],
) -> SossResult<BTreeMap<SpectralOrder, OrderAperture>> {
    let mut apertures = BTreeMap::new();
    for &order in orders {
        debug!(order, "computing box weights");
        let trace = trace_1d(refs, order, shape.1)?;
        let weights = box_weights(&trace.y, &trace.columns, width, shape);
        apertures.insert(order, OrderAperture { weights, trace });
    }
    Ok(apertures)
}

/// Per extracted order, the image minus the finite part of every other order's model.
pub fn decontaminate_image(
    data: ArrayView2<'_, f64>,
    tracemodels: &OrderImages,
    orders: &[SpectralOrder],
) -> OrderImages {
    debug!("performing the decontamination");
    orders
        .iter()
        .map(|&order| {
            let mut decontaminated = data.to_owned();
            for (&other, model) in tracemodels {
                if other == order {
                    continue;
                }
                Zip::from(&mut decontaminated).and(model).for_each(|value, &contaminant| {
                    if contaminant.is_finite() {
                        *value -= contaminant;
                    }
                });
            }
            (order, decontaminated)
        })
        .collect()
}

/// Replaces masked pixels the model covers by the model value, borrows
/// their errors from valid aperture pixels of similar value and unmasks them.
pub fn substitute_bad_pixels(
    data: ArrayView2<'_, f64>,
    err: ArrayView2<'_, f64>,
    scimask: ArrayView2<'_, bool>,
    weights: ArrayView2<'_, f64>,
    model: ArrayView2<'_, f64>,
) -> (Array2<f64>, Array2<f64>, Array2<bool>) {
    let shape = data.dim();
    let modelled = model.mapv(f64::is_finite);
    let substituted = Array2::from_shape_fn(shape, |pixel| {
        if scimask[pixel] && modelled[pixel] {
            model[pixel]
        } else {
            data[pixel]
        }
    });

    let in_aperture = weights.mapv(|weight| weight > 0.0);
    let to_estimate = Array2::from_shape_fn(shape, |pixel| {
        in_aperture[pixel] && scimask[pixel] && modelled[pixel]
    });
    let valid = Array2::from_shape_fn(shape, |pixel| in_aperture[pixel] && !scimask[pixel]);
    let errors = estimate_error_nearest_data(err, substituted.view(), to_estimate.view(), valid.view());
    let mask = Array2::from_shape_fn(shape, |pixel| scimask[pixel] && !modelled[pixel]);
    (substituted, errors, mask)
}

/// Box extraction of every order with an aperture and a decontaminated image.
pub fn extract_image(
    decontaminated: &OrderImages,
    err: ArrayView2<'_, f64>,
    scimask: ArrayView2<'_, bool>,
    box_weights: &OrderImages,
    bad_pix: BadPixelMode,
    tracemodels: &OrderImages,
) -> BTreeMap<SpectralOrder, BoxExtraction> {
    info!("performing the box extraction");
    let mut extracted = BTreeMap::new();
    for (&order, weights) in box_weights {
        let Some(data) = decontaminated.get(&order) else {
            continue;
        };
        let extraction = match (bad_pix, tracemodels.get(&order)) {
            (BadPixelMode::Model, Some(model)) => {
                debug!(order, "bad pixels replaced by the trace model");
                let (data, err, mask) =
                    substitute_bad_pixels(data.view(), err, scimask, weights.view(), model.view());
                box_extract(data.view(), err.view(), mask.view(), weights.view())
            }
            (BadPixelMode::Model, None) => {
                warn!(order, "bad pixels will be masked instead of modelled: trace model unavailable");
                box_extract(data.view(), err, scimask, weights.view())
            }
            (BadPixelMode::Masking, _) => {
                debug!(order, "bad pixels will be masked");
                box_extract(data.view(), err, scimask, weights.view())
            }
        };
        extracted.insert(order, extraction);
    }
    extracted
}
