//! Box extraction of NIRISS SOSS integrations, decontaminated with the ATOCA
//! forward model when one is built.

pub mod background;
pub mod boxextract;
pub mod soss;

pub use background::{make_background_mask, soss_background};
pub use boxextract::{BoxExtraction, box_extract, box_weights, estimate_error_nearest_data};

use crate::atoca::FluxEstimate;
use crate::domain::{
    BadPixelMode, DO_NOT_USE, DetectorImage, Exposure, REFERENCE_PIXEL, SossError, SossFilter,
    SossResult, SpectralOrder, Subarray,
};
use crate::numerics::is_strictly_increasing;
use crate::products::{
    EstimateTable, Extract1dOutput, ExtractionMetadata, SossReferenceProduct, SpecTable,
    SpectrumRecord, integration_spectrum, make_tso_spectrum,
};
use crate::reference::{
    ReferenceBundle, ReferenceFiles, SpecKernelReference, SpecProfileReference,
    TraceTableReference, build_reference_bundle,
};
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use soss::{
    ImageInputs, OrderImages, compute_box_weights, decontaminate_image, extract_image, model_image,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SossExtractConfig {
    pub atoca: bool,
    pub tikfac: Option<f64>,
    pub threshold: f64,
    pub n_os: usize,
    pub rtol: f64,
    pub max_grid_size: usize,
    pub bad_pix: BadPixelMode,
    pub width: f64,
    pub subtract_background: bool,
    pub background_width: f64,
    pub wavelength_range: Option<(f64, f64)>,
    pub wave_grid_in: Option<Vec<f64>>,
    pub estimate: Option<EstimateTable>,
    pub recompute_each_integration: bool,
    pub keep_tikhonov_tests: bool,
    pub parallel: bool,
}

impl Default for SossExtractConfig {
    fn default() -> Self {
        Self {
            atoca: true,
            tikfac: None,
            threshold: 1.0e-2,
            n_os: 2,
            rtol: 1.0e-4,
            max_grid_size: 20_000,
            bad_pix: BadPixelMode::Model,
            width: 40.0,
            subtract_background: true,
            background_width: 40.0,
            wavelength_range: None,
            wave_grid_in: None,
            estimate: None,
            recompute_each_integration: false,
            keep_tikhonov_tests: true,
            parallel: false,
        }
    }
}

impl SossExtractConfig {
    pub fn validate(&self) -> SossResult<()> {
        let invalid = |code: &'static str, message: String| {
            Err(SossError::input_validation(code, message))
        };
        if self.n_os == 0 {
            return invalid("INPUT.N_OS", "n_os must be at least 1".to_string());
        }
        if !(self.rtol > 0.0 && self.rtol.is_finite()) {
            return invalid("INPUT.RTOL", format!("rtol must be positive, got {}", self.rtol));
        }
        if self.max_grid_size == 0 {
            return invalid("INPUT.MAX_GRID_SIZE", "max_grid_size must be positive".to_string());
        }
        if !(self.width > 0.0 && self.width.is_finite()) {
            return invalid("INPUT.WIDTH", format!("width must be positive, got {}", self.width));
        }
        if !(self.background_width > 0.0 && self.background_width.is_finite()) {
            return invalid(
                "INPUT.WIDTH",
                format!("background_width must be positive, got {}", self.background_width),
            );
        }
        if !(self.threshold >= 0.0 && self.threshold.is_finite()) {
            return invalid(
                "INPUT.THRESHOLD",
                format!("threshold must be non-negative, got {}", self.threshold),
            );
        }
        if let Some(tikfac) = self.tikfac {
            if !(tikfac > 0.0 && tikfac.is_finite()) {
                return invalid("INPUT.TIKFAC", format!("tikfac must be positive, got {tikfac}"));
            }
        }
        if let Some((min, max)) = self.wavelength_range {
            if !(min < max) {
                return invalid(
                    "INPUT.WAVELENGTH_RANGE",
                    format!("wavelength range [{min}, {max}] is empty"),
                );
            }
        }
        if let Some(grid) = &self.wave_grid_in {
            if grid.len() < 2 || !is_strictly_increasing(grid) {
                return invalid(
                    "INPUT.WAVE_GRID",
                    "input wavelength grid must hold at least two strictly increasing values"
                        .to_string(),
                );
            }
        }
        Ok(())
    }

    /// Decontamination and bad pixel modelling both need the forward model.
    pub fn generates_model(&self) -> bool {
        self.atoca || self.bad_pix == BadPixelMode::Model
    }
}

/// State shared between integrations: the wavelength grid, the Tikhonov
/// factor and the flux estimate, each either supplied or found on the first
/// integration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionSession {
    pub wave_grid: Option<Vec<f64>>,
    pub tikfac: Option<f64>,
    pub estimate: Option<FluxEstimate>,
}

impl ExtractionSession {
    pub fn from_config(config: &SossExtractConfig) -> SossResult<Self> {
        let estimate = config
            .estimate
            .as_ref()
            .map(EstimateTable::to_estimate)
            .transpose()?;
        if estimate.is_some() {
            info!("using the supplied flux estimate");
        }
        Ok(Self {
            wave_grid: config.wave_grid_in.clone(),
            tikfac: config.tikfac,
            estimate,
        })
    }

    /// Same session with the grid and factor fixed.
    pub fn with_solution(&self, wave_grid: Vec<f64>, tikfac: f64) -> Self {
        Self {
            wave_grid: Some(wave_grid),
            tikfac: Some(tikfac),
            estimate: self.estimate.clone(),
        }
    }
}

struct ExtractionContext<'a> {
    exposure: &'a Exposure,
    refs: &'a ReferenceFiles,
    bundle: Option<&'a ReferenceBundle>,
    config: &'a SossExtractConfig,
    orders: &'a [SpectralOrder],
}

struct IntegrationProducts {
    spectra: BTreeMap<SpectralOrder, SpectrumRecord>,
    atoca_spectra: Vec<SpectrumRecord>,
    tracemodels: OrderImages,
    box_weights: OrderImages,
    solution: Option<(Vec<f64>, f64)>,
}

/// Orders that get a box extraction: those with a trace, at most 2 in SUBSTRIP96.
pub fn extracted_orders(trace_table: &TraceTableReference, subarray: Subarray) -> Vec<SpectralOrder> {
    let highest = match subarray {
        Subarray::Substrip96 => 2,
        Subarray::Substrip256 | Subarray::Full => 3,
    };
    trace_table
        .orders()
        .into_iter()
        .filter(|&order| (1..=highest).contains(&order))
        .collect()
}

fn extract_integration(
    ctx: &ExtractionContext<'_>,
    index: usize,
    session: &ExtractionSession,
) -> SossResult<IntegrationProducts> {
    let int_num = index + 1;
    let mid_time = ctx.exposure.mid_time(int_num);
    let config = ctx.config;
    info!(
        integration = int_num,
        total = ctx.exposure.n_integrations(),
        "processing integration"
    );

    let DetectorImage { data, err, dq } = ctx.exposure.integration(index);
    let shape = data.dim();
    let mut scimask = dq.mapv(|flags| flags & DO_NOT_USE != 0);
    let mut refmask = dq.mapv(|flags| flags & REFERENCE_PIXEL != 0);

    let not_finite = Zip::from(&data)
        .and(&err)
        .map_collect(|value, sigma| !(value.is_finite() && sigma.is_finite()));
    if not_finite.iter().zip(&scimask).any(|(&bad, &masked)| bad && !masked) {
        warn!(
            integration = int_num,
            "input contains invalid values not flagged in the dq map; they will be masked"
        );
        Zip::from(&mut scimask)
            .and(&mut refmask)
            .and(&not_finite)
            .for_each(|masked, reference, &bad| {
                if bad {
                    *masked = true;
                    *reference = false;
                }
            });
    }

    let (data, column_background) = if config.subtract_background {
        debug!("applying background subtraction");
        let background_mask = make_background_mask(data.view(), config.background_width);
        soss_background(data.view(), scimask.view(), background_mask.view())
    } else {
        debug!("skipping background subtraction");
        (data, vec![0.0; shape.1])
    };

    let apertures = compute_box_weights(ctx.refs, shape, config.width, ctx.orders)?;
    let mut box_weights: OrderImages = apertures
        .iter()
        .map(|(&order, aperture)| (order, aperture.weights.clone()))
        .collect();
    // The SUBSTRIP96 order 2 trace leaves the subarray; its aperture is the whole image.
    if ctx.refs.subarray == Subarray::Substrip96 {
        if let Some(weights) = box_weights.get_mut(&2) {
            *weights = Array2::ones(shape);
        }
    }

    let (tracemodels, atoca_spectra, solution) = match ctx.bundle {
        Some(bundle) => {
            let image = ImageInputs {
                data: data.view(),
                err: err.view(),
                scimask: scimask.view(),
                refmask: refmask.view(),
            };
            let model = model_image(&image, ctx.refs, bundle, &box_weights, session, config)?;
            let spectra = model
                .spectra
                .iter()
                .map(|record| record.for_integration(int_num, mid_time))
                .collect();
            (model.tracemodels, spectra, Some((model.wave_grid, model.tikfac)))
        }
        None => (OrderImages::new(), Vec::new(), None),
    };

    let decontaminated = decontaminate_image(data.view(), &tracemodels, ctx.orders);
    let extracted = extract_image(
        &decontaminated,
        err.view(),
        scimask.view(),
        &box_weights,
        config.bad_pix,
        &tracemodels,
    );

    let mut spectra = BTreeMap::new();
    for (&order, extraction) in &extracted {
        let Some(aperture) = apertures.get(&order) else {
            continue;
        };
        let columns = &aperture.trace.columns;
        let pick = |values: &[f64]| columns.iter().map(|&column| values[column]).collect::<Vec<_>>();
        let mut table = SpecTable::extracted(
            aperture.trace.wavelength.clone(),
            pick(&extraction.flux),
            pick(&extraction.flux_err),
            pick(&column_background),
            pick(&extraction.npix),
        );
        if let Some(range) = config.wavelength_range {
            table = table.within(range);
        }
        spectra.insert(order, integration_spectrum(order, int_num, mid_time, table));
    }

    Ok(IntegrationProducts {
        spectra,
        atoca_spectra,
        tracemodels,
        box_weights,
        solution,
    })
}

/// Extracts every integration of a SOSS exposure.
///
/// The first integration fixes the wavelength grid and the Tikhonov factor
/// (unless supplied); the others reuse them, on the rayon pool when
/// `config.parallel` is set.
pub fn run_extract1d(
    exposure: &Exposure,
    trace_table: &TraceTableReference,
    spec_profile: &SpecProfileReference,
    spec_kernel: &SpecKernelReference,
    config: &SossExtractConfig,
) -> SossResult<Extract1dOutput> {
    config.validate()?;
    exposure.validate()?;
    let meta = &exposure.meta;
    let refs = ReferenceFiles {
        trace_table: trace_table.clone(),
        spec_profile: spec_profile.clone(),
        spec_kernel: spec_kernel.clone(),
        subarray: meta.subarray,
        pupil_position: meta.pupil_position,
    };
    let shape = exposure.detector_shape();
    let orders = extracted_orders(trace_table, meta.subarray);
    if orders.is_empty() {
        return Err(SossError::reference_mismatch(
            "REF.UNKNOWN_ORDER",
            "trace table holds no extractable spectral order",
        ));
    }

    let bundle = if config.generates_model() {
        if meta.filter != SossFilter::Clear {
            return Err(SossError::input_validation(
                "INPUT.UNSUPPORTED_FILTER",
                format!("no extraction possible for filter {}", meta.filter),
            ));
        }
        Some(build_reference_bundle(&refs, shape)?)
    } else {
        None
    };

    let initial = ExtractionSession::from_config(config)?;
    let n_integrations = exposure.n_integrations();
    info!(
        integrations = n_integrations,
        subarray = %meta.subarray,
        filter = %meta.filter,
        "starting SOSS extraction"
    );

    let ctx = ExtractionContext {
        exposure,
        refs: &refs,
        bundle: bundle.as_ref(),
        config,
        orders: &orders,
    };
    let first = extract_integration(&ctx, 0, &initial)?;
    let tikhonov_factor = first
        .solution
        .as_ref()
        .map(|(_, tikfac)| *tikfac)
        .or(config.tikfac);
    let session = match (&first.solution, config.recompute_each_integration) {
        (Some((grid, tikfac)), false) => initial.with_solution(grid.clone(), *tikfac),
        _ => initial.clone(),
    };

    let rest: Vec<IntegrationProducts> = if config.parallel {
        (1..n_integrations)
            .into_par_iter()
            .map(|index| extract_integration(&ctx, index, &session))
            .collect::<SossResult<_>>()?
    } else {
        (1..n_integrations)
            .map(|index| extract_integration(&ctx, index, &session))
            .collect::<SossResult<_>>()?
    };

    let mut per_order: BTreeMap<SpectralOrder, Vec<SpectrumRecord>> = BTreeMap::new();
    let mut atoca_spectra = Vec::new();
    let mut references = SossReferenceProduct::default();
    let mut wave_grid = None;
    for products in std::iter::once(first).chain(rest) {
        for (order, record) in products.spectra {
            per_order.entry(order).or_default().push(record);
        }
        atoca_spectra.extend(products.atoca_spectra);
        for (order, model) in products.tracemodels {
            references
                .tracemodels
                .entry(order)
                .or_default()
                .push(model.mapv(|value| if value.is_finite() { value } else { 0.0 }));
        }
        for (order, weights) in products.box_weights {
            references.box_weights.entry(order).or_default().push(weights);
        }
        if let Some((grid, _)) = products.solution {
            wave_grid.get_or_insert(grid);
        }
    }

    let spectra = per_order
        .into_iter()
        .map(|(order, records)| make_tso_spectrum(order, meta.segment_number, records))
        .collect();
    info!("SOSS extraction complete");

    Ok(Extract1dOutput {
        spectra,
        atoca_spectra,
        references,
        wave_grid,
        meta: ExtractionMetadata {
            width: config.width,
            apply_decontamination: config.atoca,
            tikhonov_factor,
            oversampling: config.n_os,
            threshold: config.threshold,
            bad_pix: config.bad_pix,
        },
    })
}
