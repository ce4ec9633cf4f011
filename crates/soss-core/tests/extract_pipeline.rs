use ndarray::{Array2, Array3};
use soss_core::domain::{
    BadPixelMode, DO_NOT_USE, Exposure, ExposureMeta, IntegrationTime, SossErrorCategory,
    SossFilter, Subarray,
};
use soss_core::extract::{SossExtractConfig, run_extract1d};
use soss_core::products::{ColorRange, Extract1dOutput, SpectrumKind};
use soss_core::reference::{
    Order2Extension, SpecKernelReference, SpecProfileReference, ThroughputReference, TraceGeometry,
    TraceReference, TraceTableReference,
};

const ROWS: usize = 32;
const COLS: usize = 64;
const SIGMA: f64 = 1.5;

#[derive(Debug, Clone, Copy)]
struct OrderScene {
    order: u8,
    row: f64,
    wave: (f64, f64),
    amplitude: f64,
}

const FIRST: OrderScene = OrderScene {
    order: 1,
    row: 22.0,
    wave: (0.9, 1.6),
    amplitude: 1000.0,
};

const SECOND: OrderScene = OrderScene {
    order: 2,
    row: 8.0,
    wave: (0.6, 1.0),
    amplitude: 300.0,
};

fn profile_value(row: usize, center: f64) -> f64 {
    let dy = row as f64 - center;
    if dy.abs() > 4.0 * SIGMA {
        return 0.0;
    }
    (-0.5 * dy * dy / (SIGMA * SIGMA)).exp() / (SIGMA * (2.0 * std::f64::consts::PI).sqrt())
}

fn profile_sum(center: f64, rows: usize) -> f64 {
    (0..rows).map(|row| profile_value(row, center)).sum()
}

/// Continuum with an absorption line for order 1, a gentle slope for order 2.
fn spectrum(order: u8, column: usize) -> f64 {
    let c = column as f64;
    match order {
        1 => 1.0 - 0.4 * (-0.5 * ((c - 40.0) / 2.5).powi(2)).exp(),
        _ => 1.0 + 0.002 * c,
    }
}

fn references(
    orders: &[OrderScene],
    rows: usize,
) -> (TraceTableReference, SpecProfileReference, SpecKernelReference) {
    let last = (COLS - 1) as f64;
    let traces = orders
        .iter()
        .map(|scene| TraceReference {
            spectral_order: scene.order,
            x: vec![0.0, last / 2.0, last],
            y: vec![scene.row; 3],
            wavelength: vec![scene.wave.0, 0.5 * (scene.wave.0 + scene.wave.1), scene.wave.1],
            padding: 0,
        })
        .collect();
    let throughputs = orders
        .iter()
        .map(|scene| ThroughputReference {
            spectral_order: scene.order,
            wavelength: vec![0.3, 3.5],
            throughput: vec![1.0, 1.0],
        })
        .collect();
    let trace_table = TraceTableReference {
        traces,
        throughputs,
        geometry: TraceGeometry::default(),
        order2: Order2Extension::default(),
    };

    let offset = if rows == 96 { TraceGeometry::default().substrip96_offset } else { 0.0 };
    let profiles = orders
        .iter()
        .map(|scene| Array2::from_shape_fn((rows, COLS), |(row, _)| profile_value(row, scene.row + offset)))
        .collect();
    let kernel = SpecKernelReference {
        wavelengths: vec![0.5, 3.0],
        kernels: vec![vec![0.1, 0.8, 0.1]; 2],
        halfwidth: 1,
        oversampling: 1,
    };
    (trace_table, SpecProfileReference { profiles }, kernel)
}

fn image(orders: &[OrderScene], rows: usize, row_offset: f64, scale: f64) -> Array2<f64> {
    Array2::from_shape_fn((rows, COLS), |(row, column)| {
        orders
            .iter()
            .map(|scene| {
                scale
                    * scene.amplitude
                    * spectrum(scene.order, column)
                    * profile_value(row, scene.row + row_offset)
            })
            .sum()
    })
}

fn exposure(frames: Vec<Array2<f64>>, subarray: Subarray, filter: SossFilter) -> Exposure {
    let (rows, cols) = frames[0].dim();
    let n = frames.len();
    let mut data = Array3::zeros((n, rows, cols));
    for (index, frame) in frames.iter().enumerate() {
        data.index_axis_mut(ndarray::Axis(0), index).assign(frame);
    }
    let int_times = (0..n)
        .map(|index| {
            let start = 60000.0 + 0.01 * index as f64;
            IntegrationTime {
                int_num: index + 1,
                int_start_mjd: start,
                int_mid_mjd: start + 0.005,
                int_end_mjd: start + 0.01,
            }
        })
        .collect();
    Exposure::new(
        data,
        Array3::from_elem((n, rows, cols), 1.0),
        Array3::zeros((n, rows, cols)),
        ExposureMeta {
            pupil_position: 245.76,
            subarray,
            filter,
            segment_number: Some(1),
        },
        int_times,
    )
    .expect("exposure should be valid")
}

fn small_config() -> SossExtractConfig {
    SossExtractConfig {
        width: 14.0,
        rtol: 1.0e-3,
        max_grid_size: 600,
        ..Default::default()
    }
}

fn run(exposure: &Exposure, orders: &[OrderScene], config: &SossExtractConfig) -> Extract1dOutput {
    let rows = exposure.detector_shape().0;
    let (trace_table, spec_profile, spec_kernel) = references(orders, rows);
    run_extract1d(exposure, &trace_table, &spec_profile, &spec_kernel, config)
        .expect("extraction should succeed")
}

#[test]
fn box_extraction_recovers_the_injected_line_profile() {
    let exposure = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::Clear);
    let output = run(&exposure, &[FIRST], &small_config());

    assert_eq!(output.spectra.len(), 1);
    let tso = &output.spectra[0];
    assert_eq!(tso.spectral_order, 1);
    assert_eq!(tso.segment_number, Some(1));
    let record = &tso.integrations[0];
    assert_eq!(record.int_num, 1);
    assert_eq!(record.mid_time_mjd, Some(60000.005));

    let table = &record.table;
    assert_eq!(table.len(), COLS);
    let total = profile_sum(FIRST.row, ROWS);
    for (column, &flux) in table.flux.iter().enumerate() {
        let expected = FIRST.amplitude * spectrum(1, column) * total;
        assert!(
            (flux - expected).abs() <= 1.0e-9 * expected,
            "column {column}: {flux} vs {expected}"
        );
        assert_eq!(table.dq[column], 0);
        assert_eq!(table.background[column], 0.0);
    }
    assert!(table.flux[40] < 0.7 * table.flux[10]);
    assert!(table.wavelength.windows(2).all(|pair| pair[1] > pair[0]));

    let grid = output.wave_grid.as_ref().expect("grid should be built");
    assert!(grid.windows(2).all(|pair| pair[1] > pair[0]));
    assert!(grid.len() <= 600);
    assert!(output.meta.tikhonov_factor.is_some_and(|factor| factor > 0.0));
    assert!(output.meta.apply_decontamination);
    assert_eq!(output.references.tracemodels[&1].len(), 1);
    assert_eq!(output.references.box_weights[&1][0].dim(), (ROWS, COLS));
}

#[test]
fn tikhonov_test_spectra_are_kept_apart_from_the_observation() {
    let exposure = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::Clear);
    let output = run(&exposure, &[FIRST], &small_config());

    let tests: Vec<_> = output
        .atoca_spectra
        .iter()
        .filter(|record| record.kind == SpectrumKind::Test)
        .collect();
    assert!(tests.len() >= 20);
    assert!(tests.iter().all(|record| record.int_num == 0 && record.diagnostics.is_some()));

    let observed: Vec<_> = output
        .atoca_spectra
        .iter()
        .filter(|record| record.kind == SpectrumKind::Observation)
        .collect();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].int_num, 1);
    assert_eq!(observed[0].color_range, ColorRange::Red);
    assert_eq!(observed[0].factor, output.meta.tikhonov_factor);
    assert!(!observed[0].table.is_empty());
}

#[test]
fn modelled_bad_pixel_restores_the_column_flux() {
    let mut frame = image(&[FIRST], ROWS, 0.0, 1.0);
    let center = FIRST.row as usize;
    let column = 20;
    frame[(center, column)] = f64::NAN;
    let mut exposure = exposure(vec![frame], Subarray::Substrip256, SossFilter::Clear);
    exposure.dq[(0, center, column)] = DO_NOT_USE;

    let expected = FIRST.amplitude * spectrum(1, column) * profile_sum(FIRST.row, ROWS);

    let modelled = run(&exposure, &[FIRST], &small_config());
    let flux = modelled.spectra[0].integrations[0].table.flux[column];
    assert!(
        ((flux - expected) / expected).abs() < 0.05,
        "modelled flux {flux} vs {expected}"
    );

    let masking = SossExtractConfig {
        bad_pix: BadPixelMode::Masking,
        atoca: false,
        ..small_config()
    };
    let masked = run(&exposure, &[FIRST], &masking);
    let table = &masked.spectra[0].integrations[0].table;
    assert!(((table.flux[column] - expected) / expected).abs() > 0.15);
    assert!(table.npixels[column] < table.npixels[column + 1]);
    assert!(masked.references.tracemodels.is_empty());
    assert!(masked.wave_grid.is_none());
}

#[test]
fn substrip96_second_order_uses_the_whole_image() {
    let rows = 96;
    let offset = TraceGeometry::default().substrip96_offset;
    let frame = image(&[FIRST], rows, offset, 1.0);
    let exposure = exposure(vec![frame], Subarray::Substrip96, SossFilter::Clear);
    let config = SossExtractConfig {
        atoca: false,
        bad_pix: BadPixelMode::Masking,
        ..small_config()
    };
    let output = run(&exposure, &[FIRST, SECOND], &config);

    let weights = &output.references.box_weights[&2][0];
    assert_eq!(weights.dim(), (rows, COLS));
    assert!(weights.iter().all(|&weight| weight == 1.0));

    let orders: Vec<u8> = output.spectra.iter().map(|tso| tso.spectral_order).collect();
    assert_eq!(orders, vec![1, 2]);
    let expected = FIRST.amplitude * spectrum(1, 5) * profile_sum(FIRST.row + offset, rows);
    let flux = output.spectra[0].integrations[0].table.flux[5];
    assert!((flux - expected).abs() <= 1.0e-9 * expected);
}

#[test]
fn unmodellable_blue_end_of_order_two_yields_a_null_spectrum() {
    let frame = image(&[FIRST, SECOND], ROWS, 0.0, 1.0);
    let mut exposure = exposure(vec![frame], Subarray::Substrip256, SossFilter::Clear);
    let (low, high) = SECOND.wave;
    for column in 0..COLS {
        let wavelength = low + (high - low) * column as f64 / (COLS - 1) as f64;
        if wavelength >= 0.96 {
            continue;
        }
        for row in 0..=15 {
            exposure.dq[(0, row, column)] = DO_NOT_USE;
        }
    }

    let output = run(&exposure, &[FIRST, SECOND], &small_config());
    let blue: Vec<_> = output
        .atoca_spectra
        .iter()
        .filter(|record| record.color_range == ColorRange::Blue)
        .collect();
    assert_eq!(blue.len(), 1);
    let null = blue[0];
    assert_eq!(null.spectral_order, 2);
    assert_eq!(null.kind, SpectrumKind::Observation);
    assert_eq!(null.factor, None);
    assert!(!null.table.is_empty());
    assert!(null.table.flux.iter().all(|value| value.is_nan()));
    assert!(null.table.dq.iter().all(|&flag| flag == DO_NOT_USE));
    assert!(null.table.wavelength.iter().all(|&w| w > 0.58 && w < 0.95));

    let first = &output.spectra[0].integrations[0].table;
    let expected = FIRST.amplitude * spectrum(1, 30) * profile_sum(FIRST.row, ROWS);
    assert!((first.flux[30] - expected).abs() <= 1.0e-6 * expected);
}

#[test]
fn later_integrations_reuse_the_first_solution_serially_or_in_parallel() {
    let frames = (0..3).map(|index| image(&[FIRST], ROWS, 0.0, 1.0 + 0.1 * index as f64)).collect();
    let exposure = exposure(frames, Subarray::Substrip256, SossFilter::Clear);

    let serial = run(&exposure, &[FIRST], &small_config());
    let parallel = run(
        &exposure,
        &[FIRST],
        &SossExtractConfig {
            parallel: true,
            ..small_config()
        },
    );

    assert_eq!(serial.spectra, parallel.spectra);
    assert_eq!(serial.meta, parallel.meta);
    let int_nums: Vec<usize> = serial.spectra[0]
        .integrations
        .iter()
        .map(|record| record.int_num)
        .collect();
    assert_eq!(int_nums, vec![1, 2, 3]);
    assert_eq!(serial.references.tracemodels[&1].len(), 3);

    let observed: Vec<_> = serial
        .atoca_spectra
        .iter()
        .filter(|record| record.kind == SpectrumKind::Observation)
        .collect();
    assert_eq!(observed.len(), 3);
    assert!(observed.iter().all(|record| record.factor == serial.meta.tikhonov_factor));
    let tests_after_first = serial
        .atoca_spectra
        .iter()
        .filter(|record| record.kind == SpectrumKind::Test)
        .count();
    let first_only = run(
        &exposure_with_first_frame(&exposure),
        &[FIRST],
        &small_config(),
    )
    .atoca_spectra
    .iter()
    .filter(|record| record.kind == SpectrumKind::Test)
    .count();
    assert_eq!(tests_after_first, first_only);
}

fn exposure_with_first_frame(exposure: &Exposure) -> Exposure {
    let first = exposure.integration(0);
    Exposure::from_image(
        soss_core::domain::DetectorImage::new(first.data, first.err, first.dq).expect("image"),
        exposure.meta.clone(),
    )
    .expect("exposure")
}

#[test]
fn modelling_is_refused_for_the_f277w_filter() {
    let exposure = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::F277w);
    let (trace_table, spec_profile, spec_kernel) = references(&[FIRST], ROWS);

    let error = run_extract1d(&exposure, &trace_table, &spec_profile, &spec_kernel, &small_config())
        .expect_err("F277W cannot be modelled");
    assert_eq!(error.category(), SossErrorCategory::InputValidation);
    assert_eq!(error.code(), "INPUT.UNSUPPORTED_FILTER");

    let masking = SossExtractConfig {
        atoca: false,
        bad_pix: BadPixelMode::Masking,
        ..small_config()
    };
    let output = run_extract1d(&exposure, &trace_table, &spec_profile, &spec_kernel, &masking)
        .expect("box extraction needs no model");
    assert!(!output.meta.apply_decontamination);
}

#[test]
fn wavelength_range_trims_the_output_tables() {
    let exposure = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::Clear);
    let config = SossExtractConfig {
        atoca: false,
        bad_pix: BadPixelMode::Masking,
        wavelength_range: Some((1.0, 1.3)),
        ..small_config()
    };
    let output = run(&exposure, &[FIRST], &config);
    let table = &output.spectra[0].integrations[0].table;
    assert!(!table.is_empty() && table.len() < COLS);
    assert!(table.wavelength.iter().all(|&w| (1.0..=1.3).contains(&w)));
}

fn worst_relative_error(flux: &[f64], baseline: &[f64]) -> f64 {
    flux.iter()
        .zip(baseline)
        .map(|(value, expected)| ((value - expected) / expected).abs())
        .fold(0.0, f64::max)
}

#[test]
fn overlapping_second_order_is_removed_from_the_first_order_box() {
    let second = OrderScene {
        row: 18.0,
        ..SECOND
    };
    let narrow = SossExtractConfig {
        width: 6.0,
        ..small_config()
    };
    let box_only = SossExtractConfig {
        atoca: false,
        bad_pix: BadPixelMode::Masking,
        ..narrow.clone()
    };

    let isolated = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::Clear);
    let baseline = run(&isolated, &[FIRST], &box_only);
    let baseline = &baseline.spectra[0].integrations[0].table.flux;

    let blended = exposure(
        vec![image(&[FIRST, second], ROWS, 0.0, 1.0)],
        Subarray::Substrip256,
        SossFilter::Clear,
    );
    let raw = run(&blended, &[FIRST, second], &box_only);
    let raw_error = worst_relative_error(&raw.spectra[0].integrations[0].table.flux, baseline);

    let cleaned = run(&blended, &[FIRST, second], &narrow);
    assert!(cleaned.meta.apply_decontamination);
    assert!(cleaned.references.tracemodels.contains_key(&2));
    let cleaned_error =
        worst_relative_error(&cleaned.spectra[0].integrations[0].table.flux, baseline);

    assert!(raw_error > 0.1, "contamination {raw_error}");
    assert!(cleaned_error < 0.12, "decontaminated error {cleaned_error}");
    assert!(
        cleaned_error < 0.8 * raw_error,
        "decontaminated {cleaned_error} vs raw {raw_error}"
    );
}

#[test]
fn modelled_spectrum_places_the_absorption_line_at_its_wavelength() {
    let exposure = exposure(vec![image(&[FIRST], ROWS, 0.0, 1.0)], Subarray::Substrip256, SossFilter::Clear);
    let output = run(&exposure, &[FIRST], &small_config());

    let observed = output
        .atoca_spectra
        .iter()
        .find(|record| {
            record.kind == SpectrumKind::Observation
                && record.spectral_order == 1
                && record.color_range == ColorRange::Red
        })
        .expect("order 1 observation");
    let table = &observed.table;
    let (line, _) = table
        .wavelength
        .iter()
        .zip(&table.flux)
        .filter(|&(&w, f)| (1.0..=1.5).contains(&w) && f.is_finite())
        .min_by(|a, b| a.1.total_cmp(b.1))
        .expect("finite flux in range");

    let (low, high) = FIRST.wave;
    let expected = low + (high - low) * 40.0 / (COLS - 1) as f64;
    assert!((line - expected).abs() < 0.03, "line at {line}, expected {expected}");
}
