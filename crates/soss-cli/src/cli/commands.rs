use super::CliError;
use anyhow::Context;
use soss_core::domain::{BadPixelMode, Exposure, SossError};
use soss_core::extract::{SossExtractConfig, run_extract1d};
use soss_core::products::{EstimateTable, Extract1dOutput, WaveGridProduct};
use soss_core::reference::{SpecKernelReference, SpecProfileReference, TraceTableReference};
use soss_core::serialization::{read_json, write_json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(clap::Args)]
pub(super) struct ExtractArgs {
    /// Exposure JSON holding the data, err and dq cubes and their metadata
    #[arg(long)]
    exposure: PathBuf,

    /// Trace table reference JSON
    #[arg(long)]
    trace_table: PathBuf,

    /// Spatial profile reference JSON
    #[arg(long)]
    spec_profile: PathBuf,

    /// Spectral kernel reference JSON
    #[arg(long)]
    spec_kernel: PathBuf,

    /// Extraction output JSON path
    #[arg(long)]
    output: PathBuf,

    /// Extraction settings JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Precomputed wavelength grid JSON
    #[arg(long)]
    wave_grid_in: Option<PathBuf>,

    /// Flux estimate table JSON used to build the grid and seed the Tikhonov search
    #[arg(long)]
    estimate: Option<PathBuf>,

    /// Write the wavelength grid used for the model to this path
    #[arg(long)]
    wave_grid_out: Option<PathBuf>,

    /// Fixed Tikhonov factor; searched when omitted
    #[arg(long)]
    tikfac: Option<f64>,

    /// Bad pixel handling inside the aperture
    #[arg(long, value_parser = parse_bad_pix)]
    bad_pix: Option<BadPixelMode>,

    /// Box aperture full width in pixels
    #[arg(long)]
    width: Option<f64>,

    /// Skip the ATOCA decontamination
    #[arg(long)]
    no_atoca: bool,

    /// Skip the column background subtraction
    #[arg(long)]
    no_background: bool,

    /// Process integrations after the first in parallel
    #[arg(long)]
    parallel: bool,

    /// Log filter, e.g. `debug` or `soss_core=debug` (default: RUST_LOG, then `info`)
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_bad_pix(value: &str) -> Result<BadPixelMode, String> {
    value
        .parse()
        .map_err(|error: SossError| error.message().to_string())
}

pub(super) fn run_extract_command(args: ExtractArgs) -> Result<i32, CliError> {
    init_logging(args.log_level.as_deref());

    let config = load_config(&args).map_err(CliError::Compute)?;
    let exposure: Exposure = read_json(&args.exposure).map_err(CliError::Compute)?;
    let trace_table: TraceTableReference =
        read_json(&args.trace_table).map_err(CliError::Compute)?;
    let spec_profile: SpecProfileReference =
        read_json(&args.spec_profile).map_err(CliError::Compute)?;
    let spec_kernel: SpecKernelReference =
        read_json(&args.spec_kernel).map_err(CliError::Compute)?;

    let output = run_extract1d(&exposure, &trace_table, &spec_profile, &spec_kernel, &config)
        .map_err(CliError::Compute)?;

    ensure_parent_dir(&args.output)?;
    write_json(&args.output, &output).map_err(CliError::Compute)?;
    info!(path = %args.output.display(), "extraction written");

    if let Some(path) = &args.wave_grid_out {
        match &output.wave_grid {
            Some(grid) => {
                ensure_parent_dir(path)?;
                let product = WaveGridProduct {
                    wavegrid: grid.clone(),
                };
                write_json(path, &product).map_err(CliError::Compute)?;
                info!(path = %path.display(), "wavelength grid written");
            }
            None => warn!(
                path = %path.display(),
                "no model was built, so there is no wavelength grid to write"
            ),
        }
    }

    println!("{}", render_summary(&output, &args.output));
    Ok(0)
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // A subscriber may already be installed when the CLI runs in-process.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(args: &ExtractArgs) -> Result<SossExtractConfig, SossError> {
    let mut config = match &args.config {
        Some(path) => read_json::<SossExtractConfig>(path)?,
        None => SossExtractConfig::default(),
    };

    if let Some(path) = &args.wave_grid_in {
        let grid: WaveGridProduct = read_json(path)?;
        info!(path = %path.display(), size = grid.wavegrid.len(), "loaded wavelength grid");
        config.wave_grid_in = Some(grid.wavegrid);
    }
    if let Some(path) = &args.estimate {
        let estimate: EstimateTable = read_json(path)?;
        config.estimate = Some(estimate);
    }
    if let Some(tikfac) = args.tikfac {
        config.tikfac = Some(tikfac);
    }
    if let Some(bad_pix) = args.bad_pix {
        config.bad_pix = bad_pix;
    }
    if let Some(width) = args.width {
        config.width = width;
    }
    if args.no_atoca {
        config.atoca = false;
    }
    if args.no_background {
        config.subtract_background = false;
    }
    if args.parallel {
        config.parallel = true;
    }
    config.validate()?;
    Ok(config)
}

fn ensure_parent_dir(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

fn render_summary(output: &Extract1dOutput, path: &Path) -> String {
    let integrations = output
        .spectra
        .first()
        .map(|tso| tso.integrations.len())
        .unwrap_or(0);
    let orders = output
        .spectra
        .iter()
        .map(|tso| tso.spectral_order.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let factor = output
        .meta
        .tikhonov_factor
        .map(|factor| format!("{factor:.3e}"))
        .unwrap_or_else(|| "none".to_string());

    let mut lines = vec![
        format!("Integrations: {integrations}"),
        format!("Orders: {orders}"),
        format!("Tikhonov factor: {factor}"),
    ];
    if !output.atoca_spectra.is_empty() {
        lines.push(format!("Modelled spectra: {}", output.atoca_spectra.len()));
    }
    lines.push(format!("Output: {}", path.display()));
    lines.join("\n")
}
