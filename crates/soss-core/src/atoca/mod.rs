//! ATOCA: joint modelling of overlapping spectral orders on a shared wavelength grid.

pub mod engine;
pub mod grid;
pub mod tikhonov;

pub use engine::{
    DEFAULT_ENGINE_THRESHOLD, EngineError, EngineOrder, ExtractionEngine, LinearModel,
    MaskOverlapError,
};
pub use grid::{
    FluxEstimate, GridError, adapt_grid, grid_from_map_with_extrapolation,
    make_combined_adaptive_grid, native_grid_from_centers, oversample_grid, wave_bounds,
};
pub use tikhonov::{
    FitMode, TikhonovTest, TikhonovTests, estimate_tikhonov_factor, run_tikhonov_tests,
    two_stage_search,
};
