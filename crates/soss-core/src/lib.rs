//! NIRISS SOSS spectral extraction: ATOCA decontamination of overlapping
//! orders followed by box extraction.

pub mod atoca;
pub mod domain;
pub mod extract;
pub mod numerics;
pub mod products;
pub mod reference;
pub mod serialization;

pub use domain::{SossError, SossErrorCategory, SossResult};
pub use extract::{SossExtractConfig, run_extract1d};
