//! Output records. Every record is built complete by a constructor function
//! and never patched afterwards.

use crate::atoca::{FluxEstimate, GridError, TikhonovTest};
use crate::domain::{BadPixelMode, DO_NOT_USE, SpectralOrder};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpectrumKind {
    Observation,
    Test,
}

/// Which part of the spectrum a record covers: the jointly fitted range or
/// the separately modelled blue end of order 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColorRange {
    Red,
    Blue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecTable {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
    pub flux_error: Vec<f64>,
    pub dq: Vec<u32>,
    pub background: Vec<f64>,
    pub npixels: Vec<f64>,
}

impl SpecTable {
    /// Box-extracted table. `DO_NOT_USE` is set wherever the flux is not finite.
    pub fn extracted(
        wavelength: Vec<f64>,
        flux: Vec<f64>,
        flux_error: Vec<f64>,
        background: Vec<f64>,
        npixels: Vec<f64>,
    ) -> Self {
        let dq = flux
            .iter()
            .map(|value| if value.is_finite() { 0 } else { DO_NOT_USE })
            .collect();
        Self {
            wavelength,
            flux,
            flux_error,
            dq,
            background,
            npixels,
        }
    }

    /// Modelled spectrum with only wavelength and flux columns populated.
    pub fn modelled(wavelength: Vec<f64>, flux: Vec<f64>) -> Self {
        let len = wavelength.len();
        Self {
            wavelength,
            flux,
            flux_error: vec![0.0; len],
            dq: vec![0; len],
            background: vec![0.0; len],
            npixels: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    /// Rows whose wavelength lies in `[min, max]`.
    pub fn within(&self, (min, max): (f64, f64)) -> Self {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| self.wavelength[i] >= min && self.wavelength[i] <= max)
            .collect();
        let take = |column: &[f64]| keep.iter().map(|&i| column[i]).collect::<Vec<f64>>();
        Self {
            wavelength: take(&self.wavelength),
            flux: take(&self.flux),
            flux_error: take(&self.flux_error),
            dq: keep.iter().map(|&i| self.dq[i]).collect(),
            background: take(&self.background),
            npixels: take(&self.npixels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TikhonovDiagnostics {
    pub chi2: f64,
    pub chi2_soft_l1: f64,
    pub chi2_cauchy: f64,
    /// Squared norm of the regularisation vector.
    pub reg: f64,
}

impl From<&TikhonovTest> for TikhonovDiagnostics {
    fn from(test: &TikhonovTest) -> Self {
        Self {
            chi2: test.chi2,
            chi2_soft_l1: test.chi2_soft_l1,
            chi2_cauchy: test.chi2_cauchy,
            reg: test.penalty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    pub spectral_order: SpectralOrder,
    /// 1-based integration number; 0 for Tikhonov test spectra.
    pub int_num: usize,
    pub kind: SpectrumKind,
    pub color_range: ColorRange,
    pub factor: Option<f64>,
    pub diagnostics: Option<TikhonovDiagnostics>,
    pub mid_time_mjd: Option<f64>,
    pub table: SpecTable,
}

impl SpectrumRecord {
    /// Copy bound to an integration. Test spectra keep `int_num == 0`.
    pub fn for_integration(&self, int_num: usize, mid_time_mjd: Option<f64>) -> Self {
        let int_num = match self.kind {
            SpectrumKind::Observation => int_num,
            SpectrumKind::Test => 0,
        };
        Self {
            int_num,
            mid_time_mjd,
            ..self.clone()
        }
    }
}

pub fn observation_spectrum(
    spectral_order: SpectralOrder,
    color_range: ColorRange,
    factor: Option<f64>,
    table: SpecTable,
) -> SpectrumRecord {
    SpectrumRecord {
        spectral_order,
        int_num: 0,
        kind: SpectrumKind::Observation,
        color_range,
        factor,
        diagnostics: None,
        mid_time_mjd: None,
        table,
    }
}

pub fn test_spectrum(
    spectral_order: SpectralOrder,
    color_range: ColorRange,
    test: &TikhonovTest,
    table: SpecTable,
) -> SpectrumRecord {
    SpectrumRecord {
        spectral_order,
        int_num: 0,
        kind: SpectrumKind::Test,
        color_range,
        factor: Some(test.factor),
        diagnostics: Some(TikhonovDiagnostics::from(test)),
        mid_time_mjd: None,
        table,
    }
}

/// Box-extracted spectrum of one order for one integration.
pub fn integration_spectrum(
    spectral_order: SpectralOrder,
    int_num: usize,
    mid_time_mjd: Option<f64>,
    table: SpecTable,
) -> SpectrumRecord {
    SpectrumRecord {
        int_num,
        mid_time_mjd,
        ..observation_spectrum(spectral_order, ColorRange::Red, None, table)
    }
}

/// All integrations of one spectral order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsoSpectrum {
    pub spectral_order: SpectralOrder,
    pub segment_number: Option<u32>,
    pub integrations: Vec<SpectrumRecord>,
}

pub fn make_tso_spectrum(
    spectral_order: SpectralOrder,
    segment_number: Option<u32>,
    integrations: Vec<SpectrumRecord>,
) -> TsoSpectrum {
    TsoSpectrum {
        spectral_order,
        segment_number,
        integrations,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub width: f64,
    pub apply_decontamination: bool,
    pub tikhonov_factor: Option<f64>,
    pub oversampling: usize,
    pub threshold: f64,
    pub bad_pix: BadPixelMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveGridProduct {
    pub wavegrid: Vec<f64>,
}

/// Tabulated flux estimate supplied in place of the internal bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateTable {
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
}

impl EstimateTable {
    pub fn to_estimate(&self) -> Result<FluxEstimate, GridError> {
        FluxEstimate::from_samples(&self.wavelength, &self.flux)
    }
}

/// Trace models and box weights per order, one image per integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SossReferenceProduct {
    pub tracemodels: BTreeMap<SpectralOrder, Vec<Array2<f64>>>,
    pub box_weights: BTreeMap<SpectralOrder, Vec<Array2<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extract1dOutput {
    pub spectra: Vec<TsoSpectrum>,
    /// Modelled spectra, Tikhonov tests included, in production order.
    pub atoca_spectra: Vec<SpectrumRecord>,
    pub references: SossReferenceProduct,
    pub wave_grid: Option<Vec<f64>>,
    pub meta: ExtractionMetadata,
}

#[cfg(test)]
mod tests {
    use super::{
        ColorRange, SpecTable, SpectrumKind, TikhonovDiagnostics, integration_spectrum,
        observation_spectrum, test_spectrum,
    };
    use crate::atoca::TikhonovTest;
    use crate::domain::DO_NOT_USE;

    #[test]
    fn extracted_tables_flag_missing_flux() {
        let table = SpecTable::extracted(
            vec![1.0, 1.1, 1.2],
            vec![5.0, f64::NAN, 7.0],
            vec![0.1, f64::NAN, 0.1],
            vec![0.0; 3],
            vec![3.0, 0.0, 3.0],
        );
        assert_eq!(table.dq, vec![0, DO_NOT_USE, 0]);

        let cut = table.within((1.05, 1.5));
        assert_eq!(cut.wavelength, vec![1.1, 1.2]);
        assert_eq!(cut.dq, vec![DO_NOT_USE, 0]);
        assert_eq!(cut.npixels, vec![0.0, 3.0]);
    }

    #[test]
    fn test_spectra_stay_outside_integrations() {
        let test = TikhonovTest {
            factor: 2.0,
            solution: vec![1.0, 2.0],
            chi2: 1.5,
            chi2_soft_l1: 1.2,
            chi2_cauchy: 0.9,
            reg: vec![3.0, f64::NAN, 4.0],
        };
        let record = test_spectrum(1, ColorRange::Red, &test, SpecTable::default());
        assert_eq!(record.kind, SpectrumKind::Test);
        assert_eq!(
            record.diagnostics,
            Some(TikhonovDiagnostics {
                chi2: 1.5,
                chi2_soft_l1: 1.2,
                chi2_cauchy: 0.9,
                reg: 25.0
            })
        );
        assert_eq!(record.for_integration(3, Some(1.0)).int_num, 0);

        let observed = observation_spectrum(2, ColorRange::Blue, Some(0.5), SpecTable::default());
        let bound = observed.for_integration(3, Some(60000.5));
        assert_eq!(bound.int_num, 3);
        assert_eq!(bound.mid_time_mjd, Some(60000.5));
        assert_eq!(bound.color_range, ColorRange::Blue);

        let box_record = integration_spectrum(1, 2, None, SpecTable::default());
        assert_eq!(box_record.int_num, 2);
        assert_eq!(box_record.factor, None);
    }
}
