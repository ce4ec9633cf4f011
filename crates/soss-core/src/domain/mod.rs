pub mod errors;

pub use errors::{SossError, SossErrorCategory, SossResult};

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Pixel must be ignored by every downstream stage.
pub const DO_NOT_USE: u32 = 1;
/// Reference (non light-sensitive) pixel.
pub const REFERENCE_PIXEL: u32 = 1 << 31;

pub type SpectralOrder = u8;

pub fn order_label(order: SpectralOrder) -> String {
    format!("Order {order}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subarray {
    #[serde(rename = "SUBSTRIP96")]
    Substrip96,
    #[serde(rename = "SUBSTRIP256")]
    Substrip256,
    #[serde(rename = "FULL")]
    Full,
}

impl Subarray {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Substrip96 => "SUBSTRIP96",
            Self::Substrip256 => "SUBSTRIP256",
            Self::Full => "FULL",
        }
    }
}

impl FromStr for Subarray {
    type Err = SossError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUBSTRIP96" => Ok(Self::Substrip96),
            "SUBSTRIP256" => Ok(Self::Substrip256),
            "FULL" => Ok(Self::Full),
            other => Err(SossError::input_validation(
                "INPUT.SUBARRAY",
                format!("unknown subarray '{other}'"),
            )),
        }
    }
}

impl Display for Subarray {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SossFilter {
    #[serde(rename = "CLEAR")]
    Clear,
    #[serde(rename = "F277W")]
    F277w,
}

impl SossFilter {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "CLEAR",
            Self::F277w => "F277W",
        }
    }
}

impl FromStr for SossFilter {
    type Err = SossError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CLEAR" => Ok(Self::Clear),
            "F277W" => Ok(Self::F277w),
            other => Err(SossError::input_validation(
                "INPUT.FILTER",
                format!("unknown filter '{other}'"),
            )),
        }
    }
}

impl Display for SossFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad pixels inside the box aperture are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadPixelMode {
    Masking,
    #[default]
    Model,
}

impl BadPixelMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Masking => "masking",
            Self::Model => "model",
        }
    }
}

impl FromStr for BadPixelMode {
    type Err = SossError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "masking" => Ok(Self::Masking),
            "model" => Ok(Self::Model),
            other => Err(SossError::input_validation(
                "INPUT.BAD_PIX",
                format!("bad_pix must be 'masking' or 'model', got '{other}'"),
            )),
        }
    }
}

impl Display for BadPixelMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One integration: science, uncertainty and data-quality planes indexed `[row, col]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorImage {
    pub data: Array2<f64>,
    pub err: Array2<f64>,
    pub dq: Array2<u32>,
}

impl DetectorImage {
    pub fn new(data: Array2<f64>, err: Array2<f64>, dq: Array2<u32>) -> SossResult<Self> {
        if data.dim() != err.dim() || data.dim() != dq.dim() {
            return Err(SossError::input_validation(
                "INPUT.SHAPE_MISMATCH",
                format!(
                    "data {:?}, err {:?} and dq {:?} must share one shape",
                    data.dim(),
                    err.dim(),
                    dq.dim()
                ),
            ));
        }
        Ok(Self { data, err, dq })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureMeta {
    pub pupil_position: f64,
    pub subarray: Subarray,
    pub filter: SossFilter,
    #[serde(default)]
    pub segment_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrationTime {
    pub int_num: usize,
    pub int_start_mjd: f64,
    pub int_mid_mjd: f64,
    pub int_end_mjd: f64,
}

/// Stack of integrations sharing one detector geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    pub data: Array3<f64>,
    pub err: Array3<f64>,
    pub dq: Array3<u32>,
    pub meta: ExposureMeta,
    #[serde(default)]
    pub int_times: Vec<IntegrationTime>,
}

impl Exposure {
    pub fn new(
        data: Array3<f64>,
        err: Array3<f64>,
        dq: Array3<u32>,
        meta: ExposureMeta,
        int_times: Vec<IntegrationTime>,
    ) -> SossResult<Self> {
        let exposure = Self {
            data,
            err,
            dq,
            meta,
            int_times,
        };
        exposure.validate()?;
        Ok(exposure)
    }

    pub fn from_image(image: DetectorImage, meta: ExposureMeta) -> SossResult<Self> {
        let DetectorImage { data, err, dq } = image;
        Self::new(
            data.insert_axis(Axis(0)),
            err.insert_axis(Axis(0)),
            dq.insert_axis(Axis(0)),
            meta,
            Vec::new(),
        )
    }

    /// Re-checks shape invariants; needed after deserialization.
    pub fn validate(&self) -> SossResult<()> {
        if self.data.dim() != self.err.dim() || self.data.dim() != self.dq.dim() {
            return Err(SossError::input_validation(
                "INPUT.SHAPE_MISMATCH",
                format!(
                    "data {:?}, err {:?} and dq {:?} must share one shape",
                    self.data.dim(),
                    self.err.dim(),
                    self.dq.dim()
                ),
            ));
        }
        if self.data.is_empty() {
            return Err(SossError::input_validation(
                "INPUT.EMPTY_EXPOSURE",
                "exposure holds no pixels",
            ));
        }
        if !self.meta.pupil_position.is_finite() {
            return Err(SossError::input_validation(
                "INPUT.PUPIL_POSITION",
                "pupil position must be finite",
            ));
        }
        Ok(())
    }

    pub fn n_integrations(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    pub fn detector_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn integration(&self, index: usize) -> DetectorImage {
        DetectorImage {
            data: self.data.index_axis(Axis(0), index).to_owned(),
            err: self.err.index_axis(Axis(0), index).to_owned(),
            dq: self.dq.index_axis(Axis(0), index).to_owned(),
        }
    }

    /// Mid-exposure time for a 1-based integration number, when the TSO table carries it.
    pub fn mid_time(&self, int_num: usize) -> Option<f64> {
        self.int_times
            .iter()
            .find(|entry| entry.int_num == int_num)
            .map(|entry| entry.int_mid_mjd)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BadPixelMode, DetectorImage, Exposure, ExposureMeta, IntegrationTime, SossErrorCategory,
        SossFilter, Subarray, order_label,
    };
    use ndarray::{Array2, Array3};

    fn meta() -> ExposureMeta {
        ExposureMeta {
            pupil_position: 245.76,
            subarray: Subarray::Substrip256,
            filter: SossFilter::Clear,
            segment_number: None,
        }
    }

    #[test]
    fn labels_and_modes_parse_case_insensitively() {
        assert_eq!(order_label(2), "Order 2");
        assert_eq!("substrip96".parse::<Subarray>().expect("subarray"), Subarray::Substrip96);
        assert_eq!("clear".parse::<SossFilter>().expect("filter"), SossFilter::Clear);
        assert_eq!("MASKING".parse::<BadPixelMode>().expect("mode"), BadPixelMode::Masking);

        let error = "wide".parse::<BadPixelMode>().expect_err("unknown mode");
        assert_eq!(error.category(), SossErrorCategory::InputValidation);
    }

    #[test]
    fn detector_image_rejects_mismatched_planes() {
        let error = DetectorImage::new(
            Array2::zeros((4, 5)),
            Array2::zeros((4, 5)),
            Array2::zeros((5, 4)),
        )
        .expect_err("shape mismatch");
        assert_eq!(error.code(), "INPUT.SHAPE_MISMATCH");
    }

    #[test]
    fn image_is_promoted_to_single_integration_cube() {
        let image = DetectorImage::new(
            Array2::from_elem((3, 4), 2.0),
            Array2::ones((3, 4)),
            Array2::zeros((3, 4)),
        )
        .expect("image");
        let exposure = Exposure::from_image(image, meta()).expect("exposure");

        assert_eq!(exposure.n_integrations(), 1);
        assert_eq!(exposure.detector_shape(), (3, 4));
        assert_eq!(exposure.integration(0).data[(2, 3)], 2.0);
    }

    #[test]
    fn mid_time_lookup_uses_integration_number() {
        let exposure = Exposure::new(
            Array3::zeros((2, 2, 2)),
            Array3::ones((2, 2, 2)),
            Array3::zeros((2, 2, 2)),
            meta(),
            vec![IntegrationTime {
                int_num: 2,
                int_start_mjd: 1.0,
                int_mid_mjd: 1.5,
                int_end_mjd: 2.0,
            }],
        )
        .expect("exposure");

        assert_eq!(exposure.mid_time(2), Some(1.5));
        assert_eq!(exposure.mid_time(1), None);
    }
}
