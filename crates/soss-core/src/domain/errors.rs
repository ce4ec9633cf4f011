use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SossResult<T> = Result<T, SossError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SossErrorCategory {
    Success,
    InputValidation,
    ReferenceMismatch,
    InsufficientData,
    Computation,
    IoSystem,
    Internal,
}

impl SossErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputValidation => 2,
            Self::ReferenceMismatch => 3,
            Self::InsufficientData => 4,
            Self::Computation => 5,
            Self::IoSystem => 6,
            Self::Internal => 7,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InputValidation => "InputValidationError",
            Self::ReferenceMismatch => "ReferenceMismatchError",
            Self::InsufficientData => "InsufficientDataError",
            Self::Computation => "ComputationError",
            Self::IoSystem => "IoSystemError",
            Self::Internal => "InternalError",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }

    /// Conditions the extraction recovers from locally by emitting flagged output.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::InsufficientData)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SossError {
    category: SossErrorCategory,
    code: &'static str,
    message: String,
}

impl SossError {
    pub fn new(category: SossErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }

    pub fn input_validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::InputValidation, code, message)
    }

    pub fn reference_mismatch(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::ReferenceMismatch, code, message)
    }

    pub fn insufficient_data(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::InsufficientData, code, message)
    }

    pub fn computation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::Computation, code, message)
    }

    pub fn io_system(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::IoSystem, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(SossErrorCategory::Internal, code, message)
    }

    pub const fn category(&self) -> SossErrorCategory {
        self.category
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() {
            "ERROR"
        } else {
            "INFO"
        };
        format!("{}: [{}] {}", severity, self.code, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for SossError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.label(),
            self.code,
            self.message
        )
    }
}

impl Error for SossError {}
