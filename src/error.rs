//! Error types for the instrument engine.
//!
//! Every control-surface call returns `AppResult<T>`; there is no shared
//! "last error" state. Each variant maps to the numeric result code the
//! device firmware documents (see [`SpectroError::code`]) and to one of four
//! recovery categories:
//!
//! - **Programming**: the caller used the API in the wrong order or with bad
//!   arguments. Fix the call sequence; never retry automatically.
//! - **UserAction**: the operator has to do something (reconnect, place the
//!   instrument on its tile, free the device from another application).
//! - **ScanTechnique**: the scan itself was performed badly. Repeat the scan.
//! - **HardwareIntegrity**: the instrument reported a self-test problem. Stop
//!   using it and run the vendor diagnostics.

use std::fmt;

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, SpectroError>;

/// Recovery category for a [`SpectroError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Wrong usage of the API.
    Programming,
    /// Environmental or user-handling problem; retry after user action.
    UserAction,
    /// The scan has to be repeated.
    ScanTechnique,
    /// Fatal for the session.
    HardwareIntegrity,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Programming => write!(f, "programming"),
            Self::UserAction => write!(f, "user action"),
            Self::ScanTechnique => write!(f, "scan technique"),
            Self::HardwareIntegrity => write!(f, "hardware integrity"),
        }
    }
}

/// Error returned by every engine operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum SpectroError {
    // --- programming errors -------------------------------------------------
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Buffer too small: {required} bytes required, {provided} provided")]
    BufferTooSmall { required: usize, provided: usize },

    #[error("Device handle is no longer valid")]
    InvalidHandle,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Wrong call order: {0}")]
    WrongCallOrder(String),

    #[error("Device is not open")]
    DeviceNotOpen,

    #[error("No data available")]
    NoDataAvailable,

    #[error("No measurement mode set")]
    NoMeasureModeSet,

    #[error("No reference chart line set")]
    NoReferenceChartLine,

    #[error("No substrate white reference set")]
    NoSubstrateWhite,

    #[error("Not licensed for this device: {0}")]
    NotLicensed(String),

    #[error("Device is already open")]
    AlreadyOpen,

    // --- user / environmental errors ----------------------------------------
    #[error("Device is not connected")]
    NotConnected,

    #[error("Device is not calibrated or the calibration expired")]
    NotCalibrated,

    #[error("Device is already in use by another application")]
    AlreadyInUse,

    #[error("Device communication error: {0}")]
    Communication(String),

    #[error("USB power problem detected")]
    UsbPowerProblem,

    #[error("Calibration failed: instrument is not on its white tile")]
    NotOnWhiteTile,

    // --- scan technique errors ----------------------------------------------
    #[error("Strip recognition failed")]
    StripRecognitionFailed,

    #[error("Chart correlation failed ({recognized} patches recognized)")]
    ChartCorrelationFailed { recognized: usize },

    #[error("Insufficient movement: travelled {travelled_mm:.1} mm")]
    InsufficientMovement { travelled_mm: f64 },

    #[error("Excessive movement: travelled {travelled_mm:.1} mm, ruler allows {max_mm:.1} mm")]
    ExcessiveMovement { travelled_mm: f64, max_mm: f64 },

    #[error("Scan started too early: moved after {moved_after_ms} ms")]
    EarlyScanStart { moved_after_ms: u64 },

    #[error("User action took too long")]
    UserTimeout,

    #[error("Incomplete scan: {0}")]
    IncompleteScan(String),

    #[error("Device was not moved during the scan")]
    DeviceNotMoved,

    // --- hardware integrity errors ------------------------------------------
    #[error("Device data is corrupt: {0}")]
    DeviceCorrupt(String),

    #[error("Wavelength shift of {shift_nm:.2} nm detected")]
    WavelengthShift { shift_nm: f64 },
}

impl SpectroError {
    /// Numeric result code as documented by the instrument API.
    pub fn code(&self) -> u32 {
        match self {
            Self::Internal(_) => 1,
            Self::BufferTooSmall { .. } => 2,
            Self::InvalidHandle => 9,
            Self::InvalidArgument(_) | Self::WrongCallOrder(_) => 10,
            Self::DeviceNotOpen => 11,
            Self::NotConnected => 12,
            Self::NotCalibrated => 13,
            Self::NoDataAvailable => 14,
            Self::NoMeasureModeSet => 15,
            Self::NoReferenceChartLine => 17,
            Self::NoSubstrateWhite => 18,
            Self::NotLicensed(_) => 19,
            Self::AlreadyOpen => 20,
            Self::AlreadyInUse => 51,
            Self::Communication(_) => 52,
            Self::UsbPowerProblem => 53,
            Self::NotOnWhiteTile => 54,
            Self::StripRecognitionFailed => 60,
            Self::ChartCorrelationFailed { .. } => 61,
            Self::InsufficientMovement { .. } => 62,
            Self::ExcessiveMovement { .. } => 63,
            Self::EarlyScanStart { .. } => 64,
            Self::UserTimeout => 65,
            Self::IncompleteScan(_) => 66,
            Self::DeviceNotMoved => 67,
            Self::DeviceCorrupt(_) => 71,
            Self::WavelengthShift { .. } => 72,
        }
    }

    /// Recovery category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            51..=59 | 12 | 13 => ErrorCategory::UserAction,
            60..=69 => ErrorCategory::ScanTechnique,
            70..=79 => ErrorCategory::HardwareIntegrity,
            _ => ErrorCategory::Programming,
        }
    }

    /// True when the same call may succeed after the operator acts.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::UserAction | ErrorCategory::ScanTechnique
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpectroError::Communication("pipe stalled".to_string());
        assert_eq!(err.to_string(), "Device communication error: pipe stalled");
    }

    #[test]
    fn test_result_codes() {
        assert_eq!(SpectroError::InvalidHandle.code(), 9);
        assert_eq!(SpectroError::NotOnWhiteTile.code(), 54);
        assert_eq!(SpectroError::DeviceNotMoved.code(), 67);
        assert_eq!(SpectroError::WavelengthShift { shift_nm: 1.5 }.code(), 72);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            SpectroError::NoDataAvailable.category(),
            ErrorCategory::Programming
        );
        assert_eq!(
            SpectroError::NotCalibrated.category(),
            ErrorCategory::UserAction
        );
        assert_eq!(
            SpectroError::AlreadyInUse.category(),
            ErrorCategory::UserAction
        );
        assert_eq!(
            SpectroError::InsufficientMovement { travelled_mm: 0.0 }.category(),
            ErrorCategory::ScanTechnique
        );
        assert_eq!(
            SpectroError::DeviceCorrupt("eeprom".into()).category(),
            ErrorCategory::HardwareIntegrity
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SpectroError::UserTimeout.is_retryable());
        assert!(SpectroError::NotOnWhiteTile.is_retryable());
        assert!(!SpectroError::InvalidHandle.is_retryable());
        assert!(!SpectroError::WavelengthShift { shift_nm: 2.0 }.is_retryable());
    }
}
