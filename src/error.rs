//! Error types for the characterization pipeline.
//!
//! Two layers are used:
//!
//! - **`HardwareError`**: a structured fault reported by one of the three rig
//!   subsystems (positioner, driver, digitizer). It carries a [`FaultKind`] so the
//!   measurement state machine can decide between retrying a point, skipping it,
//!   or aborting the run without string matching.
//! - **`CharacError`**: the crate-wide error. Input errors (`InvalidGridSpec`,
//!   `MissingConversionTable`, `OutOfRangeIntensity`, `InvalidSequence`) are raised
//!   while a protocol is being prepared, before any hardware command is issued.
//!   Everything else wraps I/O, serialization, configuration and hardware failures.
//!
//! By using `#[from]`, `CharacError` can be created from the underlying error
//! types with the `?` operator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Hardware Faults
// =============================================================================

/// Classification of a per-point failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Stage did not reach the target in time.
    PositionTimeout,
    /// Stage reported a fault (limit switch, alarm, interlock).
    PositionFault,
    /// Driving system rejected the configuration or failed to emit.
    DriveFault,
    /// Digitizer did not deliver a record in time.
    CaptureTimeout,
    /// Digitizer armed but never saw the trigger.
    NoTrigger,
    /// Captured record failed shape/saturation checks.
    InvalidWaveform,
    /// Subsystem could not be reached.
    Connection,
    /// Run was cancelled before the point completed.
    Cancelled,
}

impl FaultKind {
    /// Whether a fault of this kind may be cleared by re-issuing the point.
    ///
    /// Only timeouts and waveform validation failures are transient; faults
    /// escalate immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FaultKind::PositionTimeout | FaultKind::CaptureTimeout | FaultKind::InvalidWaveform
        )
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::PositionTimeout => "position_timeout",
            FaultKind::PositionFault => "position_fault",
            FaultKind::DriveFault => "drive_fault",
            FaultKind::CaptureTimeout => "capture_timeout",
            FaultKind::NoTrigger => "no_trigger",
            FaultKind::InvalidWaveform => "invalid_waveform",
            FaultKind::Connection => "connection",
            FaultKind::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// A fault reported by (or on behalf of) one rig subsystem.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{device} {kind}: {message}")]
pub struct HardwareError {
    /// Identifier of the reporting device.
    pub device: String,
    /// Fault classification.
    pub kind: FaultKind,
    /// Human-readable detail.
    pub message: String,
}

impl HardwareError {
    /// Create a new hardware error.
    pub fn new(device: impl Into<String>, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// See [`FaultKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

// =============================================================================
// Crate Error
// =============================================================================

/// Convenience alias for results using the crate error type.
pub type CharacResult<T> = std::result::Result<T, CharacError>;

/// Primary error type for the characterization pipeline.
#[derive(Error, Debug)]
pub enum CharacError {
    #[error("Invalid grid specification: {0}")]
    InvalidGridSpec(String),

    #[error("Sequence {sequence_id} requests an Isppa drive value but no conversion table was supplied")]
    MissingConversionTable { sequence_id: u32 },

    #[error("Requested intensity {requested} W/cm² is outside the conversion table range [{min}, {max}]")]
    OutOfRangeIntensity { requested: f64, min: f64, max: f64 },

    #[error("Invalid conversion table: {0}")]
    InvalidConversionTable(String),

    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Run manifest is already finalized")]
    ManifestFinalized,
}

impl CharacError {
    /// True for errors raised while preparing a protocol, before hardware is touched.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CharacError::InvalidGridSpec(_)
                | CharacError::MissingConversionTable { .. }
                | CharacError::OutOfRangeIntensity { .. }
                | CharacError::InvalidConversionTable(_)
                | CharacError::InvalidSequence(_)
        )
    }
}

impl From<figment::Error> for CharacError {
    fn from(value: figment::Error) -> Self {
        CharacError::Figment(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_and_validation_are_retryable() {
        assert!(FaultKind::PositionTimeout.is_retryable());
        assert!(FaultKind::CaptureTimeout.is_retryable());
        assert!(FaultKind::InvalidWaveform.is_retryable());

        assert!(!FaultKind::PositionFault.is_retryable());
        assert!(!FaultKind::DriveFault.is_retryable());
        assert!(!FaultKind::NoTrigger.is_retryable());
        assert!(!FaultKind::Connection.is_retryable());
        assert!(!FaultKind::Cancelled.is_retryable());
    }

    #[test]
    fn hardware_error_display_includes_device_and_kind() {
        let err = HardwareError::new("digitizer", FaultKind::NoTrigger, "armed for 30 ms");
        assert_eq!(err.to_string(), "digitizer no_trigger: armed for 30 ms");
    }

    #[test]
    fn fault_kind_serializes_as_label() {
        let json = serde_json::to_string(&FaultKind::CaptureTimeout).unwrap();
        assert_eq!(json, "\"capture_timeout\"");
        assert_eq!(FaultKind::CaptureTimeout.to_string(), "capture_timeout");
    }

    #[test]
    fn input_errors_are_classified() {
        assert!(CharacError::InvalidGridSpec("x".into()).is_input_error());
        assert!(CharacError::MissingConversionTable { sequence_id: 1 }.is_input_error());
        let hw: CharacError = HardwareError::new("stage", FaultKind::PositionFault, "limit").into();
        assert!(!hw.is_input_error());
    }
}
