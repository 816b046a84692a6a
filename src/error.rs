//! Custom error types for the scan engine.
//!
//! This module defines the primary error type, `ScanError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures a raster scan can run into, from rejected parameters to hardware
//! faults in the middle of a line.
//!
//! ## Error Hierarchy
//!
//! `ScanError` is an enum that consolidates the failure classes of the engine:
//!
//! - **`Configuration`**: Invalid resolution, range, frequency or timing parameters.
//!   Always rejected synchronously, before a session is started or altered.
//! - **`Config`**: Wraps errors from `figment` while loading the configuration file.
//! - **`PositionerFault`**: The positioner refused or failed a move mid-scan.
//! - **`AcquisitionFault`**: A detector or spectrometer call failed, returned the
//!   `-1` fault sentinel, or kept returning a spectrum of the wrong size.
//! - **`SweepSizeMismatch`**: A single spectrum of unexpected length. The controller
//!   recomputes the window and retries the pixel once before escalating it to
//!   `AcquisitionFault`.
//! - **`AlreadyRunning`** / **`NotPaused`** / **`NotRunning`**: Lifecycle commands
//!   issued in the wrong state.
//! - **`Processing`**: Post-processing (plane fit) could not be computed.
//! - **`EngineUnavailable`**: The controller task is gone and can no longer answer.
//!
//! Positioner and acquisition faults never reach the caller of `start`; they stop the
//! scan and are surfaced as [`crate::engine::ScanEvent::Fault`] notifications.

use crate::engine::state::ScanState;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Errors returned by the scan engine.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Invalid parameter, rejected before it reaches a session
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or deserialized
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Positioner move, retrace or approach failed
    #[error("Positioner fault: {0}")]
    PositionerFault(String),

    /// Counting, sweeping or arming failed, or the fault sentinel was returned
    #[error("Acquisition fault: {0}")]
    AcquisitionFault(String),

    /// A sweep returned a different number of points than its window holds
    #[error("Spectrum size mismatch: expected {expected} points, got {actual}")]
    SweepSizeMismatch {
        /// Points in the sweep window
        expected: usize,
        /// Points returned by the spectrometer
        actual: usize,
    },

    /// A session or move is already active
    #[error("Cannot start: scan is {0}")]
    AlreadyRunning(ScanState),

    /// Resume requested while not paused
    #[error("Cannot resume: scan is {0}, not paused")]
    NotPaused(ScanState),

    /// Pause requested while not running
    #[error("Cannot pause: scan is {0}")]
    NotRunning(ScanState),

    /// Post-processing could not be computed
    #[error("Data processing error: {0}")]
    Processing(String),

    /// The controller task has exited
    #[error("Scan engine is not running")]
    EngineUnavailable,
}

impl ScanError {
    /// True for the faults that abort a running scan.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            ScanError::PositionerFault(_)
                | ScanError::AcquisitionFault(_)
                | ScanError::SweepSizeMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::AcquisitionFault("counter returned -1".to_string());
        assert_eq!(err.to_string(), "Acquisition fault: counter returned -1");
    }

    #[test]
    fn test_lifecycle_errors_carry_state() {
        let err = ScanError::NotPaused(ScanState::Running);
        assert_eq!(err.to_string(), "Cannot resume: scan is Running, not paused");
        assert!(!err.is_hardware_fault());
    }

    #[test]
    fn test_sweep_mismatch_is_hardware_fault() {
        let err = ScanError::SweepSizeMismatch {
            expected: 11,
            actual: 2,
        };
        assert!(err.is_hardware_fault());
        assert!(err.to_string().contains("expected 11"));
    }
}
