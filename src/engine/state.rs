//! Scan lifecycle state.

use serde::{Deserialize, Serialize};

/// Scan controller state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Running ──pause──> Paused
///  ▲                 │  ▲              │
///  │                 │  └───resume─────┤
///  │            stop/end/fault         stop
///  │                 ▼                 │
///  └───cleanup─── Stopped <────────────┘
/// ```
///
/// `Stopped` is only held while the hardware is torn down; the controller then
/// returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan session, hardware released
    #[default]
    Idle,
    /// Pixels are being acquired
    Running,
    /// Session kept, no step scheduled until resumed
    Paused,
    /// Hardware teardown in progress
    Stopped,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Running => write!(f, "Running"),
            ScanState::Paused => write!(f, "Paused"),
            ScanState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ScanState {
    /// Check if the state allows starting a new scan.
    pub fn can_start(&self) -> bool {
        matches!(self, ScanState::Idle)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ScanState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ScanState::Paused)
    }

    /// True while a session owns the hardware.
    pub fn is_active(&self) -> bool {
        !matches!(self, ScanState::Idle)
    }
}
