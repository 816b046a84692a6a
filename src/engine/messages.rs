//! Message types for the scan controller actor.
//!
//! Callers never touch the controller's state directly. Commands travel over an
//! mpsc channel and carry a oneshot sender for the reply; progress travels the
//! other way as [`ScanEvent`]s on a broadcast channel.
//!
//! # Message Flow
//!
//! ```text
//! Caller                              Controller task
//! ------                              ---------------
//! 1. Create command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                     3. Validate against state
//!                                     4. Mutate session / dispatch a step
//!                                     5. Send response
//! 6. Await oneshot receiver   <------
//!                                     7. Broadcast ScanEvents as steps complete
//! ```
//!
//! Each command variant has a helper that builds the command and returns the
//! receiver:
//!
//! ```rust
//! use magscan::engine::messages::ScanCommand;
//!
//! let (cmd, rx) = ScanCommand::start();
//! // command_tx.send(cmd).await?;
//! // rx.await??;
//! ```

use std::sync::Arc;
use tokio::sync::oneshot;

use super::settings::{ParameterMap, ScanSettings, SweepParameters};
use super::state::ScanState;
use crate::error::{AppResult, ScanError};
use crate::hardware::ports::AxisRange;
use crate::scan::{
    DurationEstimate, FrequencyWindow, Orientation, Plane, ScanCursor, ScanImage, ScanLineBuffer,
    ScanMode, SpectrumLog, SpectrumRecord,
};

/// A single parameter update, applied only while no scan is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterChange {
    /// Measurement mode; reallocates the image
    Mode(ScanMode),
    /// Pixels along x and y; odd values are rounded down to even
    Resolution {
        /// Pixels along x
        x: usize,
        /// Pixels along y
        y: usize,
    },
    /// Scan range in meters
    Range(AxisRange),
    /// Fast axis of the raster
    Orientation(Orientation),
    /// Spacing of retrace and approach path samples in meters
    ReturnSlowness(f64),
    /// Pixel clock in Hz
    ClockFrequency(f64),
    /// Microwave power in dBm, clamped to the source limits
    Power(f64),
    /// Iso-B frequency pair in Hz, swapped when given in reverse order
    IsoBFrequencies {
        /// First frequency
        freq1: f64,
        /// Second frequency
        freq2: f64,
    },
    /// Full-sweep window and tracking parameters
    Sweep(SweepParameters),
}

impl ParameterChange {
    /// True when the change alters the shape or meaning of the image.
    pub fn reallocates_image(&self) -> bool {
        matches!(
            self,
            ParameterChange::Mode(_)
                | ParameterChange::Resolution { .. }
                | ParameterChange::Range(_)
                | ParameterChange::Orientation(_)
        )
    }
}

/// Commands accepted by the scan controller.
///
/// Each variant carries a `oneshot::Sender` for the reply. Use the helper
/// constructors like [`start`](Self::start) to get the matching receiver.
#[derive(Debug)]
pub enum ScanCommand {
    /// Allocates a fresh image and session, arms the hardware and starts
    /// acquiring from the first pixel.
    ///
    /// # Response
    ///
    /// - `Ok(())`: Session created, first step dispatched
    /// - `Err(AlreadyRunning)`: A session or a move is in progress
    /// - `Err(Configuration)`: Scan range outside the positioner's travel
    Start {
        /// Response channel for the start result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Stops scheduling after the step in flight.
    ///
    /// Answered once the controller has left `Running`: `Ok(())` when it
    /// reached `Paused`, `Err(NotRunning)` when the scan ended first.
    Pause {
        /// Response channel, answered on the transition
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Re-arms the hardware and continues at the saved cursor.
    ///
    /// # Response
    ///
    /// - `Ok(())`: Hardware re-arm dispatched
    /// - `Err(NotPaused)`: The controller is not paused
    Resume {
        /// Response channel for the resume result
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Ends the session after the step in flight and releases the hardware.
    ///
    /// `is_final` marks a scan that should be reported as complete; the cursor
    /// is then reset to the first pixel. Answered once the controller is back in
    /// `Idle`. A stop while idle is a no-op.
    Stop {
        /// Report the scan as complete
        is_final: bool,
        /// Response channel, answered once the hardware is released
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Applies a parameter change and replies with the changed keys.
    Configure {
        /// The update to apply
        change: ParameterChange,
        /// Response channel carrying the changed keys
        response: oneshot::Sender<AppResult<ParameterMap>>,
    },

    /// Fits a plane to the visited raw topography and subtracts it.
    CorrectTopography {
        /// Response channel carrying the fitted plane
        response: oneshot::Sender<AppResult<Plane>>,
    },

    /// Moves the probe outside a scan. Progress is reported with
    /// [`ScanEvent::PositionChanged`] and [`ScanEvent::MoveToEnded`].
    MoveTo {
        /// Target x in meters
        x: f64,
        /// Target y in meters
        y: f64,
        /// Response channel, answered once the move is dispatched
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Copy of everything a viewer needs.
    Snapshot {
        /// Response channel for the snapshot
        response: oneshot::Sender<ScanSnapshot>,
    },

    /// Tears down any active session and exits the controller loop.
    Shutdown {
        /// Acknowledged once the hardware is released
        response: oneshot::Sender<()>,
    },
}

impl ScanCommand {
    /// Build a `Start` command and its response receiver.
    pub fn start() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { response: tx }, rx)
    }

    /// Build a `Pause` command and its response receiver.
    pub fn pause() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Pause { response: tx }, rx)
    }

    /// Build a `Resume` command and its response receiver.
    pub fn resume() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Resume { response: tx }, rx)
    }

    /// Build a `Stop` command and its response receiver.
    pub fn stop(is_final: bool) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Stop {
                is_final,
                response: tx,
            },
            rx,
        )
    }

    /// Build a `Configure` command and its response receiver.
    pub fn configure(change: ParameterChange) -> (Self, oneshot::Receiver<AppResult<ParameterMap>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Configure {
                change,
                response: tx,
            },
            rx,
        )
    }

    /// Build a `CorrectTopography` command and its response receiver.
    pub fn correct_topography() -> (Self, oneshot::Receiver<AppResult<Plane>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CorrectTopography { response: tx }, rx)
    }

    /// Build a `MoveTo` command and its response receiver.
    pub fn move_to(x: f64, y: f64) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::MoveTo { x, y, response: tx }, rx)
    }

    /// Build a `Snapshot` command and its response receiver.
    pub fn snapshot() -> (Self, oneshot::Receiver<ScanSnapshot>) {
        let (tx, rx) = oneshot::channel();
        (Self::Snapshot { response: tx }, rx)
    }

    /// Build a `Shutdown` command and its response receiver.
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Notifications broadcast by the controller.
///
/// Images and spectra are shared `Arc`s: the controller copies on its next write
/// when a subscriber still holds the previous version, so a received image never
/// changes underneath its reader.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// Previous state
        from: ScanState,
        /// New state
        to: ScanState,
    },
    /// Parameters changed; keys and new values.
    ParametersChanged(ParameterMap),
    /// A step was committed, or the image was reallocated or corrected.
    ImageUpdated {
        /// Current image
        image: Arc<ScanImage>,
        /// Live buffer of the line being acquired
        line: Arc<ScanLineBuffer>,
        /// Spectrum of the committed full-sweep pixel
        spectrum: Option<SpectrumRecord>,
    },
    /// The session is over and the hardware released.
    ScanEnded {
        /// True when the scan completed or was stopped as final
        was_final: bool,
        /// Final image
        image: Arc<ScanImage>,
        /// Every spectrum recorded during the session
        spectra: Arc<SpectrumLog>,
    },
    /// New human-readable duration estimate after a parameter change.
    DurationEstimateChanged(String),
    /// Estimated time left, sent after every committed step.
    RemainingTimeChanged(String),
    /// A hardware fault aborted the session at `(row, col)`.
    Fault {
        /// The fault
        error: Arc<ScanError>,
        /// Row of the failing pixel
        row: usize,
        /// Column of the failing pixel
        col: usize,
    },
    /// The probe reached one point of a free move.
    PositionChanged {
        /// x in meters
        x: f64,
        /// y in meters
        y: f64,
    },
    /// A free move reached its target.
    MoveToEnded {
        /// x in meters
        x: f64,
        /// y in meters
        y: f64,
    },
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct ScanSnapshot {
    /// Lifecycle state
    pub state: ScanState,
    /// Parameters of the current or next scan
    pub settings: ScanSettings,
    /// Next pixel to acquire
    pub cursor: ScanCursor,
    /// Pixels committed in acquisition order
    pub committed: usize,
    /// Current image
    pub image: Arc<ScanImage>,
    /// Live line buffer
    pub line: Arc<ScanLineBuffer>,
    /// Spectra recorded so far
    pub spectra: Arc<SpectrumLog>,
    /// Sweep window of the next full-sweep pixel
    pub window: Option<FrequencyWindow>,
    /// Active topography correction
    pub correction: Option<Plane>,
    /// Duration estimate for the current parameters
    pub estimate: DurationEstimate,
    /// Id of the active session
    pub session_id: Option<uuid::Uuid>,
}
