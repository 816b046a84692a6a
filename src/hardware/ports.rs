//! Hardware ports consumed by the scan engine
//!
//! The engine talks to three narrow collaborators. Each port is a small async
//! capability trait; concrete drivers (DAQ cards, piezo controllers, microwave
//! sources) live outside this crate and only need to implement these methods.
//!
//! - [`PositionerPort`]: absolute moves of the probe and the reachable range
//! - [`LineScanPort`]: clocked acquisition along a path of positions
//! - [`SpectrometerPort`]: microwave sweeps and fixed-frequency counting
//!
//! # Design
//!
//! Each port trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! Failures may be reported either as `Err` or, following the convention of the
//! counting hardware, as a [`Samples`] block whose first value is `-1`. The engine
//! treats both as fatal for the running scan.
//!
//! # Thread Safety
//! - All methods take `&self`; drivers use interior mutability for state
//! - The engine calls at most one method at a time while a scan owns the ports

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scan::window::FrequencyWindow;

/// Value at `[0][0]` that a driver returns to signal a failed acquisition.
pub const FAULT_SENTINEL: f64 = -1.0;

/// Reachable positioner range `[[xmin, xmax], [ymin, ymax]]` in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// x bounds
    pub x: [f64; 2],
    /// y bounds
    pub y: [f64; 2],
}

impl AxisRange {
    /// Build from the nested array layout used in configuration files.
    pub fn from_array(range: [[f64; 2]; 2]) -> Self {
        Self {
            x: range[0],
            y: range[1],
        }
    }

    /// Nested array layout `[[xmin, xmax], [ymin, ymax]]`.
    pub fn to_array(self) -> [[f64; 2]; 2] {
        [self.x, self.y]
    }

    /// True when `(x, y)` lies inside the range, bounds included.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x[0] && x <= self.x[1] && y >= self.y[0] && y <= self.y[1]
    }

    /// Length of the longer axis.
    pub fn largest_span(&self) -> f64 {
        (self.x[1] - self.x[0]).abs().max((self.y[1] - self.y[0]).abs())
    }

    /// True when `other` lies entirely inside this range.
    pub fn encloses(&self, other: &AxisRange) -> bool {
        self.contains(other.x[0], other.y[0]) && self.contains(other.x[1], other.y[1])
    }
}

/// Hardware limits of the microwave source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerLimits {
    /// Lowest output frequency in Hz
    pub min_frequency: f64,
    /// Highest output frequency in Hz
    pub max_frequency: f64,
    /// Smallest sweep step in Hz
    pub min_step: f64,
    /// Largest sweep step in Hz
    pub max_step: f64,
    /// Lowest power in dBm
    pub min_power: f64,
    /// Highest power in dBm
    pub max_power: f64,
}

impl SpectrometerLimits {
    /// Clamp a frequency into the source's range.
    pub fn frequency_in_range(&self, frequency: f64) -> f64 {
        frequency.clamp(self.min_frequency, self.max_frequency)
    }

    /// Clamp a sweep step into the supported range.
    pub fn step_in_range(&self, step: f64) -> f64 {
        step.clamp(self.min_step, self.max_step)
    }

    /// Clamp a power in dBm into the supported range.
    pub fn power_in_range(&self, power: f64) -> f64 {
        power.clamp(self.min_power, self.max_power)
    }
}

impl Default for SpectrometerLimits {
    fn default() -> Self {
        Self {
            min_frequency: 100e3,
            max_frequency: 20e9,
            min_step: 1.0,
            max_step: 1e9,
            min_power: -144.0,
            max_power: 10.0,
        }
    }
}

/// Raw block of samples returned by an acquisition.
///
/// Row 0 is the detector signal, row 1 the raw topography in volts. Each row has
/// one entry per requested point (path position or frequency).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Samples {
    /// Sample rows, one entry per point
    pub rows: Vec<Vec<f64>>,
}

impl Samples {
    /// Block from its rows.
    pub fn new(rows: Vec<Vec<f64>>) -> Self {
        Self { rows }
    }

    /// A block carrying only the fault sentinel.
    pub fn fault() -> Self {
        Self {
            rows: vec![vec![FAULT_SENTINEL]],
        }
    }

    /// True when the driver flagged a failure through the sentinel value.
    pub fn is_fault(&self) -> bool {
        self.rows
            .first()
            .and_then(|row| row.first())
            .is_some_and(|&value| value == FAULT_SENTINEL)
    }

    /// Number of points per row (length of the signal row).
    pub fn point_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Detector signal row.
    pub fn signal(&self) -> &[f64] {
        self.rows.first().map_or(&[], Vec::as_slice)
    }

    /// Raw topography row in volts.
    pub fn topo_volts(&self) -> &[f64] {
        self.rows.get(1).map_or(&[], Vec::as_slice)
    }
}

/// Port: probe positioner
///
/// # Contract
/// - Positions are in meters
/// - `move_to` returns once the probe has reached the target
/// - Targets outside `axis_range` are an error
#[async_trait]
pub trait PositionerPort: Send + Sync {
    /// Move to an absolute position.
    async fn move_to(&self, x: f64, y: f64) -> Result<()>;

    /// Current probe position.
    async fn current_position(&self) -> Result<(f64, f64)>;

    /// Reachable range of both axes.
    async fn axis_range(&self) -> Result<AxisRange>;
}

/// Port: clocked line acquisition
///
/// # Contract
/// - `arm_clock` must be called before the first `scan_line`
/// - `scan_line` moves through every point of `path` at the pixel clock and
///   returns `[signal, topography]` rows with one entry per point
/// - `close_counters` releases the clock and counters; it is safe to call when
///   nothing is armed
#[async_trait]
pub trait LineScanPort: Send + Sync {
    /// Configure and start the pixel clock.
    async fn arm_clock(&self, clock_frequency: f64) -> Result<()>;

    /// Acquire along a path of `(x, y)` positions.
    async fn scan_line(&self, path: &[(f64, f64)]) -> Result<Samples>;

    /// Stop the clock and release the counters.
    async fn close_counters(&self) -> Result<()>;
}

/// Port: microwave spectrometer (ODMR)
///
/// # Contract
/// - `arm_trigger` switches the source into triggered list mode at the given power
/// - `sweep` returns one entry per frequency of the window, averaged over the
///   repetitions
/// - `counts` returns one entry per requested frequency
/// - `mw_off` is safe to call when the source is already off
#[async_trait]
pub trait SpectrometerPort: Send + Sync {
    /// Hardware limits used to clamp user parameters.
    fn limits(&self) -> SpectrometerLimits;

    /// Arm the microwave trigger at the pixel clock and sweep power.
    async fn arm_trigger(&self, clock_frequency: f64, power_dbm: f64) -> Result<()>;

    /// Sweep the window `repetitions` times and return the averaged spectrum.
    async fn sweep(&self, window: &FrequencyWindow, repetitions: u32) -> Result<Samples>;

    /// Count at each of the given frequencies.
    async fn counts(&self, frequencies: &[f64]) -> Result<Samples>;

    /// Switch the microwave output off.
    async fn mw_off(&self) -> Result<()>;
}
