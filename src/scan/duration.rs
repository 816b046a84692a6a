//! Scan duration estimate.

use serde::{Deserialize, Serialize};

use super::cursor::Orientation;
use super::ScanMode;
use crate::hardware::ports::AxisRange;

/// Empirical factor covering communication overhead on top of the clocked time.
const OVERHEAD_FACTOR: f64 = 1.8;

/// Parameters the estimate depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurationInput {
    /// Acquisition mode
    pub mode: ScanMode,
    /// `[x_res, y_res]`
    pub resolution: [usize; 2],
    /// Pixel clock in Hz
    pub clock_frequency: f64,
    /// Scan range in metres
    pub range: AxisRange,
    /// Metres per clock tick on the retrace
    pub return_slowness: f64,
    /// Fast axis
    pub orientation: Orientation,
    /// Points per full-sweep spectrum; ignored by the other modes
    pub frequency_points: usize,
}

/// Estimated scan time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationEstimate {
    /// Time spent on forward lines
    pub forward_s: f64,
    /// Time spent on retraces
    pub retrace_s: f64,
    /// Forward plus retrace, with overhead
    pub total_s: f64,
}

impl DurationEstimate {
    /// Total formatted by [`format_duration`].
    pub fn display(&self) -> String {
        format_duration(self.total_s)
    }
}

/// Computes a [`DurationEstimate`] from a [`DurationInput`].
pub struct DurationEstimator;

impl DurationEstimator {
    /// Estimate the time of one full scan.
    pub fn estimate(input: &DurationInput) -> DurationEstimate {
        let [x_res, y_res] = input.resolution;
        let pixels = (x_res * y_res) as f64;
        let multiplier = match input.mode {
            ScanMode::Quenching => 1.0,
            ScanMode::IsoB => 2.0,
            ScanMode::FullSweep => 2.0 + input.frequency_points as f64,
        };
        let forward_s = multiplier * pixels / input.clock_frequency;

        let (lines, axis_range) = match input.orientation {
            Orientation::Horizontal => (y_res, input.range.x[1] - input.range.x[0]),
            Orientation::Vertical => (x_res, input.range.y[1] - input.range.y[0]),
        };
        let retrace_s =
            lines as f64 * (axis_range / input.return_slowness) / input.clock_frequency;

        DurationEstimate {
            forward_s,
            retrace_s,
            total_s: OVERHEAD_FACTOR * (forward_s + retrace_s),
        }
    }
}

/// Render seconds as `"S s"`, `"M min, S s"` or `"H h, M min, S s"`.
pub fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let minutes = (seconds / 60.0).trunc() as u64;
    if minutes == 0 {
        return format!("{} s", seconds.trunc() as u64);
    }
    let hours = minutes / 60;
    let rest = (seconds - minutes as f64 * 60.0).round() as u64;
    if hours == 0 {
        format!("{} min, {} s", minutes, rest)
    } else {
        format!("{} h, {} min, {} s", hours, minutes - hours * 60, rest)
    }
}
