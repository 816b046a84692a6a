//! Frequency window of a full-sweep acquisition.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ScanError};
use crate::hardware::ports::SpectrometerLimits;

/// Sweep window around the tracked resonance.
///
/// `step` is the fine step used near resonance, `step_coarse` the step used
/// while searching; `coarse` says which one the next sweep uses. Dips outside
/// `[tracked_min, tracked_max]` are not followed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyWindow {
    /// First frequency in Hz
    pub start: f64,
    /// Last frequency in Hz
    pub stop: f64,
    /// Fine step in Hz
    pub step: f64,
    /// Coarse step in Hz
    pub step_coarse: f64,
    /// Lowest dip that is followed
    pub tracked_min: f64,
    /// Highest dip that is followed
    pub tracked_max: f64,
    /// Dip shift in Hz above which the next sweep goes coarse
    pub threshold: f64,
    /// Next sweep uses `step_coarse`
    pub coarse: bool,
}

impl FrequencyWindow {
    /// Validated window starting on the fine step.
    pub fn new(
        start: f64,
        stop: f64,
        step: f64,
        step_coarse: f64,
        tracked_min: f64,
        tracked_max: f64,
        threshold: f64,
    ) -> AppResult<Self> {
        let window = Self {
            start,
            stop,
            step,
            step_coarse,
            tracked_min,
            tracked_max,
            threshold,
            coarse: false,
        };
        window.validate()?;
        Ok(window)
    }

    /// Check ordering and positivity of all fields.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.start < self.stop) {
            return Err(ScanError::Configuration(format!(
                "Sweep start {} must be below stop {}",
                self.start, self.stop
            )));
        }
        if !(self.step > 0.0 && self.step_coarse > 0.0) {
            return Err(ScanError::Configuration(format!(
                "Sweep steps must be positive (fine {}, coarse {})",
                self.step, self.step_coarse
            )));
        }
        if !(self.tracked_min < self.tracked_max) {
            return Err(ScanError::Configuration(format!(
                "Tracking bounds [{}, {}] are inverted",
                self.tracked_min, self.tracked_max
            )));
        }
        Ok(())
    }

    /// Step used by the next sweep.
    pub fn active_step(&self) -> f64 {
        if self.coarse {
            self.step_coarse
        } else {
            self.step
        }
    }

    /// `stop - start`
    pub fn span(&self) -> f64 {
        self.stop - self.start
    }

    /// Midpoint of the window.
    pub fn center(&self) -> f64 {
        0.5 * (self.start + self.stop)
    }

    /// Number of frequencies in the next sweep (at least two).
    pub fn point_count(&self) -> usize {
        let intervals = (self.span() / self.active_step()).round().max(1.0);
        intervals as usize + 1
    }

    /// Frequencies of the next sweep, starting at `start` on the active step.
    pub fn frequencies(&self) -> Vec<f64> {
        let count = self.point_count();
        let step = self.active_step();
        (0..count).map(|i| self.start + i as f64 * step).collect()
    }

    /// Shift the window into the source's range, keeping its width, and clamp
    /// the steps.
    pub fn fit_within(&mut self, limits: &SpectrometerLimits) {
        let span = self.span();
        if self.start < limits.min_frequency {
            self.start = limits.min_frequency;
            self.stop = self.start + span;
        }
        if self.stop > limits.max_frequency {
            self.stop = limits.max_frequency;
            self.start = (self.stop - span).max(limits.min_frequency);
        }
        self.step = limits.step_in_range(self.step);
        self.step_coarse = limits.step_in_range(self.step_coarse);
    }
}
