//! Resonance tracking for full-sweep scans.
//!
//! After every pixel the sweep window is recentred on the dip that pixel
//! produced. The window width never changes; only its centre moves, and the step
//! switches between fine (dip within `threshold` of the reference frequency) and
//! coarse (searching). The window used for pixel `n + 1` depends only on pixel `n`.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::window::FrequencyWindow;

/// Dip of one full-sweep spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dip {
    /// Frequency of minimum signal over the whole sweep, as recorded in the image
    pub minimum: f64,
    /// Dip restricted to the tracking bounds; the next window is centred on it
    pub tracked: f64,
}

/// Recentres the full-sweep window on the dip of the previous pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResonanceTracker {
    /// Zero-field resonance the step selection is measured against
    pub reference_frequency: f64,
}

impl ResonanceTracker {
    /// Tracker measuring the step selection against `reference_frequency`.
    pub fn new(reference_frequency: f64) -> Self {
        Self {
            reference_frequency,
        }
    }

    /// Locate the dip of one spectrum.
    ///
    /// [`Dip::minimum`] is the frequency of minimum signal over the whole window.
    /// [`Dip::tracked`] is the same frequency when it lies inside
    /// `[window.tracked_min, window.tracked_max]`; otherwise the minimum is
    /// searched again among the in-bound frequencies only. Without any in-bound
    /// frequency both are the global minimum.
    pub fn locate_dip(&self, window: &FrequencyWindow, frequencies: &[f64], signal: &[f64]) -> Option<Dip> {
        let in_bounds = |f: f64| f >= window.tracked_min && f <= window.tracked_max;

        let minimum = argmin(frequencies.iter().copied().zip(signal.iter().copied()))?;
        if in_bounds(minimum) {
            return Some(Dip {
                minimum,
                tracked: minimum,
            });
        }

        let bounded = argmin(
            frequencies
                .iter()
                .copied()
                .zip(signal.iter().copied())
                .filter(|&(f, _)| in_bounds(f)),
        );
        Some(Dip {
            minimum,
            tracked: bounded.unwrap_or(minimum),
        })
    }

    /// Window for the next pixel, centred on `dip`.
    pub fn next_window(&self, previous: &FrequencyWindow, dip: f64) -> FrequencyWindow {
        let half_span = 0.5 * previous.span();
        let coarse = (self.reference_frequency - dip).abs() >= previous.threshold;
        trace!(dip, coarse, "recentering sweep window");
        FrequencyWindow {
            start: dip - half_span,
            stop: dip + half_span,
            coarse,
            ..*previous
        }
    }
}

/// Frequency of the smallest value; the first one wins on ties.
fn argmin(points: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    points
        .fold(None, |best: Option<(f64, f64)>, (f, v)| match best {
            Some((_, best_v)) if best_v <= v => best,
            _ => Some((f, v)),
        })
        .map(|(f, _)| f)
}
