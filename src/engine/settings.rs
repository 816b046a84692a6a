//! Runtime scan parameters and their validating setters.
//!
//! Every setter returns the changed keys as a [`ParameterMap`] so the controller
//! can publish them unchanged. Invalid values are rejected with
//! [`ScanError::Configuration`] and leave the settings untouched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::ScanConfig;
use crate::error::{AppResult, ScanError};
use crate::hardware::ports::{AxisRange, SpectrometerLimits};
use crate::scan::cursor::Orientation;
use crate::scan::duration::{DurationEstimate, DurationEstimator, DurationInput};
use crate::scan::retrace::{path_fits, MAX_PATH_POINTS};
use crate::scan::strategy::{AcquisitionStrategy, TopoConverter};
use crate::scan::tracker::ResonanceTracker;
use crate::scan::window::FrequencyWindow;
use crate::scan::ScanMode;

/// Changed parameter names mapped to their new values.
pub type ParameterMap = Map<String, Value>;

/// Full-sweep parameters set together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepParameters {
    /// Sweep start in Hz
    pub start: f64,
    /// Sweep stop in Hz
    pub stop: f64,
    /// Fine step in Hz, used near resonance
    pub step: f64,
    /// Coarse step in Hz, used while searching
    pub step_coarse: f64,
    /// Lower bound of tracked dips in Hz
    pub min_fullb: f64,
    /// Upper bound of tracked dips in Hz
    pub max_fullb: f64,
    /// Sweeps averaged per pixel
    pub number_sweeps: u32,
    /// Distance from the reference frequency beyond which the coarse step is used
    pub threshold: f64,
}

/// Parameters of the next scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Measurement mode
    pub mode: ScanMode,
    /// `[x_res, y_res]`, always even
    pub resolution: [usize; 2],
    /// Scan range in meters
    pub range: AxisRange,
    /// Fast axis of the raster
    pub orientation: Orientation,
    /// Pixel clock in Hz
    pub clock_frequency: f64,
    /// Spacing of retrace and approach path samples in meters
    pub return_slowness: f64,
    /// Full z travel in meters
    pub z_scanner_range: f64,
    /// Voltage at full z travel
    pub z_scanner_max_voltage: f64,
    /// Microwave power in dBm
    pub power_dbm: f64,
    /// Lower iso-B frequency in Hz
    pub freq1: f64,
    /// Upper iso-B frequency in Hz
    pub freq2: f64,
    /// Initial full-sweep window
    pub sweep: FrequencyWindow,
    /// Sweeps averaged per full-sweep pixel
    pub number_sweeps: u32,
    /// Zero-field resonance the step selection is measured against
    pub resonance_frequency: f64,
}

impl ScanSettings {
    /// Validated settings from a loaded configuration.
    pub fn from_config(config: &ScanConfig) -> AppResult<Self> {
        config.validate()?;
        let scanner = &config.scanner;
        let mw = &config.microwave;

        let (freq1, freq2) = ordered(mw.freq1, mw.freq2);
        let mut settings = Self {
            mode: scanner.mode,
            resolution: [0, 0],
            range: AxisRange::from_array(scanner.range),
            orientation: scanner.orientation,
            clock_frequency: scanner.clock_frequency,
            return_slowness: scanner.return_slowness,
            z_scanner_range: scanner.z_scanner_range,
            z_scanner_max_voltage: scanner.z_scanner_max_voltage,
            power_dbm: mw.power_dbm,
            freq1,
            freq2,
            sweep: FrequencyWindow::new(
                mw.start,
                mw.stop,
                mw.step,
                mw.step_coarse,
                mw.min_fullb,
                mw.max_fullb,
                mw.threshold,
            )?,
            number_sweeps: mw.number_sweeps,
            resonance_frequency: mw.resonance_frequency,
        };
        settings.set_resolution(scanner.resolution[0], scanner.resolution[1])?;
        Ok(settings)
    }

    /// Select the measurement mode.
    pub fn set_mode(&mut self, mode: ScanMode) -> ParameterMap {
        self.mode = mode;
        params([("mode", json!(mode))])
    }

    /// Odd resolutions are rounded down to even: the line-scan hardware needs at
    /// least two points per call.
    pub fn set_resolution(&mut self, x_res: usize, y_res: usize) -> AppResult<ParameterMap> {
        let rounded = [x_res - x_res % 2, y_res - y_res % 2];
        if rounded.iter().any(|&res| res < 2) {
            return Err(ScanError::Configuration(format!(
                "Resolution {}x{} too small, at least 2 pixels per axis are required",
                x_res, y_res
            )));
        }
        self.resolution = rounded;
        Ok(params([
            ("x_resolution", json!(rounded[0])),
            ("y_resolution", json!(rounded[1])),
        ]))
    }

    /// Set the scan range. Each axis needs finite, increasing bounds.
    pub fn set_range(&mut self, range: AxisRange) -> AppResult<ParameterMap> {
        for (axis, [min, max]) in [("x", range.x), ("y", range.y)] {
            if !(min.is_finite() && max.is_finite()) || min >= max {
                return Err(ScanError::Configuration(format!(
                    "Invalid {} range [{}, {}]",
                    axis, min, max
                )));
            }
        }
        path_density(range, self.return_slowness)?;
        self.range = range;
        Ok(params([("scan_range", json!(range.to_array()))]))
    }

    /// Select the fast axis.
    pub fn set_orientation(&mut self, orientation: Orientation) -> ParameterMap {
        self.orientation = orientation;
        params([("orientation", json!(orientation))])
    }

    /// Set the retrace sampling step. It must be positive and keep paths over
    /// the scan range within [`MAX_PATH_POINTS`].
    pub fn set_return_slowness(&mut self, return_slowness: f64) -> AppResult<ParameterMap> {
        positive("return_slowness", return_slowness)?;
        path_density(self.range, return_slowness)?;
        self.return_slowness = return_slowness;
        Ok(params([("return_slowness", json!(return_slowness))]))
    }

    /// Set the pixel clock.
    pub fn set_clock_frequency(&mut self, clock_frequency: f64) -> AppResult<ParameterMap> {
        positive("clock_frequency", clock_frequency)?;
        self.clock_frequency = clock_frequency;
        Ok(params([("clock_frequency", json!(clock_frequency))]))
    }

    /// Set the microwave power, clamped to the source limits.
    pub fn set_power(&mut self, power_dbm: f64, limits: &SpectrometerLimits) -> ParameterMap {
        self.power_dbm = limits.power_in_range(power_dbm);
        params([("sweep_mw_power", json!(self.power_dbm))])
    }

    /// Iso-B frequencies, swapped when given in reverse order and clamped to the
    /// source limits.
    pub fn set_isob_frequencies(
        &mut self,
        freq1: f64,
        freq2: f64,
        limits: &SpectrometerLimits,
    ) -> AppResult<ParameterMap> {
        let (low, high) = ordered(freq1, freq2);
        let (low, high) = (limits.frequency_in_range(low), limits.frequency_in_range(high));
        if low == high {
            return Err(ScanError::Configuration(format!(
                "Iso-B frequencies must differ (got {} Hz twice after clamping)",
                low
            )));
        }
        self.freq1 = low;
        self.freq2 = high;
        Ok(params([("freq1", json!(low)), ("freq2", json!(high))]))
    }

    /// Replace the full-sweep window and tracking parameters. Bounds given in
    /// reverse order are swapped and everything is clamped to the source limits.
    pub fn set_sweep_parameters(
        &mut self,
        sweep: SweepParameters,
        limits: &SpectrometerLimits,
    ) -> AppResult<ParameterMap> {
        if sweep.number_sweeps == 0 {
            return Err(ScanError::Configuration(
                "number_sweeps must be at least 1".to_string(),
            ));
        }
        let (start, stop) = ordered(sweep.start, sweep.stop);
        let (min_fullb, max_fullb) = ordered(sweep.min_fullb, sweep.max_fullb);
        let window = FrequencyWindow::new(
            limits.frequency_in_range(start),
            limits.frequency_in_range(stop),
            limits.step_in_range(sweep.step),
            limits.step_in_range(sweep.step_coarse),
            limits.frequency_in_range(min_fullb),
            limits.frequency_in_range(max_fullb),
            sweep.threshold.abs(),
        )?;
        self.sweep = window;
        self.number_sweeps = sweep.number_sweeps;
        Ok(params([
            ("mw_start", json!(window.start)),
            ("mw_stop", json!(window.stop)),
            ("mw_step", json!(window.step)),
            ("mw_step_coarse", json!(window.step_coarse)),
            ("min_fullb", json!(window.tracked_min)),
            ("max_fullb", json!(window.tracked_max)),
            ("number_sweeps", json!(sweep.number_sweeps)),
            ("threshold", json!(window.threshold)),
        ]))
    }

    /// Strategy for the configured mode.
    pub fn strategy(&self) -> AcquisitionStrategy {
        match self.mode {
            ScanMode::Quenching => AcquisitionStrategy::Quenching,
            ScanMode::IsoB => AcquisitionStrategy::IsoB {
                freq1: self.freq1,
                freq2: self.freq2,
            },
            ScanMode::FullSweep => AcquisitionStrategy::FullSweep {
                freq1: self.freq1,
                freq2: self.freq2,
                number_sweeps: self.number_sweeps,
                tracker: ResonanceTracker::new(self.resonance_frequency),
            },
        }
    }

    /// Starting window of a full-sweep scan.
    pub fn initial_window(&self) -> Option<FrequencyWindow> {
        matches!(self.mode, ScanMode::FullSweep).then_some(self.sweep)
    }

    /// Volts to height conversion for the configured z calibration.
    pub fn topo_converter(&self) -> TopoConverter {
        TopoConverter::new(self.z_scanner_range, self.z_scanner_max_voltage)
    }

    /// Inputs of the duration estimate.
    pub fn duration_input(&self) -> DurationInput {
        DurationInput {
            mode: self.mode,
            resolution: self.resolution,
            clock_frequency: self.clock_frequency,
            range: self.range,
            return_slowness: self.return_slowness,
            orientation: self.orientation,
            frequency_points: self.sweep.point_count(),
        }
    }

    /// Duration estimate for the current parameters.
    pub fn estimate(&self) -> DurationEstimate {
        DurationEstimator::estimate(&self.duration_input())
    }

    /// Every parameter, keyed like the setters' change maps.
    pub fn as_parameters(&self) -> ParameterMap {
        params([
            ("mode", json!(self.mode)),
            ("x_resolution", json!(self.resolution[0])),
            ("y_resolution", json!(self.resolution[1])),
            ("scan_range", json!(self.range.to_array())),
            ("orientation", json!(self.orientation)),
            ("clock_frequency", json!(self.clock_frequency)),
            ("return_slowness", json!(self.return_slowness)),
            ("sweep_mw_power", json!(self.power_dbm)),
            ("freq1", json!(self.freq1)),
            ("freq2", json!(self.freq2)),
            ("mw_start", json!(self.sweep.start)),
            ("mw_stop", json!(self.sweep.stop)),
            ("mw_step", json!(self.sweep.step)),
            ("mw_step_coarse", json!(self.sweep.step_coarse)),
            ("min_fullb", json!(self.sweep.tracked_min)),
            ("max_fullb", json!(self.sweep.tracked_max)),
            ("number_sweeps", json!(self.number_sweeps)),
            ("threshold", json!(self.sweep.threshold)),
            ("resonance_frequency", json!(self.resonance_frequency)),
        ])
    }
}

fn params<const N: usize>(entries: [(&str, Value); N]) -> ParameterMap {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if b < a {
        (b, a)
    } else {
        (a, b)
    }
}

fn path_density(range: AxisRange, return_slowness: f64) -> AppResult<()> {
    if path_fits(range.largest_span(), return_slowness) {
        Ok(())
    } else {
        Err(ScanError::Configuration(format!(
            "return_slowness {} too fine for a {} m scan range (more than {} path points)",
            return_slowness,
            range.largest_span(),
            MAX_PATH_POINTS
        )))
    }
}

fn positive(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ScanError::Configuration(format!(
            "Invalid {} {}. Must be a positive number",
            name, value
        )))
    }
}
