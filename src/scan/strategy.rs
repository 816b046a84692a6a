//! Per-mode pixel acquisition.
//!
//! [`AcquisitionStrategy`] is chosen once when a scan starts. `acquire` runs on a
//! worker task and is the only place that talks to the hardware ports during a
//! pixel; `store` runs on the controller and writes the validated samples into
//! the image. No partial data reaches the image when `acquire` fails.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::image::{ChannelLayout, ScanImage};
use super::spectra::SpectrumRecord;
use super::topography::Plane;
use super::tracker::ResonanceTracker;
use super::window::FrequencyWindow;
use super::ScanMode;
use crate::error::{AppResult, ScanError};
use crate::hardware::ports::Samples;
use crate::hardware::HardwarePorts;

/// Converts raw z-piezo volts into a height in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopoConverter {
    z_range: f64,
    coefficient: f64,
}

impl TopoConverter {
    /// Converter for a piezo of `z_range` metres at `z_max_voltage` volts.
    pub fn new(z_range: f64, z_max_voltage: f64) -> Self {
        Self {
            z_range,
            coefficient: z_range / z_max_voltage,
        }
    }

    /// Height in metres of one reading.
    pub fn to_height(&self, volts: f64) -> f64 {
        self.z_range - self.coefficient * volts
    }

    /// Height of the mean of several readings.
    pub fn mean_height(&self, volts: &[f64]) -> f64 {
        if volts.is_empty() {
            return self.to_height(0.0);
        }
        self.to_height(volts.iter().sum::<f64>() / volts.len() as f64)
    }
}

/// Raw hardware data of one acquisition step.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelSamples {
    /// One line scan over the step's pixels
    Line(Samples),
    /// Counts at `freq1` and `freq2`
    Counts(Samples),
    /// Averaged spectrum plus the iso-B counts
    Sweep {
        /// Swept frequencies in Hz
        frequencies: Vec<f64>,
        /// Averaged spectrum
        spectrum: Samples,
        /// Counts at `freq1` and `freq2`
        counts: Samples,
    },
}

/// What a stored step produced beyond the image values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreOutcome {
    /// Dip the next full-sweep window is centred on
    pub dip: Option<f64>,
    /// Spectrum to append to the log
    pub spectrum: Option<SpectrumRecord>,
}

/// What is measured at each pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionStrategy {
    /// Photoluminescence only, two pixels per step
    Quenching,
    /// Counts at two fixed frequencies
    IsoB {
        /// Lower frequency in Hz
        freq1: f64,
        /// Upper frequency in Hz
        freq2: f64,
    },
    /// Full sweep with resonance tracking, plus the iso-B counts
    FullSweep {
        /// Lower iso-B frequency in Hz
        freq1: f64,
        /// Upper iso-B frequency in Hz
        freq2: f64,
        /// Sweeps averaged per pixel
        number_sweeps: u32,
        /// Dip search and window update
        tracker: ResonanceTracker,
    },
}

impl AcquisitionStrategy {
    /// Mode this strategy fills.
    pub fn mode(&self) -> ScanMode {
        match self {
            AcquisitionStrategy::Quenching => ScanMode::Quenching,
            AcquisitionStrategy::IsoB { .. } => ScanMode::IsoB,
            AcquisitionStrategy::FullSweep { .. } => ScanMode::FullSweep,
        }
    }

    /// Acquire the pixels at `targets` (two for quenching, one otherwise).
    pub async fn acquire(
        &self,
        ports: &HardwarePorts,
        targets: &[(f64, f64)],
        window: Option<&FrequencyWindow>,
    ) -> AppResult<PixelSamples> {
        match self {
            AcquisitionStrategy::Quenching => {
                let samples = ports.line_scanner.scan_line(targets).await.map_err(|e| {
                    ScanError::AcquisitionFault(format!("Line scan failed: {:#}", e))
                })?;
                let samples = checked(samples, targets.len(), "line scan")?;
                Ok(PixelSamples::Line(samples))
            }
            AcquisitionStrategy::IsoB { freq1, freq2 } => {
                move_to_pixel(ports, targets).await?;
                let counts = read_counts(ports, *freq1, *freq2).await?;
                Ok(PixelSamples::Counts(counts))
            }
            AcquisitionStrategy::FullSweep {
                freq1,
                freq2,
                number_sweeps,
                ..
            } => {
                let window = window.ok_or_else(|| {
                    ScanError::Configuration("Full sweep started without a window".to_string())
                })?;
                move_to_pixel(ports, targets).await?;

                let frequencies = window.frequencies();
                let spectrum = ports
                    .spectrometer
                    .sweep(window, *number_sweeps)
                    .await
                    .map_err(|e| ScanError::AcquisitionFault(format!("Sweep failed: {:#}", e)))?;
                if spectrum.is_fault() {
                    return Err(ScanError::AcquisitionFault(
                        "Sweep returned the fault sentinel".to_string(),
                    ));
                }
                if spectrum.point_count() != frequencies.len() {
                    return Err(ScanError::SweepSizeMismatch {
                        expected: frequencies.len(),
                        actual: spectrum.point_count(),
                    });
                }
                let spectrum = checked(spectrum, frequencies.len(), "sweep")?;
                trace!(points = frequencies.len(), "spectrum acquired");

                let counts = read_counts(ports, *freq1, *freq2).await?;
                Ok(PixelSamples::Sweep {
                    frequencies,
                    spectrum,
                    counts,
                })
            }
        }
    }

    /// Write one step's samples into `image` at `cells`.
    ///
    /// The corrected topography channel receives `raw - correction` when a plane
    /// correction is active, the raw value otherwise.
    pub fn store(
        &self,
        image: &mut ScanImage,
        cells: &[(usize, usize)],
        samples: &PixelSamples,
        topo: &TopoConverter,
        correction: Option<&Plane>,
        window: Option<&FrequencyWindow>,
    ) -> AppResult<StoreOutcome> {
        let layout = image.layout();
        let write_topo = |image: &mut ScanImage, row: usize, col: usize, height: f64| {
            image.set(row, col, layout.raw_topo(), height);
            let offset = correction.map_or(0.0, |plane| plane.at(row, col));
            image.set(row, col, ChannelLayout::TOPO, height - offset);
        };

        match (self, samples) {
            (AcquisitionStrategy::Quenching, PixelSamples::Line(line)) => {
                let pl = layout.pl().ok_or_else(|| layout_mismatch(layout))?;
                for (i, &(row, col)) in cells.iter().enumerate() {
                    let (Some(&signal), Some(&volts)) =
                        (line.signal().get(i), line.topo_volts().get(i))
                    else {
                        break;
                    };
                    image.set(row, col, pl, signal);
                    write_topo(image, row, col, topo.to_height(volts));
                }
                Ok(StoreOutcome::default())
            }
            (AcquisitionStrategy::IsoB { .. }, PixelSamples::Counts(counts)) => {
                let &(row, col) = cells.first().ok_or_else(no_cells)?;
                write_counts(image, layout, row, col, counts)?;
                write_topo(image, row, col, topo.mean_height(counts.topo_volts()));
                Ok(StoreOutcome::default())
            }
            (
                AcquisitionStrategy::FullSweep { tracker, .. },
                PixelSamples::Sweep {
                    frequencies,
                    spectrum,
                    counts,
                },
            ) => {
                let &(row, col) = cells.first().ok_or_else(no_cells)?;
                let window = window.ok_or_else(|| {
                    ScanError::Configuration("Full sweep stored without a window".to_string())
                })?;
                let freq = layout.freq().ok_or_else(|| layout_mismatch(layout))?;

                let dip = tracker
                    .locate_dip(window, frequencies, spectrum.signal())
                    .ok_or_else(|| {
                        ScanError::AcquisitionFault("Empty spectrum".to_string())
                    })?;

                write_topo(image, row, col, topo.mean_height(spectrum.topo_volts()));
                image.set(row, col, freq, dip.minimum);
                write_counts(image, layout, row, col, counts)?;

                let (x, y) = image.position(row, col);
                Ok(StoreOutcome {
                    dip: Some(dip.tracked),
                    spectrum: Some(SpectrumRecord {
                        row,
                        col,
                        x,
                        y,
                        frequencies: frequencies.clone(),
                        signal: spectrum.signal().to_vec(),
                        acquired_at: Utc::now(),
                    }),
                })
            }
            _ => Err(ScanError::AcquisitionFault(format!(
                "Samples do not belong to a {} acquisition",
                self.mode()
            ))),
        }
    }
}

fn checked(samples: Samples, expected: usize, what: &str) -> AppResult<Samples> {
    if samples.is_fault() {
        return Err(ScanError::AcquisitionFault(format!(
            "{} returned the fault sentinel",
            what
        )));
    }
    if samples.rows.len() < 2 {
        return Err(ScanError::AcquisitionFault(format!(
            "{} returned no topography row",
            what
        )));
    }
    if samples.rows.iter().any(|row| row.len() != expected) {
        return Err(ScanError::AcquisitionFault(format!(
            "{} returned {} points, expected {}",
            what,
            samples.point_count(),
            expected
        )));
    }
    Ok(samples)
}

async fn move_to_pixel(ports: &HardwarePorts, targets: &[(f64, f64)]) -> AppResult<()> {
    let &(x, y) = targets.first().ok_or_else(no_cells)?;
    ports
        .positioner
        .move_to(x, y)
        .await
        .map_err(|e| ScanError::PositionerFault(format!("Move to ({}, {}) failed: {:#}", x, y, e)))
}

async fn read_counts(ports: &HardwarePorts, freq1: f64, freq2: f64) -> AppResult<Samples> {
    let counts = ports
        .spectrometer
        .counts(&[freq1, freq2])
        .await
        .map_err(|e| ScanError::AcquisitionFault(format!("Counting failed: {:#}", e)))?;
    checked(counts, 2, "iso-B counting")
}

fn write_counts(
    image: &mut ScanImage,
    layout: ChannelLayout,
    row: usize,
    col: usize,
    counts: &Samples,
) -> AppResult<()> {
    let pl_diff = layout.pl_diff().ok_or_else(|| layout_mismatch(layout))?;
    let (pl1, pl2) = match counts.signal() {
        [pl1, pl2, ..] => (*pl1, *pl2),
        _ => {
            return Err(ScanError::AcquisitionFault(
                "Iso-B counts need two frequencies".to_string(),
            ))
        }
    };
    image.set(row, col, pl_diff, pl1 - pl2);
    image.set(row, col, pl_diff + 1, pl1);
    image.set(row, col, pl_diff + 2, pl2);
    Ok(())
}

fn no_cells() -> ScanError {
    ScanError::AcquisitionFault("No pixel to acquire".to_string())
}

fn layout_mismatch(layout: ChannelLayout) -> ScanError {
    ScanError::AcquisitionFault(format!(
        "Image allocated for {} does not match the acquisition",
        layout.mode()
    ))
}
