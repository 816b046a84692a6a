//! Raster scan building blocks.
//!
//! Everything in here is synchronous and hardware-free except
//! [`strategy::AcquisitionStrategy::acquire`], which is the single point where a
//! pixel acquisition talks to the ports. The controller in [`crate::engine`]
//! composes these pieces into the running scan.

pub mod cursor;
pub mod duration;
pub mod image;
pub mod retrace;
pub mod spectra;
pub mod strategy;
pub mod topography;
pub mod tracker;
pub mod window;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use cursor::{Advance, Orientation, ScanCursor};
pub use duration::{format_duration, DurationEstimate, DurationEstimator, DurationInput};
pub use image::{ChannelLayout, ScanImage, ScanLineBuffer};
pub use retrace::{path_fits, RetraceController, MAX_PATH_POINTS};
pub use spectra::{SpectrumLog, SpectrumRecord};
pub use strategy::{AcquisitionStrategy, PixelSamples, StoreOutcome, TopoConverter};
pub use topography::{Plane, TopographyCorrector};
pub use tracker::{Dip, ResonanceTracker};
pub use window::FrequencyWindow;

/// Measurement mode of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Photoluminescence and topography only, two pixels per hardware call
    #[default]
    Quenching,
    /// Differential counting at two fixed microwave frequencies
    #[serde(rename = "isob")]
    IsoB,
    /// Full ODMR sweep per pixel with resonance tracking
    #[serde(rename = "fullb", alias = "fullsweep")]
    FullSweep,
}

impl ScanMode {
    /// Number of image channels the mode writes.
    pub fn channel_count(self) -> usize {
        match self {
            ScanMode::Quenching => 5,
            ScanMode::IsoB => 7,
            ScanMode::FullSweep => 8,
        }
    }

    /// Pixels covered by one hardware call along the fast axis.
    pub fn increment(self) -> usize {
        match self {
            ScanMode::Quenching => 2,
            ScanMode::IsoB | ScanMode::FullSweep => 1,
        }
    }

    /// True when the mode drives the microwave source.
    pub fn uses_microwave(self) -> bool {
        !matches!(self, ScanMode::Quenching)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Quenching => write!(f, "quenching"),
            ScanMode::IsoB => write!(f, "isob"),
            ScanMode::FullSweep => write!(f, "fullb"),
        }
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quenching" => Ok(ScanMode::Quenching),
            "isob" => Ok(ScanMode::IsoB),
            "fullb" | "fullsweep" => Ok(ScanMode::FullSweep),
            other => Err(format!(
                "Unknown scan mode '{}'. Must be one of: quenching, isob, fullb",
                other
            )),
        }
    }
}
