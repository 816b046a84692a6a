//! Hardware abstraction for the scan engine.
//!
//! The engine only sees the port traits in [`ports`]. [`mock`] provides simulated
//! implementations used by the CLI `simulate` command and the test suite.

pub mod mock;
pub mod ports;

use std::sync::Arc;

pub use ports::{
    AxisRange, LineScanPort, PositionerPort, Samples, SpectrometerLimits, SpectrometerPort,
};

/// The set of ports a scan session owns while it runs.
#[derive(Clone)]
pub struct HardwarePorts {
    /// Probe positioner
    pub positioner: Arc<dyn PositionerPort>,
    /// Clocked line scanner and counters
    pub line_scanner: Arc<dyn LineScanPort>,
    /// Microwave source and ODMR counter
    pub spectrometer: Arc<dyn SpectrometerPort>,
}

impl HardwarePorts {
    /// Bundle the three ports.
    pub fn new(
        positioner: Arc<dyn PositionerPort>,
        line_scanner: Arc<dyn LineScanPort>,
        spectrometer: Arc<dyn SpectrometerPort>,
    ) -> Self {
        Self {
            positioner,
            line_scanner,
            spectrometer,
        }
    }
}

impl std::fmt::Debug for HardwarePorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwarePorts").finish_non_exhaustive()
    }
}
