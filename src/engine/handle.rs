//! Client handle for a running scan engine.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, Instrument};

use super::controller::ScanController;
use super::messages::{ParameterChange, ScanCommand, ScanEvent, ScanSnapshot};
use super::settings::{ParameterMap, ScanSettings, SweepParameters};
use crate::config::EngineConfig;
use crate::error::{AppResult, ScanError};
use crate::hardware::ports::AxisRange;
use crate::hardware::HardwarePorts;
use crate::scan::{Orientation, Plane, ScanMode};

/// Cloneable front end of the scan controller.
///
/// Every method sends one [`ScanCommand`] and awaits its reply; none of them
/// waits for hardware except `pause` and `stop`, which resolve once the step in
/// flight has finished.
#[derive(Clone)]
pub struct ScanHandle {
    command_tx: mpsc::Sender<ScanCommand>,
    events: broadcast::Sender<ScanEvent>,
}

/// Spawn a scan controller on the current tokio runtime.
///
/// Queries the positioner travel and the spectrometer limits once; the source
/// power and iso-B frequencies of `settings` are clamped to those limits.
pub async fn spawn_scan_engine(
    mut settings: ScanSettings,
    ports: HardwarePorts,
    config: &EngineConfig,
) -> AppResult<(ScanHandle, JoinHandle<()>)> {
    let travel: AxisRange = ports
        .positioner
        .axis_range()
        .await
        .map_err(|e| ScanError::PositionerFault(format!("Axis range query failed: {:#}", e)))?;
    let limits = ports.spectrometer.limits();
    settings.set_power(settings.power_dbm, &limits);
    settings.set_isob_frequencies(settings.freq1, settings.freq2, &limits)?;

    let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let (done_tx, done_rx) = mpsc::channel(4);

    info!(
        travel = ?travel.to_array(),
        min_frequency = limits.min_frequency,
        max_frequency = limits.max_frequency,
        "Spawning scan engine"
    );
    let controller = ScanController::new(settings, ports, limits, travel, events.clone(), done_tx);
    let task = tokio::spawn(
        controller
            .run(command_rx, done_rx)
            .instrument(info_span!("scan_engine")),
    );

    Ok((ScanHandle { command_tx, events }, task))
}

impl ScanHandle {
    /// Receiver for every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, (command, rx): (ScanCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ScanError::EngineUnavailable)?;
        rx.await.map_err(|_| ScanError::EngineUnavailable)
    }

    /// Start a scan from the first pixel.
    pub async fn start(&self) -> AppResult<()> {
        self.request(ScanCommand::start()).await?
    }

    /// Pause after the step in flight; resolves once paused.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(ScanCommand::pause()).await?
    }

    /// Continue a paused scan at its saved cursor.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(ScanCommand::resume()).await?
    }

    /// Stop the scan. `is_final` reports the scan as complete and rewinds the
    /// cursor to the first pixel.
    pub async fn stop(&self, is_final: bool) -> AppResult<()> {
        self.request(ScanCommand::stop(is_final)).await?
    }

    /// Apply one parameter change while idle.
    pub async fn configure(&self, change: ParameterChange) -> AppResult<ParameterMap> {
        self.request(ScanCommand::configure(change)).await?
    }

    /// Select the measurement mode.
    pub async fn set_mode(&self, mode: ScanMode) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Mode(mode)).await
    }

    /// Set the pixel count per axis.
    pub async fn set_resolution(&self, x: usize, y: usize) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Resolution { x, y }).await
    }

    /// Set the scan range.
    pub async fn set_range(&self, range: AxisRange) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Range(range)).await
    }

    /// Select the fast axis.
    pub async fn set_orientation(&self, orientation: Orientation) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Orientation(orientation)).await
    }

    /// Set the retrace sampling step in meters.
    pub async fn set_return_slowness(&self, value: f64) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::ReturnSlowness(value)).await
    }

    /// Set the pixel clock in Hz.
    pub async fn set_clock_frequency(&self, hz: f64) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::ClockFrequency(hz)).await
    }

    /// Set the microwave power in dBm.
    pub async fn set_power(&self, dbm: f64) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Power(dbm)).await
    }

    /// Set the iso-B frequency pair in Hz.
    pub async fn set_isob_frequencies(&self, freq1: f64, freq2: f64) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::IsoBFrequencies { freq1, freq2 })
            .await
    }

    /// Replace the full-sweep parameters.
    pub async fn set_sweep_parameters(&self, sweep: SweepParameters) -> AppResult<ParameterMap> {
        self.configure(ParameterChange::Sweep(sweep)).await
    }

    /// Subtract a plane fitted to the visited topography.
    pub async fn correct_topography(&self) -> AppResult<Plane> {
        self.request(ScanCommand::correct_topography()).await?
    }

    /// Start a free move; completion is reported by [`ScanEvent::MoveToEnded`].
    pub async fn move_to(&self, x: f64, y: f64) -> AppResult<()> {
        self.request(ScanCommand::move_to(x, y)).await?
    }

    /// Read-only copy of the controller state.
    pub async fn snapshot(&self) -> AppResult<ScanSnapshot> {
        self.request(ScanCommand::snapshot()).await
    }

    /// Tear down any active session and stop the controller task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(ScanCommand::shutdown()).await
    }
}

impl std::fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHandle")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::hardware::mock::MockHardware;
    use tracing_test::traced_test;

    fn small_settings() -> ScanSettings {
        let mut config = ScanConfig::default();
        config.scanner.resolution = [2, 2];
        config.scanner.range = [[0.0, 1e-6], [0.0, 1e-6]];
        ScanSettings::from_config(&config).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_session_lifecycle_is_logged() {
        let settings = small_settings();
        let hw = MockHardware::new(settings.range);
        let (handle, task) = spawn_scan_engine(settings, hw.ports(), &EngineConfig::default())
            .await
            .unwrap();
        let mut events = handle.subscribe();

        handle.start().await.unwrap();
        loop {
            if let ScanEvent::ScanEnded { was_final, .. } = events.recv().await.unwrap() {
                assert!(was_final);
                break;
            }
        }
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(logs_contain("Starting scan"));
        assert!(logs_contain("Scan session ended"));
        assert!(logs_contain("Scan controller stopped"));
    }

    #[tokio::test]
    async fn test_spawn_clamps_power_to_source_limits() {
        let mut settings = small_settings();
        settings.power_dbm = 40.0;
        let hw = MockHardware::new(settings.range);
        let (handle, _task) = spawn_scan_engine(settings, hw.ports(), &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(handle.snapshot().await.unwrap().settings.power_dbm, 10.0);
    }
}
