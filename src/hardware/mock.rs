//! Mock Hardware Implementations
//!
//! Simulated positioner, line scanner and ODMR spectrometer for running scans
//! without instruments. All mocks use async-safe operations (tokio::time::sleep,
//! not std::thread::sleep) and share one probe position, so a line scan moves the
//! probe the same way a move of the positioner does.
//!
//! # Available Mocks
//!
//! - `MockPositioner` - probe position with range checking
//! - `MockLineScanner` - clocked line scans over a tilted synthetic surface
//! - `MockSpectrometer` - Lorentzian ODMR dip whose centre follows a field gradient
//! - `MockHardware` - the three wired together
//!
//! # Fault Injection
//!
//! Every acquisition call is counted. `fail_on_call(n)` makes the n-th call (0-based)
//! return the `-1` fault sentinel; the positioner can be told to refuse moves and
//! the spectrometer to return a truncated spectrum.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::hardware::ports::{
    AxisRange, LineScanPort, PositionerPort, Samples, SpectrometerLimits, SpectrometerPort,
};
use crate::hardware::HardwarePorts;
use crate::scan::window::FrequencyWindow;

const NO_FAULT: usize = usize::MAX;

/// Synthetic sample model shared by the mocks.
///
/// Topography volts form a plane over the scan area, the photoluminescence is a
/// constant background, and the ODMR resonance shifts linearly with x.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockSurface {
    /// Topography volts at the origin
    pub topo_offset: f64,
    /// Volts per meter along x
    pub topo_tilt_x: f64,
    /// Volts per meter along y
    pub topo_tilt_y: f64,
    /// Background counts
    pub counts: f64,
    /// Resonance at x = 0 (Hz)
    pub resonance: f64,
    /// Resonance shift (Hz per meter of x)
    pub resonance_gradient: f64,
    /// Dip full width at half maximum (Hz)
    pub linewidth: f64,
    /// Relative dip depth
    pub contrast: f64,
    /// Uniform noise amplitude added to counts
    pub noise: f64,
}

impl Default for MockSurface {
    fn default() -> Self {
        Self {
            topo_offset: 1.0,
            topo_tilt_x: 2e4,
            topo_tilt_y: -1e4,
            counts: 1000.0,
            resonance: 2.87e9,
            resonance_gradient: 0.0,
            linewidth: 10e6,
            contrast: 0.3,
            noise: 0.0,
        }
    }
}

impl MockSurface {
    /// Raw z-piezo reading in volts at `(x, y)`.
    pub fn topo_volts(&self, x: f64, y: f64) -> f64 {
        self.topo_offset + self.topo_tilt_x * x + self.topo_tilt_y * y
    }

    /// Resonance frequency with the probe at `x`.
    pub fn resonance_at(&self, x: f64) -> f64 {
        self.resonance + self.resonance_gradient * x
    }

    /// Detector counts at `frequency` with the probe at `x`.
    pub fn odmr(&self, frequency: f64, x: f64) -> f64 {
        let detuning = 2.0 * (frequency - self.resonance_at(x)) / self.linewidth;
        self.counts * (1.0 - self.contrast / (1.0 + detuning * detuning)) + self.jitter()
    }

    /// Counts without microwave.
    pub fn photoluminescence(&self) -> f64 {
        self.counts + self.jitter()
    }

    fn jitter(&self) -> f64 {
        if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..self.noise)
        } else {
            0.0
        }
    }
}

// =============================================================================
// MockPositioner - Simulated Probe Positioner
// =============================================================================

/// Mock positioner holding the probe position.
pub struct MockPositioner {
    position: Arc<RwLock<(f64, f64)>>,
    range: AxisRange,
    refuse_moves: AtomicBool,
    moves: AtomicUsize,
}

impl MockPositioner {
    /// Positioner at the lower corner of `range`
    pub fn new(range: AxisRange) -> Self {
        Self::with_position(range, (range.x[0], range.y[0]))
    }

    /// Positioner starting at `position`.
    pub fn with_position(range: AxisRange, position: (f64, f64)) -> Self {
        Self {
            position: Arc::new(RwLock::new(position)),
            range,
            refuse_moves: AtomicBool::new(false),
            moves: AtomicUsize::new(0),
        }
    }

    /// Make every following move fail.
    pub fn refuse_moves(&self, refuse: bool) {
        self.refuse_moves.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful `move_to` calls.
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Current probe position.
    pub async fn position(&self) -> (f64, f64) {
        *self.position.read().await
    }

    async fn place(&self, x: f64, y: f64) -> Result<()> {
        if !self.range.contains(x, y) {
            bail!("Position ({}, {}) outside of {:?}", x, y, self.range);
        }
        *self.position.write().await = (x, y);
        Ok(())
    }
}

#[async_trait]
impl PositionerPort for MockPositioner {
    async fn move_to(&self, x: f64, y: f64) -> Result<()> {
        if self.refuse_moves.load(Ordering::SeqCst) {
            bail!("MockPositioner: move refused");
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
        trace!(x, y, "MockPositioner: moving");
        self.place(x, y).await
    }

    async fn current_position(&self) -> Result<(f64, f64)> {
        Ok(self.position().await)
    }

    async fn axis_range(&self) -> Result<AxisRange> {
        Ok(self.range)
    }
}

// =============================================================================
// MockLineScanner - Simulated Counter + Scanner Clock
// =============================================================================

/// Mock line scanner returning `[PL, topography volts]` per path point.
pub struct MockLineScanner {
    positioner: Arc<MockPositioner>,
    surface: MockSurface,
    clock: Arc<RwLock<Option<f64>>>,
    calls: AtomicUsize,
    fail_on: AtomicUsize,
    closes: AtomicUsize,
    paths: Arc<RwLock<Vec<Vec<(f64, f64)>>>>,
    delay: Duration,
}

impl MockLineScanner {
    /// Line scanner reading `surface` at the probe of `positioner`.
    pub fn new(positioner: Arc<MockPositioner>, surface: MockSurface) -> Self {
        Self {
            positioner,
            surface,
            clock: Arc::new(RwLock::new(None)),
            calls: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(NO_FAULT),
            closes: AtomicUsize::new(0),
            paths: Arc::new(RwLock::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Sleep this long in every `scan_line` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Return the fault sentinel from the n-th `scan_line` call (0-based),
    /// counting approach and retrace scans.
    pub fn fail_on_call(&self, call: usize) {
        self.fail_on.store(call, Ordering::SeqCst);
    }

    /// Number of `scan_line` calls so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `close_counters` calls so far.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// True while the clock is armed.
    pub async fn is_armed(&self) -> bool {
        self.clock.read().await.is_some()
    }

    /// Every path passed to `scan_line`, in call order.
    pub async fn recorded_paths(&self) -> Vec<Vec<(f64, f64)>> {
        self.paths.read().await.clone()
    }
}

#[async_trait]
impl LineScanPort for MockLineScanner {
    async fn arm_clock(&self, clock_frequency: f64) -> Result<()> {
        if clock_frequency <= 0.0 {
            bail!("MockLineScanner: invalid clock {}", clock_frequency);
        }
        *self.clock.write().await = Some(clock_frequency);
        debug!(clock_frequency, "MockLineScanner: clock armed");
        Ok(())
    }

    async fn scan_line(&self, path: &[(f64, f64)]) -> Result<Samples> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.clock.read().await.is_none() {
            bail!("MockLineScanner: clock not armed");
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.paths.write().await.push(path.to_vec());

        if call == self.fail_on.load(Ordering::SeqCst) {
            debug!(call, "MockLineScanner: injecting fault");
            return Ok(Samples::fault());
        }

        let &(x, y) = path
            .last()
            .ok_or_else(|| anyhow!("MockLineScanner: empty path"))?;
        self.positioner.place(x, y).await?;

        let signal = path.iter().map(|_| self.surface.photoluminescence()).collect();
        let topo = path
            .iter()
            .map(|&(px, py)| self.surface.topo_volts(px, py))
            .collect();
        Ok(Samples::new(vec![signal, topo]))
    }

    async fn close_counters(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.clock.write().await = None;
        debug!("MockLineScanner: counters closed");
        Ok(())
    }
}

// =============================================================================
// MockSpectrometer - Simulated Microwave Source + ODMR Counter
// =============================================================================

/// Mock spectrometer producing a Lorentzian dip at the probe position.
pub struct MockSpectrometer {
    positioner: Arc<MockPositioner>,
    surface: MockSurface,
    limits: SpectrometerLimits,
    armed: AtomicBool,
    mw_on: AtomicBool,
    sweeps: AtomicUsize,
    fail_sweep_on: AtomicUsize,
    truncate_sweep_on: AtomicUsize,
    truncate_following: AtomicBool,
    delay: Duration,
}

impl MockSpectrometer {
    /// Spectrometer reading `surface` at the probe of `positioner`.
    pub fn new(positioner: Arc<MockPositioner>, surface: MockSurface) -> Self {
        Self {
            positioner,
            surface,
            limits: SpectrometerLimits {
                min_frequency: 1e9,
                max_frequency: 6e9,
                min_step: 1e3,
                max_step: 1e9,
                min_power: -60.0,
                max_power: 10.0,
            },
            armed: AtomicBool::new(false),
            mw_on: AtomicBool::new(false),
            sweeps: AtomicUsize::new(0),
            fail_sweep_on: AtomicUsize::new(NO_FAULT),
            truncate_sweep_on: AtomicUsize::new(NO_FAULT),
            truncate_following: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    /// Replace the reported source limits.
    pub fn with_limits(mut self, limits: SpectrometerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sleep this long in every sweep and count.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Return the fault sentinel from the n-th sweep (0-based).
    pub fn fail_sweep_on(&self, sweep: usize) {
        self.fail_sweep_on.store(sweep, Ordering::SeqCst);
    }

    /// Return a two-point spectrum from the n-th sweep (0-based).
    pub fn truncate_sweep_on(&self, sweep: usize) {
        self.truncate_sweep_on.store(sweep, Ordering::SeqCst);
        self.truncate_following.store(false, Ordering::SeqCst);
    }

    /// Return two-point spectra from the n-th sweep onwards.
    pub fn truncate_sweeps_from(&self, sweep: usize) {
        self.truncate_sweep_on.store(sweep, Ordering::SeqCst);
        self.truncate_following.store(true, Ordering::SeqCst);
    }

    /// Number of sweeps so far.
    pub fn sweep_count(&self) -> usize {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// True while the microwave output is on.
    pub fn is_mw_on(&self) -> bool {
        self.mw_on.load(Ordering::SeqCst)
    }

    fn spectrum(&self, frequencies: &[f64], x: f64, y: f64, repetitions: u32) -> Samples {
        let repetitions = repetitions.max(1);
        let signal = frequencies
            .iter()
            .map(|&f| {
                (0..repetitions)
                    .map(|_| self.surface.odmr(f, x))
                    .sum::<f64>()
                    / f64::from(repetitions)
            })
            .collect();
        let topo = frequencies
            .iter()
            .map(|_| self.surface.topo_volts(x, y))
            .collect();
        Samples::new(vec![signal, topo])
    }
}

#[async_trait]
impl SpectrometerPort for MockSpectrometer {
    fn limits(&self) -> SpectrometerLimits {
        self.limits
    }

    async fn arm_trigger(&self, clock_frequency: f64, power_dbm: f64) -> Result<()> {
        if power_dbm > self.limits.max_power {
            bail!("MockSpectrometer: power {} dBm above limit", power_dbm);
        }
        self.armed.store(true, Ordering::SeqCst);
        self.mw_on.store(true, Ordering::SeqCst);
        debug!(clock_frequency, power_dbm, "MockSpectrometer: trigger armed");
        Ok(())
    }

    async fn sweep(&self, window: &FrequencyWindow, repetitions: u32) -> Result<Samples> {
        let sweep = self.sweeps.fetch_add(1, Ordering::SeqCst);
        if !self.armed.load(Ordering::SeqCst) {
            bail!("MockSpectrometer: trigger not armed");
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if sweep == self.fail_sweep_on.load(Ordering::SeqCst) {
            return Ok(Samples::fault());
        }

        let (x, y) = self.positioner.position().await;
        let mut frequencies = window.frequencies();
        let truncate_on = self.truncate_sweep_on.load(Ordering::SeqCst);
        if sweep == truncate_on
            || (self.truncate_following.load(Ordering::SeqCst) && sweep > truncate_on)
        {
            frequencies.truncate(2);
        }
        Ok(self.spectrum(&frequencies, x, y, repetitions))
    }

    async fn counts(&self, frequencies: &[f64]) -> Result<Samples> {
        if !self.armed.load(Ordering::SeqCst) {
            bail!("MockSpectrometer: trigger not armed");
        }
        let (x, y) = self.positioner.position().await;
        Ok(self.spectrum(frequencies, x, y, 1))
    }

    async fn mw_off(&self) -> Result<()> {
        self.armed.store(false, Ordering::SeqCst);
        self.mw_on.store(false, Ordering::SeqCst);
        debug!("MockSpectrometer: microwave off");
        Ok(())
    }
}

// =============================================================================
// MockHardware - All Three Ports
// =============================================================================

/// Mock positioner, line scanner and spectrometer sharing one probe.
#[derive(Clone)]
pub struct MockHardware {
    /// Simulated positioner
    pub positioner: Arc<MockPositioner>,
    /// Simulated line scanner
    pub line_scanner: Arc<MockLineScanner>,
    /// Simulated spectrometer
    pub spectrometer: Arc<MockSpectrometer>,
}

impl MockHardware {
    /// Mock hardware over the default surface.
    pub fn new(range: AxisRange) -> Self {
        Self::with_surface(range, MockSurface::default())
    }

    /// Mock hardware over `surface`.
    pub fn with_surface(range: AxisRange, surface: MockSurface) -> Self {
        let positioner = Arc::new(MockPositioner::new(range));
        Self {
            line_scanner: Arc::new(MockLineScanner::new(positioner.clone(), surface)),
            spectrometer: Arc::new(MockSpectrometer::new(positioner.clone(), surface)),
            positioner,
        }
    }

    /// Same as [`MockHardware::with_surface`] but every acquisition sleeps `delay`.
    pub fn with_delay(range: AxisRange, surface: MockSurface, delay: Duration) -> Self {
        let positioner = Arc::new(MockPositioner::new(range));
        Self {
            line_scanner: Arc::new(
                MockLineScanner::new(positioner.clone(), surface).with_delay(delay),
            ),
            spectrometer: Arc::new(
                MockSpectrometer::new(positioner.clone(), surface).with_delay(delay),
            ),
            positioner,
        }
    }

    /// Port handles for the scan engine.
    pub fn ports(&self) -> HardwarePorts {
        HardwarePorts::new(
            self.positioner.clone(),
            self.line_scanner.clone(),
            self.spectrometer.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> AxisRange {
        AxisRange::from_array([[0.0, 1e-5], [0.0, 1e-5]])
    }

    #[tokio::test]
    async fn test_positioner_rejects_out_of_range() {
        let positioner = MockPositioner::new(range());
        assert!(positioner.move_to(5e-6, 5e-6).await.is_ok());
        assert!(positioner.move_to(2e-5, 0.0).await.is_err());
        assert_eq!(positioner.current_position().await.unwrap(), (5e-6, 5e-6));

        positioner.refuse_moves(true);
        assert!(positioner.move_to(0.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_line_scan_requires_armed_clock() {
        let hw = MockHardware::new(range());
        assert!(hw.line_scanner.scan_line(&[(0.0, 0.0)]).await.is_err());

        hw.line_scanner.arm_clock(10.0).await.unwrap();
        let samples = hw
            .line_scanner
            .scan_line(&[(0.0, 0.0), (1e-6, 0.0)])
            .await
            .unwrap();
        assert_eq!(samples.point_count(), 2);
        assert_eq!(hw.positioner.position().await, (1e-6, 0.0));
    }

    #[tokio::test]
    async fn test_line_scan_fault_injection() {
        let hw = MockHardware::new(range());
        hw.line_scanner.arm_clock(10.0).await.unwrap();
        hw.line_scanner.fail_on_call(1);
        assert!(!hw.line_scanner.scan_line(&[(0.0, 0.0)]).await.unwrap().is_fault());
        assert!(hw.line_scanner.scan_line(&[(0.0, 0.0)]).await.unwrap().is_fault());
        assert_eq!(hw.line_scanner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_spectrometer_dip_at_resonance() {
        let hw = MockHardware::new(range());
        hw.spectrometer.arm_trigger(10.0, -30.0).await.unwrap();
        let window = FrequencyWindow::new(2.85e9, 2.89e9, 5e6, 10e6, 2.8e9, 2.94e9, 50e6).unwrap();

        let samples = hw.spectrometer.sweep(&window, 3).await.unwrap();
        assert_eq!(samples.point_count(), window.point_count());
        let freqs = window.frequencies();
        let (dip, _) = freqs
            .iter()
            .zip(samples.signal())
            .fold((0.0, f64::MAX), |best, (&f, &v)| if v < best.1 { (f, v) } else { best });
        assert_eq!(dip, 2.87e9);

        hw.spectrometer.mw_off().await.unwrap();
        assert!(!hw.spectrometer.is_mw_on());
    }

    #[tokio::test]
    async fn test_truncated_sweep() {
        let hw = MockHardware::new(range());
        hw.spectrometer.arm_trigger(10.0, -30.0).await.unwrap();
        hw.spectrometer.truncate_sweep_on(0);
        let window = FrequencyWindow::new(2.85e9, 2.89e9, 5e6, 10e6, 2.8e9, 2.94e9, 50e6).unwrap();
        assert_eq!(hw.spectrometer.sweep(&window, 1).await.unwrap().point_count(), 2);
        assert_eq!(hw.spectrometer.sweep(&window, 1).await.unwrap().point_count(), 9);
    }
}
