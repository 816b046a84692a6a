//! Scan controller actor.
//!
//! The controller exclusively owns the image, the session and the lifecycle
//! state. It runs a `tokio::select!` loop over two inputs:
//!
//! - commands from [`super::ScanHandle`]s, answered through oneshot channels
//! - completions of the single hardware [`Job`] in flight
//!
//! Every state transition happens on this task, so a command can never observe
//! a half-committed pixel. When a step completes the controller commits it,
//! publishes the result and only then decides whether to dispatch the next
//! step, pause or tear down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{ParameterChange, ScanCommand, ScanEvent, ScanSnapshot};
use super::settings::{ParameterMap, ScanSettings};
use super::state::ScanState;
use super::worker::{Job, JobOutcome};
use crate::error::{AppResult, ScanError};
use crate::hardware::ports::{AxisRange, SpectrometerLimits};
use crate::hardware::HardwarePorts;
use crate::scan::{
    format_duration, AcquisitionStrategy, Advance, ChannelLayout, DurationEstimate,
    FrequencyWindow, PixelSamples, Plane, RetraceController, ScanCursor, ScanImage,
    ScanLineBuffer, SpectrumLog, SpectrumRecord, TopoConverter, TopographyCorrector,
};

type Reply = oneshot::Sender<AppResult<()>>;

/// State held from `start` until the hardware has been released.
struct ScanSession {
    id: Uuid,
    strategy: AcquisitionStrategy,
    window: Option<FrequencyWindow>,
    retrace: RetraceController,
    topo: TopoConverter,
    estimate: DurationEstimate,
    running_since: Option<Instant>,
    elapsed: Duration,
    /// `Some(is_final)` once an end of session has been requested
    stop: Option<bool>,
    pause_requested: bool,
    pause_waiters: Vec<Reply>,
    stop_waiters: Vec<Reply>,
}

impl ScanSession {
    fn new(settings: &ScanSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy: settings.strategy(),
            window: settings.initial_window(),
            retrace: RetraceController::new(settings.orientation, settings.return_slowness),
            topo: settings.topo_converter(),
            estimate: settings.estimate(),
            running_since: Some(Instant::now()),
            elapsed: Duration::ZERO,
            stop: None,
            pause_requested: false,
            pause_waiters: Vec::new(),
            stop_waiters: Vec::new(),
        }
    }

    fn suspend_clock(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed();
        }
    }

    fn resume_clock(&mut self) {
        self.running_since.get_or_insert_with(Instant::now);
    }

    fn remaining_seconds(&self) -> f64 {
        let running = self.running_since.map_or(Duration::ZERO, |since| since.elapsed());
        self.estimate.total_s - (self.elapsed + running).as_secs_f64()
    }
}

/// Actor owning one scan engine.
pub struct ScanController {
    settings: ScanSettings,
    ports: HardwarePorts,
    limits: SpectrometerLimits,
    travel: AxisRange,
    state: ScanState,
    image: Arc<ScanImage>,
    line: Arc<ScanLineBuffer>,
    spectra: Arc<SpectrumLog>,
    cursor: ScanCursor,
    committed: usize,
    correction: Option<Plane>,
    session: Option<ScanSession>,
    in_flight: Option<&'static str>,
    events: broadcast::Sender<ScanEvent>,
    done_tx: mpsc::Sender<JobOutcome>,
}

impl ScanController {
    pub(crate) fn new(
        settings: ScanSettings,
        ports: HardwarePorts,
        limits: SpectrometerLimits,
        travel: AxisRange,
        events: broadcast::Sender<ScanEvent>,
        done_tx: mpsc::Sender<JobOutcome>,
    ) -> Self {
        let image = ScanImage::initialize(settings.mode, settings.resolution, settings.range);
        let line = ScanLineBuffer::new(&image, settings.orientation);
        let cursor = ScanCursor::new(
            image.rows(),
            image.cols(),
            settings.mode.increment(),
            settings.orientation,
        );
        Self {
            settings,
            ports,
            limits,
            travel,
            state: ScanState::Idle,
            image: Arc::new(image),
            line: Arc::new(line),
            spectra: Arc::new(SpectrumLog::new()),
            cursor,
            committed: 0,
            correction: None,
            session: None,
            in_flight: None,
            events,
            done_tx,
        }
    }

    /// Run the actor until a `Shutdown` command arrives or every handle is
    /// dropped. An active session is torn down before returning.
    pub(crate) async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ScanCommand>,
        mut done_rx: mpsc::Receiver<JobOutcome>,
    ) {
        info!(
            mode = %self.settings.mode,
            resolution = ?self.settings.resolution,
            "Scan controller started"
        );

        loop {
            tokio::select! {
                Some(outcome) = done_rx.recv() => {
                    self.on_job_done(outcome);
                }
                command = command_rx.recv() => {
                    match command {
                        Some(ScanCommand::Shutdown { response }) => {
                            self.shutdown(&mut done_rx).await;
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All scan handles dropped");
                            self.shutdown(&mut done_rx).await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Scan controller stopped");
    }

    fn handle_command(&mut self, command: ScanCommand) {
        match command {
            ScanCommand::Start { response } => {
                let result = self.start();
                let _ = response.send(result);
            }
            ScanCommand::Pause { response } => self.pause(response),
            ScanCommand::Resume { response } => {
                let result = self.resume();
                let _ = response.send(result);
            }
            ScanCommand::Stop { is_final, response } => self.stop(is_final, response),
            ScanCommand::Configure { change, response } => {
                let result = self.configure(change);
                let _ = response.send(result);
            }
            ScanCommand::CorrectTopography { response } => {
                let result = self.correct_topography();
                let _ = response.send(result);
            }
            ScanCommand::MoveTo { x, y, response } => {
                let result = self.move_to(x, y);
                let _ = response.send(result);
            }
            ScanCommand::Snapshot { response } => {
                let _ = response.send(self.snapshot());
            }
            ScanCommand::Shutdown { response } => {
                // Handled by the run loop; answer anyway so the caller never hangs.
                let _ = response.send(());
            }
        }
    }

    // =========================================================================
    // Lifecycle commands
    // =========================================================================

    fn start(&mut self) -> AppResult<()> {
        if !self.state.can_start() || self.in_flight.is_some() {
            return Err(ScanError::AlreadyRunning(self.state));
        }
        if !self.travel.encloses(&self.settings.range) {
            return Err(ScanError::Configuration(format!(
                "Scan range {:?} exceeds the positioner travel {:?}",
                self.settings.range.to_array(),
                self.travel.to_array()
            )));
        }

        self.allocate();
        let session = ScanSession::new(&self.settings);
        let retrace = session.retrace;
        info!(
            session = %session.id,
            mode = %self.settings.mode,
            resolution = ?self.settings.resolution,
            orientation = ?self.settings.orientation,
            estimate = %session.estimate.display(),
            "Starting scan"
        );
        self.session = Some(session);
        self.set_state(ScanState::Running);
        self.publish_image(None);

        let first_pixel = self.image.position(0, 0);
        self.dispatch(Job::Arm {
            clock_frequency: self.settings.clock_frequency,
            power_dbm: self.microwave_power(),
            approach: Some((retrace, first_pixel)),
        });
        Ok(())
    }

    fn pause(&mut self, response: Reply) {
        if !self.state.can_pause() {
            let _ = response.send(Err(ScanError::NotRunning(self.state)));
            return;
        }
        let Some(session) = self.session.as_mut() else {
            let _ = response.send(Err(ScanError::NotRunning(self.state)));
            return;
        };
        debug!("Pause requested");
        session.pause_requested = true;
        session.pause_waiters.push(response);
        if self.in_flight.is_none() {
            self.schedule_next();
        }
    }

    fn resume(&mut self) -> AppResult<()> {
        if !self.state.can_resume() {
            return Err(ScanError::NotPaused(self.state));
        }
        let Some(session) = self.session.as_mut() else {
            return Err(ScanError::NotPaused(self.state));
        };
        session.resume_clock();
        info!(
            session = %session.id,
            row = self.cursor.row,
            col = self.cursor.col,
            "Resuming scan"
        );
        self.set_state(ScanState::Running);
        self.dispatch(Job::Arm {
            clock_frequency: self.settings.clock_frequency,
            power_dbm: self.microwave_power(),
            approach: None,
        });
        Ok(())
    }

    fn stop(&mut self, is_final: bool, response: Reply) {
        let Some(session) = self.session.as_mut() else {
            debug!("Stop requested while idle");
            let _ = response.send(Ok(()));
            return;
        };
        session.stop.get_or_insert(is_final);
        session.stop_waiters.push(response);

        match self.state {
            ScanState::Paused => {
                let is_final = session.stop.unwrap_or(is_final);
                self.begin_teardown(is_final);
            }
            ScanState::Running if self.in_flight.is_none() => self.schedule_next(),
            _ => debug!(is_final, "Stop requested, waiting for the step in flight"),
        }
    }

    fn configure(&mut self, change: ParameterChange) -> AppResult<ParameterMap> {
        if self.state.is_active() {
            return Err(ScanError::AlreadyRunning(self.state));
        }

        let settings = &mut self.settings;
        let changed = match change {
            ParameterChange::Mode(mode) => settings.set_mode(mode),
            ParameterChange::Resolution { x, y } => settings.set_resolution(x, y)?,
            ParameterChange::Range(range) => settings.set_range(range)?,
            ParameterChange::Orientation(orientation) => settings.set_orientation(orientation),
            ParameterChange::ReturnSlowness(value) => settings.set_return_slowness(value)?,
            ParameterChange::ClockFrequency(value) => settings.set_clock_frequency(value)?,
            ParameterChange::Power(dbm) => settings.set_power(dbm, &self.limits),
            ParameterChange::IsoBFrequencies { freq1, freq2 } => {
                settings.set_isob_frequencies(freq1, freq2, &self.limits)?
            }
            ParameterChange::Sweep(sweep) => settings.set_sweep_parameters(sweep, &self.limits)?,
        };
        info!(parameters = ?changed.keys().collect::<Vec<_>>(), "Scan parameters changed");

        if change.reallocates_image() {
            self.allocate();
            self.publish_image(None);
        }
        self.emit(ScanEvent::ParametersChanged(changed.clone()));
        self.emit(ScanEvent::DurationEstimateChanged(
            self.settings.estimate().display(),
        ));
        Ok(changed)
    }

    /// Fit a plane to the visited raw topography, subtract it into the
    /// corrected channel and zero the unvisited pixels. Recomputed from the raw
    /// channel every time, so repeated calls give the same image.
    fn correct_topography(&mut self) -> AppResult<Plane> {
        let raw = self.image.layout().raw_topo();
        let visited = self
            .image
            .visited_mask(self.cursor.orientation(), self.committed);
        let plane = TopographyCorrector::plane_fit(self.image.channel(raw), &visited)?;

        let image = Arc::make_mut(&mut self.image);
        for ((row, col), &seen) in visited.indexed_iter() {
            let value = if seen {
                image.get(row, col, raw) - plane.at(row, col)
            } else {
                0.0
            };
            image.set(row, col, ChannelLayout::TOPO, value);
        }
        self.correction = Some(plane);
        info!(a = plane.a, b = plane.b, c = plane.c, "Topography plane subtracted");

        self.refresh_line();
        self.publish_image(None);
        Ok(plane)
    }

    fn move_to(&mut self, x: f64, y: f64) -> AppResult<()> {
        if self.state.is_active() || self.in_flight.is_some() {
            return Err(ScanError::AlreadyRunning(self.state));
        }
        if !self.travel.contains(x, y) {
            return Err(ScanError::Configuration(format!(
                "Target ({}, {}) outside the positioner travel {:?}",
                x,
                y,
                self.travel.to_array()
            )));
        }
        info!(x, y, "Moving probe");
        self.dispatch(Job::MoveTo {
            target: (x, y),
            retrace: RetraceController::new(
                self.settings.orientation,
                self.settings.return_slowness,
            ),
        });
        Ok(())
    }

    fn snapshot(&self) -> ScanSnapshot {
        ScanSnapshot {
            state: self.state,
            settings: self.settings.clone(),
            cursor: self.cursor,
            committed: self.committed,
            image: Arc::clone(&self.image),
            line: Arc::clone(&self.line),
            spectra: Arc::clone(&self.spectra),
            window: self.session.as_ref().and_then(|s| s.window),
            correction: self.correction,
            estimate: self.settings.estimate(),
            session_id: self.session.as_ref().map(|s| s.id),
        }
    }

    async fn shutdown(&mut self, done_rx: &mut mpsc::Receiver<JobOutcome>) {
        info!("Scan controller shutting down");
        if let Some(session) = self.session.as_mut() {
            session.stop.get_or_insert(false);
            if self.state == ScanState::Paused {
                self.begin_teardown(false);
            }
        }
        while self.in_flight.is_some() {
            match done_rx.recv().await {
                Some(outcome) => self.on_job_done(outcome),
                None => break,
            }
        }
    }

    // =========================================================================
    // Step scheduling
    // =========================================================================

    fn on_job_done(&mut self, outcome: JobOutcome) {
        self.in_flight = None;
        match outcome {
            JobOutcome::Armed(Ok(())) | JobOutcome::Retraced { result: Ok(()), .. } => {
                self.schedule_next()
            }
            JobOutcome::Armed(Err(e)) => self.fault(e),
            JobOutcome::Retraced {
                last_cell: (row, col),
                result: Err(e),
            } => self.fault_at(e, row, col),
            JobOutcome::Pixel {
                result: Ok(samples),
                ..
            } => self.commit(samples),
            JobOutcome::Pixel {
                result: Err(ScanError::SweepSizeMismatch { expected, actual }),
                retried: false,
            } => self.retry_sweep(expected, actual),
            JobOutcome::Pixel {
                result: Err(ScanError::SweepSizeMismatch { expected, actual }),
                retried: true,
            } => self.fault(ScanError::AcquisitionFault(format!(
                "Spectrum size still wrong after retry: expected {} points, got {}",
                expected, actual
            ))),
            JobOutcome::Pixel { result: Err(e), .. } => self.fault(e),
            JobOutcome::TornDown => self.finish_session(),
            JobOutcome::Moved {
                target: (x, y),
                result: Ok(()),
            } => {
                info!(x, y, "Move finished");
                self.emit(ScanEvent::MoveToEnded { x, y });
            }
            JobOutcome::Moved {
                target: (x, y),
                result: Err(e),
            } => {
                error!(x, y, "Move failed: {}", e);
                self.emit(ScanEvent::Fault {
                    error: Arc::new(e),
                    row: self.cursor.row,
                    col: self.cursor.col,
                });
            }
        }
    }

    /// Decide what follows a completed step: teardown, pause or the next pixel.
    fn schedule_next(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(is_final) = session.stop {
            self.begin_teardown(is_final);
            return;
        }
        if session.pause_requested {
            session.pause_requested = false;
            session.suspend_clock();
            let waiters = std::mem::take(&mut session.pause_waiters);
            info!(
                row = self.cursor.row,
                col = self.cursor.col,
                "Scan paused"
            );
            self.set_state(ScanState::Paused);
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return;
        }
        self.dispatch_pixel(false);
    }

    fn dispatch_pixel(&mut self, retried: bool) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let targets = self
            .cursor
            .pixels()
            .into_iter()
            .map(|(row, col)| self.image.position(row, col))
            .collect();
        let job = Job::Pixel {
            strategy: session.strategy,
            targets,
            window: session.window,
            retried,
        };
        self.dispatch(job);
    }

    fn commit(&mut self, samples: PixelSamples) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let cells = self.cursor.pixels();
        let stored = session.strategy.store(
            Arc::make_mut(&mut self.image),
            &cells,
            &samples,
            &session.topo,
            self.correction.as_ref(),
            session.window.as_ref(),
        );
        let outcome = match stored {
            Ok(outcome) => outcome,
            Err(e) => return self.fault(e),
        };

        if let (Some(dip), AcquisitionStrategy::FullSweep { tracker, .. }, Some(window)) =
            (outcome.dip, session.strategy, session.window.as_mut())
        {
            let mut next = tracker.next_window(window, dip);
            next.fit_within(&self.limits);
            if next.coarse != window.coarse {
                debug!(dip, coarse = next.coarse, "Sweep step changed");
            }
            *window = next;
        }
        let remaining = session.remaining_seconds();
        let retrace = session.retrace;

        self.committed += cells.len();
        if let Some(record) = &outcome.spectrum {
            Arc::make_mut(&mut self.spectra).append(record.clone());
        }
        let acquired = self.cursor.fast() + cells.len();
        Arc::make_mut(&mut self.line).refresh(
            &self.image,
            self.cursor.orientation(),
            self.cursor.slow(),
            acquired,
        );
        self.publish_image(outcome.spectrum);
        self.emit(ScanEvent::RemainingTimeChanged(format_duration(remaining)));

        match self.cursor.advance() {
            Advance::Next => self.schedule_next(),
            Advance::LineEnd => {
                let stopping = self.session.as_ref().is_some_and(|s| s.stop.is_some());
                if stopping {
                    self.schedule_next();
                } else {
                    let finished = self.cursor.slow().saturating_sub(1);
                    let path = retrace.retrace_path(&self.image, finished);
                    debug!(line = finished, points = path.len(), "Retracing");
                    let last_cell = cells.last().copied().unwrap_or((0, 0));
                    self.dispatch(Job::Retrace { path, last_cell });
                }
            }
            Advance::ScanEnd => {
                info!(pixels = self.committed, "Last pixel acquired");
                if let Some(session) = self.session.as_mut() {
                    session.stop.get_or_insert(true);
                }
                self.schedule_next();
            }
        }
    }

    /// Recompute the window from the source limits and acquire the same pixel
    /// once more.
    fn retry_sweep(&mut self, expected: usize, actual: usize) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        warn!(
            expected,
            actual, "Spectrum size mismatch, recomputing the window and retrying the pixel"
        );
        let revalidated = match session.window.as_mut() {
            Some(window) => {
                window.fit_within(&self.limits);
                window.validate()
            }
            None => Ok(()),
        };
        if let Err(e) = revalidated {
            self.fault(e);
        } else if session.stop.is_some() {
            self.schedule_next();
        } else {
            self.dispatch_pixel(true);
        }
    }

    /// Abort the session after a hardware fault. Nothing of the failed step is
    /// committed; the cursor stays on the failing pixel.
    fn fault(&mut self, error: ScanError) {
        self.fault_at(error, self.cursor.row, self.cursor.col);
    }

    /// Abort the session, reporting the fault at `(row, col)`.
    fn fault_at(&mut self, error: ScanError, row: usize, col: usize) {
        error!(row, col, "Scan fault: {}", error);
        self.emit(ScanEvent::Fault {
            error: Arc::new(error),
            row,
            col,
        });
        if let Some(session) = self.session.as_mut() {
            session.stop = Some(false);
            self.begin_teardown(false);
        }
    }

    fn begin_teardown(&mut self, is_final: bool) {
        info!(is_final, committed = self.committed, "Stopping scan");
        self.set_state(ScanState::Stopped);
        self.dispatch(Job::Teardown {
            microwave: self.settings.mode.uses_microwave(),
        });
    }

    fn finish_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let was_final = session.stop.unwrap_or(false);
        if was_final {
            self.cursor.reset();
        }
        self.set_state(ScanState::Idle);
        info!(
            session = %session.id,
            was_final,
            pixels = self.committed,
            spectra = self.spectra.len(),
            "Scan session ended"
        );
        self.emit(ScanEvent::ScanEnded {
            was_final,
            image: Arc::clone(&self.image),
            spectra: Arc::clone(&self.spectra),
        });

        for waiter in session.pause_waiters {
            let _ = waiter.send(Err(ScanError::NotRunning(self.state)));
        }
        for waiter in session.stop_waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn dispatch(&mut self, job: Job) {
        debug!(job = job.name(), "Dispatching hardware job");
        self.in_flight = Some(job.name());
        job.spawn(self.ports.clone(), self.events.clone(), self.done_tx.clone());
    }

    /// Fresh zeroed image, line buffer and spectrum log for the current settings.
    fn allocate(&mut self) {
        let settings = &self.settings;
        let image = ScanImage::initialize(settings.mode, settings.resolution, settings.range);
        self.line = Arc::new(ScanLineBuffer::new(&image, settings.orientation));
        self.cursor = ScanCursor::new(
            image.rows(),
            image.cols(),
            settings.mode.increment(),
            settings.orientation,
        );
        self.image = Arc::new(image);
        self.spectra = Arc::new(SpectrumLog::new());
        self.committed = 0;
        self.correction = None;
    }

    /// Rebuild the line buffer for the line it currently mirrors.
    fn refresh_line(&mut self) {
        let slow = self.line.line();
        let length = self.cursor.line_length();
        let acquired = self.committed.saturating_sub(slow * length).min(length);
        Arc::make_mut(&mut self.line).refresh(
            &self.image,
            self.cursor.orientation(),
            slow,
            acquired,
        );
    }

    fn microwave_power(&self) -> Option<f64> {
        self.settings
            .mode
            .uses_microwave()
            .then_some(self.settings.power_dbm)
    }

    fn publish_image(&self, spectrum: Option<SpectrumRecord>) {
        self.emit(ScanEvent::ImageUpdated {
            image: Arc::clone(&self.image),
            line: Arc::clone(&self.line),
            spectrum,
        });
    }

    fn set_state(&mut self, to: ScanState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, %to, "Scan state changed");
        self.emit(ScanEvent::StateChanged { from, to });
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}
