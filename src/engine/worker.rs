//! Hardware steps run off the controller task.
//!
//! The controller dispatches at most one [`Job`] at a time. Each job runs on its
//! own tokio task with a clone of the [`HardwarePorts`] and reports back with a
//! [`JobOutcome`] on the completion channel, so commands keep being served while
//! the hardware is busy.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn, Instrument};

use super::messages::ScanEvent;
use crate::error::{AppResult, ScanError};
use crate::hardware::HardwarePorts;
use crate::scan::{AcquisitionStrategy, FrequencyWindow, PixelSamples, RetraceController};

#[derive(Debug, Clone)]
pub(crate) enum Job {
    /// Arm the sample clock (and the microwave trigger for microwave modes),
    /// then optionally bring the probe to `approach` before the first pixel.
    Arm {
        clock_frequency: f64,
        power_dbm: Option<f64>,
        approach: Option<(RetraceController, (f64, f64))>,
    },
    Pixel {
        strategy: AcquisitionStrategy,
        targets: Vec<(f64, f64)>,
        window: Option<FrequencyWindow>,
        retried: bool,
    },
    /// Return the probe along `path`; `last_cell` is the final pixel of the
    /// line just finished.
    Retrace {
        path: Vec<(f64, f64)>,
        last_cell: (usize, usize),
    },
    Teardown {
        microwave: bool,
    },
    MoveTo {
        target: (f64, f64),
        retrace: RetraceController,
    },
}

#[derive(Debug)]
pub(crate) enum JobOutcome {
    Armed(AppResult<()>),
    Pixel {
        result: AppResult<PixelSamples>,
        retried: bool,
    },
    Retraced {
        last_cell: (usize, usize),
        result: AppResult<()>,
    },
    TornDown,
    Moved {
        target: (f64, f64),
        result: AppResult<()>,
    },
}

impl Job {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Job::Arm { .. } => "arm",
            Job::Pixel { .. } => "pixel",
            Job::Retrace { .. } => "retrace",
            Job::Teardown { .. } => "teardown",
            Job::MoveTo { .. } => "move",
        }
    }

    /// Spawn the job; its outcome is delivered on `done`.
    pub(crate) fn spawn(
        self,
        ports: HardwarePorts,
        events: broadcast::Sender<ScanEvent>,
        done: mpsc::Sender<JobOutcome>,
    ) {
        tokio::spawn(
            async move {
                let outcome = self.run(&ports, &events).await;
                if done.send(outcome).await.is_err() {
                    debug!("Controller gone before job completion was delivered");
                }
            }
            .in_current_span(),
        );
    }

    pub(crate) async fn run(
        self,
        ports: &HardwarePorts,
        events: &broadcast::Sender<ScanEvent>,
    ) -> JobOutcome {
        match self {
            Job::Arm {
                clock_frequency,
                power_dbm,
                approach,
            } => JobOutcome::Armed(arm(ports, clock_frequency, power_dbm, approach).await),
            Job::Pixel {
                strategy,
                targets,
                window,
                retried,
            } => JobOutcome::Pixel {
                result: strategy.acquire(ports, &targets, window.as_ref()).await,
                retried,
            },
            Job::Retrace { path, last_cell } => JobOutcome::Retraced {
                last_cell,
                result: reposition(ports, &path, "Retrace").await,
            },
            Job::Teardown { microwave } => {
                teardown(ports, microwave).await;
                JobOutcome::TornDown
            }
            Job::MoveTo { target, retrace } => JobOutcome::Moved {
                target,
                result: move_to(ports, events, target, retrace).await,
            },
        }
    }
}

async fn arm(
    ports: &HardwarePorts,
    clock_frequency: f64,
    power_dbm: Option<f64>,
    approach: Option<(RetraceController, (f64, f64))>,
) -> AppResult<()> {
    ports
        .line_scanner
        .arm_clock(clock_frequency)
        .await
        .map_err(|e| ScanError::AcquisitionFault(format!("Clock arming failed: {:#}", e)))?;

    if let Some(power) = power_dbm {
        ports
            .spectrometer
            .arm_trigger(clock_frequency, power)
            .await
            .map_err(|e| {
                ScanError::AcquisitionFault(format!("Microwave trigger arming failed: {:#}", e))
            })?;
    }

    if let Some((retrace, first_pixel)) = approach {
        let current = ports
            .positioner
            .current_position()
            .await
            .map_err(|e| ScanError::PositionerFault(format!("Position query failed: {:#}", e)))?;
        let path = retrace.approach_path(current, first_pixel);
        debug!(points = path.len(), "Approaching first pixel");
        reposition(ports, &path, "Approach").await?;
    }
    Ok(())
}

/// Drive the probe along `path` with one line scan, discarding the samples.
async fn reposition(ports: &HardwarePorts, path: &[(f64, f64)], what: &str) -> AppResult<()> {
    let samples = ports
        .line_scanner
        .scan_line(path)
        .await
        .map_err(|e| ScanError::PositionerFault(format!("{} failed: {:#}", what, e)))?;
    if samples.is_fault() {
        return Err(ScanError::PositionerFault(format!(
            "{} returned the fault sentinel",
            what
        )));
    }
    Ok(())
}

/// Release counters and the microwave source. Failures are logged only: the
/// session is over either way.
async fn teardown(ports: &HardwarePorts, microwave: bool) {
    if let Err(e) = ports.line_scanner.close_counters().await {
        warn!("Closing counters failed: {:#}", e);
    }
    if microwave {
        if let Err(e) = ports.spectrometer.mw_off().await {
            warn!("Switching microwave off failed: {:#}", e);
        }
    }
}

async fn move_to(
    ports: &HardwarePorts,
    events: &broadcast::Sender<ScanEvent>,
    target: (f64, f64),
    retrace: RetraceController,
) -> AppResult<()> {
    let current = ports
        .positioner
        .current_position()
        .await
        .map_err(|e| ScanError::PositionerFault(format!("Position query failed: {:#}", e)))?;

    for (x, y) in retrace.approach_path(current, target) {
        ports
            .positioner
            .move_to(x, y)
            .await
            .map_err(|e| ScanError::PositionerFault(format!("Move to ({}, {}) failed: {:#}", x, y, e)))?;
        let _ = events.send(ScanEvent::PositionChanged { x, y });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockHardware;
    use crate::hardware::ports::AxisRange;
    use crate::scan::Orientation;

    fn range() -> AxisRange {
        AxisRange::from_array([[0.0, 1.0], [0.0, 1.0]])
    }

    #[tokio::test]
    async fn test_arm_with_approach_moves_probe() {
        let hw = MockHardware::new(range());
        let (events, _rx) = broadcast::channel(16);
        let job = Job::Arm {
            clock_frequency: 10.0,
            power_dbm: Some(-20.0),
            approach: Some((RetraceController::new(Orientation::Horizontal, 0.25), (0.5, 0.5))),
        };
        let outcome = job.run(&hw.ports(), &events).await;
        assert!(matches!(outcome, JobOutcome::Armed(Ok(()))));
        assert!(hw.line_scanner.is_armed().await);
        assert_eq!(hw.positioner.position().await, (0.5, 0.5));
    }

    #[tokio::test]
    async fn test_retrace_fault_is_positioner_fault() {
        let hw = MockHardware::new(range());
        hw.line_scanner.fail_on_call(0);
        let (events, _rx) = broadcast::channel(16);
        let _ = Job::Arm {
            clock_frequency: 10.0,
            power_dbm: None,
            approach: None,
        }
        .run(&hw.ports(), &events)
        .await;

        let outcome = Job::Retrace {
            path: vec![(0.0, 0.0), (0.0, 0.5)],
            last_cell: (0, 3),
        }
        .run(&hw.ports(), &events)
        .await;
        assert!(matches!(
            outcome,
            JobOutcome::Retraced {
                last_cell: (0, 3),
                result: Err(ScanError::PositionerFault(_)),
            }
        ));
    }

    #[tokio::test]
    async fn test_move_reports_each_point() {
        let hw = MockHardware::new(range());
        let (events, mut rx) = broadcast::channel(16);
        let outcome = Job::MoveTo {
            target: (0.5, 0.0),
            retrace: RetraceController::new(Orientation::Horizontal, 0.25),
        }
        .run(&hw.ports(), &events)
        .await;
        assert!(matches!(outcome, JobOutcome::Moved { result: Ok(()), .. }));

        let mut last = None;
        while let Ok(ScanEvent::PositionChanged { x, y }) = rx.try_recv() {
            last = Some((x, y));
        }
        assert_eq!(last, Some((0.5, 0.0)));
    }
}
