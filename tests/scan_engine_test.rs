//! Integration tests for the scan engine driven through `ScanHandle`
//!
//! Every scan runs against `MockHardware`, so image contents can be compared to
//! the synthetic surface that produced them.

use magscan::config::{EngineConfig, ScanConfig};
use magscan::engine::{
    spawn_scan_engine, ScanEvent, ScanHandle, ScanSettings, ScanState, SweepParameters,
};
use magscan::error::ScanError;
use magscan::hardware::mock::{MockHardware, MockSurface};
use magscan::hardware::ports::AxisRange;
use magscan::scan::{ChannelLayout, Orientation, ScanImage, ScanMode, SpectrumLog};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

// =============================================================================
// Helpers
// =============================================================================

fn scan_range() -> AxisRange {
    AxisRange::from_array([[0.0, 3e-6], [0.0, 3e-6]])
}

fn settings(mode: ScanMode, resolution: [usize; 2], orientation: Orientation) -> ScanSettings {
    let mut config = ScanConfig::default();
    config.scanner.mode = mode;
    config.scanner.resolution = resolution;
    config.scanner.orientation = orientation;
    config.scanner.range = scan_range().to_array();
    config.scanner.return_slowness = 1e-6;
    config.microwave.start = 2.84e9;
    config.microwave.stop = 2.90e9;
    config.microwave.step = 2e6;
    config.microwave.step_coarse = 6e6;
    ScanSettings::from_config(&config).unwrap()
}

async fn spawn(settings: ScanSettings, hw: &MockHardware) -> (ScanHandle, JoinHandle<()>) {
    spawn_scan_engine(settings, hw.ports(), &EngineConfig::default())
        .await
        .unwrap()
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ScanEvent>, mut matches: F) -> ScanEvent
where
    F: FnMut(&ScanEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for scan event")
}

async fn wait_for_end(
    rx: &mut broadcast::Receiver<ScanEvent>,
) -> (bool, Arc<ScanImage>, Arc<SpectrumLog>) {
    match wait_for(rx, |e| matches!(e, ScanEvent::ScanEnded { .. })).await {
        ScanEvent::ScanEnded {
            was_final,
            image,
            spectra,
        } => (was_final, image, spectra),
        _ => unreachable!(),
    }
}

// =============================================================================
// Complete scans
// =============================================================================

#[tokio::test]
async fn test_quenching_scan_visits_every_pixel() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [6, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let (was_final, image, spectra) = wait_for_end(&mut events).await;

    assert!(was_final);
    assert_eq!((image.rows(), image.cols(), image.channels()), (4, 6, 5));
    assert!(spectra.is_empty());
    let pl = image.layout().pl().unwrap();
    for row in 0..4 {
        for col in 0..6 {
            assert_eq!(image.get(row, col, pl), 1000.0, "pixel ({}, {})", row, col);
            assert!(image.get(row, col, image.layout().raw_topo()) != 0.0);
        }
    }

    // approach + 3 steps per line + a retrace between lines
    assert_eq!(hw.line_scanner.call_count(), 1 + 4 * 3 + 3);
    assert_eq!(hw.line_scanner.close_count(), 1);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ScanState::Idle);
    assert_eq!((snapshot.cursor.row, snapshot.cursor.col), (0, 0));
    assert_eq!(snapshot.committed, 24);
    assert!(snapshot.session_id.is_none());
}

#[tokio::test]
async fn test_vertical_scan_walks_columns() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Vertical), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let (was_final, image, _) = wait_for_end(&mut events).await;
    assert!(was_final);

    let paths = hw.line_scanner.recorded_paths().await;
    // paths[0] is the approach; the first pixel pair shares x and steps in y
    assert_eq!(paths[1], vec![image.position(0, 0), image.position(1, 0)]);
    assert_eq!(paths[1][0].0, paths[1][1].0);
}

#[tokio::test]
async fn test_isob_scan_writes_difference_channel() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::IsoB, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let (was_final, image, _) = wait_for_end(&mut events).await;
    assert!(was_final);
    assert_eq!(image.channels(), 7);

    let diff = image.layout().pl_diff().unwrap();
    for row in 0..4 {
        for col in 0..4 {
            let pl1 = image.get(row, col, diff + 1);
            let pl2 = image.get(row, col, diff + 2);
            assert!((pl1 - 700.0).abs() < 1e-6, "on-resonance counts {}", pl1);
            assert_eq!(image.get(row, col, diff), pl1 - pl2);
        }
    }
    assert_eq!(hw.positioner.move_count(), 16);
    assert!(!hw.spectrometer.is_mw_on());
}

#[tokio::test]
async fn test_full_sweep_tracks_moving_resonance() {
    let surface = MockSurface {
        resonance_gradient: 5e12,
        ..MockSurface::default()
    };
    let hw = MockHardware::with_surface(scan_range(), surface);
    let (handle, _task) = spawn(settings(ScanMode::FullSweep, [6, 2], Orientation::Horizontal), &hw).await;
    handle
        .set_sweep_parameters(SweepParameters {
            start: 2.84e9,
            stop: 2.90e9,
            step: 2e6,
            step_coarse: 6e6,
            min_fullb: 2.80e9,
            max_fullb: 2.95e9,
            number_sweeps: 2,
            threshold: 100e6,
        })
        .await
        .unwrap();
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let (was_final, image, spectra) = wait_for_end(&mut events).await;
    assert!(was_final);
    assert_eq!(image.channels(), 8);
    assert_eq!(spectra.len(), 12);

    let freq = image.layout().freq().unwrap();
    for row in 0..2 {
        for col in 0..6 {
            let (x, _) = image.position(row, col);
            let dip = image.get(row, col, freq);
            assert!(
                (dip - surface.resonance_at(x)).abs() <= 2e6,
                "pixel ({}, {}): dip {} vs resonance {}",
                row,
                col,
                dip,
                surface.resonance_at(x)
            );
        }
    }

    let last = spectra.last().unwrap();
    assert_eq!((last.row, last.col), (1, 5));
    assert_eq!(last.frequencies.len(), last.signal.len());
}

// =============================================================================
// Sweep retry and faults
// =============================================================================

#[tokio::test]
async fn test_single_sweep_mismatch_is_retried() {
    let hw = MockHardware::new(scan_range());
    hw.spectrometer.truncate_sweep_on(3);
    let (handle, _task) = spawn(settings(ScanMode::FullSweep, [2, 2], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let (was_final, _, spectra) = wait_for_end(&mut events).await;
    assert!(was_final);
    assert_eq!(spectra.len(), 4);
    assert_eq!(hw.spectrometer.sweep_count(), 5);
}

#[tokio::test]
async fn test_repeated_sweep_mismatch_aborts_scan() {
    let hw = MockHardware::new(scan_range());
    hw.spectrometer.truncate_sweeps_from(1);
    let (handle, _task) = spawn(settings(ScanMode::FullSweep, [2, 2], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let fault = wait_for(&mut events, |e| matches!(e, ScanEvent::Fault { .. })).await;
    match fault {
        ScanEvent::Fault { error, row, col } => {
            assert!(matches!(*error, ScanError::AcquisitionFault(_)));
            assert_eq!((row, col), (0, 1));
        }
        _ => unreachable!(),
    }
    let (was_final, image, spectra) = wait_for_end(&mut events).await;
    assert!(!was_final);
    assert_eq!(spectra.len(), 1);
    assert_eq!(image.get(0, 1, image.layout().freq().unwrap()), 0.0);
    assert!(!hw.spectrometer.is_mw_on());
}

#[tokio::test]
async fn test_fault_keeps_earlier_pixels_and_skips_failed_ones() {
    let hw = MockHardware::new(scan_range());
    // calls: approach, line 0 (2 steps), retrace, line 1 step 0, line 1 step 1 fails
    hw.line_scanner.fail_on_call(5);
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let fault = wait_for(&mut events, |e| matches!(e, ScanEvent::Fault { .. })).await;
    assert!(matches!(fault, ScanEvent::Fault { row: 1, col: 2, .. }));

    let (was_final, image, _) = wait_for_end(&mut events).await;
    assert!(!was_final);
    let pl = image.layout().pl().unwrap();
    for col in 0..4 {
        assert_eq!(image.get(0, col, pl), 1000.0);
    }
    assert_eq!(image.get(1, 0, pl), 1000.0);
    assert_eq!(image.get(1, 1, pl), 1000.0);
    assert_eq!(image.get(1, 2, pl), 0.0);
    assert_eq!(image.get(1, 3, pl), 0.0);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ScanState::Idle);
    assert_eq!(snapshot.committed, 6);
    assert_eq!(hw.line_scanner.close_count(), 1);

    // A failed session can be restarted from the beginning
    handle.start().await.unwrap();
    let (was_final, _, _) = wait_for_end(&mut events).await;
    assert!(was_final);
}

#[tokio::test]
async fn test_retrace_fault_reports_end_of_finished_line() {
    let hw = MockHardware::new(scan_range());
    // calls: approach, line 0 (2 steps), retrace fails
    hw.line_scanner.fail_on_call(3);
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let fault = wait_for(&mut events, |e| matches!(e, ScanEvent::Fault { .. })).await;
    match fault {
        ScanEvent::Fault { error, row, col } => {
            assert!(matches!(*error, ScanError::PositionerFault(_)));
            assert_eq!((row, col), (0, 3));
        }
        _ => unreachable!(),
    }

    let (was_final, image, _) = wait_for_end(&mut events).await;
    assert!(!was_final);
    let pl = image.layout().pl().unwrap();
    assert_eq!(image.get(0, 3, pl), 1000.0);
    assert_eq!(image.get(1, 0, pl), 0.0);
}

#[tokio::test]
async fn test_refused_move_is_positioner_fault() {
    let hw = MockHardware::new(scan_range());
    hw.positioner.refuse_moves(true);
    let (handle, _task) = spawn(settings(ScanMode::IsoB, [2, 2], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    let fault = wait_for(&mut events, |e| matches!(e, ScanEvent::Fault { .. })).await;
    match fault {
        ScanEvent::Fault { error, .. } => {
            assert!(matches!(*error, ScanError::PositionerFault(_)))
        }
        _ => unreachable!(),
    }
    let (was_final, _, _) = wait_for_end(&mut events).await;
    assert!(!was_final);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_pause_resume_continues_at_saved_cursor() {
    let hw = MockHardware::with_delay(scan_range(), MockSurface::default(), Duration::from_millis(5));
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [6, 6], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    sleep(Duration::from_millis(30)).await;
    handle.pause().await.unwrap();

    let paused = handle.snapshot().await.unwrap();
    assert_eq!(paused.state, ScanState::Paused);
    assert!(paused.committed > 0 && paused.committed < 36);
    assert!(paused.session_id.is_some());

    sleep(Duration::from_millis(40)).await;
    let still = handle.snapshot().await.unwrap();
    assert_eq!(still.committed, paused.committed);
    assert_eq!(still.cursor, paused.cursor);

    handle.resume().await.unwrap();
    let (was_final, image, _) = wait_for_end(&mut events).await;
    assert!(was_final);
    let pl = image.layout().pl().unwrap();
    assert!(image.channel(pl).iter().all(|&v| v == 1000.0));
    // No pixel pair acquired twice: approach + 18 steps + 5 retraces
    assert_eq!(hw.line_scanner.call_count(), 1 + 18 + 5);
}

#[tokio::test]
async fn test_lifecycle_commands_rejected_in_wrong_state() {
    let hw = MockHardware::with_delay(scan_range(), MockSurface::default(), Duration::from_millis(5));
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;

    assert!(matches!(
        handle.pause().await,
        Err(ScanError::NotRunning(ScanState::Idle))
    ));
    assert!(matches!(
        handle.resume().await,
        Err(ScanError::NotPaused(ScanState::Idle))
    ));
    assert!(handle.stop(true).await.is_ok());

    handle.start().await.unwrap();
    assert!(matches!(
        handle.start().await,
        Err(ScanError::AlreadyRunning(ScanState::Running))
    ));
    assert!(matches!(
        handle.resume().await,
        Err(ScanError::NotPaused(ScanState::Running))
    ));
    assert!(matches!(
        handle.set_mode(ScanMode::IsoB).await,
        Err(ScanError::AlreadyRunning(_))
    ));
    assert!(matches!(
        handle.move_to(1e-6, 1e-6).await,
        Err(ScanError::AlreadyRunning(_))
    ));

    handle.stop(false).await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap().state, ScanState::Idle);
}

#[tokio::test]
async fn test_final_stop_rewinds_cursor() {
    let hw = MockHardware::with_delay(scan_range(), MockSurface::default(), Duration::from_millis(5));
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [6, 6], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    sleep(Duration::from_millis(25)).await;
    handle.stop(true).await.unwrap();

    let (was_final, _, _) = wait_for_end(&mut events).await;
    assert!(was_final);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!((snapshot.cursor.row, snapshot.cursor.col), (0, 0));
    assert!(snapshot.committed < 36);
    assert_eq!(hw.line_scanner.close_count(), 1);
}

#[tokio::test]
async fn test_stop_while_paused_releases_hardware() {
    let hw = MockHardware::with_delay(scan_range(), MockSurface::default(), Duration::from_millis(5));
    let (handle, _task) = spawn(settings(ScanMode::FullSweep, [4, 4], Orientation::Horizontal), &hw).await;

    handle.start().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    handle.pause().await.unwrap();
    assert!(hw.spectrometer.is_mw_on());

    handle.stop(false).await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ScanState::Idle);
    assert!(!hw.spectrometer.is_mw_on());
    assert!(!hw.line_scanner.is_armed().await);
}

// =============================================================================
// Parameters and post-processing
// =============================================================================

#[tokio::test]
async fn test_mode_switch_reallocates_image() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;

    handle.set_mode(ScanMode::IsoB).await.unwrap();
    assert_eq!(handle.snapshot().await.unwrap().image.channels(), 7);
    handle.set_mode(ScanMode::FullSweep).await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.image.channels(), 8);
    assert_eq!(snapshot.image.layout(), ChannelLayout::for_mode(ScanMode::FullSweep));

    let changed = handle.set_resolution(7, 4).await.unwrap();
    assert_eq!(changed["x_resolution"], 6);
    assert_eq!(handle.snapshot().await.unwrap().image.cols(), 6);
}

#[tokio::test]
async fn test_parameter_change_publishes_duration_estimate() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    let changed = handle.set_clock_frequency(20.0).await.unwrap();
    assert_eq!(changed["clock_frequency"], 20.0);

    let params = wait_for(&mut events, |e| matches!(e, ScanEvent::ParametersChanged(_))).await;
    assert!(matches!(params, ScanEvent::ParametersChanged(map) if map.contains_key("clock_frequency")));

    let estimate = wait_for(&mut events, |e| matches!(e, ScanEvent::DurationEstimateChanged(_))).await;
    let expected = handle.snapshot().await.unwrap().estimate.display();
    assert!(matches!(estimate, ScanEvent::DurationEstimateChanged(text) if text == expected));

    assert!(matches!(
        handle.set_clock_frequency(-1.0).await,
        Err(ScanError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_range_outside_travel_rejected_at_start() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;

    handle
        .set_range(AxisRange::from_array([[0.0, 5e-6], [0.0, 3e-6]]))
        .await
        .unwrap();
    assert!(matches!(
        handle.start().await,
        Err(ScanError::Configuration(_))
    ));
    assert_eq!(handle.snapshot().await.unwrap().state, ScanState::Idle);
}

#[tokio::test]
async fn test_plane_correction_flattens_tilted_surface() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [6, 6], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    wait_for_end(&mut events).await;

    let plane = handle.correct_topography().await.unwrap();
    assert!(plane.a != 0.0 && plane.b != 0.0);
    let first = handle.snapshot().await.unwrap().image;
    assert!(first
        .channel(ChannelLayout::TOPO)
        .iter()
        .all(|v| v.abs() < 1e-12));

    handle.correct_topography().await.unwrap();
    let second = handle.snapshot().await.unwrap().image;
    assert_eq!(first.data(), second.data());
}

#[tokio::test]
async fn test_plane_correction_zeroes_unvisited_pixels() {
    let hw = MockHardware::new(scan_range());
    hw.line_scanner.fail_on_call(5);
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.start().await.unwrap();
    wait_for_end(&mut events).await;

    handle.correct_topography().await.unwrap();
    let image = handle.snapshot().await.unwrap().image;
    for row in 2..4 {
        for col in 0..4 {
            assert_eq!(image.get(row, col, ChannelLayout::TOPO), 0.0);
        }
    }
    assert!(image.get(1, 1, image.layout().raw_topo()) != 0.0);
}

#[tokio::test]
async fn test_move_to_reports_progress_and_end() {
    let hw = MockHardware::new(scan_range());
    let (handle, _task) = spawn(settings(ScanMode::Quenching, [4, 4], Orientation::Horizontal), &hw).await;
    let mut events = handle.subscribe();

    handle.move_to(2e-6, 1e-6).await.unwrap();
    wait_for(&mut events, |e| matches!(e, ScanEvent::PositionChanged { .. })).await;
    let end = wait_for(&mut events, |e| matches!(e, ScanEvent::MoveToEnded { .. })).await;
    assert!(matches!(end, ScanEvent::MoveToEnded { x, y } if x == 2e-6 && y == 1e-6));
    assert_eq!(hw.positioner.position().await, (2e-6, 1e-6));

    assert!(matches!(
        handle.move_to(1.0, 0.0).await,
        Err(ScanError::Configuration(_))
    ));
}
