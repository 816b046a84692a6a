//! CLI entry point for magscan
//!
//! Provides command-line access to:
//! - Running a complete raster scan against the simulated hardware
//! - Estimating the duration of a scan from the configuration
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Simulate a full-sweep scan and save the result:
//! ```bash
//! magscan simulate --mode fullb --resolution 20 20 --output scan.json
//! ```
//!
//! Estimate how long the configured scan takes:
//! ```bash
//! magscan estimate --config config/magscan.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use magscan::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use magscan::engine::{spawn_scan_engine, ScanEvent, ScanSettings, ScanState};
use magscan::hardware::mock::{MockHardware, MockSurface};
use magscan::logging;
use magscan::scan::{Orientation, ScanMode};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "magscan")]
#[command(about = "Raster-scanning magnetometry engine", long_about = None)]
struct Cli {
    /// Configuration file (TOML); MAGSCAN_* environment variables override it
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full scan on simulated hardware
    Simulate {
        /// Scan mode: quenching, isob or fullb
        #[arg(long)]
        mode: Option<ScanMode>,

        /// Pixels along x and y
        #[arg(long, num_args = 2, value_names = ["X", "Y"])]
        resolution: Option<Vec<usize>>,

        /// Scan along columns instead of rows
        #[arg(long)]
        vertical: bool,

        /// Simulated acquisition time per hardware call, in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Subtract a fitted plane from the topography once the scan ends
        #[arg(long)]
        correct_topography: bool,

        /// Write the image and spectra as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the estimated scan duration
    Estimate,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    logging::init_from_config(&config)?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "Configuration file not found, using defaults");
    }

    match cli.command {
        Commands::Simulate {
            mode,
            resolution,
            vertical,
            delay_ms,
            correct_topography,
            output,
        } => {
            let mut settings = ScanSettings::from_config(&config)?;
            if let Some(mode) = mode {
                settings.set_mode(mode);
            }
            if let Some([x, y]) = resolution.as_deref().and_then(|r| <[usize; 2]>::try_from(r).ok()) {
                settings.set_resolution(x, y)?;
            }
            if vertical {
                settings.set_orientation(Orientation::Vertical);
            }
            simulate(
                &config,
                settings,
                Duration::from_millis(delay_ms),
                correct_topography,
                output.as_deref(),
            )
            .await
        }
        Commands::Estimate => {
            let settings = ScanSettings::from_config(&config)?;
            let estimate = settings.estimate();
            println!(
                "{} scan, {}x{} pixels: {} (forward {:.1} s, retrace {:.1} s)",
                settings.mode,
                settings.resolution[0],
                settings.resolution[1],
                estimate.display(),
                estimate.forward_s,
                estimate.retrace_s
            );
            Ok(())
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", text);
            Ok(())
        }
    }
}

/// A missing file leaves the defaults plus environment overrides.
fn load_config(path: &Path) -> Result<ScanConfig> {
    ScanConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn simulate(
    config: &ScanConfig,
    settings: ScanSettings,
    delay: Duration,
    correct_topography: bool,
    output: Option<&Path>,
) -> Result<()> {
    let hardware = MockHardware::with_delay(settings.range, MockSurface::default(), delay);
    let (handle, task) = spawn_scan_engine(settings, hardware.ports(), &config.engine).await?;
    let mut events = handle.subscribe();

    handle.start().await?;
    let mut completed = false;
    loop {
        match events.recv().await {
            Ok(ScanEvent::StateChanged { from, to }) => info!(%from, %to, "Scan state"),
            Ok(ScanEvent::RemainingTimeChanged(remaining)) => debug!(%remaining, "Remaining"),
            Ok(ScanEvent::Fault { error, row, col }) => {
                error!(row, col, "Scan aborted: {}", error)
            }
            Ok(ScanEvent::ScanEnded {
                was_final,
                image,
                spectra,
            }) => {
                info!(
                    was_final,
                    rows = image.rows(),
                    cols = image.cols(),
                    spectra = spectra.len(),
                    "Scan ended"
                );
                completed = was_final;
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event consumer lagging"),
            Err(RecvError::Closed) => break,
        }
    }

    if completed && correct_topography {
        let plane = handle.correct_topography().await?;
        info!(a = plane.a, b = plane.b, c = plane.c, "Topography corrected");
    }

    let snapshot = handle.snapshot().await?;
    if let Some(path) = output {
        let document = json!({
            "parameters": snapshot.settings.as_parameters(),
            "channels": snapshot.image.layout().names(),
            "image": snapshot.image.as_ref(),
            "spectra": snapshot.spectra.as_ref(),
            "correction": snapshot.correction,
        });
        let text = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Scan saved");
    }

    handle.shutdown().await?;
    task.await.context("Scan controller task panicked")?;

    if snapshot.state != ScanState::Idle || !completed {
        anyhow::bail!("Scan did not complete");
    }
    Ok(())
}
