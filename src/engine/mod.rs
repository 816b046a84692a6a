//! Scan engine: the controller actor, its messages and the client handle.
//!
//! ```rust,no_run
//! use magscan::config::ScanConfig;
//! use magscan::engine::{spawn_scan_engine, ScanSettings};
//! use magscan::hardware::mock::MockHardware;
//!
//! # async fn demo() -> magscan::error::AppResult<()> {
//! let config = ScanConfig::default();
//! let settings = ScanSettings::from_config(&config)?;
//! let hardware = MockHardware::new(settings.range);
//! let (handle, task) = spawn_scan_engine(settings, hardware.ports(), &config.engine).await?;
//!
//! let mut events = handle.subscribe();
//! handle.start().await?;
//! // ... consume `events` ...
//! handle.shutdown().await?;
//! let _ = task.await;
//! # Ok(())
//! # }
//! ```

mod controller;
pub mod handle;
pub mod messages;
pub mod settings;
pub mod state;
mod worker;

pub use handle::{spawn_scan_engine, ScanHandle};
pub use messages::{ParameterChange, ScanCommand, ScanEvent, ScanSnapshot};
pub use settings::{ParameterMap, ScanSettings, SweepParameters};
pub use state::ScanState;
