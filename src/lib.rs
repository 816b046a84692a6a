//! # magscan
//!
//! Raster-scanning magnetometry engine. A probe is stepped across a rectangular
//! sample region; at every pixel the engine reads photoluminescence counts, the
//! probe height and, depending on the mode, counts at two microwave frequencies
//! or a whole microwave spectrum whose dip follows the local magnetic field.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based loading of `config/magscan.toml` plus `MAGSCAN_*`
//!   environment overrides. See [`config::ScanConfig`].
//! - **`engine`**: The scan controller actor, its command/event messages and the
//!   cloneable [`engine::ScanHandle`] used to drive it.
//! - **`error`**: The crate-wide [`error::ScanError`] enum.
//! - **`hardware`**: Async port traits for the positioner, the line scanner and the
//!   microwave spectrometer, plus simulated implementations.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`scan`**: Synchronous scan building blocks: raster cursor, image and line
//!   buffer, per-mode acquisition strategies, resonance tracking, retrace paths,
//!   plane correction and duration estimates.

pub mod config;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod scan;
