//! # sonorover
//!
//! Protocol-driven characterization of focused-ultrasound transducers. A
//! hydrophone on a 3-axis stage is moved over a grid of points; at each point
//! the driving system emits a pulse train and a digitizer records the
//! hydrophone signal.
//!
//! ## Crate Structure
//!
//! - **`config`**: `RigConfig`, layered from defaults, a TOML file and
//!   `SONOROVER_` environment variables (figment).
//! - **`error`**: `CharacError` for the pipeline and `HardwareError` with its
//!   `FaultKind` taxonomy for rig faults.
//! - **`error_recovery`**: `RetryPolicy`, the per-point retry budget.
//! - **`hardware`**: capability traits (`Positioner`, `Driver`, `Digitizer`),
//!   the `HardwareCoordinator` that owns them, and simulated devices.
//! - **`experiment`**: grid resolution, intensity conversion, the protocol
//!   model and loaders, the per-point `MeasurementStateMachine` and the
//!   `ProtocolSequencer` that drives a run.
//! - **`data`**: `ResultStore` (run directory, waveforms, per-point records),
//!   `RunManifest`, and phasor extraction.
//! - **`logging`**: tracing subscriber setup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sonorover::config::RigConfig;
//! use sonorover::experiment::ProtocolSequencer;
//!
//! let rig = RigConfig::load()?;
//! let sequencer = ProtocolSequencer::from_config(coordinator, &rig);
//! let manifest = sequencer.run(&sequences, rig.zero_point, table.as_ref(), false).await?;
//! println!("{}", manifest.status);
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{CharacError, CharacResult, FaultKind, HardwareError};
