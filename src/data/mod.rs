//! Result persistence and post-processing.
pub mod manifest;
pub mod phasor;
pub mod storage;

pub use manifest::{PointSummary, RunManifest, RunStatus, SequenceSummary};
pub use storage::{PointRecord, ResultStore};
