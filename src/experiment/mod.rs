//! Characterization pipeline.
//!
//! ```text
//! protocol ──► ProtocolSequencer ──► per sequence: IntensityConverter + GridGenerator
//!                    │
//!                    └──► per point: MeasurementStateMachine ──► HardwareCoordinator
//!                                          │
//!                                          └──► ResultStore
//! ```

pub mod grid;
pub mod intensity;
#[cfg(feature = "storage_csv")]
pub mod loader;
pub mod measurement;
pub mod protocol;
pub mod sequencer;

pub use grid::{GridGenerator, GridSpecification, TargetPoint};
pub use intensity::{to_drive_value, ConversionTable, DriveKind, DriveValue};
pub use measurement::{MeasurementResult, MeasurementStateMachine, PointStatus};
pub use protocol::{DriveParameters, ProtocolRow, Sequence};
pub use sequencer::{
    prepare_sequences, CancellationFlag, Confirmation, ConfirmationSource, ProtocolSequencer,
};
