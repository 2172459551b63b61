//! Rig Capabilities
//!
//! One trait per subsystem. The pipeline is polymorphic over any implementation
//! that satisfies these contracts; a vendor stage, driving system or scope is
//! swapped without touching the sequencer.
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Reports failures as [`HardwareError`] so faults can be classified
//! - Takes `&self`; implementations use interior mutability for state
//!
//! # Example
//!
//! ```rust,ignore
//! struct BenchStage { position: RwLock<Position3> }
//!
//! #[async_trait]
//! impl Positioner for BenchStage {
//!     fn id(&self) -> &str { "bench-stage" }
//!
//!     async fn move_to(&self, target: Position3) -> HwResult<()> {
//!         *self.position.write().await = target;
//!         Ok(())
//!     }
//!
//!     async fn current_position(&self) -> HwResult<Position3> {
//!         Ok(*self.position.read().await)
//!     }
//!
//!     async fn is_moving(&self) -> HwResult<bool> { Ok(false) }
//! }
//! ```

use async_trait::async_trait;
use std::time::Duration;

use crate::error::HardwareError;
use crate::experiment::protocol::DriveParameters;
use crate::hardware::{Position3, Waveform};

/// Result type returned by capability calls.
pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Capability: 3-axis positioning stage.
///
/// # Contract
/// - Positions are absolute stage coordinates in millimetres
/// - `move_to` initiates motion and may return before motion completes
/// - `is_moving` and `current_position` are the readiness queries used to
///   decide that a target has been reached
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Identifier recorded in the run manifest.
    fn id(&self) -> &str;

    /// Open the connection. Default: no-op.
    async fn connect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Close the connection. Default: no-op.
    async fn disconnect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Command an absolute move.
    ///
    /// # Returns
    /// - Ok(()) once the controller accepted the move
    /// - Err(PositionTimeout) if the controller did not acknowledge in time
    /// - Err(PositionFault) on limit, alarm or interlock
    async fn move_to(&self, target: Position3) -> HwResult<()>;

    /// Current stage position. May be approximate while moving.
    async fn current_position(&self) -> HwResult<Position3>;

    /// Whether the stage is still in motion.
    async fn is_moving(&self) -> HwResult<bool>;
}

/// Capability: ultrasound driving system.
///
/// # Contract
/// - `configure` loads a full waveform description; it stays in effect for
///   every subsequent `fire` until reconfigured
/// - `fire` emits one programmed pulse train and returns when emission is done
/// - `stop` forces the output off and must be safe to call at any time
#[async_trait]
pub trait Driver: Send + Sync {
    /// Identifier recorded in the run manifest.
    fn id(&self) -> &str;

    /// Open the connection. Default: no-op.
    async fn connect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Close the connection. Default: no-op.
    async fn disconnect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Load the waveform description for the coming points.
    async fn configure(&self, parameters: &DriveParameters) -> HwResult<()>;

    /// Emit one pulse train. Fails with DriveFault.
    async fn fire(&self) -> HwResult<()>;

    /// Force the output off.
    async fn stop(&self) -> HwResult<()>;
}

/// Capability: triggered waveform digitizer.
///
/// # Contract
/// - `arm` prepares a single triggered record of `window` length at `sample_rate_hz`
/// - `capture` waits for the triggered record and returns it
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Identifier recorded in the run manifest.
    fn id(&self) -> &str;

    /// Open the connection. Default: no-op.
    async fn connect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Close the connection. Default: no-op.
    async fn disconnect(&self) -> HwResult<()> {
        Ok(())
    }

    /// Arm for one triggered record.
    async fn arm(&self, sample_rate_hz: f64, window: Duration) -> HwResult<()>;

    /// Retrieve the armed record.
    ///
    /// # Returns
    /// - Ok(waveform) when the record is complete
    /// - Err(CaptureTimeout) if the record did not complete within `timeout`
    /// - Err(NoTrigger) if the trigger never arrived
    async fn capture(&self, timeout: Duration) -> HwResult<Waveform>;
}
