//! Run manifest.
//!
//! One `RunManifest` exists per run. It is created before the first sequence,
//! receives one [`PointSummary`] per measured point, and is finalized exactly
//! once with a terminal [`RunStatus`]. After finalization it rejects further
//! mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::{EnvironmentConditions, EquipmentConfig};
use crate::error::{CharacError, CharacResult};
use crate::experiment::grid::GridIndex;
use crate::experiment::intensity::DriveValue;
use crate::experiment::measurement::{FaultRecord, MeasurementResult, PointStatus};
use crate::hardware::coordinator::EquipmentIds;
use crate::hardware::Position3;

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    InProgress,
    /// Every point stored.
    Completed,
    /// Finished, with at least one skipped point.
    CompletedWithSkips,
    /// Halted by a fatal fault.
    Aborted,
    /// Halted by a cancellation request.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithSkips => "completed_with_skips",
            RunStatus::Aborted => "aborted",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Outcome of one point, as kept in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSummary {
    /// Grid position and visit order.
    pub index: GridIndex,
    /// Absolute stage position [mm].
    pub absolute: Position3,
    /// Outcome.
    pub status: PointStatus,
    /// Attempts made.
    pub attempts: u32,
    /// Last fault seen, if any.
    pub last_error: Option<FaultRecord>,
}

/// Per-sequence section of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    /// Sequence number.
    pub sequence_id: u32,
    /// Sequence label.
    pub tag: String,
    /// Resolved drive value.
    pub drive: DriveValue,
    /// Points the grid resolved to.
    pub planned_points: usize,
    /// Points reached, in visit order.
    pub points: Vec<PointSummary>,
}

impl SequenceSummary {
    /// Points with the given status.
    pub fn count(&self, status: PointStatus) -> usize {
        self.points.iter().filter(|p| p.status == status).count()
    }
}

/// Process-wide record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// Run directory.
    pub output_dir: PathBuf,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end, set on finalization.
    pub finished_at: Option<DateTime<Utc>>,
    /// Stage position the grids are relative to [mm].
    pub zero_point: Position3,
    /// Connected devices.
    pub equipment: EquipmentIds,
    /// Operator-supplied equipment details.
    pub equipment_details: EquipmentConfig,
    /// Water conditions.
    pub environment: EnvironmentConditions,
    /// Whether the run paused between sequences.
    pub interactive: bool,
    /// Protocol file the sequences came from.
    pub protocol_source: Option<PathBuf>,
    /// Software version and host.
    pub system_info: BTreeMap<String, String>,
    /// Terminal (or current) status.
    pub status: RunStatus,
    /// Why the run stopped early.
    pub abort_reason: Option<String>,
    /// Sequences in execution order.
    pub sequences: Vec<SequenceSummary>,
}

impl RunManifest {
    /// Fresh manifest in `InProgress`.
    pub fn new(output_dir: PathBuf, zero_point: Position3, equipment: EquipmentIds, interactive: bool) -> Self {
        let mut system_info = BTreeMap::new();
        system_info.insert(
            "software_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        if let Ok(host) = hostname::get() {
            system_info.insert("hostname".to_string(), host.to_string_lossy().into_owned());
        }
        system_info.insert("os".to_string(), std::env::consts::OS.to_string());

        Self {
            run_id: Uuid::new_v4(),
            output_dir,
            started_at: Utc::now(),
            finished_at: None,
            zero_point,
            equipment,
            equipment_details: EquipmentConfig::default(),
            environment: EnvironmentConditions::default(),
            interactive,
            protocol_source: None,
            system_info,
            status: RunStatus::InProgress,
            abort_reason: None,
            sequences: Vec::new(),
        }
    }

    /// True once a terminal status has been set.
    pub fn is_finalized(&self) -> bool {
        self.status != RunStatus::InProgress
    }

    fn ensure_open(&self) -> CharacResult<()> {
        if self.is_finalized() {
            Err(CharacError::ManifestFinalized)
        } else {
            Ok(())
        }
    }

    /// Open a section for a sequence.
    pub fn begin_sequence(
        &mut self,
        sequence_id: u32,
        tag: &str,
        drive: DriveValue,
        planned_points: usize,
    ) -> CharacResult<()> {
        self.ensure_open()?;
        self.sequences.push(SequenceSummary {
            sequence_id,
            tag: tag.to_string(),
            drive,
            planned_points,
            points: Vec::new(),
        });
        Ok(())
    }

    /// Append a point outcome to its sequence's section.
    pub fn record_point(&mut self, result: &MeasurementResult) -> CharacResult<()> {
        self.ensure_open()?;
        let section = self
            .sequences
            .iter_mut()
            .rev()
            .find(|s| s.sequence_id == result.sequence_id)
            .ok_or_else(|| {
                CharacError::InvalidSequence(format!(
                    "sequence {} was never started in this run",
                    result.sequence_id
                ))
            })?;
        section.points.push(PointSummary {
            index: result.point.index,
            absolute: result.point.absolute,
            status: result.status,
            attempts: result.attempts,
            last_error: result.last_error.clone(),
        });
        Ok(())
    }

    /// Set the terminal status. Allowed once.
    pub fn finalize(&mut self, status: RunStatus, reason: Option<String>) -> CharacResult<()> {
        self.ensure_open()?;
        if status == RunStatus::InProgress {
            return Err(CharacError::Configuration(
                "a manifest cannot be finalized as in progress".to_string(),
            ));
        }
        self.status = status;
        self.abort_reason = reason;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Section for `sequence_id`.
    pub fn sequence(&self, sequence_id: u32) -> Option<&SequenceSummary> {
        self.sequences.iter().find(|s| s.sequence_id == sequence_id)
    }

    /// Points with `status` across all sequences.
    pub fn count(&self, status: PointStatus) -> usize {
        self.sequences.iter().map(|s| s.count(status)).sum()
    }

    /// Points recorded across all sequences.
    pub fn point_count(&self) -> usize {
        self.sequences.iter().map(|s| s.points.len()).sum()
    }
}
