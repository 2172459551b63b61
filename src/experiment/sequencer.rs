//! Protocol execution.
//!
//! [`ProtocolSequencer::run`] is the top-level driver of a characterization run:
//!
//! 1. Every sequence is validated and resolved (drive value and grid) before
//!    anything is written or any hardware is touched. Input errors abort here.
//! 2. The run directory and an `InProgress` manifest are created, and the rig
//!    is connected.
//! 3. Sequences execute in ascending id order. The driving system is
//!    configured once per sequence, then each grid point runs through its own
//!    [`MeasurementStateMachine`]. A fatal point halts the run.
//! 4. In interactive mode the run pauses between sequences until a
//!    [`ConfirmationSource`] answers or cancellation is requested.
//! 5. The rig is disconnected and the manifest finalized, whatever happened.
//!
//! Cancellation is cooperative: the [`CancellationFlag`] is checked before each
//! sequence and each point, never inside an in-flight hardware call. The point
//! that would have run next is recorded as skipped, even when it belongs to a
//! sequence that was never configured.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{
    AcquisitionSettings, EnvironmentConditions, EquipmentConfig, RigConfig, StorageConfig,
    ValidationSettings,
};
use crate::data::manifest::{RunManifest, RunStatus};
use crate::data::storage::ResultStore;
use crate::error::{CharacError, CharacResult};
use crate::experiment::grid::{GridDimensions, GridGenerator, TargetPoint};
use crate::experiment::intensity::ConversionTable;
use crate::experiment::measurement::{
    AcquisitionPlan, MeasurementResult, MeasurementStateMachine, PointStatus, WaveformValidator,
};
use crate::experiment::protocol::{DriveParameters, Sequence};
use crate::hardware::{HardwareCoordinator, Position3};

// =============================================================================
// Cancellation and confirmation
// =============================================================================

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Run-level cancellation request, shareable across tasks.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<CancelState>,
}

impl CancellationFlag {
    /// Unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next checkpoint.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Operator answer at an inter-sequence pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Proceed with the next sequence.
    Continue,
    /// Stop the run.
    Cancel,
}

/// Source of operator confirmations for interactive runs.
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    /// Called after sequence `completed` finished and before `next` starts.
    async fn confirm(&self, completed: u32, next: u32) -> Confirmation;
}

/// Always continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

#[async_trait]
impl ConfirmationSource for AutoConfirm {
    async fn confirm(&self, _completed: u32, _next: u32) -> Confirmation {
        Confirmation::Continue
    }
}

/// Confirmations delivered over a channel, e.g. from a UI task.
///
/// A closed channel counts as `Cancel`.
pub struct ChannelConfirmation {
    rx: Mutex<mpsc::Receiver<Confirmation>>,
}

impl ChannelConfirmation {
    /// Create the source and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Confirmation>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl ConfirmationSource for ChannelConfirmation {
    async fn confirm(&self, _completed: u32, _next: u32) -> Confirmation {
        self.rx.lock().await.recv().await.unwrap_or(Confirmation::Cancel)
    }
}

// =============================================================================
// Preparation
// =============================================================================

/// A sequence with everything resolved for execution.
#[derive(Debug, Clone)]
pub struct PreparedSequence {
    /// The sequence as specified.
    pub sequence: Sequence,
    /// Parameters loaded into the driving system.
    pub drive: Arc<DriveParameters>,
    /// Digitizer settings.
    pub plan: AcquisitionPlan,
    /// Points in visit order.
    pub points: Vec<TargetPoint>,
    /// Extent of the stored amplitude/phase map.
    pub layout: GridDimensions,
}

/// Validate and resolve a protocol without touching hardware.
///
/// Sequences are returned in ascending id order.
pub fn prepare_sequences(
    sequences: &[Sequence],
    zero: Position3,
    table: Option<&ConversionTable>,
    acquisition: &AcquisitionSettings,
) -> CharacResult<Vec<PreparedSequence>> {
    if sequences.is_empty() {
        return Err(CharacError::InvalidSequence(
            "protocol contains no sequences".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for sequence in sequences {
        if !seen.insert(sequence.id) {
            return Err(CharacError::InvalidSequence(format!(
                "sequence number {} appears more than once",
                sequence.id
            )));
        }
    }

    let mut ordered: Vec<&Sequence> = sequences.iter().collect();
    ordered.sort_by_key(|s| s.id);

    ordered
        .into_iter()
        .map(|sequence| {
            sequence.validate()?;
            let drive = DriveParameters::resolve(sequence, acquisition.operating_frequency_hz(), table)?;
            let mut points = GridGenerator::resolve(&sequence.grid, zero)?;
            for &index in &sequence.critical_points {
                let count = points.len();
                let point = points.get_mut(index).ok_or_else(|| {
                    CharacError::InvalidSequence(format!(
                        "sequence {}: critical point {} is outside the grid of {} points",
                        sequence.id, index, count
                    ))
                })?;
                point.critical = true;
            }
            let layout = GridGenerator::layout(&sequence.grid, &points)?;
            let plan = AcquisitionPlan::for_sequence(acquisition, &drive, sequence.grid.column_step_mm());
            Ok(PreparedSequence {
                sequence: sequence.clone(),
                drive: Arc::new(drive),
                plan,
                points,
                layout,
            })
        })
        .collect()
}

// =============================================================================
// Sequencer
// =============================================================================

/// Descriptive run metadata carried into the manifest.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    /// Transducer, hydrophone and driving system details.
    pub equipment: EquipmentConfig,
    /// Water conditions.
    pub environment: EnvironmentConditions,
    /// Protocol file path.
    pub protocol_source: Option<PathBuf>,
}

enum RunOutcome {
    Finished,
    Aborted(String),
    Cancelled,
}

/// Executes protocols against a [`HardwareCoordinator`].
pub struct ProtocolSequencer {
    coordinator: HardwareCoordinator,
    acquisition: AcquisitionSettings,
    validator: WaveformValidator,
    storage: StorageConfig,
    metadata: RunMetadata,
    confirmation: Box<dyn ConfirmationSource>,
    cancel: CancellationFlag,
}

impl ProtocolSequencer {
    /// Sequencer that auto-confirms and is not yet cancellable from outside.
    pub fn new(
        coordinator: HardwareCoordinator,
        acquisition: AcquisitionSettings,
        validation: ValidationSettings,
        storage: StorageConfig,
    ) -> Self {
        Self {
            coordinator,
            acquisition,
            validator: WaveformValidator::new(validation),
            storage,
            metadata: RunMetadata::default(),
            confirmation: Box::new(AutoConfirm),
            cancel: CancellationFlag::new(),
        }
    }

    /// Sequencer using the sections of a loaded configuration.
    pub fn from_config(coordinator: HardwareCoordinator, config: &RigConfig) -> Self {
        Self::new(
            coordinator,
            config.acquisition.clone(),
            config.validation.clone(),
            config.storage.clone(),
        )
        .with_metadata(RunMetadata {
            equipment: config.equipment.clone(),
            environment: config.environment.clone(),
            protocol_source: None,
        })
    }

    /// Use `source` at inter-sequence pauses.
    pub fn with_confirmation(mut self, source: Box<dyn ConfirmationSource>) -> Self {
        self.confirmation = source;
        self
    }

    /// Observe `flag` for cancellation.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Replace the manifest metadata.
    pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record `path` as the protocol source.
    pub fn with_protocol_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata.protocol_source = Some(path.into());
        self
    }

    /// Handle for requesting cancellation.
    pub fn cancellation_flag(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// The rig.
    pub fn coordinator(&self) -> &HardwareCoordinator {
        &self.coordinator
    }

    /// Execute `sequences` and return the finalized manifest.
    ///
    /// Input errors are returned before the run directory exists. Hardware
    /// failures do not produce an `Err`: they end the run with status
    /// `Aborted` and are described in the manifest. Storage errors finalize
    /// the manifest as `Aborted` and are then returned.
    pub async fn run(
        &self,
        sequences: &[Sequence],
        zero: Position3,
        table: Option<&ConversionTable>,
        interactive: bool,
    ) -> CharacResult<RunManifest> {
        let prepared = prepare_sequences(sequences, zero, table, &self.acquisition)?;
        let planned: usize = prepared.iter().map(|s| s.points.len()).sum();

        let mut store = ResultStore::create(&self.storage)?;
        let mut manifest = RunManifest::new(
            store.run_dir().to_path_buf(),
            zero,
            self.coordinator.equipment(),
            interactive,
        );
        manifest.equipment_details = self.metadata.equipment.clone();
        manifest.environment = self.metadata.environment.clone();
        manifest.protocol_source = self.metadata.protocol_source.clone();
        store.write_manifest(&manifest)?;

        info!(
            run_id = %manifest.run_id,
            sequences = prepared.len(),
            points = planned,
            interactive,
            %zero,
            "Run started"
        );

        let outcome = match self.coordinator.connect_all().await {
            Ok(()) => {
                self.execute(&prepared, &mut store, &mut manifest, interactive)
                    .await
            }
            Err(e) => {
                error!(error = %e, "Rig connection failed");
                Ok(RunOutcome::Aborted(format!("connection failed: {}", e)))
            }
        };
        if let Err(e) = self.coordinator.disconnect_all().await {
            warn!(error = %e, "Rig did not disconnect cleanly");
        }

        let (status, reason, failure) = match outcome {
            Ok(RunOutcome::Finished) if manifest.count(PointStatus::Skipped) > 0 => {
                (RunStatus::CompletedWithSkips, None, None)
            }
            Ok(RunOutcome::Finished) => (RunStatus::Completed, None, None),
            Ok(RunOutcome::Aborted(reason)) => (RunStatus::Aborted, Some(reason), None),
            Ok(RunOutcome::Cancelled) => (
                RunStatus::Cancelled,
                Some("cancellation requested".to_string()),
                None,
            ),
            Err(e) => (RunStatus::Aborted, Some(e.to_string()), Some(e)),
        };
        store.finalize(&mut manifest, status, reason)?;
        if let Some(e) = failure {
            return Err(e);
        }

        info!(
            status = %manifest.status,
            stored = manifest.count(PointStatus::Success) + manifest.count(PointStatus::Retried),
            skipped = manifest.count(PointStatus::Skipped),
            "Run finished"
        );
        Ok(manifest)
    }

    async fn execute(
        &self,
        prepared: &[PreparedSequence],
        store: &mut ResultStore,
        manifest: &mut RunManifest,
        interactive: bool,
    ) -> CharacResult<RunOutcome> {
        for (position, sequence) in prepared.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(sequence_id = sequence.sequence.id, "Cancelled before sequence");
                return self.cancel_before_sequence(sequence, store, manifest).await;
            }

            let span = info_span!("sequence", sequence_id = sequence.sequence.id);
            match self
                .execute_sequence(sequence, store, manifest)
                .instrument(span)
                .await?
            {
                RunOutcome::Finished => {}
                stopped => return Ok(stopped),
            }

            let next = match prepared.get(position + 1) {
                Some(next) if interactive => next,
                _ => continue,
            };
            info!(
                completed = sequence.sequence.id,
                next = next.sequence.id,
                "Waiting for operator confirmation"
            );
            let answer = tokio::select! {
                answer = self.confirmation.confirm(sequence.sequence.id, next.sequence.id) => answer,
                _ = self.cancel.cancelled() => Confirmation::Cancel,
            };
            if answer == Confirmation::Cancel {
                info!(sequence_id = next.sequence.id, "Operator cancelled the run");
                return self.cancel_before_sequence(next, store, manifest).await;
            }
        }
        Ok(RunOutcome::Finished)
    }

    async fn execute_sequence(
        &self,
        prepared: &PreparedSequence,
        store: &mut ResultStore,
        manifest: &mut RunManifest,
    ) -> CharacResult<RunOutcome> {
        let id = prepared.sequence.id;
        if let Err(e) = self.coordinator.configure(&prepared.drive).await {
            error!(error = %e, "Driving system rejected the sequence");
            return Ok(RunOutcome::Aborted(format!(
                "sequence {}: configuration failed: {}",
                id, e
            )));
        }
        Self::open_sequence(prepared, store, manifest)?;
        info!(
            points = prepared.points.len(),
            sample_rate_hz = prepared.plan.sample_rate_hz,
            samples = prepared.plan.expected_samples,
            "Sequence started"
        );

        for point in &prepared.points {
            if self.cancel.is_cancelled() {
                return self.cancel_at(prepared, point, store, manifest).await;
            }

            let mut machine = MeasurementStateMachine::new(
                &self.coordinator,
                &prepared.plan,
                &self.validator,
                point.clone(),
                Arc::clone(&prepared.drive),
            );
            let result = machine.run().await;
            store.record(&result, manifest)?;

            if result.status == PointStatus::Aborted {
                self.force_output_off().await;
                let reason = match &result.last_error {
                    Some(fault) => format!(
                        "sequence {} point {}: {} from {}: {}",
                        id, point.index, fault.kind, fault.device, fault.message
                    ),
                    None => format!("sequence {} point {}: fatal fault", id, point.index),
                };
                error!(point = %point.index, "Run halted: {}", reason);
                return Ok(RunOutcome::Aborted(reason));
            }
        }

        store.end_sequence()?;
        if let Some(summary) = manifest.sequence(id) {
            info!(
                stored = summary.count(PointStatus::Success) + summary.count(PointStatus::Retried),
                retried = summary.count(PointStatus::Retried),
                skipped = summary.count(PointStatus::Skipped),
                "Sequence complete"
            );
        }
        Ok(RunOutcome::Finished)
    }

    fn open_sequence(
        prepared: &PreparedSequence,
        store: &mut ResultStore,
        manifest: &mut RunManifest,
    ) -> CharacResult<()> {
        let points = prepared.points.len();
        manifest.begin_sequence(prepared.sequence.id, &prepared.sequence.tag, prepared.drive.drive, points)?;
        store.begin_sequence(&prepared.sequence, &prepared.drive, &prepared.plan, prepared.layout, points)
    }

    /// Record the first point of a sequence that never started as cancelled.
    ///
    /// The driver is not configured for it.
    async fn cancel_before_sequence(
        &self,
        prepared: &PreparedSequence,
        store: &mut ResultStore,
        manifest: &mut RunManifest,
    ) -> CharacResult<RunOutcome> {
        Self::open_sequence(prepared, store, manifest)?;
        match prepared.points.first() {
            Some(point) => self.cancel_at(prepared, point, store, manifest).await,
            None => {
                self.force_output_off().await;
                Ok(RunOutcome::Cancelled)
            }
        }
    }

    async fn cancel_at(
        &self,
        prepared: &PreparedSequence,
        point: &TargetPoint,
        store: &mut ResultStore,
        manifest: &mut RunManifest,
    ) -> CharacResult<RunOutcome> {
        let result = MeasurementResult::cancelled(point.clone(), Arc::clone(&prepared.drive));
        store.record(&result, manifest)?;
        self.force_output_off().await;
        info!(
            sequence_id = prepared.sequence.id,
            point = %point.index,
            "Cancelled before point"
        );
        Ok(RunOutcome::Cancelled)
    }

    async fn force_output_off(&self) {
        if let Err(e) = self.coordinator.stop_driver().await {
            warn!(error = %e, "Failed to stop the driving system");
        }
    }
}
