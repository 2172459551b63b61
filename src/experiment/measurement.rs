//! Per-point measurement state machine.
//!
//! Each grid point is driven through an explicit transition table:
//!
//! ```text
//! Idle → Moving → Settling → Arming → Triggering → Capturing → Validating → Stored
//!          ↑                                                      │
//!          └──────────────── Retrying ←── (transient fault) ──────┤
//!                                                                 ├→ Skipped (budget exhausted)
//!                                                                 └→ Fatal   (fault, or critical point exhausted)
//! ```
//!
//! Any step may raise a fault. Transient faults (timeouts and failed waveform
//! validation) send the point to `Retrying`, which re-issues the whole point
//! from `Moving` while the retry budget lasts. A fresh machine, with a fresh
//! counter, is created for every point.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AcquisitionSettings, ValidationSettings};
use crate::error::{FaultKind, HardwareError};
use crate::experiment::grid::TargetPoint;
use crate::experiment::protocol::DriveParameters;
use crate::hardware::{expected_sample_count, HardwareCoordinator, Waveform};

/// Acquisition parameters shared by every point of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Digitizer sampling rate [Hz].
    pub sample_rate_hz: f64,
    /// Record length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Samples a complete record holds.
    pub expected_samples: usize,
    /// Limit for one capture.
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// Part of each record reduced to a phasor.
    pub processing: ProcessingWindow,
}

/// Slice of a record fed to phasor extraction.
///
/// With time-of-flight adjustment the window start moves by `column_shift_s`
/// for each column, keeping a fixed length in samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessingWindow {
    /// Start at column 0, from record start.
    #[serde(with = "humantime_serde")]
    pub begin: Duration,
    /// Window length.
    pub samples: usize,
    /// Start delay added per column [s]; negative moves the window earlier.
    pub column_shift_s: f64,
}

impl AcquisitionPlan {
    /// Derive the plan for a sequence.
    ///
    /// The capture timeout covers the emission itself, the record window scaled by
    /// the sampling multiplier (transfer time grows with record size), and a fixed grace.
    /// `column_step_mm` is the grid's column spacing, used for time-of-flight shifts.
    pub fn for_sequence(
        settings: &AcquisitionSettings,
        drive: &DriveParameters,
        column_step_mm: Option<f64>,
    ) -> Self {
        let sample_rate_hz = settings.sampling_freq_multiplier * drive.operating_frequency_hz;
        let window = settings.acquisition_time;
        let transfer_ns = window.as_nanos() as f64 * settings.sampling_freq_multiplier.max(1.0);
        let transfer = Duration::from_nanos(transfer_ns.round() as u64);
        let expected_samples = expected_sample_count(sample_rate_hz, window);

        let begin_sample = expected_sample_count(sample_rate_hz, settings.processing_begin);
        let end_sample = settings
            .processing_end
            .map_or(expected_samples, |end| expected_sample_count(sample_rate_hz, end))
            .min(expected_samples);
        let column_shift_s = match column_step_mm {
            Some(step) if settings.speed_of_sound_m_s > 0.0 => {
                f64::from(settings.tof_adjust) * step.abs() * 1e-3 / settings.speed_of_sound_m_s
            }
            _ => 0.0,
        };

        Self {
            sample_rate_hz,
            window,
            expected_samples,
            capture_timeout: settings
                .capture_grace
                .saturating_add(drive.pulse_train_duration)
                .saturating_add(transfer),
            processing: ProcessingWindow {
                begin: settings.processing_begin,
                samples: end_sample.saturating_sub(begin_sample),
                column_shift_s,
            },
        }
    }

    /// Sample range processed for a point in `column`.
    ///
    /// A start shifted before the record is clamped to sample 0. The range may
    /// run past the record end; extraction stops at the last sample.
    pub fn processing_range(&self, column: usize) -> Range<usize> {
        let begin_s =
            self.processing.begin.as_secs_f64() + self.processing.column_shift_s * column as f64;
        let start = (begin_s * self.sample_rate_hz + 1e-9).floor().max(0.0) as usize;
        start..start.saturating_add(self.processing.samples)
    }
}

/// Shape and saturation checks for captured records.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformValidator {
    settings: ValidationSettings,
}

impl WaveformValidator {
    /// Validator with the given thresholds.
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    /// Accept or reject `waveform`, returning the reason on rejection.
    pub fn check(&self, waveform: &Waveform, expected_samples: usize) -> Result<(), String> {
        if waveform.len() != expected_samples {
            return Err(format!(
                "record holds {} samples, expected {}",
                waveform.len(),
                expected_samples
            ));
        }
        if waveform.samples.iter().any(|s| !s.is_finite()) {
            return Err("record contains non-finite samples".to_string());
        }
        if waveform
            .samples
            .iter()
            .all(|s| s.abs() <= self.settings.zero_threshold_v)
        {
            return Err("record is all zero".to_string());
        }
        let clipped = waveform
            .samples
            .iter()
            .filter(|s| s.abs() >= self.settings.saturation_level_v)
            .count();
        let fraction = clipped as f64 / waveform.len() as f64;
        if fraction > self.settings.max_clipped_fraction {
            return Err(format!(
                "{:.1}% of samples at or above {} V",
                fraction * 100.0,
                self.settings.saturation_level_v
            ));
        }
        Ok(())
    }
}

/// Outcome of one grid point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointStatus {
    /// Stored on the first attempt.
    Success,
    /// Stored after at least one retry.
    Retried,
    /// Given up on; the run continues.
    Skipped,
    /// Unrecoverable; the run halts.
    Aborted,
}

impl fmt::Display for PointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PointStatus::Success => "success",
            PointStatus::Retried => "retried",
            PointStatus::Skipped => "skipped",
            PointStatus::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// Serializable record of the last fault seen at a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Fault classification.
    pub kind: FaultKind,
    /// Reporting device.
    pub device: String,
    /// Detail.
    pub message: String,
}

impl From<&HardwareError> for FaultRecord {
    fn from(value: &HardwareError) -> Self {
        Self {
            kind: value.kind,
            device: value.device.clone(),
            message: value.message.clone(),
        }
    }
}

/// Everything known about one measured point.
#[derive(Debug, Clone)]
pub struct MeasurementResult {
    /// Sequence the point belongs to.
    pub sequence_id: u32,
    /// The point.
    pub point: TargetPoint,
    /// Parameters in effect.
    pub drive: Arc<DriveParameters>,
    /// Outcome.
    pub status: PointStatus,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Most recent fault, if any.
    pub last_error: Option<FaultRecord>,
    /// Accepted record, present for Success and Retried.
    pub waveform: Option<Waveform>,
    /// When the accepted record was captured.
    pub captured_at: Option<DateTime<Utc>>,
}

impl MeasurementResult {
    /// A point that was not measured because the run was cancelled.
    pub fn cancelled(point: TargetPoint, drive: Arc<DriveParameters>) -> Self {
        Self {
            sequence_id: drive.sequence_id,
            point,
            drive,
            status: PointStatus::Skipped,
            attempts: 0,
            last_error: Some(FaultRecord {
                kind: FaultKind::Cancelled,
                device: "run".to_string(),
                message: "cancellation requested before the point started".to_string(),
            }),
            waveform: None,
            captured_at: None,
        }
    }
}

/// States of the per-point machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    /// Not started.
    Idle,
    /// Stage moving to the point.
    Moving,
    /// Waiting out mechanical vibration.
    Settling,
    /// Digitizer being armed.
    Arming,
    /// Driving system emitting.
    Triggering,
    /// Waiting for the record.
    Capturing,
    /// Checking the record.
    Validating,
    /// About to re-issue the point.
    Retrying,
    /// Record accepted.
    Stored,
    /// Point abandoned.
    Skipped,
    /// Run must halt.
    Fatal,
}

impl MeasurementState {
    /// Stored, Skipped and Fatal end a point.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MeasurementState::Stored | MeasurementState::Skipped | MeasurementState::Fatal
        )
    }
}

impl fmt::Display for MeasurementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives one [`TargetPoint`] through the measurement cycle.
pub struct MeasurementStateMachine<'a> {
    coordinator: &'a HardwareCoordinator,
    plan: &'a AcquisitionPlan,
    validator: &'a WaveformValidator,
    point: TargetPoint,
    drive: Arc<DriveParameters>,
    state: MeasurementState,
    retries: u32,
    last_error: Option<HardwareError>,
    waveform: Option<Waveform>,
    captured_at: Option<DateTime<Utc>>,
    history: Vec<MeasurementState>,
}

impl<'a> MeasurementStateMachine<'a> {
    /// Fresh machine in `Idle` for `point`.
    pub fn new(
        coordinator: &'a HardwareCoordinator,
        plan: &'a AcquisitionPlan,
        validator: &'a WaveformValidator,
        point: TargetPoint,
        drive: Arc<DriveParameters>,
    ) -> Self {
        Self {
            coordinator,
            plan,
            validator,
            point,
            drive,
            state: MeasurementState::Idle,
            retries: 0,
            last_error: None,
            waveform: None,
            captured_at: None,
            history: vec![MeasurementState::Idle],
        }
    }

    /// Current state.
    pub fn state(&self) -> MeasurementState {
        self.state
    }

    /// Every state visited so far, starting with `Idle`.
    pub fn history(&self) -> &[MeasurementState] {
        &self.history
    }

    /// Run to a terminal state and produce the point's result.
    pub async fn run(&mut self) -> MeasurementResult {
        while !self.state.is_terminal() {
            let next = self.step().await;
            debug!(
                point = %self.point.index,
                from = %self.state,
                to = %next,
                "Point transition"
            );
            self.state = next;
            self.history.push(next);
        }

        let status = match self.state {
            MeasurementState::Stored if self.retries == 0 => PointStatus::Success,
            MeasurementState::Stored => PointStatus::Retried,
            MeasurementState::Skipped => PointStatus::Skipped,
            _ => PointStatus::Aborted,
        };
        if status == PointStatus::Skipped {
            warn!(
                sequence_id = self.drive.sequence_id,
                point = %self.point.index,
                attempts = self.retries + 1,
                "Point skipped after exhausting retries"
            );
        }

        MeasurementResult {
            sequence_id: self.drive.sequence_id,
            point: self.point.clone(),
            drive: Arc::clone(&self.drive),
            status,
            attempts: self.retries + 1,
            last_error: self.last_error.as_ref().map(FaultRecord::from),
            waveform: self.waveform.take(),
            captured_at: self.captured_at,
        }
    }

    async fn step(&mut self) -> MeasurementState {
        let coordinator = self.coordinator;
        match self.state {
            MeasurementState::Idle => MeasurementState::Moving,
            MeasurementState::Moving => match coordinator.move_to(self.point.absolute).await {
                Ok(()) => MeasurementState::Settling,
                Err(e) => self.on_fault(e),
            },
            MeasurementState::Settling => {
                coordinator.settle().await;
                MeasurementState::Arming
            }
            MeasurementState::Arming => {
                match coordinator.arm(self.plan.sample_rate_hz, self.plan.window).await {
                    Ok(()) => MeasurementState::Triggering,
                    Err(e) => self.on_fault(e),
                }
            }
            MeasurementState::Triggering => match coordinator.fire().await {
                Ok(()) => MeasurementState::Capturing,
                Err(e) => self.on_fault(e),
            },
            MeasurementState::Capturing => match coordinator.capture(self.plan.capture_timeout).await {
                Ok(waveform) => {
                    self.captured_at = Some(Utc::now());
                    self.waveform = Some(waveform);
                    MeasurementState::Validating
                }
                Err(e) => self.on_fault(e),
            },
            MeasurementState::Validating => {
                let verdict = match &self.waveform {
                    Some(waveform) => self.validator.check(waveform, self.plan.expected_samples),
                    None => Err("no record captured".to_string()),
                };
                match verdict {
                    Ok(()) => MeasurementState::Stored,
                    Err(reason) => {
                        self.waveform = None;
                        self.captured_at = None;
                        let device = coordinator.equipment().digitizer;
                        self.on_fault(HardwareError::new(device, FaultKind::InvalidWaveform, reason))
                    }
                }
            }
            MeasurementState::Retrying => {
                self.retries += 1;
                coordinator.retry_policy().backoff().await;
                MeasurementState::Moving
            }
            terminal => terminal,
        }
    }

    fn on_fault(&mut self, error: HardwareError) -> MeasurementState {
        let policy = self.coordinator.retry_policy();
        let next = if !error.is_retryable() {
            MeasurementState::Fatal
        } else if policy.allows(&error, self.retries) {
            MeasurementState::Retrying
        } else if self.point.critical {
            MeasurementState::Fatal
        } else {
            MeasurementState::Skipped
        };
        warn!(
            point = %self.point.index,
            state = %self.state,
            fault = %error.kind,
            retries = self.retries,
            next = %next,
            "Point fault: {}",
            error.message
        );
        self.last_error = Some(error);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::RetryPolicy;
    use crate::experiment::grid::GridIndex;
    use crate::experiment::intensity::{DriveKind, DriveUnit, DriveValue};
    use crate::experiment::protocol::ModulationShape;
    use crate::hardware::mock::{MockDigitizer, MockDriver, MockPositioner};
    use crate::hardware::{CoordinatorSettings, Position3, Positioner};

    struct Rig {
        stage: Arc<MockPositioner>,
        driver: Arc<MockDriver>,
        digitizer: Arc<MockDigitizer>,
        coordinator: HardwareCoordinator,
    }

    fn rig(max_retries: u32) -> Rig {
        let stage = Arc::new(MockPositioner::new());
        let driver = Arc::new(MockDriver::new());
        let digitizer = Arc::new(MockDigitizer::new().with_trigger_line(driver.trigger_line()));
        let settings = CoordinatorSettings {
            settle_time: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                max_retries,
                backoff_delay: Duration::ZERO,
            },
            ..Default::default()
        };
        let coordinator =
            HardwareCoordinator::new(stage.clone(), driver.clone(), digitizer.clone(), settings);
        Rig {
            stage,
            driver,
            digitizer,
            coordinator,
        }
    }

    fn drive() -> Arc<DriveParameters> {
        Arc::new(DriveParameters {
            sequence_id: 1,
            modulation: ModulationShape::Square,
            ramp_duration: Duration::ZERO,
            ramp_step: None,
            pulse_duration: Duration::from_micros(20),
            pulse_repetition_frequency_hz: 1000.0,
            pulse_repetition_interval: Duration::from_millis(1),
            pulse_train_duration: Duration::from_millis(5),
            focus_depth_mm: 40.0,
            operating_frequency_hz: 500_000.0,
            requested_kind: DriveKind::Amplitude,
            requested_value: 20.0,
            drive: DriveValue {
                unit: DriveUnit::AmplitudePercent,
                value: 20.0,
            },
        })
    }

    fn point(critical: bool) -> TargetPoint {
        TargetPoint {
            index: GridIndex {
                slice: 0,
                row: 0,
                column: 0,
                flat: 0,
            },
            offset: Position3::default(),
            absolute: Position3::new(1.0, 2.0, 3.0),
            critical,
            measurement_number: 1,
            cluster_number: None,
            indices_number: None,
        }
    }

    fn plan() -> AcquisitionPlan {
        AcquisitionPlan::for_sequence(
            &AcquisitionSettings {
                acquisition_time: Duration::from_micros(100),
                ..Default::default()
            },
            &drive(),
            None,
        )
    }

    async fn configured(rig: &Rig) {
        rig.coordinator.configure(&drive()).await.unwrap();
    }

    #[tokio::test]
    async fn clean_point_visits_every_state_once() {
        let rig = rig(1);
        configured(&rig).await;
        let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

        let mut machine =
            MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(false), drive());
        let result = machine.run().await;

        assert_eq!(result.status, PointStatus::Success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.waveform.as_ref().map(Waveform::len), Some(plan.expected_samples));
        assert!(result.captured_at.is_some());
        assert_eq!(
            machine.history(),
            &[
                MeasurementState::Idle,
                MeasurementState::Moving,
                MeasurementState::Settling,
                MeasurementState::Arming,
                MeasurementState::Triggering,
                MeasurementState::Capturing,
                MeasurementState::Validating,
                MeasurementState::Stored,
            ]
        );
        assert_eq!(rig.stage.current_position().await.unwrap(), Position3::new(1.0, 2.0, 3.0));
    }

    #[tokio::test]
    async fn capture_timeouts_exhaust_budget_then_skip() {
        for budget in [0, 1, 3] {
            let rig = rig(budget);
            configured(&rig).await;
            rig.digitizer.faults().fail_always(FaultKind::CaptureTimeout).await;
            let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

            let mut machine =
                MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(false), drive());
            let result = machine.run().await;

            assert_eq!(result.status, PointStatus::Skipped, "budget {budget}");
            assert_eq!(rig.digitizer.capture_count().await, u64::from(budget) + 1);
            assert_eq!(result.attempts, budget + 1);
            assert_eq!(result.last_error.map(|e| e.kind), Some(FaultKind::CaptureTimeout));
            assert!(result.waveform.is_none());
        }
    }

    #[tokio::test]
    async fn critical_point_exhaustion_is_fatal() {
        let rig = rig(1);
        configured(&rig).await;
        rig.digitizer.faults().fail_always(FaultKind::CaptureTimeout).await;
        let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

        let mut machine =
            MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(true), drive());
        let result = machine.run().await;
        assert_eq!(result.status, PointStatus::Aborted);
        assert_eq!(machine.state(), MeasurementState::Fatal);
    }

    #[tokio::test]
    async fn drive_fault_is_not_retried() {
        let rig = rig(3);
        configured(&rig).await;
        rig.driver.faults().fail_on_calls([1], FaultKind::DriveFault).await;
        let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

        let mut machine =
            MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(false), drive());
        let result = machine.run().await;
        assert_eq!(result.status, PointStatus::Aborted);
        assert_eq!(result.attempts, 1);
        assert_eq!(rig.digitizer.capture_count().await, 0);
        assert!(!machine.history().contains(&MeasurementState::Retrying));
    }

    #[tokio::test]
    async fn missing_trigger_is_fatal() {
        let rig = rig(3);
        configured(&rig).await;
        rig.digitizer.faults().fail_on_calls([1], FaultKind::NoTrigger).await;
        let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

        let mut machine =
            MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(false), drive());
        let result = machine.run().await;
        assert_eq!(result.status, PointStatus::Aborted);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.last_error.map(|e| e.kind), Some(FaultKind::NoTrigger));
        assert_eq!(rig.driver.fire_count(), 1);
    }

    #[tokio::test]
    async fn invalid_record_is_retried_and_then_stored() {
        let rig = rig(1);
        configured(&rig).await;
        rig.digitizer.truncation().fail_on_calls([1], FaultKind::InvalidWaveform).await;
        let (plan, validator) = (plan(), WaveformValidator::new(ValidationSettings::default()));

        let mut machine =
            MeasurementStateMachine::new(&rig.coordinator, &plan, &validator, point(false), drive());
        let result = machine.run().await;
        assert_eq!(result.status, PointStatus::Retried);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.last_error.map(|e| e.kind), Some(FaultKind::InvalidWaveform));
        assert_eq!(rig.stage.move_count().await, 2);
    }

    #[test]
    fn validator_rejects_flat_and_clipped_records() {
        let validator = WaveformValidator::new(ValidationSettings::default());
        let flat = Waveform::from_rate(vec![0.0; 100], 1e6);
        assert!(validator.check(&flat, 100).is_err());

        let clipped = Waveform::from_rate(vec![0.6; 100], 1e6);
        assert!(validator.check(&clipped, 100).is_err());

        let short = Waveform::from_rate(vec![0.1; 50], 1e6);
        assert!(validator.check(&short, 100).is_err());

        let good = Waveform::from_rate(vec![0.1; 100], 1e6);
        assert!(validator.check(&good, 100).is_ok());
    }

    #[test]
    fn plan_derives_rate_count_and_timeout() {
        let settings = AcquisitionSettings::default();
        let plan = AcquisitionPlan::for_sequence(&settings, &drive(), None);
        assert_eq!(plan.sample_rate_hz, 25_000_000.0);
        assert_eq!(plan.expected_samples, 12_500);
        // 500 ms grace + 5 ms train + 500 µs × 50
        assert_eq!(plan.capture_timeout, Duration::from_millis(530));
        assert_eq!(plan.processing.samples, 12_500);
        assert_eq!(plan.processing_range(7), 0..12_500);
    }

    #[test]
    fn processing_window_shifts_by_column_time_of_flight() {
        let settings = AcquisitionSettings {
            processing_begin: Duration::from_micros(100),
            processing_end: Some(Duration::from_micros(300)),
            tof_adjust: 1,
            ..Default::default()
        };
        // 1.5 mm columns at 1500 m/s: 1 µs, i.e. 25 samples at 25 MHz
        let plan = AcquisitionPlan::for_sequence(&settings, &drive(), Some(1.5));
        assert_eq!(plan.processing.samples, 5_000);
        assert_eq!(plan.processing_range(0), 2_500..7_500);
        assert_eq!(plan.processing_range(4), 2_600..7_600);

        let earlier = AcquisitionPlan::for_sequence(
            &AcquisitionSettings { tof_adjust: -1, ..settings.clone() },
            &drive(),
            Some(1.5),
        );
        assert_eq!(earlier.processing_range(4), 2_400..7_400);
        // clamped at record start
        assert_eq!(earlier.processing_range(200), 0..5_000);

        let unshifted = AcquisitionPlan::for_sequence(&settings, &drive(), None);
        assert_eq!(unshifted.processing_range(4), 2_500..7_500);
    }

    #[test]
    fn oversized_timeouts_saturate() {
        let mut long = (*drive()).clone();
        long.pulse_train_duration = Duration::MAX;
        let plan = AcquisitionPlan::for_sequence(&AcquisitionSettings::default(), &long, None);
        assert_eq!(plan.capture_timeout, Duration::MAX);
    }
}
