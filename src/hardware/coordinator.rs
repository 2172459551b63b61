//! Single point of contact between the pipeline and the rig.
//!
//! The coordinator owns the three capability objects for the duration of a run
//! and wraps every call in a per-call timeout. Timeouts are mapped onto the
//! fault taxonomy so the measurement state machine can classify them:
//! a stage that does not arrive is a `PositionTimeout`, a digitizer that does
//! not deliver is a `CaptureTimeout`, a driving system that does not finish an
//! emission is a `DriveFault`.
//!
//! Motion is only acknowledged once the stage reports it has stopped within
//! tolerance of the target. A stage that stays stopped elsewhere is a
//! `PositionFault`. The stage is never commanded while an emission is in
//! progress.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{FaultKind, HardwareError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::protocol::DriveParameters;
use crate::hardware::capabilities::{Digitizer, Driver, HwResult, Positioner};
use crate::hardware::{Position3, Waveform};

/// Consecutive idle polls off target before a move is reported as a fault.
const STOPPED_OFF_TARGET_POLLS: u32 = 3;

/// Timeouts and readiness settings applied to every hardware call.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    /// Connect/disconnect limit per subsystem.
    pub connect_timeout: Duration,
    /// Limit for a move, from command to position-reached.
    pub move_timeout: Duration,
    /// Limit for loading a waveform description.
    pub configure_timeout: Duration,
    /// Limit for one emission on top of the programmed train duration.
    pub fire_timeout: Duration,
    /// Limit for arming the digitizer.
    pub arm_timeout: Duration,
    /// Distance from target at which a stopped stage counts as arrived.
    pub position_tolerance_mm: f64,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Minimum pause after motion before acquisition is armed.
    pub settle_time: Duration,
    /// Point-level retry budget.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            move_timeout: Duration::from_secs(30),
            configure_timeout: Duration::from_secs(5),
            fire_timeout: Duration::from_secs(2),
            arm_timeout: Duration::from_secs(2),
            position_tolerance_mm: 0.01,
            poll_interval: Duration::from_millis(20),
            settle_time: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

/// Identifiers of the connected equipment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentIds {
    /// Positioning stage.
    pub positioner: String,
    /// Driving system.
    pub driver: String,
    /// Digitizer.
    pub digitizer: String,
}

/// Façade over the rig's positioner, driver and digitizer.
pub struct HardwareCoordinator {
    positioner: Arc<dyn Positioner>,
    driver: Arc<dyn Driver>,
    digitizer: Arc<dyn Digitizer>,
    settings: CoordinatorSettings,
    emitting: AtomicBool,
    train_duration: Mutex<Duration>,
}

impl HardwareCoordinator {
    /// Take ownership of the three subsystems.
    pub fn new(
        positioner: Arc<dyn Positioner>,
        driver: Arc<dyn Driver>,
        digitizer: Arc<dyn Digitizer>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            positioner,
            driver,
            digitizer,
            settings,
            emitting: AtomicBool::new(false),
            train_duration: Mutex::new(Duration::ZERO),
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Point-level retry budget.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    /// Identifiers for the run manifest.
    pub fn equipment(&self) -> EquipmentIds {
        EquipmentIds {
            positioner: self.positioner.id().to_string(),
            driver: self.driver.id().to_string(),
            digitizer: self.digitizer.id().to_string(),
        }
    }

    /// True between the start of `fire` and its acknowledgement.
    pub fn is_emitting(&self) -> bool {
        self.emitting.load(Ordering::SeqCst)
    }

    /// Connect all subsystems, driving system first so its output can be forced off.
    pub async fn connect_all(&self) -> HwResult<()> {
        let limit = self.settings.connect_timeout;
        bounded(self.driver.id(), FaultKind::Connection, limit, self.driver.connect()).await?;
        bounded(self.driver.id(), FaultKind::Connection, limit, self.driver.stop()).await?;
        bounded(self.positioner.id(), FaultKind::Connection, limit, self.positioner.connect()).await?;
        bounded(self.digitizer.id(), FaultKind::Connection, limit, self.digitizer.connect()).await?;
        info!(equipment = ?self.equipment(), "Rig connected");
        Ok(())
    }

    /// Stop emission and disconnect in reverse order.
    ///
    /// Every subsystem is attempted; the first failure is returned.
    pub async fn disconnect_all(&self) -> HwResult<()> {
        let limit = self.settings.connect_timeout;
        let results = [
            self.stop_driver().await,
            bounded(self.digitizer.id(), FaultKind::Connection, limit, self.digitizer.disconnect()).await,
            bounded(self.positioner.id(), FaultKind::Connection, limit, self.positioner.disconnect()).await,
            bounded(self.driver.id(), FaultKind::Connection, limit, self.driver.disconnect()).await,
        ];
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Disconnect step failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Move to `target` and wait until the stage reports it has arrived.
    pub async fn move_to(&self, target: Position3) -> HwResult<()> {
        if self.is_emitting() {
            return Err(HardwareError::new(
                self.positioner.id(),
                FaultKind::PositionFault,
                "motion refused while the driving system is emitting",
            ));
        }

        debug!(%target, "Moving");
        let motion = async {
            self.positioner.move_to(target).await?;
            self.wait_until_reached(target).await
        };
        match timeout(self.settings.move_timeout, motion).await {
            Ok(result) => result,
            Err(_) => Err(HardwareError::new(
                self.positioner.id(),
                FaultKind::PositionTimeout,
                format!(
                    "target {} not reached within {:?}",
                    target, self.settings.move_timeout
                ),
            )),
        }
    }

    async fn wait_until_reached(&self, target: Position3) -> HwResult<()> {
        let mut stopped_off_target = 0;
        loop {
            if self.positioner.is_moving().await? {
                stopped_off_target = 0;
            } else {
                let position = self.positioner.current_position().await?;
                if position.distance_to(&target) <= self.settings.position_tolerance_mm {
                    return Ok(());
                }
                stopped_off_target += 1;
                if stopped_off_target >= STOPPED_OFF_TARGET_POLLS {
                    return Err(HardwareError::new(
                        self.positioner.id(),
                        FaultKind::PositionFault,
                        format!(
                            "stage stopped at {} short of target {} ({:.3} mm away)",
                            position,
                            target,
                            position.distance_to(&target)
                        ),
                    ));
                }
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Wait the configured settle interval. Issues no hardware call.
    pub async fn settle(&self) {
        if !self.settings.settle_time.is_zero() {
            sleep(self.settings.settle_time).await;
        }
    }

    /// Load a sequence's waveform description into the driving system.
    pub async fn configure(&self, parameters: &DriveParameters) -> HwResult<()> {
        bounded(
            self.driver.id(),
            FaultKind::DriveFault,
            self.settings.configure_timeout,
            self.driver.configure(parameters),
        )
        .await?;
        *self.train_duration.lock().await = parameters.pulse_train_duration;
        info!(
            sequence_id = parameters.sequence_id,
            drive = %parameters.drive,
            "Driving system configured"
        );
        Ok(())
    }

    /// Arm the digitizer for one record.
    pub async fn arm(&self, sample_rate_hz: f64, window: Duration) -> HwResult<()> {
        bounded(
            self.digitizer.id(),
            FaultKind::CaptureTimeout,
            self.settings.arm_timeout,
            self.digitizer.arm(sample_rate_hz, window),
        )
        .await
    }

    /// Emit one pulse train.
    ///
    /// A failed or overdue emission forces the output off before the
    /// `DriveFault` is returned.
    pub async fn fire(&self) -> HwResult<()> {
        let limit = self
            .settings
            .fire_timeout
            .saturating_add(*self.train_duration.lock().await);
        self.emitting.store(true, Ordering::SeqCst);
        let result = bounded(self.driver.id(), FaultKind::DriveFault, limit, self.driver.fire()).await;
        match result {
            Ok(()) => {
                self.emitting.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = self.stop_driver().await {
                    warn!(error = %stop_err, "Failed to force driving system off");
                }
                Err(HardwareError {
                    kind: FaultKind::DriveFault,
                    ..e
                })
            }
        }
    }

    /// Collect the armed record.
    pub async fn capture(&self, limit: Duration) -> HwResult<Waveform> {
        bounded(
            self.digitizer.id(),
            FaultKind::CaptureTimeout,
            limit,
            self.digitizer.capture(limit),
        )
        .await
    }

    /// Force the driving system output off.
    pub async fn stop_driver(&self) -> HwResult<()> {
        let result = bounded(
            self.driver.id(),
            FaultKind::DriveFault,
            self.settings.configure_timeout,
            self.driver.stop(),
        )
        .await;
        self.emitting.store(false, Ordering::SeqCst);
        result
    }
}

/// Run `call` under `limit`, mapping an elapsed timer onto `on_timeout`.
async fn bounded<T, F>(device: &str, on_timeout: FaultKind, limit: Duration, call: F) -> HwResult<T>
where
    F: Future<Output = HwResult<T>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(HardwareError::new(
            device,
            on_timeout,
            format!("no response within {:?}", limit),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockDigitizer, MockDriver, MockPositioner};

    fn fast_settings() -> CoordinatorSettings {
        CoordinatorSettings {
            move_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(1),
            settle_time: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn move_waits_for_stage_to_arrive() {
        let stage = Arc::new(MockPositioner::new().with_motion_time(Duration::from_millis(30)));
        let coordinator = HardwareCoordinator::new(
            stage.clone(),
            Arc::new(MockDriver::new()),
            Arc::new(MockDigitizer::new()),
            fast_settings(),
        );

        let target = Position3::new(1.0, -2.0, 3.0);
        coordinator.move_to(target).await.unwrap();
        assert_eq!(stage.current_position().await.unwrap(), target);
        assert!(!stage.is_moving().await.unwrap());
    }

    #[tokio::test]
    async fn stalled_stage_maps_to_position_timeout() {
        let stage = Arc::new(MockPositioner::new().with_motion_time(Duration::from_secs(5)));
        let coordinator = HardwareCoordinator::new(
            stage,
            Arc::new(MockDriver::new()),
            Arc::new(MockDigitizer::new()),
            fast_settings(),
        );

        let err = coordinator.move_to(Position3::new(5.0, 0.0, 0.0)).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::PositionTimeout);
    }

    /// Accepts every move but never leaves its parking position.
    struct StuckStage;

    #[async_trait::async_trait]
    impl Positioner for StuckStage {
        fn id(&self) -> &str {
            "stuck-stage"
        }

        async fn move_to(&self, _target: Position3) -> HwResult<()> {
            Ok(())
        }

        async fn current_position(&self) -> HwResult<Position3> {
            Ok(Position3::new(0.5, 0.0, 0.0))
        }

        async fn is_moving(&self) -> HwResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn stage_stopped_off_target_is_a_position_fault() {
        let coordinator = HardwareCoordinator::new(
            Arc::new(StuckStage),
            Arc::new(MockDriver::new()),
            Arc::new(MockDigitizer::new()),
            CoordinatorSettings {
                move_timeout: Duration::from_secs(30),
                ..fast_settings()
            },
        );

        let started = std::time::Instant::now();
        let err = coordinator.move_to(Position3::new(5.0, 0.0, 0.0)).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::PositionFault);
        assert!(!err.kind.is_retryable());
        assert!(err.message.contains("short of target"), "{}", err.message);
        assert!(started.elapsed() < Duration::from_secs(5));

        // within tolerance of where it stopped is fine
        coordinator.move_to(Position3::new(0.5, 0.0, 0.0)).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_train_duration_does_not_overflow_fire_limit() {
        use crate::experiment::grid::{ExplicitCoordinate, GridSpecification};
        use crate::experiment::protocol::tests::sequence;

        let coordinator = HardwareCoordinator::new(
            Arc::new(MockPositioner::new()),
            Arc::new(MockDriver::new()),
            Arc::new(MockDigitizer::new()),
            fast_settings(),
        );
        let seq = sequence(
            1,
            GridSpecification::ExplicitCoordinates { points: vec![ExplicitCoordinate::at(0.0, 0.0, 0.0)] },
        );
        let mut drive = DriveParameters::resolve(&seq, 500e3, None).unwrap();
        drive.pulse_train_duration = Duration::MAX;
        coordinator.configure(&drive).await.unwrap();
        coordinator.fire().await.unwrap();
    }

    #[tokio::test]
    async fn failed_fire_forces_output_off() {
        let driver = Arc::new(MockDriver::new());
        driver.faults().fail_on_calls([1], FaultKind::DriveFault).await;
        let coordinator = HardwareCoordinator::new(
            Arc::new(MockPositioner::new()),
            driver.clone(),
            Arc::new(MockDigitizer::new()),
            fast_settings(),
        );

        let err = coordinator.fire().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::DriveFault);
        assert!(!coordinator.is_emitting());
        assert_eq!(driver.stop_count(), 1);
    }

    #[tokio::test]
    async fn equipment_ids_come_from_devices() {
        let coordinator = HardwareCoordinator::new(
            Arc::new(MockPositioner::new()),
            Arc::new(MockDriver::new()),
            Arc::new(MockDigitizer::new()),
            fast_settings(),
        );
        let ids = coordinator.equipment();
        assert_eq!(ids.positioner, "mock-positioner");
        assert_eq!(ids.driver, "mock-driver");
        assert_eq!(ids.digitizer, "mock-digitizer");
    }
}
