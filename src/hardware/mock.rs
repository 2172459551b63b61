//! Mock Rig Implementations
//!
//! Simulated positioner, driving system and digitizer for tests and the
//! command-line simulator. All mocks use async-safe timing (tokio::time), never
//! std::thread::sleep.
//!
//! # Fault injection
//!
//! Each mock exposes one or more [`FaultInjector`]s. An injector counts calls
//! to the operation it guards and fails scripted call numbers (1-based) or
//! every call:
//!
//! ```rust,ignore
//! let stage = MockPositioner::new();
//! // 5th and 6th move time out
//! stage.faults().fail_on_calls([5, 6], FaultKind::PositionTimeout).await;
//! ```
//!
//! # Call log
//!
//! Mocks sharing a [`CallLog`] append every command they receive, so tests can
//! assert the order of operations across subsystems.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::error::{FaultKind, HardwareError};
use crate::experiment::protocol::DriveParameters;
use crate::hardware::capabilities::{Digitizer, Driver, HwResult, Positioner};
use crate::hardware::{expected_sample_count, Position3, Waveform};

// =============================================================================
// Shared helpers
// =============================================================================

/// A command observed by a mock device.
#[derive(Debug, Clone, PartialEq)]
pub enum RigCall {
    /// Positioner move command.
    Move(Position3),
    /// Driver configured for a sequence.
    Configure(u32),
    /// Driver emission.
    Fire,
    /// Driver output forced off.
    Stop,
    /// Digitizer armed.
    Arm,
    /// Digitizer record requested.
    Capture,
}

/// Shared, ordered record of commands across mocks.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RigCall>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, call: RigCall) {
        self.calls.lock().await.push(call);
    }

    /// Snapshot of all calls so far.
    pub async fn calls(&self) -> Vec<RigCall> {
        self.calls.lock().await.clone()
    }
}

#[derive(Debug, Default)]
struct FaultScript {
    calls: u64,
    on_calls: HashSet<u64>,
    kind: Option<FaultKind>,
    always: Option<FaultKind>,
}

/// Scripted failures for one operation of a mock device.
#[derive(Debug, Default)]
pub struct FaultInjector {
    script: Mutex<FaultScript>,
}

impl FaultInjector {
    /// Fail the given 1-based call numbers with `kind`.
    pub async fn fail_on_calls(&self, calls: impl IntoIterator<Item = u64>, kind: FaultKind) {
        let mut script = self.script.lock().await;
        script.on_calls.extend(calls);
        script.kind = Some(kind);
    }

    /// Fail every call with `kind`.
    pub async fn fail_always(&self, kind: FaultKind) {
        self.script.lock().await.always = Some(kind);
    }

    /// Remove all scripted failures.
    pub async fn clear(&self) {
        let mut script = self.script.lock().await;
        script.on_calls.clear();
        script.kind = None;
        script.always = None;
    }

    /// Number of calls observed.
    pub async fn calls(&self) -> u64 {
        self.script.lock().await.calls
    }

    /// Count a call and return the fault scheduled for it, if any.
    async fn next(&self) -> Option<FaultKind> {
        let mut script = self.script.lock().await;
        script.calls += 1;
        if let Some(kind) = script.always {
            return Some(kind);
        }
        if script.on_calls.contains(&script.calls) {
            return script.kind;
        }
        None
    }

    async fn check(&self, device: &str, operation: &str) -> HwResult<()> {
        match self.next().await {
            Some(kind) => Err(HardwareError::new(
                device,
                kind,
                format!("injected fault on {}", operation),
            )),
            None => Ok(()),
        }
    }
}

// =============================================================================
// MockPositioner
// =============================================================================

struct Motion {
    from: Position3,
    to: Position3,
    started: Instant,
}

/// Simulated 3-axis stage.
///
/// Every move takes a fixed `motion_time` (default: instantaneous). The stage
/// reports `is_moving` until that time has elapsed.
pub struct MockPositioner {
    id: String,
    motion: RwLock<Motion>,
    motion_time: Duration,
    faults: FaultInjector,
    log: Option<CallLog>,
}

impl MockPositioner {
    /// Stage at the origin with instantaneous motion.
    pub fn new() -> Self {
        Self {
            id: "mock-positioner".to_string(),
            motion: RwLock::new(Motion {
                from: Position3::default(),
                to: Position3::default(),
                started: Instant::now(),
            }),
            motion_time: Duration::ZERO,
            faults: FaultInjector::default(),
            log: None,
        }
    }

    /// Set the time every move takes.
    pub fn with_motion_time(mut self, motion_time: Duration) -> Self {
        self.motion_time = motion_time;
        self
    }

    /// Record commands into `log`.
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Faults injected on `move_to`.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of `move_to` calls.
    pub async fn move_count(&self) -> u64 {
        self.faults.calls().await
    }
}

impl Default for MockPositioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Positioner for MockPositioner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn move_to(&self, target: Position3) -> HwResult<()> {
        if let Some(log) = &self.log {
            log.push(RigCall::Move(target)).await;
        }
        self.faults.check(&self.id, "move_to").await?;

        let mut motion = self.motion.write().await;
        let from = if motion.started.elapsed() >= self.motion_time {
            motion.to
        } else {
            motion.from
        };
        *motion = Motion {
            from,
            to: target,
            started: Instant::now(),
        };
        trace!(%target, "MockPositioner: move accepted");
        Ok(())
    }

    async fn current_position(&self) -> HwResult<Position3> {
        let motion = self.motion.read().await;
        if motion.started.elapsed() >= self.motion_time {
            Ok(motion.to)
        } else {
            Ok(motion.from)
        }
    }

    async fn is_moving(&self) -> HwResult<bool> {
        Ok(self.motion.read().await.started.elapsed() < self.motion_time)
    }
}

// =============================================================================
// MockDriver
// =============================================================================

/// Simulated driving system.
///
/// Emission takes `emission_time` (default: instantaneous). Each successful
/// fire increments a trigger line that a [`MockDigitizer`] can watch.
pub struct MockDriver {
    id: String,
    configured: RwLock<Option<DriveParameters>>,
    emission_time: Duration,
    trigger_line: Arc<AtomicU64>,
    stops: AtomicU64,
    configure_faults: FaultInjector,
    faults: FaultInjector,
    log: Option<CallLog>,
}

impl MockDriver {
    /// Unconfigured driver with instantaneous emission.
    pub fn new() -> Self {
        Self {
            id: "mock-driver".to_string(),
            configured: RwLock::new(None),
            emission_time: Duration::ZERO,
            trigger_line: Arc::new(AtomicU64::new(0)),
            stops: AtomicU64::new(0),
            configure_faults: FaultInjector::default(),
            faults: FaultInjector::default(),
            log: None,
        }
    }

    /// Set how long an emission lasts.
    pub fn with_emission_time(mut self, emission_time: Duration) -> Self {
        self.emission_time = emission_time;
        self
    }

    /// Record commands into `log`.
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Counter incremented on every completed emission.
    pub fn trigger_line(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.trigger_line)
    }

    /// Faults injected on `fire`.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Faults injected on `configure`.
    pub fn configure_faults(&self) -> &FaultInjector {
        &self.configure_faults
    }

    /// Completed emissions.
    pub fn fire_count(&self) -> u64 {
        self.trigger_line.load(Ordering::SeqCst)
    }

    /// Calls to `stop`.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Parameters currently loaded.
    pub async fn configured(&self) -> Option<DriveParameters> {
        self.configured.read().await.clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn configure(&self, parameters: &DriveParameters) -> HwResult<()> {
        if let Some(log) = &self.log {
            log.push(RigCall::Configure(parameters.sequence_id)).await;
        }
        self.configure_faults.check(&self.id, "configure").await?;
        *self.configured.write().await = Some(parameters.clone());
        Ok(())
    }

    async fn fire(&self) -> HwResult<()> {
        if let Some(log) = &self.log {
            log.push(RigCall::Fire).await;
        }
        self.faults.check(&self.id, "fire").await?;
        if self.configured.read().await.is_none() {
            return Err(HardwareError::new(
                &self.id,
                FaultKind::DriveFault,
                "fire requested before configure",
            ));
        }
        if !self.emission_time.is_zero() {
            sleep(self.emission_time).await;
        }
        self.trigger_line.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> HwResult<()> {
        if let Some(log) = &self.log {
            log.push(RigCall::Stop).await;
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockDigitizer
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Armed {
    sample_rate_hz: f64,
    window: Duration,
    trigger_mark: u64,
}

/// Simulated digitizer producing a noisy tone burst.
///
/// When linked to a driver's trigger line, a capture without an emission since
/// arming fails with `NoTrigger`.
pub struct MockDigitizer {
    id: String,
    armed: RwLock<Option<Armed>>,
    tone_hz: f64,
    amplitude_v: f64,
    noise_v: f64,
    rng: Mutex<StdRng>,
    trigger_line: Option<Arc<AtomicU64>>,
    arm_faults: FaultInjector,
    faults: FaultInjector,
    truncation: FaultInjector,
    log: Option<CallLog>,
}

impl MockDigitizer {
    /// 500 kHz, 100 mV tone with 2 mV noise.
    pub fn new() -> Self {
        Self {
            id: "mock-digitizer".to_string(),
            armed: RwLock::new(None),
            tone_hz: 500_000.0,
            amplitude_v: 0.1,
            noise_v: 0.002,
            rng: Mutex::new(StdRng::seed_from_u64(7)),
            trigger_line: None,
            arm_faults: FaultInjector::default(),
            faults: FaultInjector::default(),
            truncation: FaultInjector::default(),
            log: None,
        }
    }

    /// Set the simulated tone.
    pub fn with_tone(mut self, frequency_hz: f64, amplitude_v: f64) -> Self {
        self.tone_hz = frequency_hz;
        self.amplitude_v = amplitude_v;
        self
    }

    /// Set the noise amplitude.
    pub fn with_noise(mut self, noise_v: f64) -> Self {
        self.noise_v = noise_v;
        self
    }

    /// Require an emission on `line` between arm and capture.
    pub fn with_trigger_line(mut self, line: Arc<AtomicU64>) -> Self {
        self.trigger_line = Some(line);
        self
    }

    /// Record commands into `log`.
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Faults injected on `capture`.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Faults injected on `arm`.
    pub fn arm_faults(&self) -> &FaultInjector {
        &self.arm_faults
    }

    /// Scripted captures that return a half-length record instead of failing.
    pub fn truncation(&self) -> &FaultInjector {
        &self.truncation
    }

    /// Number of `capture` calls.
    pub async fn capture_count(&self) -> u64 {
        self.faults.calls().await
    }

    async fn synthesize(&self, armed: Armed) -> Vec<f32> {
        let n = expected_sample_count(armed.sample_rate_hz, armed.window);
        let omega = 2.0 * PI * self.tone_hz / armed.sample_rate_hz;
        let mut rng = self.rng.lock().await;
        (0..n)
            .map(|i| {
                let noise = if self.noise_v > 0.0 {
                    rng.gen_range(-self.noise_v..self.noise_v)
                } else {
                    0.0
                };
                (self.amplitude_v * (omega * i as f64).sin() + noise) as f32
            })
            .collect()
    }
}

impl Default for MockDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Digitizer for MockDigitizer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arm(&self, sample_rate_hz: f64, window: Duration) -> HwResult<()> {
        if let Some(log) = &self.log {
            log.push(RigCall::Arm).await;
        }
        self.arm_faults.check(&self.id, "arm").await?;
        let trigger_mark = self
            .trigger_line
            .as_ref()
            .map_or(0, |line| line.load(Ordering::SeqCst));
        *self.armed.write().await = Some(Armed {
            sample_rate_hz,
            window,
            trigger_mark,
        });
        Ok(())
    }

    async fn capture(&self, _timeout: Duration) -> HwResult<Waveform> {
        if let Some(log) = &self.log {
            log.push(RigCall::Capture).await;
        }
        self.faults.check(&self.id, "capture").await?;

        let armed = self.armed.write().await.take().ok_or_else(|| {
            HardwareError::new(&self.id, FaultKind::NoTrigger, "capture requested while not armed")
        })?;
        if let Some(line) = &self.trigger_line {
            if line.load(Ordering::SeqCst) == armed.trigger_mark {
                return Err(HardwareError::new(
                    &self.id,
                    FaultKind::NoTrigger,
                    "no emission observed since arming",
                ));
            }
        }

        let mut samples = self.synthesize(armed).await;
        if self.truncation.next().await.is_some() {
            samples.truncate(samples.len() / 2);
        }
        Ok(Waveform::from_rate(samples, armed.sample_rate_hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injector_fails_only_scripted_calls() {
        let injector = FaultInjector::default();
        injector.fail_on_calls([2], FaultKind::CaptureTimeout).await;
        assert!(injector.check("d", "op").await.is_ok());
        let err = injector.check("d", "op").await.unwrap_err();
        assert_eq!(err.kind, FaultKind::CaptureTimeout);
        assert!(injector.check("d", "op").await.is_ok());
        assert_eq!(injector.calls().await, 3);
    }

    #[tokio::test]
    async fn digitizer_record_length_follows_arm() {
        let digitizer = MockDigitizer::new();
        digitizer.arm(10_000_000.0, Duration::from_micros(100)).await.unwrap();
        let waveform = digitizer.capture(Duration::from_secs(1)).await.unwrap();
        assert_eq!(waveform.len(), 1000);
        assert_eq!(waveform.sample_interval, Duration::from_nanos(100));
    }

    #[tokio::test]
    async fn linked_digitizer_requires_emission() {
        let driver = MockDriver::new();
        let digitizer = MockDigitizer::new().with_trigger_line(driver.trigger_line());

        digitizer.arm(1_000_000.0, Duration::from_micros(10)).await.unwrap();
        let err = digitizer.capture(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::NoTrigger);
    }

    #[tokio::test]
    async fn driver_refuses_fire_before_configure() {
        let driver = MockDriver::new();
        let err = driver.fire().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::DriveFault);
        assert_eq!(driver.fire_count(), 0);
    }
}
