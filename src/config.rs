//! Rig configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. A TOML file (by default `config/rig.toml`)
//! 3. Environment variables prefixed with `SONOROVER_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use sonorover::config::RigConfig;
//!
//! let config = RigConfig::load_from("config/rig.toml")?;
//! config.validate()?;
//! println!("Operating frequency: {} kHz", config.acquisition.operating_frequency_khz);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Environment override example: `SONOROVER_HARDWARE__MOVE_TIMEOUT="45s"`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CharacError, CharacResult};
use crate::error_recovery::RetryPolicy;
use crate::hardware::{CoordinatorSettings, Position3};

/// Top-level rig configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Acquisition timing
    pub acquisition: AcquisitionSettings,
    /// Hardware call limits
    pub hardware: HardwareConfig,
    /// Waveform acceptance
    pub validation: ValidationSettings,
    /// Output location
    pub storage: StorageConfig,
    /// Equipment identifiers recorded with each run
    pub equipment: EquipmentConfig,
    /// Water conditions recorded with each run
    pub environment: EnvironmentConditions,
    /// Calibrated zero point in stage coordinates [mm]
    pub zero_point: Position3,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionSettings::default(),
            hardware: HardwareConfig::default(),
            validation: ValidationSettings::default(),
            storage: StorageConfig::default(),
            equipment: EquipmentConfig::default(),
            environment: EnvironmentConditions::default(),
            zero_point: Position3::new(-50.0, -50.0, -150.0),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Console log format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sonorover".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// How each grid point is acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Transducer operating frequency [kHz]
    pub operating_frequency_khz: f64,
    /// Record length
    #[serde(with = "humantime_serde")]
    pub acquisition_time: Duration,
    /// Sampling rate as a multiple of the operating frequency
    pub sampling_freq_multiplier: f64,
    /// Pause after motion before the digitizer is armed
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Added to every capture timeout
    #[serde(with = "humantime_serde")]
    pub capture_grace: Duration,
    /// Start of the phasor window, from record start
    #[serde(with = "humantime_serde")]
    pub processing_begin: Duration,
    /// End of the phasor window; unset means end of record
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub processing_end: Option<Duration>,
    /// Shift the window by one column's time of flight per column: -1, 0 or 1
    pub tof_adjust: i8,
    /// Speed of sound in the tank [m/s]
    pub speed_of_sound_m_s: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            operating_frequency_khz: 500.0,
            acquisition_time: Duration::from_micros(500),
            sampling_freq_multiplier: 50.0,
            settle_time: Duration::from_millis(100),
            capture_grace: Duration::from_millis(500),
            processing_begin: Duration::ZERO,
            processing_end: None,
            tof_adjust: 0,
            speed_of_sound_m_s: 1500.0,
        }
    }
}

impl AcquisitionSettings {
    /// Operating frequency in Hz.
    pub fn operating_frequency_hz(&self) -> f64 {
        self.operating_frequency_khz * 1e3
    }

    /// Digitizer sampling rate in Hz.
    pub fn sample_rate_hz(&self) -> f64 {
        self.sampling_freq_multiplier * self.operating_frequency_hz()
    }
}

/// Limits applied to hardware calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Connect/disconnect limit per subsystem
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Move limit, command to position reached
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
    /// Driving system configuration limit
    #[serde(with = "humantime_serde")]
    pub configure_timeout: Duration,
    /// Emission limit on top of the pulse train duration
    #[serde(with = "humantime_serde")]
    pub fire_timeout: Duration,
    /// Digitizer arm limit
    #[serde(with = "humantime_serde")]
    pub arm_timeout: Duration,
    /// Arrival tolerance [mm]
    pub position_tolerance_mm: f64,
    /// Readiness poll interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Point retry budget
    pub retry: RetryPolicy,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let defaults = CoordinatorSettings::default();
        Self {
            connect_timeout: defaults.connect_timeout,
            move_timeout: defaults.move_timeout,
            configure_timeout: defaults.configure_timeout,
            fire_timeout: defaults.fire_timeout,
            arm_timeout: defaults.arm_timeout,
            position_tolerance_mm: defaults.position_tolerance_mm,
            poll_interval: defaults.poll_interval,
            retry: defaults.retry,
        }
    }
}

/// Waveform acceptance thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Magnitude at which the digitizer clips [V]
    pub saturation_level_v: f32,
    /// Fraction of clipped samples above which a record is rejected
    pub max_clipped_fraction: f64,
    /// Records with every sample at or below this magnitude are rejected [V]
    pub zero_threshold_v: f32,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            saturation_level_v: 0.5,
            max_clipped_fraction: 0.01,
            zero_threshold_v: 1e-6,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which run directories are created
    pub output_dir: PathBuf,
    /// Prefix of each run directory name
    pub run_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            run_name: "characterization".to_string(),
        }
    }
}

/// Equipment recorded in the run manifest alongside the devices' own ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentConfig {
    /// Transducer serial or name
    pub transducer: Option<String>,
    /// Hydrophone serial or name
    pub hydrophone: Option<String>,
    /// Driving system serial, when it differs from the device id
    pub driving_system: Option<String>,
}

/// Water conditions at the time of measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConditions {
    /// Water temperature [°C]
    pub water_temperature_c: Option<f64>,
    /// Dissolved oxygen [mg/L]
    pub dissolved_oxygen_mg_l: Option<f64>,
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    pub fn load() -> CharacResult<Self> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to defaults; a missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CharacResult<Self> {
        let config = Figment::from(Serialized::defaults(RigConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SONOROVER_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CharacResult<()> {
        let invalid = |msg: String| Err(CharacError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let acq = &self.acquisition;
        if !(acq.operating_frequency_khz.is_finite() && acq.operating_frequency_khz > 0.0) {
            return invalid(format!(
                "operating_frequency_khz must be positive, got {}",
                acq.operating_frequency_khz
            ));
        }
        if !(acq.sampling_freq_multiplier.is_finite() && acq.sampling_freq_multiplier >= 2.0) {
            return invalid(format!(
                "sampling_freq_multiplier must be at least 2 (Nyquist), got {}",
                acq.sampling_freq_multiplier
            ));
        }
        if acq.acquisition_time.is_zero() {
            return invalid("acquisition_time must be positive".to_string());
        }
        let window_end = acq.processing_end.unwrap_or(acq.acquisition_time);
        if acq.processing_begin >= window_end || window_end > acq.acquisition_time {
            return invalid(format!(
                "processing window {:?}..{:?} must be non-empty and within the {:?} record",
                acq.processing_begin, window_end, acq.acquisition_time
            ));
        }
        if !(-1..=1).contains(&acq.tof_adjust) {
            return invalid(format!(
                "tof_adjust must be -1, 0 or 1, got {}",
                acq.tof_adjust
            ));
        }
        if !(acq.speed_of_sound_m_s.is_finite() && acq.speed_of_sound_m_s > 0.0) {
            return invalid(format!(
                "speed_of_sound_m_s must be positive, got {}",
                acq.speed_of_sound_m_s
            ));
        }

        let hw = &self.hardware;
        for (name, value) in [
            ("connect_timeout", hw.connect_timeout),
            ("move_timeout", hw.move_timeout),
            ("configure_timeout", hw.configure_timeout),
            ("fire_timeout", hw.fire_timeout),
            ("arm_timeout", hw.arm_timeout),
            ("poll_interval", hw.poll_interval),
        ] {
            if value.is_zero() {
                return invalid(format!("hardware.{} must be positive", name));
            }
        }
        if !(hw.position_tolerance_mm.is_finite() && hw.position_tolerance_mm > 0.0) {
            return invalid(format!(
                "position_tolerance_mm must be positive, got {}",
                hw.position_tolerance_mm
            ));
        }

        let val = &self.validation;
        if !(0.0..=1.0).contains(&val.max_clipped_fraction) {
            return invalid(format!(
                "max_clipped_fraction must be within [0, 1], got {}",
                val.max_clipped_fraction
            ));
        }
        if !(val.saturation_level_v > val.zero_threshold_v && val.zero_threshold_v >= 0.0) {
            return invalid(format!(
                "saturation_level_v ({}) must exceed zero_threshold_v ({})",
                val.saturation_level_v, val.zero_threshold_v
            ));
        }

        if !self.zero_point.is_finite() {
            return invalid("zero_point must be finite".to_string());
        }
        if self.storage.run_name.trim().is_empty() {
            return invalid("storage.run_name must not be empty".to_string());
        }

        Ok(())
    }

    /// Hardware coordinator settings derived from this configuration.
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            connect_timeout: self.hardware.connect_timeout,
            move_timeout: self.hardware.move_timeout,
            configure_timeout: self.hardware.configure_timeout,
            fire_timeout: self.hardware.fire_timeout,
            arm_timeout: self.hardware.arm_timeout,
            position_tolerance_mm: self.hardware.position_tolerance_mm,
            poll_interval: self.hardware.poll_interval,
            settle_time: self.acquisition.settle_time,
            retry: self.hardware.retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.sample_rate_hz(), 25_000_000.0);
        assert_eq!(config.zero_point, Position3::new(-50.0, -50.0, -150.0));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_sub_nyquist_sampling() {
        let mut config = RigConfig::default();
        config.acquisition.sampling_freq_multiplier = 1.5;
        assert!(matches!(config.validate(), Err(CharacError::Configuration(_))));
    }

    #[test]
    fn rejects_bad_clip_fraction() {
        let mut config = RigConfig::default();
        config.validation.max_clipped_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn processing_window_must_fit_the_record() {
        let mut config = RigConfig::default();
        config.acquisition.processing_begin = Duration::from_micros(100);
        config.acquisition.processing_end = Some(Duration::from_micros(300));
        assert!(config.validate().is_ok());

        config.acquisition.processing_end = Some(Duration::from_micros(600));
        assert!(matches!(config.validate(), Err(CharacError::Configuration(_))));

        config.acquisition.processing_end = Some(Duration::from_micros(100));
        assert!(config.validate().is_err());

        config.acquisition.processing_end = None;
        config.acquisition.processing_begin = Duration::from_micros(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tof_adjust_is_a_direction() {
        let mut config = RigConfig::default();
        config.acquisition.tof_adjust = -1;
        assert!(config.validate().is_ok());
        config.acquisition.tof_adjust = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
zero_point = {{ x = 1.0, y = 2.0, z = 3.0 }}

[acquisition]
operating_frequency_khz = 250.0
acquisition_time = "200us"
processing_begin = "20us"
processing_end = "150us"
tof_adjust = 1

[hardware]
move_timeout = "45s"

[hardware.retry]
max_retries = 3

[environment]
water_temperature_c = 21.5
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.acquisition.operating_frequency_khz, 250.0);
        assert_eq!(config.acquisition.acquisition_time, Duration::from_micros(200));
        assert_eq!(config.acquisition.sampling_freq_multiplier, 50.0);
        assert_eq!(config.acquisition.processing_begin, Duration::from_micros(20));
        assert_eq!(config.acquisition.processing_end, Some(Duration::from_micros(150)));
        assert_eq!(config.acquisition.tof_adjust, 1);
        assert_eq!(config.hardware.move_timeout, Duration::from_secs(45));
        assert_eq!(config.hardware.retry.max_retries, 3);
        assert_eq!(config.environment.water_temperature_c, Some(21.5));
        assert_eq!(config.zero_point, Position3::new(1.0, 2.0, 3.0));
        assert!(config.validate().is_ok());

        let settings = config.coordinator_settings();
        assert_eq!(settings.move_timeout, Duration::from_secs(45));
        assert_eq!(settings.settle_time, config.acquisition.settle_time);
    }
}
