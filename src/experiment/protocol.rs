//! Protocol data model.
//!
//! A protocol is an ordered list of [`Sequence`]s. Each sequence describes one
//! acoustic waveform and the grid it is measured on. Before a run starts every
//! sequence is resolved into a [`DriveParameters`] that the driving system can
//! load directly.
//!
//! [`ProtocolRow`] is the tabular form of a sequence. Its serde renames are the
//! column headers protocol files must use.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CharacError, CharacResult};
use crate::experiment::grid::{
    AxisExtent, AxisMapping, Bounds, BoundsAndSteps, ExplicitCoordinate, GridSpecification,
    ScanPattern,
};
use crate::experiment::intensity::{to_drive_value, ConversionTable, DriveKind, DriveValue};
use crate::hardware::Position3;

/// Relative tolerance when checking PRF against PRI.
const PRF_TOLERANCE: f64 = 1e-6;

/// Longest pulse train a sequence may request.
pub const MAX_PULSE_TRAIN: Duration = Duration::from_secs(600);

/// Envelope applied to each pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModulationShape {
    /// Rectangular pulse.
    Square,
    /// Linear ramp up and down.
    Linear,
    /// Tapered cosine.
    Tukey,
}

impl FromStr for ModulationShape {
    type Err = CharacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" | "rect" | "rectangular" => Ok(ModulationShape::Square),
            "linear" => Ok(ModulationShape::Linear),
            "tukey" => Ok(ModulationShape::Tukey),
            other => Err(CharacError::InvalidSequence(format!(
                "unknown modulation '{}' (expected Square, Linear or Tukey)",
                other
            ))),
        }
    }
}

/// One acoustic sequence of a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Unique, positive sequence number.
    pub id: u32,
    /// Free-form label.
    #[serde(default)]
    pub tag: String,
    /// Pulse envelope.
    pub modulation: ModulationShape,
    /// Ramp duration of the envelope.
    #[serde(default, with = "humantime_serde")]
    pub ramp_duration: Duration,
    /// Ramp step size, for driving systems that need it.
    #[serde(default, with = "humantime_serde::option")]
    pub ramp_step: Option<Duration>,
    /// Pulse duration.
    #[serde(with = "humantime_serde")]
    pub pulse_duration: Duration,
    /// Pulse repetition frequency [Hz].
    pub pulse_repetition_frequency_hz: f64,
    /// Pulse repetition interval.
    #[serde(with = "humantime_serde")]
    pub pulse_repetition_interval: Duration,
    /// Pulse train duration.
    #[serde(with = "humantime_serde")]
    pub pulse_train_duration: Duration,
    /// Focus depth [mm].
    pub focus_depth_mm: f64,
    /// What `drive_value` means.
    pub drive_kind: DriveKind,
    /// Requested drive quantity.
    pub drive_value: f64,
    /// Where to measure.
    pub grid: GridSpecification,
    /// Flat indices whose retry exhaustion aborts the run.
    #[serde(default)]
    pub critical_points: Vec<usize>,
}

impl Sequence {
    /// Check timing and drive fields.
    pub fn validate(&self) -> CharacResult<()> {
        let fail = |msg: String| Err(CharacError::InvalidSequence(format!("sequence {}: {}", self.id, msg)));

        if self.id == 0 {
            return fail("sequence number must be positive".to_string());
        }
        if self.pulse_duration.is_zero() {
            return fail("pulse duration must be positive".to_string());
        }
        if self.pulse_repetition_interval.is_zero() {
            return fail("pulse repetition interval must be positive".to_string());
        }
        if self.pulse_train_duration.is_zero() {
            return fail("pulse train duration must be positive".to_string());
        }
        if self.pulse_train_duration > MAX_PULSE_TRAIN {
            return fail(format!(
                "pulse train duration {:?} exceeds {:?}",
                self.pulse_train_duration, MAX_PULSE_TRAIN
            ));
        }
        if self.pulse_duration > self.pulse_repetition_interval {
            return fail(format!(
                "pulse duration {:?} exceeds repetition interval {:?}",
                self.pulse_duration, self.pulse_repetition_interval
            ));
        }
        let implied_prf = 1.0 / self.pulse_repetition_interval.as_secs_f64();
        let prf = self.pulse_repetition_frequency_hz;
        if !(prf.is_finite() && prf > 0.0) || ((prf - implied_prf) / implied_prf).abs() > PRF_TOLERANCE {
            return fail(format!(
                "pulse repetition frequency {} Hz disagrees with interval {:?}",
                prf, self.pulse_repetition_interval
            ));
        }
        if !(self.drive_value.is_finite() && self.drive_value >= 0.0) {
            return fail(format!("drive value {} must be a non-negative number", self.drive_value));
        }
        if self.drive_kind == DriveKind::Amplitude && self.drive_value > 100.0 {
            return fail(format!("amplitude {}% exceeds 100%", self.drive_value));
        }
        if !self.focus_depth_mm.is_finite() {
            return fail("focus depth must be finite".to_string());
        }
        Ok(())
    }
}

/// Fully resolved waveform description for the driving system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveParameters {
    /// Sequence this was resolved from.
    pub sequence_id: u32,
    /// Pulse envelope.
    pub modulation: ModulationShape,
    /// Ramp duration.
    #[serde(with = "humantime_serde")]
    pub ramp_duration: Duration,
    /// Ramp step size.
    #[serde(with = "humantime_serde::option")]
    pub ramp_step: Option<Duration>,
    /// Pulse duration.
    #[serde(with = "humantime_serde")]
    pub pulse_duration: Duration,
    /// Pulse repetition frequency [Hz].
    pub pulse_repetition_frequency_hz: f64,
    /// Pulse repetition interval.
    #[serde(with = "humantime_serde")]
    pub pulse_repetition_interval: Duration,
    /// Pulse train duration.
    #[serde(with = "humantime_serde")]
    pub pulse_train_duration: Duration,
    /// Focus depth [mm].
    pub focus_depth_mm: f64,
    /// Transducer operating frequency [Hz].
    pub operating_frequency_hz: f64,
    /// Requested quantity, as specified.
    pub requested_kind: DriveKind,
    /// Requested value, as specified.
    pub requested_value: f64,
    /// Value in the driving system's native unit.
    pub drive: DriveValue,
}

impl DriveParameters {
    /// Resolve a validated sequence into driving system parameters.
    pub fn resolve(
        sequence: &Sequence,
        operating_frequency_hz: f64,
        table: Option<&ConversionTable>,
    ) -> CharacResult<Self> {
        let drive = to_drive_value(sequence.id, sequence.drive_kind, sequence.drive_value, table)?;
        Ok(Self {
            sequence_id: sequence.id,
            modulation: sequence.modulation,
            ramp_duration: sequence.ramp_duration,
            ramp_step: sequence.ramp_step,
            pulse_duration: sequence.pulse_duration,
            pulse_repetition_frequency_hz: sequence.pulse_repetition_frequency_hz,
            pulse_repetition_interval: sequence.pulse_repetition_interval,
            pulse_train_duration: sequence.pulse_train_duration,
            focus_depth_mm: sequence.focus_depth_mm,
            operating_frequency_hz,
            requested_kind: sequence.drive_kind,
            requested_value: sequence.drive_value,
            drive,
        })
    }
}

// =============================================================================
// Tabular form
// =============================================================================

/// One protocol row, keyed by the column headers of a protocol file.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRow {
    #[serde(rename = "Sequence number")]
    pub sequence_number: u32,
    #[serde(rename = "Tag", default)]
    pub tag: Option<String>,
    #[serde(rename = "Modulation")]
    pub modulation: String,
    #[serde(rename = "Ramp duration [us]", default)]
    pub ramp_duration_us: Option<f64>,
    #[serde(rename = "Ramp duration step size [us]", default)]
    pub ramp_step_us: Option<f64>,
    #[serde(rename = "Pulse duration [us]")]
    pub pulse_duration_us: f64,
    #[serde(rename = "Pulse Repetition Frequency [Hz]", default)]
    pub pulse_repetition_frequency_hz: Option<f64>,
    #[serde(rename = "Pulse Repetition Interval [ms]")]
    pub pulse_repetition_interval_ms: f64,
    #[serde(rename = "Pulse Train Duration [ms]")]
    pub pulse_train_duration_ms: f64,
    #[serde(rename = "Focus [mm]")]
    pub focus_mm: f64,
    #[serde(rename = "Drive parameter")]
    pub drive_parameter: String,
    #[serde(rename = "Corresponding value")]
    pub drive_value: f64,
    #[serde(rename = "Grid mode")]
    pub grid_mode: String,
    #[serde(rename = "Path and filename of coordinate file", default)]
    pub coordinate_file: Option<String>,
    #[serde(rename = "max. + x [mm] w.r.t. relative zero", default)]
    pub max_plus_x: Option<f64>,
    #[serde(rename = "max. - x [mm] w.r.t. relative zero", default)]
    pub max_minus_x: Option<f64>,
    #[serde(rename = "max. + y [mm] w.r.t. relative zero", default)]
    pub max_plus_y: Option<f64>,
    #[serde(rename = "max. - y [mm] w.r.t. relative zero", default)]
    pub max_minus_y: Option<f64>,
    #[serde(rename = "max. + z [mm] w.r.t. relative zero", default)]
    pub max_plus_z: Option<f64>,
    #[serde(rename = "max. - z [mm] w.r.t. relative zero", default)]
    pub max_minus_z: Option<f64>,
    #[serde(rename = "direction_slices", default)]
    pub direction_slices: Option<String>,
    #[serde(rename = "direction_rows", default)]
    pub direction_rows: Option<String>,
    #[serde(rename = "direction_columns", default)]
    pub direction_columns: Option<String>,
    #[serde(rename = "step_size_x [mm]", default)]
    pub step_x: Option<f64>,
    #[serde(rename = "step_size_y [mm]", default)]
    pub step_y: Option<f64>,
    #[serde(rename = "step_size_z [mm]", default)]
    pub step_z: Option<f64>,
    #[serde(rename = "Scan pattern", default)]
    pub scan_pattern: Option<String>,
    #[serde(rename = "Critical points", default)]
    pub critical_points: Option<String>,
}

impl ProtocolRow {
    /// Convert into a validated [`Sequence`].
    ///
    /// `load_coordinates` is called with the row's coordinate file path when the
    /// grid mode asks for explicit coordinates.
    pub fn into_sequence<F>(self, mut load_coordinates: F) -> CharacResult<Sequence>
    where
        F: FnMut(&Path) -> CharacResult<Vec<ExplicitCoordinate>>,
    {
        let id = self.sequence_number;
        let bad = |msg: String| CharacError::InvalidSequence(format!("sequence {}: {}", id, msg));

        let drive_kind = parse_drive_kind(&self.drive_parameter).ok_or_else(|| {
            bad(format!("unknown drive parameter '{}'", self.drive_parameter))
        })?;

        let grid = match self.grid_mode.trim().to_ascii_lowercase() {
            mode if mode.starts_with("coordinate") => {
                let path = self
                    .coordinate_file
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| bad("coordinate grid without a coordinate file".to_string()))?;
                GridSpecification::ExplicitCoordinates {
                    points: load_coordinates(Path::new(path.trim()))?,
                }
            }
            mode if mode.starts_with("bounds") || mode.starts_with("parameters") => {
                GridSpecification::BoundsAndSteps(self.bounds_and_steps()?)
            }
            _ => return Err(bad(format!("unknown grid mode '{}'", self.grid_mode))),
        };

        let pri = duration_from(self.pulse_repetition_interval_ms * 1e-3)
            .ok_or_else(|| bad("pulse repetition interval is not a valid duration".to_string()))?;
        let prf = self
            .pulse_repetition_frequency_hz
            .unwrap_or_else(|| 1.0 / pri.as_secs_f64().max(f64::MIN_POSITIVE));

        let critical_points = match self.critical_points.as_deref() {
            Some(list) => list
                .split([';', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<usize>().map_err(|_| bad(format!("critical point '{}' is not an index", s))))
                .collect::<CharacResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        let sequence = Sequence {
            id,
            tag: self.tag.unwrap_or_default(),
            modulation: self.modulation.parse()?,
            ramp_duration: duration_from(self.ramp_duration_us.unwrap_or(0.0) * 1e-6)
                .ok_or_else(|| bad("ramp duration is not a valid duration".to_string()))?,
            ramp_step: match self.ramp_step_us {
                Some(us) => Some(
                    duration_from(us * 1e-6)
                        .ok_or_else(|| bad("ramp step is not a valid duration".to_string()))?,
                ),
                None => None,
            },
            pulse_duration: duration_from(self.pulse_duration_us * 1e-6)
                .ok_or_else(|| bad("pulse duration is not a valid duration".to_string()))?,
            pulse_repetition_frequency_hz: prf,
            pulse_repetition_interval: pri,
            pulse_train_duration: duration_from(self.pulse_train_duration_ms * 1e-3)
                .ok_or_else(|| bad("pulse train duration is not a valid duration".to_string()))?,
            focus_depth_mm: self.focus_mm,
            drive_kind,
            drive_value: self.drive_value,
            grid,
            critical_points,
        };
        sequence.validate()?;
        Ok(sequence)
    }

    fn bounds_and_steps(&self) -> CharacResult<BoundsAndSteps> {
        let required = |value: Option<f64>, column: &str| {
            value.ok_or_else(|| {
                CharacError::InvalidGridSpec(format!(
                    "sequence {}: column '{}' is required for a bounds grid",
                    self.sequence_number, column
                ))
            })
        };
        let extent = |plus: Option<f64>, minus: Option<f64>| AxisExtent {
            max_plus: plus.unwrap_or(0.0),
            max_minus: minus.unwrap_or(0.0),
        };

        let defaults = AxisMapping::default();
        let direction = |value: &Option<String>, fallback| match value.as_deref() {
            Some(s) if !s.trim().is_empty() => s.parse(),
            _ => Ok(fallback),
        };
        let mapping = AxisMapping {
            slices: direction(&self.direction_slices, defaults.slices)?,
            rows: direction(&self.direction_rows, defaults.rows)?,
            columns: direction(&self.direction_columns, defaults.columns)?,
        };

        let pattern = match self.scan_pattern.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
            None => ScanPattern::Raster,
            Some(s) if s.is_empty() || s == "raster" || s == "direct" => ScanPattern::Raster,
            Some(s) if s == "serpentine" || s == "alternate" || s == "snake" => ScanPattern::Serpentine,
            Some(s) => {
                return Err(CharacError::InvalidGridSpec(format!(
                    "sequence {}: unknown scan pattern '{}'",
                    self.sequence_number, s
                )))
            }
        };

        Ok(BoundsAndSteps {
            bounds: Bounds {
                x: extent(self.max_plus_x, self.max_minus_x),
                y: extent(self.max_plus_y, self.max_minus_y),
                z: extent(self.max_plus_z, self.max_minus_z),
            },
            steps: Position3::new(
                required(self.step_x, "step_size_x [mm]")?,
                required(self.step_y, "step_size_y [mm]")?,
                required(self.step_z, "step_size_z [mm]")?,
            ),
            mapping,
            pattern,
        })
    }
}

fn parse_drive_kind(label: &str) -> Option<DriveKind> {
    let label = label.trim().to_ascii_lowercase();
    if label.starts_with("isppa") {
        Some(DriveKind::Isppa)
    } else if label.starts_with("global power") || label.starts_with("global_power") {
        Some(DriveKind::GlobalPower)
    } else if label.starts_with("amplitude") {
        Some(DriveKind::Amplitude)
    } else {
        None
    }
}

fn duration_from(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}
