//! Conversion from a requested acoustic quantity to the driving system's native value.
//!
//! Amplitude and global power are already native and pass through unchanged.
//! Isppa (W/cm²) is mapped to global power (mW) by linear interpolation in a
//! calibration table measured for the transducer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CharacError, CharacResult};

/// What the operator specified for a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveKind {
    /// Spatial-peak pulse-average intensity [W/cm²].
    Isppa,
    /// Driving system global power [mW].
    GlobalPower,
    /// Driving system amplitude [%].
    Amplitude,
}

impl fmt::Display for DriveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriveKind::Isppa => "Isppa [W/cm2]",
            DriveKind::GlobalPower => "Global power [mW]",
            DriveKind::Amplitude => "Amplitude [%]",
        };
        write!(f, "{}", label)
    }
}

/// Unit of a resolved drive value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveUnit {
    /// Milliwatts of global power.
    GlobalPowerMilliwatt,
    /// Percent of full amplitude.
    AmplitudePercent,
}

/// A drive value in the driving system's native unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriveValue {
    /// Native unit.
    pub unit: DriveUnit,
    /// Value in `unit`.
    pub value: f64,
}

impl fmt::Display for DriveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            DriveUnit::GlobalPowerMilliwatt => write!(f, "{} mW", self.value),
            DriveUnit::AmplitudePercent => write!(f, "{} %", self.value),
        }
    }
}

/// One calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConversionRow {
    /// Global power [mW].
    #[serde(rename = "globalPower")]
    pub global_power_mw: f64,
    /// Resulting Isppa [W/cm²].
    #[serde(rename = "intensity")]
    pub intensity_w_cm2: f64,
}

/// Isppa → global power calibration, strictly increasing in both columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionTable {
    rows: Vec<ConversionRow>,
}

impl ConversionTable {
    /// Validate and wrap calibration rows.
    pub fn new(rows: Vec<ConversionRow>) -> CharacResult<Self> {
        if rows.is_empty() {
            return Err(CharacError::InvalidConversionTable(
                "table has no rows".to_string(),
            ));
        }
        for (i, row) in rows.iter().enumerate() {
            if !(row.global_power_mw.is_finite() && row.intensity_w_cm2.is_finite()) {
                return Err(CharacError::InvalidConversionTable(format!(
                    "row {} is not finite",
                    i + 1
                )));
            }
        }
        for (i, pair) in rows.windows(2).enumerate() {
            if pair[1].intensity_w_cm2 <= pair[0].intensity_w_cm2
                || pair[1].global_power_mw <= pair[0].global_power_mw
            {
                return Err(CharacError::InvalidConversionTable(format!(
                    "rows {} and {} are not strictly increasing",
                    i + 1,
                    i + 2
                )));
            }
        }
        Ok(Self { rows })
    }

    /// Calibration rows in ascending order.
    pub fn rows(&self) -> &[ConversionRow] {
        &self.rows
    }

    /// Covered intensity range.
    pub fn intensity_range(&self) -> (f64, f64) {
        let first = self.rows[0].intensity_w_cm2;
        let last = self.rows[self.rows.len() - 1].intensity_w_cm2;
        (first, last)
    }

    /// Global power producing `intensity`, by linear interpolation.
    ///
    /// Returns a table value exactly when `intensity` is a table knot.
    pub fn global_power_for(&self, intensity: f64) -> CharacResult<f64> {
        let (min, max) = self.intensity_range();
        if !(intensity >= min && intensity <= max) {
            return Err(CharacError::OutOfRangeIntensity {
                requested: intensity,
                min,
                max,
            });
        }
        // first row whose intensity is >= the request
        let upper = self
            .rows
            .partition_point(|row| row.intensity_w_cm2 < intensity);
        let hi = self.rows[upper];
        if hi.intensity_w_cm2 == intensity {
            return Ok(hi.global_power_mw);
        }
        let lo = self.rows[upper - 1];
        let t = (intensity - lo.intensity_w_cm2) / (hi.intensity_w_cm2 - lo.intensity_w_cm2);
        Ok(lo.global_power_mw + t * (hi.global_power_mw - lo.global_power_mw))
    }
}

impl<'de> Deserialize<'de> for ConversionTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let rows = Vec::<ConversionRow>::deserialize(deserializer)?;
        ConversionTable::new(rows).map_err(serde::de::Error::custom)
    }
}

/// Resolve a requested drive quantity into the driving system's native value.
///
/// `sequence_id` only labels a `MissingConversionTable` error.
pub fn to_drive_value(
    sequence_id: u32,
    kind: DriveKind,
    value: f64,
    table: Option<&ConversionTable>,
) -> CharacResult<DriveValue> {
    match kind {
        DriveKind::Amplitude => Ok(DriveValue {
            unit: DriveUnit::AmplitudePercent,
            value,
        }),
        DriveKind::GlobalPower => Ok(DriveValue {
            unit: DriveUnit::GlobalPowerMilliwatt,
            value,
        }),
        DriveKind::Isppa => {
            let table = table.ok_or(CharacError::MissingConversionTable { sequence_id })?;
            Ok(DriveValue {
                unit: DriveUnit::GlobalPowerMilliwatt,
                value: table.global_power_for(value)?,
            })
        }
    }
}
