//! Rig hardware abstraction.
//!
//! The rig is three independently controlled subsystems, each modelled as a
//! capability trait in [`capabilities`]:
//!
//! - [`Positioner`](capabilities::Positioner): 3-axis stage carrying the hydrophone
//! - [`Driver`](capabilities::Driver): ultrasound driving system
//! - [`Digitizer`](capabilities::Digitizer): oscilloscope recording the hydrophone signal
//!
//! Vendor implementations live outside this crate. [`mock`] provides simulated
//! devices with fault injection for tests and the command-line simulator, and
//! [`coordinator::HardwareCoordinator`] is the only component that talks to them.

pub mod capabilities;
pub mod coordinator;
pub mod mock;

pub use capabilities::{Digitizer, Driver, Positioner};
pub use coordinator::{CoordinatorSettings, HardwareCoordinator};

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point in stage coordinates, in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position3 {
    /// X coordinate [mm]
    pub x: f64,
    /// Y coordinate [mm]
    pub y: f64,
    /// Z coordinate [mm]
    pub z: f64,
}

impl Position3 {
    /// Construct a position.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: &Position3) -> f64 {
        let d = *self - *other;
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }

    /// All three components are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Component access by axis.
    pub fn axis(&self, axis: crate::experiment::grid::Axis) -> f64 {
        use crate::experiment::grid::Axis;
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Mutable component access by axis.
    pub fn axis_mut(&mut self, axis: crate::experiment::grid::Axis) -> &mut f64 {
        use crate::experiment::grid::Axis;
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
        }
    }
}

impl Add for Position3 {
    type Output = Position3;

    fn add(self, rhs: Position3) -> Position3 {
        Position3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Position3 {
    type Output = Position3;

    fn sub(self, rhs: Position3) -> Position3 {
        Position3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::fmt::Display for Position3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3}) mm", self.x, self.y, self.z)
    }
}

/// A captured hydrophone record.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Samples in volts, oldest first.
    pub samples: Vec<f32>,
    /// Time between consecutive samples.
    pub sample_interval: Duration,
}

impl Waveform {
    /// Build a record from samples and the rate they were taken at.
    pub fn from_rate(samples: Vec<f32>, sample_rate_hz: f64) -> Self {
        Self {
            samples,
            sample_interval: Duration::from_secs_f64(1.0 / sample_rate_hz),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the record holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Number of samples a digitizer returns for a window at a given rate.
///
/// Both the acquisition plan and simulated digitizers use this so their
/// notion of a complete record agrees.
pub fn expected_sample_count(sample_rate_hz: f64, window: Duration) -> usize {
    (window.as_secs_f64() * sample_rate_hz + 1e-9).floor() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_matches_window() {
        // 500 µs at 50 × 500 kHz
        let n = expected_sample_count(25_000_000.0, Duration::from_micros(500));
        assert_eq!(n, 12_500);
    }

    #[test]
    fn position_arithmetic() {
        let a = Position3::new(1.0, 2.0, 3.0);
        let b = Position3::new(0.5, 0.5, 0.5);
        assert_eq!(a - b, Position3::new(0.5, 1.5, 2.5));
        assert_eq!(a + b, Position3::new(1.5, 2.5, 3.5));
        assert!((Position3::default().distance_to(&Position3::new(3.0, 4.0, 0.0)) - 5.0).abs() < 1e-12);
    }
}
