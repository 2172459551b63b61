//! Single-bin DFT of a captured record at the operating frequency.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::ops::Range;
use std::time::Duration;

/// Amplitude and phase of one frequency component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phasor {
    /// Peak amplitude [V].
    pub amplitude: f64,
    /// Phase [rad], in (-π, π].
    pub phase_rad: f64,
}

/// Extract the component at `frequency_hz` from `samples[window]`.
///
/// Time runs from the first sample of the record, so phases of different
/// windows share one reference. A window reaching past the record is cut at
/// the last sample. Returns `None` for an empty window or a non-positive interval.
pub fn extract(
    samples: &[f32],
    window: Range<usize>,
    sample_interval: Duration,
    frequency_hz: f64,
) -> Option<Phasor> {
    let dt = sample_interval.as_secs_f64();
    let end = window.end.min(samples.len());
    if window.start >= end || dt <= 0.0 || !frequency_hz.is_finite() {
        return None;
    }
    let omega = 2.0 * PI * frequency_hz * dt;
    let sum: Complex64 = samples[window.start..end]
        .iter()
        .zip(window.start..)
        .map(|(&s, n)| Complex64::from_polar(f64::from(s), -omega * n as f64))
        .sum();
    Some(Phasor {
        amplitude: 2.0 * sum.norm() / (end - window.start) as f64,
        phase_rad: sum.arg(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f64, frequency: f64, phase: f64, rate: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * frequency * i as f64 / rate + phase).cos()) as f32)
            .collect()
    }

    #[test]
    fn recovers_amplitude_and_phase_of_whole_cycles() {
        // 20 cycles of 500 kHz at 25 MHz
        let samples = tone(0.25, 500e3, 0.4, 25e6, 1000);
        let p = extract(&samples, 0..samples.len(), Duration::from_nanos(40), 500e3).unwrap();
        assert!((p.amplitude - 0.25).abs() < 1e-4, "amplitude {}", p.amplitude);
        assert!((p.phase_rad - 0.4).abs() < 1e-3, "phase {}", p.phase_rad);
    }

    #[test]
    fn window_ignores_samples_outside_it() {
        // offset before the window, a louder tone after it
        let mut samples = tone(0.25, 500e3, 0.4, 25e6, 2000);
        samples[..500].iter_mut().for_each(|s| *s = 0.9);
        let loud = tone(0.8, 500e3, -1.2, 25e6, 2000);
        samples[1500..].copy_from_slice(&loud[1500..]);

        let p = extract(&samples, 500..1500, Duration::from_nanos(40), 500e3).unwrap();
        assert!((p.amplitude - 0.25).abs() < 1e-4, "amplitude {}", p.amplitude);
        // phase stays referenced to record start
        assert!((p.phase_rad - 0.4).abs() < 1e-3, "phase {}", p.phase_rad);

        let whole = extract(&samples, 0..2000, Duration::from_nanos(40), 500e3).unwrap();
        assert!((whole.amplitude - 0.25).abs() > 0.01);
    }

    #[test]
    fn window_past_the_record_is_cut() {
        let samples = tone(0.25, 500e3, 0.0, 25e6, 1000);
        let p = extract(&samples, 500..1500, Duration::from_nanos(40), 500e3).unwrap();
        assert!((p.amplitude - 0.25).abs() < 1e-4, "amplitude {}", p.amplitude);
        assert!(extract(&samples, 1000..1200, Duration::from_nanos(40), 500e3).is_none());
    }

    #[test]
    fn empty_record_has_no_phasor() {
        assert!(extract(&[], 0..0, Duration::from_nanos(40), 500e3).is_none());
        assert!(extract(&[0.1; 10], 4..4, Duration::from_nanos(40), 500e3).is_none());
    }
}
