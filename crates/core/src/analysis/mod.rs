//! Loudness primitives shared by the offline extractor and the streaming
//! tracker: RMS, dBFS conversion, percentile reference and the asymmetric
//! attack/release smoother.

use serde::{Deserialize, Serialize};

/// Floor applied before taking the logarithm so silence maps to -240 dBFS
/// instead of negative infinity.
const DBFS_FLOOR: f32 = 1e-12;

/// Parameters shared by both envelope paths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeParams {
    /// Frame length of the offline extractor. The tracker uses the block
    /// duration instead.
    pub frame_ms: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    /// Frames quieter than this are treated as silence.
    pub gate_dbfs: f32,
    /// Percentile of the non-silent RMS values used as full scale.
    pub percentile: f32,
}

impl Default for EnvelopeParams {
    fn default() -> Self {
        Self {
            frame_ms: 30.0,
            attack_ms: 40.0,
            release_ms: 120.0,
            gate_dbfs: -45.0,
            percentile: 95.0,
        }
    }
}

pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

pub fn dbfs(rms: f32) -> f32 {
    20.0 * rms.max(DBFS_FLOOR).log10()
}

/// Percentile with linear interpolation between the closest ranks.
///
/// `values` is sorted in place; callers pass a scratch buffer they own so the
/// real-time path never allocates. Returns `None` for an empty slice.
pub fn percentile_in_place(values: &mut [f32], percentile: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(f32::total_cmp);

    let rank = (percentile.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f32;
    Some(values[lower] + (values[upper] - values[lower]) * fraction)
}

/// Normalisation reference of a set of RMS values: the configured percentile
/// of the non-zero entries, or 1.0 when nothing is above silence.
pub fn reference_level(nonzero: &mut [f32], percentile: f32) -> f32 {
    match percentile_in_place(nonzero, percentile) {
        Some(reference) if reference > 0.0 => reference,
        _ => 1.0,
    }
}

/// One-pole smoother that rises with the attack coefficient and falls with
/// the release coefficient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttackRelease {
    attack: f32,
    release: f32,
    value: f32,
}

impl AttackRelease {
    /// Builds a smoother for a fixed step duration in milliseconds.
    pub fn new(step_ms: f32, attack_ms: f32, release_ms: f32) -> Self {
        Self {
            attack: coefficient(step_ms, attack_ms),
            release: coefficient(step_ms, release_ms),
            value: 0.0,
        }
    }

    pub fn from_params(step_ms: f32, params: &EnvelopeParams) -> Self {
        Self::new(step_ms, params.attack_ms, params.release_ms)
    }

    pub fn next(&mut self, target: f32) -> f32 {
        let coef = if target > self.value {
            self.attack
        } else {
            self.release
        };
        self.value = coef * self.value + (1.0 - coef) * target;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

fn coefficient(step_ms: f32, time_constant_ms: f32) -> f32 {
    (-step_ms / time_constant_ms.max(1.0)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_constant_signal() {
        assert!((compute_rms(&[0.5; 64]) - 0.5).abs() < 1e-6);
        assert_eq!(compute_rms(&[]), 0.0);
    }

    #[test]
    fn dbfs_floors_silence() {
        assert!((dbfs(1.0)).abs() < 1e-6);
        assert!((dbfs(0.0) + 240.0).abs() < 1e-3);
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0, 5.0];
        assert_eq!(percentile_in_place(&mut values, 50.0), Some(3.0));
        let mut values = vec![0.0, 10.0];
        let p95 = percentile_in_place(&mut values, 95.0).unwrap();
        assert!((p95 - 9.5).abs() < 1e-5);
        assert_eq!(percentile_in_place(&mut [], 95.0), None);
    }

    #[test]
    fn reference_defaults_to_unity() {
        assert_eq!(reference_level(&mut [], 95.0), 1.0);
        assert_eq!(reference_level(&mut [0.0, 0.0], 95.0), 1.0);
    }

    #[test]
    fn smoother_attacks_faster_than_it_releases() {
        let mut smoother = AttackRelease::new(30.0, 40.0, 120.0);
        let up = smoother.next(1.0);
        let mut falling = AttackRelease::new(30.0, 40.0, 120.0);
        for _ in 0..200 {
            falling.next(1.0);
        }
        let down = 1.0 - falling.next(0.0);
        assert!(up > down, "attack step {up} should exceed release step {down}");
    }
}
