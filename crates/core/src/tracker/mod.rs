//! Streaming loudness tracker used inside the real-time audio callback.
//!
//! All buffers are sized at construction; [`EnvelopeTracker::process_block`]
//! never allocates and runs in time proportional to the window length.

use crate::analysis::{dbfs, reference_level, AttackRelease, EnvelopeParams};

/// Seconds of history kept for the adaptive normalisation reference.
pub const WINDOW_SECONDS: f32 = 2.5;

/// Guards the logarithm and square root against an all-zero block.
const RMS_EPSILON: f32 = 1e-20;

#[derive(Debug, Clone)]
pub struct EnvelopeTracker {
    params: EnvelopeParams,
    block_ms: f32,
    history: Vec<f32>,
    head: usize,
    filled: usize,
    scratch: Vec<f32>,
    smoother: AttackRelease,
}

impl EnvelopeTracker {
    pub fn new(sample_rate: u32, block_size: usize, params: EnvelopeParams) -> Self {
        let block_size = block_size.max(1);
        let window = window_blocks(sample_rate, block_size);
        let block_ms = 1000.0 * block_size as f32 / sample_rate.max(1) as f32;
        Self {
            params,
            block_ms,
            history: vec![0.0; window],
            head: 0,
            filled: 0,
            scratch: Vec::with_capacity(window),
            smoother: AttackRelease::from_params(block_ms, &params),
        }
    }

    pub fn window_len(&self) -> usize {
        self.history.len()
    }

    pub fn block_ms(&self) -> f32 {
        self.block_ms
    }

    /// Last smoothed output.
    pub fn level(&self) -> f32 {
        self.smoother.value()
    }

    /// Consumes one mono block and returns the smoothed level in `[0, 1]`.
    pub fn process_block(&mut self, block: &[f32]) -> f32 {
        let rms = block_rms(block);
        self.push_history(rms);

        let target = if dbfs(rms) < self.params.gate_dbfs {
            0.0
        } else {
            self.scratch.clear();
            self.scratch.extend(
                self.history[..self.filled]
                    .iter()
                    .copied()
                    .filter(|&value| value > 0.0),
            );
            let reference = reference_level(&mut self.scratch, self.params.percentile);
            (rms / reference).clamp(0.0, 1.0)
        };

        self.smoother.next(target)
    }

    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|value| *value = 0.0);
        self.head = 0;
        self.filled = 0;
        self.smoother.reset();
    }

    fn push_history(&mut self, rms: f32) {
        let capacity = self.history.len();
        self.history[self.head] = rms;
        self.head = (self.head + 1) % capacity;
        self.filled = (self.filled + 1).min(capacity);
    }
}

/// Number of blocks in the rolling reference window.
pub fn window_blocks(sample_rate: u32, block_size: usize) -> usize {
    ((WINDOW_SECONDS * sample_rate as f32 / block_size.max(1) as f32) as usize).max(1)
}

fn block_rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|sample| sample * sample).sum();
    (sum / block.len() as f32 + RMS_EPSILON).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;
    const BLOCK: usize = 256;

    fn tracker() -> EnvelopeTracker {
        EnvelopeTracker::new(RATE, BLOCK, EnvelopeParams::default())
    }

    fn square(amplitude: f32) -> Vec<f32> {
        (0..BLOCK)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn window_covers_two_and_a_half_seconds() {
        assert_eq!(window_blocks(48_000, 256), 468);
        assert_eq!(window_blocks(8_000, 1_000_000), 1);
        assert_eq!(tracker().window_len(), 468);
    }

    #[test]
    fn silence_stays_at_zero() {
        let mut tracker = tracker();
        for _ in 0..100 {
            assert_eq!(tracker.process_block(&[0.0; BLOCK]), 0.0);
        }
    }

    #[test]
    fn converges_to_zero_within_one_release_constant() {
        let mut tracker = tracker();
        let loud = square(0.8);
        for _ in 0..200 {
            tracker.process_block(&loud);
        }
        assert!(tracker.level() > 0.99);

        let release_blocks = (120.0 / tracker.block_ms()).ceil() as usize;
        let mut level = tracker.level();
        for _ in 0..release_blocks {
            level = tracker.process_block(&[0.0; BLOCK]);
        }
        assert!(level < 1.0 / std::f32::consts::E + 1e-3, "level {level}");

        for _ in 0..release_blocks * 8 {
            level = tracker.process_block(&[0.0; BLOCK]);
        }
        assert!(level < 1e-3);
    }

    #[test]
    fn full_scale_tone_rises_monotonically_and_stays_bounded() {
        let mut tracker = tracker();
        let tone = square(1.0);
        let mut previous = 0.0;
        for _ in 0..300 {
            let level = tracker.process_block(&tone);
            assert!((0.0..=1.0).contains(&level));
            assert!(level >= previous);
            previous = level;
        }
        assert!(previous > 0.999);
    }

    #[test]
    fn quiet_blocks_below_gate_are_ignored() {
        let mut tracker = tracker();
        // -60 dBFS is below the default -45 dBFS gate.
        let whisper = square(0.001);
        for _ in 0..50 {
            assert_eq!(tracker.process_block(&whisper), 0.0);
        }
    }

    #[test]
    fn reference_adapts_to_recent_loudness() {
        let mut tracker = tracker();
        let quiet = square(0.05);
        for _ in 0..tracker.window_len() + 10 {
            tracker.process_block(&quiet);
        }
        // A steady quiet signal normalises to full excursion once the window
        // only holds that signal.
        assert!(tracker.level() > 0.99);
    }

    #[test]
    fn reset_clears_history_and_output() {
        let mut tracker = tracker();
        tracker.process_block(&square(0.5));
        tracker.reset();
        assert_eq!(tracker.level(), 0.0);
    }
}
