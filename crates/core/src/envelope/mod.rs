//! Offline envelope extraction with a fingerprint-keyed memory cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::analysis::{compute_rms, dbfs, reference_level, AttackRelease, EnvelopeParams};
use crate::decode::{downmix, AudioDecoder, DecodedAudio, SymphoniaDecoder};
use crate::{DecodeError, LipsyncError, Result};

/// One point of the loudness curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSample {
    pub time: f32,
    pub level: f32,
}

/// Normalised loudness curve of a whole clip. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub samples: Vec<EnvelopeSample>,
    pub duration_seconds: f32,
    pub frame_ms: f32,
}

impl Envelope {
    /// Builds the envelope of interleaved PCM. Deterministic and uncached.
    pub fn compute(
        interleaved: &[f32],
        channels: usize,
        sample_rate: u32,
        params: &EnvelopeParams,
    ) -> Self {
        let mono = downmix(interleaved, channels);
        let duration_seconds = if sample_rate > 0 {
            mono.len() as f32 / sample_rate as f32
        } else {
            0.0
        };

        let frame_len = (sample_rate as f32 * params.frame_ms / 1000.0) as usize;
        if frame_len == 0 {
            return Self {
                samples: Vec::new(),
                duration_seconds,
                frame_ms: params.frame_ms,
            };
        }

        let mut levels: Vec<f32> = mono
            .chunks_exact(frame_len)
            .map(|frame| {
                let rms = compute_rms(frame);
                if dbfs(rms) < params.gate_dbfs {
                    0.0
                } else {
                    rms
                }
            })
            .collect();

        let mut nonzero: Vec<f32> = levels.iter().copied().filter(|&rms| rms > 0.0).collect();
        let reference = reference_level(&mut nonzero, params.percentile);

        let mut smoother = AttackRelease::from_params(params.frame_ms, params);
        for level in &mut levels {
            *level = smoother.next((*level / reference).clamp(0.0, 1.0));
        }

        let step = params.frame_ms / 1000.0;
        let samples = levels
            .into_iter()
            .enumerate()
            .map(|(index, level)| EnvelopeSample {
                time: index as f32 * step,
                level,
            })
            .collect();

        Self {
            samples,
            duration_seconds,
            frame_ms: params.frame_ms,
        }
    }

    pub fn from_decoded(audio: &DecodedAudio, params: &EnvelopeParams) -> Self {
        Self::compute(&audio.samples, audio.channels, audio.sample_rate, params)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Level of the last sample at or before `time`; 0 before the first one.
    pub fn level_at(&self, time: f32) -> f32 {
        let index = self.samples.partition_point(|sample| sample.time <= time);
        match index {
            0 => 0.0,
            index => self.samples[index - 1].level,
        }
    }

    pub fn peak(&self) -> f32 {
        self.samples
            .iter()
            .map(|sample| sample.level)
            .fold(0.0, f32::max)
    }
}

/// Identity of a file's content as far as the cache is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> std::result::Result<Self, DecodeError> {
        let io_error = |source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let metadata = std::fs::metadata(path).map_err(io_error)?;
        let modified = metadata.modified().map_err(io_error)?;
        Ok(Self {
            path: path.to_path_buf(),
            modified,
            size: metadata.len(),
        })
    }
}

/// Decodes clips and memoises their envelopes by [`Fingerprint`].
pub struct EnvelopeExtractor {
    decoder: Box<dyn AudioDecoder>,
    params: EnvelopeParams,
    cache: Mutex<HashMap<Fingerprint, Arc<Envelope>>>,
}

impl EnvelopeExtractor {
    pub fn new(params: EnvelopeParams) -> Self {
        Self::with_decoder(params, Box::new(SymphoniaDecoder))
    }

    pub fn with_decoder(params: EnvelopeParams, decoder: Box<dyn AudioDecoder>) -> Self {
        Self {
            decoder,
            params,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &EnvelopeParams {
        &self.params
    }

    /// Returns the envelope of `path`, decoding only when the file's
    /// fingerprint is not cached yet.
    pub fn envelope(&self, path: &Path) -> Result<Arc<Envelope>> {
        let fingerprint = Fingerprint::of(path)?;
        if let Some(hit) = self.lock_cache()?.get(&fingerprint) {
            return Ok(Arc::clone(hit));
        }

        // Decoding runs outside the lock so other clips are not held up.
        let audio = self.decoder.decode(path)?;
        let envelope = Arc::new(Envelope::from_decoded(&audio, &self.params));
        tracing::debug!(
            ?path,
            frames = envelope.len(),
            duration = envelope.duration_seconds,
            "computed envelope"
        );

        let mut cache = self.lock_cache()?;
        cache.retain(|key, _| key.path != fingerprint.path);
        let entry = cache.entry(fingerprint).or_insert(envelope);
        Ok(Arc::clone(entry))
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    fn lock_cache(&self) -> Result<MutexGuard<'_, HashMap<Fingerprint, Arc<Envelope>>>> {
        self.cache
            .lock()
            .map_err(|_| LipsyncError::msg("envelope cache has been poisoned"))
    }
}

impl std::fmt::Debug for EnvelopeExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeExtractor")
            .field("params", &self.params)
            .field("cached", &self.cached_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    const RATE: u32 = 8_000;

    fn burst_clip() -> Vec<f32> {
        // 1 s of silence with a 100 ms full-scale square burst centred at 0.5 s.
        let mut clip = vec![0.0_f32; RATE as usize];
        let start = (0.45 * RATE as f32) as usize;
        let end = (0.55 * RATE as f32) as usize;
        for (i, sample) in clip[start..end].iter_mut().enumerate() {
            *sample = if (i / 4) % 2 == 0 { 1.0 } else { -1.0 };
        }
        clip
    }

    struct CountingDecoder {
        calls: Arc<AtomicUsize>,
    }

    impl AudioDecoder for CountingDecoder {
        fn decode(&self, _path: &Path) -> std::result::Result<DecodedAudio, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DecodedAudio {
                samples: burst_clip(),
                sample_rate: RATE,
                channels: 1,
                bits_per_sample: Some(16),
            })
        }
    }

    fn counting_extractor() -> (EnvelopeExtractor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = CountingDecoder {
            calls: calls.clone(),
        };
        (
            EnvelopeExtractor::with_decoder(EnvelopeParams::default(), Box::new(decoder)),
            calls,
        )
    }

    #[test]
    fn silence_produces_zero_levels() {
        let envelope = Envelope::compute(&vec![0.0; 48_000], 2, 48_000, &EnvelopeParams::default());
        assert!(!envelope.is_empty());
        assert!(envelope.samples.iter().all(|s| s.level == 0.0));
        assert!((envelope.duration_seconds - 0.5).abs() < 1e-6);
    }

    #[test]
    fn trailing_partial_frame_is_dropped() {
        // 30 ms at 1 kHz is 30 samples; 95 samples give three full frames.
        let envelope = Envelope::compute(&vec![0.5; 95], 1, 1_000, &EnvelopeParams::default());
        assert_eq!(envelope.len(), 3);
        assert!((envelope.samples[2].time - 0.06).abs() < 1e-6);
    }

    #[test]
    fn sustained_tone_rises_monotonically_within_bounds() {
        // Full-scale square wave whose period divides the frame length.
        let tone: Vec<f32> = (0..RATE)
            .map(|i| if (i / 4) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let envelope = Envelope::compute(&tone, 1, RATE, &EnvelopeParams::default());

        let mut previous = 0.0;
        for sample in &envelope.samples {
            assert!((0.0..=1.0).contains(&sample.level));
            assert!(sample.level >= previous - 1e-6);
            previous = sample.level;
        }
        assert!(previous > 0.9);
    }

    #[test]
    fn burst_is_tracked_with_attack_and_release_lag() {
        let params = EnvelopeParams::default();
        let envelope = Envelope::compute(&burst_clip(), 1, RATE, &params);

        // Frames that end before the burst starts stay at zero.
        for sample in envelope.samples.iter().filter(|s| s.time + 0.03 < 0.449) {
            assert!(sample.level < 0.01, "unexpected level at {}", sample.time);
        }

        let first_rise = envelope
            .samples
            .iter()
            .find(|s| s.level > 0.1)
            .expect("burst should raise the envelope");
        assert!(first_rise.time + 0.03 > 0.45);
        assert!(first_rise.time - 0.45 < params.attack_ms / 1000.0);

        let peak = envelope.peak();
        assert!(peak > 0.5);

        // After the burst the level decays by 1/e within roughly one release constant.
        let fall_point = envelope
            .samples
            .iter()
            .filter(|s| s.time >= 0.55)
            .find(|s| s.level < peak / std::f32::consts::E)
            .expect("envelope should fall after the burst");
        let lag = fall_point.time - 0.55;
        assert!(lag > 0.0 && lag < 2.0 * params.release_ms / 1000.0, "lag {lag}");

        let closed = 5.0;
        let mapper = crate::servo::ServoMapper::new(crate::servo::Geometry::new(closed, 65.0));
        assert!(mapper.angle(envelope.level_at(0.5)) > closed);
        assert_eq!(mapper.angle(envelope.level_at(0.1)), closed);
    }

    #[test]
    fn level_at_uses_previous_sample() {
        let envelope = Envelope {
            samples: vec![
                EnvelopeSample { time: 0.0, level: 0.2 },
                EnvelopeSample { time: 0.03, level: 0.4 },
            ],
            duration_seconds: 0.06,
            frame_ms: 30.0,
        };
        assert_eq!(envelope.level_at(-1.0), 0.0);
        assert_eq!(envelope.level_at(0.01), 0.2);
        assert_eq!(envelope.level_at(0.5), 0.4);
    }

    #[test]
    fn cache_returns_same_instance_for_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp3");
        std::fs::write(&path, b"stand-in").unwrap();
        let (extractor, calls) = counting_extractor();

        let first = extractor.envelope(&path).unwrap();
        let second = extractor.envelope(&path).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, *second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn modification_time_change_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp3");
        std::fs::write(&path, b"stand-in").unwrap();
        let (extractor, calls) = counting_extractor();

        let first = extractor.envelope(&path).unwrap();

        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        drop(file);

        let second = extractor.envelope(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(extractor.cached_len(), 1);
    }

    #[test]
    fn sub_second_modification_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp3");
        std::fs::write(&path, b"stand-in").unwrap();
        let (extractor, calls) = counting_extractor();
        let touch = |millis: u64| {
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(UNIX_EPOCH + Duration::from_millis(millis))
                .unwrap();
        };

        touch(1_000_100);
        extractor.envelope(&path).unwrap();
        touch(1_000_900);
        extractor.envelope(&path).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn decode_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mp3");
        std::fs::write(&path, b"not audio").unwrap();
        let extractor = EnvelopeExtractor::new(EnvelopeParams::default());

        let err = extractor.envelope(&path).unwrap_err();
        assert!(matches!(err, LipsyncError::Decode(_)));
    }

    #[test]
    fn decodes_pcm_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burst.wav");
        write_wav(&path, &burst_clip(), RATE);

        let extractor = EnvelopeExtractor::new(EnvelopeParams::default());
        let envelope = extractor.envelope(&path).unwrap();
        assert!((envelope.duration_seconds - 1.0).abs() < 0.01);
        assert!(envelope.peak() > 0.5);
        assert!(envelope.level_at(0.1) < 0.01);
    }

    fn write_wav(path: &Path, samples: &[f32], rate: u32) {
        let data_len = (samples.len() * 2) as u32;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }
}
