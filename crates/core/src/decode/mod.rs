//! Audio decode source used by the offline envelope extractor.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use crate::DecodeError;

/// PCM produced by a decoder: interleaved `f32` in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
    /// Bit depth reported by the container, when known.
    pub bits_per_sample: Option<u32>,
}

impl DecodedAudio {
    /// Down-mixes to mono by averaging channels.
    pub fn to_mono(&self) -> Vec<f32> {
        downmix(&self.samples, self.channels)
    }

    /// Number of sample frames (one frame spans all channels).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Averages interleaved channels into a mono signal.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Turns an audio file into PCM.
pub trait AudioDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedAudio, DecodeError>;
}

/// Decoder backed by symphonia's default format and codec registries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedAudio, DecodeError> {
        let file = File::open(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let unsupported = |reason: String| DecodeError::Unsupported {
            path: path.to_path_buf(),
            reason,
        };
        let corrupt = |reason: String| DecodeError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|err| unsupported(err.to_string()))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| unsupported("no default track".to_string()))?;
        let track_id = track.id;
        let mut decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|err| unsupported(err.to_string()))?;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;
        let mut channels = track.codec_params.channels.map(|c| c.count());
        let bits_per_sample = track.codec_params.bits_per_sample;

        let mut sample_buf: Option<SampleBuffer<f32>> = None;
        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(_)) => break,
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(err) => return Err(corrupt(err.to_string())),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A damaged frame is skipped rather than failing the clip.
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::debug!(?path, reason, "skipping undecodable packet");
                    continue;
                }
                Err(err) => return Err(corrupt(err.to_string())),
            };
            if channels.is_none() {
                channels = Some(decoded.spec().channels.count());
            }
            let buffer = sample_buf.get_or_insert_with(|| {
                SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec())
            });
            buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buffer.samples());
        }

        let channels = channels
            .filter(|&count| count > 0)
            .ok_or_else(|| unsupported("unknown channel count".to_string()))?;

        tracing::debug!(
            ?path,
            sample_rate,
            channels,
            frames = samples.len() / channels,
            "decoded clip"
        );

        Ok(DecodedAudio {
            samples,
            sample_rate,
            channels,
            bits_per_sample,
        })
    }
}
