use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analysis::EnvelopeParams;
use crate::servo::Geometry;
use crate::{LipsyncError, Result};

/// ALSA device the player and the effects process fall back to.
pub const DEFAULT_ALSA_DEVICE: &str = "plughw:1,0";

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sink handed to the external player first.
    pub output_device: String,
    pub envelope: EnvelopeParams,
    pub playback: PlaybackConfig,
    pub actuator: ActuatorConfig,
    pub live: LiveConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_device: DEFAULT_ALSA_DEVICE.to_owned(),
            envelope: EnvelopeParams::default(),
            playback: PlaybackConfig::default(),
            actuator: ActuatorConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads a JSON file; missing fields take their defaults. The result is
    /// validated before it is returned.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Like [`AppConfig::load`] but returns the defaults when `path` does not
    /// exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let EnvelopeParams {
            frame_ms,
            attack_ms,
            release_ms,
            percentile,
            ..
        } = self.envelope;
        if frame_ms <= 0.0 {
            return Err(LipsyncError::config("envelope.frame_ms must be positive"));
        }
        if attack_ms < 0.0 || release_ms < 0.0 {
            return Err(LipsyncError::config(
                "envelope attack and release times must not be negative",
            ));
        }
        if !(percentile > 0.0 && percentile <= 100.0) {
            return Err(LipsyncError::config("envelope.percentile must lie in (0, 100]"));
        }
        if self.playback.lead_ms > MAX_LEAD_MS {
            return Err(LipsyncError::config(format!(
                "playback.lead_ms must lie within 0..={MAX_LEAD_MS}"
            )));
        }
        self.actuator.geometry().validate()?;
        self.live.direct.validate()?;
        self.live.effects.validate()?;
        Ok(())
    }
}

pub const MAX_LEAD_MS: u64 = 1000;

/// Settings for clip playback with motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How far motion runs ahead of the audio timeline, absorbing the sink's
    /// output latency.
    pub lead_ms: u64,
    /// A player that exits within this window counts as failed to start.
    pub start_wait_ms: u64,
    /// Devices tried after `output_device`, in order.
    pub fallback_devices: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            lead_ms: 180,
            start_wait_ms: 120,
            fallback_devices: ["plughw:1,0", "default", "plughw:0,0", "plughw:2,0", "plughw:3,0"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Servo wiring and the daemon that drives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub servo_gpio: Option<u32>,
    pub power_gpio: Option<u32>,
    pub closed_angle: f32,
    pub open_angle: f32,
    pub pigpiod_addr: String,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        let geometry = Geometry::default();
        Self {
            servo_gpio: Some(17),
            power_gpio: Some(23),
            closed_angle: geometry.closed_angle,
            open_angle: geometry.open_angle,
            pigpiod_addr: "127.0.0.1:8888".to_owned(),
        }
    }
}

impl ActuatorConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.closed_angle, self.open_angle)
    }
}

/// Whether live audio bypasses or goes through the effects process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveMode {
    Direct,
    #[default]
    Effects,
}

impl std::str::FromStr for LiveMode {
    type Err = LipsyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "effects" | "fx" => Ok(Self::Effects),
            other => Err(LipsyncError::config(format!("unknown live mode `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub mode: LiveMode,
    pub direct: DirectConfig,
    pub effects: EffectsConfig,
}

/// Microphone straight to the speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub input_gain_db: f32,
    pub output_gain_db: f32,
    pub low_latency: bool,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 256,
            input_device: None,
            output_device: None,
            input_gain_db: 0.0,
            output_gain_db: 0.0,
            low_latency: true,
        }
    }
}

impl DirectConfig {
    fn validate(&self) -> Result<()> {
        validate_stream("live.direct", self.sample_rate, self.block_size)
    }
}

/// Microphone through the external effects process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_device: Option<String>,
    pub input_gain_db: f32,
    /// ALSA sink the effects process plays into.
    pub alsa_out: String,
    pub pitch_semitones: f32,
    pub reverb: f32,
    pub bass_db: f32,
    pub treble_db: f32,
    pub sox_buffer_frames: usize,
    pub low_latency: bool,
    /// Holds motion back by roughly the effects chain latency.
    pub servo_delay_ms: f32,
    /// Name of the last preset applied, if any.
    pub preset: Option<String>,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 256,
            input_device: None,
            input_gain_db: 0.0,
            alsa_out: DEFAULT_ALSA_DEVICE.to_owned(),
            pitch_semitones: 0.0,
            reverb: 10.0,
            bass_db: 0.0,
            treble_db: 0.0,
            sox_buffer_frames: 256,
            low_latency: true,
            servo_delay_ms: 180.0,
            preset: None,
        }
    }
}

impl EffectsConfig {
    /// Copies a named voice preset into the effect parameters. Unknown names
    /// apply `neutral`.
    pub fn apply_preset(&mut self, name: &str) {
        let (name, preset) = match find_preset(name) {
            Some(found) => found,
            None => {
                tracing::warn!(preset = name, "unknown preset, using neutral");
                ("neutral", EffectsPreset::NEUTRAL)
            }
        };
        self.pitch_semitones = preset.pitch_semitones;
        self.reverb = preset.reverb;
        self.bass_db = preset.bass_db;
        self.treble_db = preset.treble_db;
        self.preset = Some(name.to_owned());
    }

    fn validate(&self) -> Result<()> {
        validate_stream("live.effects", self.sample_rate, self.block_size)?;
        if self.servo_delay_ms < 0.0 {
            return Err(LipsyncError::config(
                "live.effects.servo_delay_ms must not be negative",
            ));
        }
        if self.reverb < 0.0 {
            return Err(LipsyncError::config("live.effects.reverb must not be negative"));
        }
        Ok(())
    }
}

fn validate_stream(section: &str, sample_rate: u32, block_size: usize) -> Result<()> {
    if sample_rate == 0 {
        return Err(LipsyncError::config(format!(
            "{section}.sample_rate must be positive"
        )));
    }
    if block_size == 0 {
        return Err(LipsyncError::config(format!(
            "{section}.block_size must be positive"
        )));
    }
    Ok(())
}

/// Voice colouring applied by the effects process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectsPreset {
    pub pitch_semitones: f32,
    pub reverb: f32,
    pub bass_db: f32,
    pub treble_db: f32,
}

impl EffectsPreset {
    pub const NEUTRAL: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    const fn new(pitch_semitones: f32, reverb: f32, bass_db: f32, treble_db: f32) -> Self {
        Self {
            pitch_semitones,
            reverb,
            bass_db,
            treble_db,
        }
    }
}

pub const PRESETS: &[(&str, EffectsPreset)] = &[
    ("neutral", EffectsPreset::NEUTRAL),
    ("daemon", EffectsPreset::new(-8.0, 18.0, 6.0, -2.0)),
    ("monster", EffectsPreset::new(-12.0, 12.0, 9.0, -3.0)),
    ("cave", EffectsPreset::new(-4.0, 35.0, 2.0, -4.0)),
    ("helium", EffectsPreset::new(7.0, 8.0, -3.0, 5.0)),
    ("funky", EffectsPreset::new(3.0, 10.0, 2.0, 6.0)),
    ("whisper", EffectsPreset::new(0.0, 45.0, -6.0, 2.0)),
];

/// Case-insensitive preset lookup.
pub fn find_preset(name: &str) -> Option<(&'static str, EffectsPreset)> {
    let name = name.trim();
    PRESETS
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.playback.lead_ms, 180);
        assert_eq!(config.actuator.servo_gpio, Some(17));
        assert_eq!(config.live.mode, LiveMode::Effects);
        assert_eq!(config.live.effects.servo_delay_ms, 180.0);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "actuator": { "open_angle": 80 }, "live": { "mode": "direct" } }"#,
        )
        .unwrap();
        assert_eq!(config.actuator.open_angle, 80.0);
        assert_eq!(config.actuator.closed_angle, 5.0);
        assert_eq!(config.live.mode, LiveMode::Direct);
        assert_eq!(config.live.direct.block_size, 256);
        assert_eq!(config.envelope, EnvelopeParams::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AppConfig::default();
        config.actuator.closed_angle = 90.0;
        config.actuator.open_angle = 30.0;
        assert!(matches!(config.validate(), Err(LipsyncError::Config(_))));

        let mut config = AppConfig::default();
        config.playback.lead_ms = 1500;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.live.effects.block_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.envelope.percentile = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_load_preserve_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mouthsync.json");

        let mut config = AppConfig::default();
        config.output_device = "hw:2,0".into();
        config.live.effects.apply_preset("cave");
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn presets_fill_effect_parameters() {
        let mut effects = EffectsConfig::default();
        effects.apply_preset("Monster");
        assert_eq!(effects.pitch_semitones, -12.0);
        assert_eq!(effects.reverb, 12.0);
        assert_eq!(effects.bass_db, 9.0);
        assert_eq!(effects.treble_db, -3.0);
        assert_eq!(effects.preset.as_deref(), Some("monster"));

        effects.apply_preset("no-such-voice");
        assert_eq!(effects.pitch_semitones, 0.0);
        assert_eq!(effects.reverb, 0.0);
        assert_eq!(effects.preset.as_deref(), Some("neutral"));
    }

    #[test]
    fn live_mode_parses_from_text() {
        assert_eq!("Direct".parse::<LiveMode>().unwrap(), LiveMode::Direct);
        assert_eq!("effects".parse::<LiveMode>().unwrap(), LiveMode::Effects);
        assert!("karaoke".parse::<LiveMode>().is_err());
    }
}
