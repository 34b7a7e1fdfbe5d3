use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mouthsync_core::live::AudioBackend;
#[cfg(not(feature = "cpal"))]
use mouthsync_core::live::{ActiveStream, StreamCallback, StreamRequest};
use mouthsync_core::servo::{DisabledActuator, MemoryActuator, PigpiodActuator};
use mouthsync_core::{
    Actuator, AppConfig, EnvelopeExtractor, LipsyncError, LiveMode, Result, SessionRegistry,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_or_default(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Envelope { input, json } => run_envelope(&config, &input, json.as_deref()),
        Commands::Play { clip } => run_play(&config, &clip, cli.dry_run),
        Commands::Live { mode, preset } => {
            run_live(config, mode.as_deref(), preset.as_deref(), cli.dry_run)
        }
        Commands::Config { write } => run_config(&config, write.as_deref()),
    }
}

fn run_envelope(config: &AppConfig, input: &Path, json: Option<&Path>) -> Result<()> {
    tracing::info!(?input, "extracting envelope");
    let extractor = EnvelopeExtractor::new(config.envelope);
    let envelope = extractor.envelope(input)?;

    match json {
        Some(output) => {
            std::fs::write(output, serde_json::to_string_pretty(&*envelope)?)?;
            tracing::info!(?output, frames = envelope.len(), "envelope written");
        }
        None => println!(
            "{}: {:.2}s, {} frames of {} ms, peak level {:.2}",
            input.display(),
            envelope.duration_seconds,
            envelope.len(),
            envelope.frame_ms,
            envelope.peak()
        ),
    }
    Ok(())
}

fn run_play(config: &AppConfig, clip: &Path, dry_run: bool) -> Result<()> {
    let registry = build_registry(config, dry_run);
    let interrupted = interrupt_channel()?;

    let id = registry.start_playback(clip)?;
    tracing::info!(%id, ?clip, "playing, press Ctrl+C to stop");
    loop {
        match interrupted.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if registry.status()?.is_idle() {
                    tracing::info!("clip finished");
                    break;
                }
            }
        }
    }
    registry.stop_all()
}

fn run_live(
    mut config: AppConfig,
    mode: Option<&str>,
    preset: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    if let Some(mode) = mode {
        config.live.mode = mode.parse::<LiveMode>()?;
    }
    if let Some(preset) = preset {
        config.live.effects.apply_preset(preset);
    }
    config.validate()?;

    let registry = build_registry(&config, dry_run);
    let interrupted = interrupt_channel()?;

    let id = registry.start_live(&config.live)?;
    tracing::info!(%id, mode = ?config.live.mode, preset, "live, press Ctrl+C to stop");
    // Either a signal or a dropped sender ends the session.
    let _ = interrupted.recv();
    registry.stop_all()
}

fn run_config(config: &AppConfig, write: Option<&Path>) -> Result<()> {
    config.validate()?;
    match write {
        Some(path) => {
            config.save(path)?;
            tracing::info!(?path, "configuration written");
        }
        None => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

fn build_registry(config: &AppConfig, dry_run: bool) -> SessionRegistry {
    SessionRegistry::from_config(config, actuator(config, dry_run), audio_backend())
}

fn actuator(config: &AppConfig, dry_run: bool) -> Arc<dyn Actuator> {
    if dry_run {
        tracing::info!("dry run, servo commands are recorded only");
        return Arc::new(MemoryActuator::new());
    }
    let wiring = &config.actuator;
    match PigpiodActuator::connect(wiring.pigpiod_addr.as_str(), wiring.servo_gpio, wiring.power_gpio) {
        Ok(actuator) => Arc::new(actuator),
        Err(err) => {
            tracing::warn!(%err, addr = %wiring.pigpiod_addr, "pigpiod unavailable, servo disabled");
            Arc::new(DisabledActuator)
        }
    }
}

#[cfg(feature = "cpal")]
fn audio_backend() -> Arc<dyn AudioBackend> {
    Arc::new(mouthsync_core::live::cpal_backend::CpalBackend)
}

#[cfg(not(feature = "cpal"))]
fn audio_backend() -> Arc<dyn AudioBackend> {
    Arc::new(NoAudioBackend)
}

/// Stand-in used when the binary is built without an audio backend.
#[cfg(not(feature = "cpal"))]
struct NoAudioBackend;

#[cfg(not(feature = "cpal"))]
impl AudioBackend for NoAudioBackend {
    fn open(&self, _request: &StreamRequest, _callback: StreamCallback) -> Result<Box<dyn ActiveStream>> {
        Err(LipsyncError::Stream(
            "built without audio capture; rebuild with `--features cpal`".into(),
        ))
    }
}

fn interrupt_channel() -> Result<Receiver<()>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| LipsyncError::msg(format!("cannot install Ctrl+C handler: {err}")))?;
    Ok(rx)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive mouth servo", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply for anything missing.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Record servo commands in memory instead of talking to pigpiod.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute the loudness envelope of a clip.
    Envelope {
        /// Audio file to analyse.
        input: PathBuf,
        /// Write the envelope as JSON instead of printing a summary.
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Play a clip and move the mouth along with it.
    Play {
        clip: PathBuf,
    },
    /// Drive the mouth from the microphone until interrupted.
    Live {
        /// `direct` or `effects`; overrides the configured mode.
        #[arg(short, long)]
        mode: Option<String>,
        /// Voice preset for effects mode.
        #[arg(short, long)]
        preset: Option<String>,
    },
    /// Print the effective configuration, or write it to a file.
    Config {
        #[arg(long)]
        write: Option<PathBuf>,
    },
}
