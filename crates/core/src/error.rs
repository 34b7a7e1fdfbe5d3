use std::path::PathBuf;

use crate::session::SessionKind;

/// Result alias that carries the custom [`LipsyncError`] type.
pub type Result<T> = std::result::Result<T, LipsyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LipsyncError {
    /// The clip could not be decoded. Callers fall back to audio-only playback.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The external player exited during its startup window on every device.
    #[error("playback could not be started: {0}")]
    PlaybackStart(String),
    /// A session is already active; new starts are rejected, never queued.
    #[error("a {active} session is already running")]
    AlreadyRunning { active: SessionKind },
    /// A stop request arrived while the session was still starting.
    #[error("{0} session start was cancelled by a stop request")]
    StartCancelled(SessionKind),
    #[error(transparent)]
    ActuatorWrite(#[from] ActuatorError),
    /// The effects process could not be spawned or fed.
    #[error("effects process: {0}")]
    DspProcess(String),
    /// The capture/render backend refused to open a stream.
    #[error("audio stream: {0}")]
    Stream(String),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LipsyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}

impl From<&str> for LipsyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LipsyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure to turn an audio file into PCM samples.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported audio in {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },
    #[error("corrupt audio in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Failure reported by an actuator backend.
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("actuator transport: {0}")]
    Transport(#[from] std::io::Error),
    /// The device answered with a negative status code.
    #[error("actuator rejected command {command} with status {status}")]
    Rejected { command: u32, status: i32 },
}
