//! Core library for the mouthsync servo engine.
//!
//! The crate turns audio into mouth motion. Clips are decoded and reduced to
//! a loudness envelope ahead of time ([`envelope`]); live input is tracked
//! block by block inside the audio callback ([`tracker`], [`live`]). Both
//! paths drive the same servo through [`servo::ServoDriver`], and the
//! [`SessionRegistry`] makes sure only one session owns it at a time.

pub mod analysis;
pub mod config;
pub mod decode;
pub mod delay;
pub mod envelope;
pub mod error;
pub mod live;
pub mod playback;
pub mod registry;
pub mod servo;
pub mod session;
pub mod tracker;

pub use analysis::EnvelopeParams;
pub use config::{AppConfig, LiveMode};
pub use decode::{AudioDecoder, DecodedAudio, SymphoniaDecoder};
pub use delay::DelayLine;
pub use envelope::{Envelope, EnvelopeExtractor, EnvelopeSample};
pub use error::{ActuatorError, DecodeError, LipsyncError, Result};
pub use registry::{RegistryStatus, SessionRegistry};
pub use servo::{Actuator, Geometry, ServoDriver, ServoMapper};
pub use session::{CancelToken, SessionId, SessionKind, SessionState};
pub use tracker::EnvelopeTracker;
