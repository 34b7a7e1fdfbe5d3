//! The single owner of running sessions.
//!
//! One mutex guards both slots so start requests check and claim a slot
//! atomically. Slow work (decoding, spawning processes, joining threads)
//! happens outside the lock while the slot is marked `Starting` or
//! `Stopping`, so status queries never wait on it.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use crate::config::{AppConfig, LiveConfig};
use crate::envelope::EnvelopeExtractor;
use crate::live::{AudioBackend, EffectsLauncher, LiveController, LiveSession, SoxLauncher};
use crate::playback::{Mpg123Launcher, PlaybackController, PlaybackLauncher, PlaybackSession};
use crate::servo::{Actuator, ServoDriver};
use crate::session::{CancelToken, SessionId, SessionKind, SessionState};
use crate::{LipsyncError, Result};

/// Operations the registry needs from either session kind.
trait Managed {
    fn id(&self) -> SessionId;
    /// `true` when the session ended by itself and only needs reaping.
    fn is_finished(&self) -> bool;
    fn stop(self);
    fn reap(self);
}

impl Managed for PlaybackSession {
    fn id(&self) -> SessionId {
        PlaybackSession::id(self)
    }

    fn is_finished(&self) -> bool {
        PlaybackSession::is_finished(self)
    }

    fn stop(self) {
        PlaybackSession::stop(self)
    }

    fn reap(self) {
        PlaybackSession::reap(self)
    }
}

impl Managed for LiveSession {
    fn id(&self) -> SessionId {
        LiveSession::id(self)
    }

    fn is_finished(&self) -> bool {
        false
    }

    fn stop(self) {
        LiveSession::stop(self)
    }

    fn reap(self) {
        LiveSession::stop(self)
    }
}

enum Slot<S> {
    Idle,
    Starting { id: SessionId, cancel: CancelToken },
    Running(S),
    Stopping(SessionId),
}

impl<S: Managed> Slot<S> {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Starting { .. } => SessionState::Starting,
            Self::Running(_) => SessionState::Running,
            Self::Stopping(_) => SessionState::Stopping,
        }
    }

    fn id(&self) -> Option<SessionId> {
        match self {
            Self::Idle => None,
            Self::Starting { id, .. } | Self::Stopping(id) => Some(*id),
            Self::Running(session) => Some(session.id()),
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Takes a session that finished on its own out of the slot.
    fn take_finished(&mut self) -> Option<S> {
        if !matches!(self, Self::Running(session) if session.is_finished()) {
            return None;
        }
        match std::mem::replace(self, Self::Idle) {
            Self::Running(session) => Some(session),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Clears the slot if it still belongs to `id`.
    fn release(&mut self, id: SessionId) {
        if self.id() == Some(id) && !matches!(self, Self::Running(_)) {
            *self = Self::Idle;
        }
    }
}

struct Slots {
    playback: Slot<PlaybackSession>,
    live: Slot<LiveSession>,
}

impl Slots {
    fn active_kind(&self) -> Option<SessionKind> {
        if self.playback.is_active() {
            Some(SessionKind::Playback)
        } else if self.live.is_active() {
            Some(SessionKind::Live)
        } else {
            None
        }
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub state: SessionState,
    pub id: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub playback: SlotStatus,
    pub live: SlotStatus,
}

impl RegistryStatus {
    pub fn is_idle(&self) -> bool {
        self.playback.state == SessionState::Idle && self.live.state == SessionState::Idle
    }
}

/// Starts, stops and tracks at most one session at a time.
///
/// A start is rejected with [`LipsyncError::AlreadyRunning`] while any
/// session, of either kind, is starting, running or stopping: both drive the
/// same servo.
pub struct SessionRegistry {
    playback: PlaybackController,
    live: LiveController,
    slots: Mutex<Slots>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(playback: PlaybackController, live: LiveController) -> Self {
        Self {
            playback,
            live,
            slots: Mutex::new(Slots {
                playback: Slot::Idle,
                live: Slot::Idle,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Wires the default external programs (`mpg123`, `sox`) around the
    /// given actuator and audio backend.
    pub fn from_config(
        config: &AppConfig,
        actuator: Arc<dyn Actuator>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        Self::with_launchers(
            config,
            actuator,
            backend,
            Arc::new(Mpg123Launcher::default()),
            Arc::new(SoxLauncher::default()),
        )
    }

    pub fn with_launchers(
        config: &AppConfig,
        actuator: Arc<dyn Actuator>,
        backend: Arc<dyn AudioBackend>,
        player: Arc<dyn PlaybackLauncher>,
        effects: Arc<dyn EffectsLauncher>,
    ) -> Self {
        let driver = Arc::new(ServoDriver::new(actuator, config.actuator.geometry()));
        let playback = PlaybackController::new(
            Arc::new(EnvelopeExtractor::new(config.envelope)),
            player,
            driver.clone(),
            &config.output_device,
            &config.playback,
        );
        let live = LiveController::new(backend, effects, driver, config.envelope);
        Self::new(playback, live)
    }

    pub fn playback_controller(&self) -> &PlaybackController {
        &self.playback
    }

    /// Starts playing `clip` with motion.
    pub fn start_playback(&self, clip: &Path) -> Result<SessionId> {
        let playback = &self.playback;
        self.start(
            SessionKind::Playback,
            |slots| &mut slots.playback,
            |id, cancel| playback.launch(id, clip, cancel),
        )
    }

    pub fn stop_playback(&self) -> Result<()> {
        self.stop(SessionKind::Playback, |slots| &mut slots.playback)
    }

    /// Starts a live session in `config.mode`.
    pub fn start_live(&self, config: &LiveConfig) -> Result<SessionId> {
        let live = &self.live;
        self.start(
            SessionKind::Live,
            |slots| &mut slots.live,
            |id, _cancel| live.launch(id, config),
        )
    }

    pub fn stop_live(&self) -> Result<()> {
        self.stop(SessionKind::Live, |slots| &mut slots.live)
    }

    /// Stops whatever is running. Both kinds are attempted even if the first
    /// stop fails; the first error is returned.
    pub fn stop_all(&self) -> Result<()> {
        let playback = self.stop_playback();
        let live = self.stop_live();
        playback.and(live)
    }

    pub fn status(&self) -> Result<RegistryStatus> {
        self.reap_finished()?;
        let slots = self.lock()?;
        Ok(RegistryStatus {
            playback: SlotStatus {
                state: slots.playback.state(),
                id: slots.playback.id(),
            },
            live: SlotStatus {
                state: slots.live.state(),
                id: slots.live.id(),
            },
        })
    }

    fn start<S, Select, Launch>(&self, kind: SessionKind, select: Select, launch: Launch) -> Result<SessionId>
    where
        S: Managed,
        Select: Fn(&mut Slots) -> &mut Slot<S>,
        Launch: FnOnce(SessionId, CancelToken) -> Result<S>,
    {
        self.reap_finished()?;

        let (id, cancel) = {
            let mut slots = self.lock()?;
            if let Some(active) = slots.active_kind() {
                tracing::info!(requested = %kind, %active, "start rejected");
                return Err(LipsyncError::AlreadyRunning { active });
            }
            let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let cancel = CancelToken::new();
            *select(&mut *slots) = Slot::Starting {
                id,
                cancel: cancel.clone(),
            };
            (id, cancel)
        };

        let launched = launch(id, cancel.clone());

        let mut slots = match self.lock() {
            Ok(slots) => slots,
            Err(err) => {
                if let Ok(session) = launched {
                    session.stop();
                }
                return Err(err);
            }
        };
        let session = match launched {
            Ok(session) => session,
            Err(err) => {
                select(&mut *slots).release(id);
                tracing::warn!(%kind, %id, %err, "start failed");
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            *select(&mut *slots) = Slot::Stopping(id);
            drop(slots);
            tracing::info!(%kind, %id, "stop requested during start");
            session.stop();
            if let Ok(mut slots) = self.lock() {
                select(&mut *slots).release(id);
            }
            return Err(LipsyncError::StartCancelled(kind));
        }

        *select(&mut *slots) = Slot::Running(session);
        Ok(id)
    }

    fn stop<S, Select>(&self, kind: SessionKind, select: Select) -> Result<()>
    where
        S: Managed,
        Select: Fn(&mut Slots) -> &mut Slot<S>,
    {
        let session = {
            let mut slots = self.lock()?;
            let slot = select(&mut *slots);
            match std::mem::replace(slot, Slot::Idle) {
                Slot::Idle => return Ok(()),
                Slot::Starting { id, cancel } => {
                    // The start sees the cancellation and tears down itself.
                    cancel.cancel();
                    *slot = Slot::Starting { id, cancel };
                    return Ok(());
                }
                Slot::Stopping(id) => {
                    *slot = Slot::Stopping(id);
                    return Ok(());
                }
                Slot::Running(session) => {
                    *slot = Slot::Stopping(session.id());
                    session
                }
            }
        };

        let id = session.id();
        if session.is_finished() {
            session.reap();
        } else {
            tracing::info!(%kind, %id, "stopping session");
            session.stop();
        }
        select(&mut *self.lock()?).release(id);
        Ok(())
    }

    /// Reaps sessions whose work ended on its own.
    fn reap_finished(&self) -> Result<()> {
        let finished = {
            let mut slots = self.lock()?;
            (slots.playback.take_finished(), slots.live.take_finished())
        };
        if let Some(session) = finished.0 {
            session.reap();
        }
        if let Some(session) = finished.1 {
            Managed::reap(session);
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slots>> {
        self.slots
            .lock()
            .map_err(|_| LipsyncError::msg("session registry has been poisoned"))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("playback", &self.playback)
            .field("live", &self.live)
            .finish()
    }
}
