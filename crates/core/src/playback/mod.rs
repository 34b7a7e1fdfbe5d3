//! Clip playback through an external player with a motion thread that
//! replays the clip's envelope on the servo.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::PlaybackConfig;
use crate::envelope::{Envelope, EnvelopeExtractor};
use crate::servo::{ServoDriver, PARK_HOLD};
use crate::session::{join_with_timeout, CancelToken, SessionId};
use crate::{LipsyncError, Result};

/// Pause after the closed pulse before the envelope clock starts.
pub const SETTLE: Duration = Duration::from_millis(50);
/// Interval at which the motion thread checks whether the player exited.
pub const PROCESS_POLL: Duration = Duration::from_millis(20);
/// How long `stop` waits for the motion thread.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A running external player.
pub trait PlaybackProcess: Send {
    /// Returns `true` while the process is still running.
    fn poll(&mut self) -> bool;
    /// Ends the process if it is still running. Safe to call repeatedly.
    fn terminate(&mut self);
}

/// Starts an external player for a clip on a given sink.
pub trait PlaybackLauncher: Send + Sync {
    fn launch(&self, clip: &Path, device: &str) -> Result<Box<dyn PlaybackProcess>>;
}

/// Launches `mpg123` against an ALSA device.
#[derive(Debug, Clone)]
pub struct Mpg123Launcher {
    program: PathBuf,
}

impl Mpg123Launcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(clip: &Path, device: &str) -> Vec<String> {
        vec![
            "-q".into(),
            "-o".into(),
            "alsa".into(),
            "-a".into(),
            device.into(),
            clip.display().to_string(),
        ]
    }
}

impl Default for Mpg123Launcher {
    fn default() -> Self {
        Self::new("mpg123")
    }
}

impl PlaybackLauncher for Mpg123Launcher {
    fn launch(&self, clip: &Path, device: &str) -> Result<Box<dyn PlaybackProcess>> {
        let child = Command::new(&self.program)
            .args(Self::args(clip, device))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| {
                LipsyncError::PlaybackStart(format!(
                    "cannot run {}: {err}",
                    self.program.display()
                ))
            })?;
        Ok(Box::new(ChildProcess::new(child)))
    }
}

/// [`PlaybackProcess`] backed by an OS child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    exited: bool,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self {
            child,
            exited: false,
        }
    }
}

impl PlaybackProcess for ChildProcess {
    fn poll(&mut self) -> bool {
        if self.exited {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(%status, "player exited");
                self.exited = true;
                false
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(%err, "cannot query player status");
                self.exited = true;
                false
            }
        }
    }

    fn terminate(&mut self) {
        if !self.poll() {
            return;
        }
        if let Err(err) = self.child.kill() {
            tracing::warn!(%err, "failed to kill player");
        }
        if let Err(err) = self.child.wait() {
            tracing::warn!(%err, "failed to reap player");
        }
        self.exited = true;
    }
}

/// Devices to try in order: the configured one, then the fallbacks, with
/// duplicates and empty names removed.
pub fn candidate_devices(configured: &str, fallbacks: &[String]) -> Vec<String> {
    let mut devices: Vec<String> = Vec::with_capacity(fallbacks.len() + 1);
    for device in std::iter::once(configured).chain(fallbacks.iter().map(String::as_str)) {
        let device = device.trim();
        if !device.is_empty() && !devices.iter().any(|seen| seen == device) {
            devices.push(device.to_owned());
        }
    }
    devices
}

/// Launches the player on each device in turn until one survives
/// `start_wait`. Returns the process and the device it is playing on.
pub fn start_with_fallback(
    launcher: &dyn PlaybackLauncher,
    clip: &Path,
    devices: &[String],
    start_wait: Duration,
) -> Result<(Box<dyn PlaybackProcess>, String)> {
    let mut last_failure = String::from("no output device configured");
    for device in devices {
        let mut process = match launcher.launch(clip, device) {
            Ok(process) => process,
            Err(err) => {
                tracing::debug!(device, %err, "player failed to launch");
                last_failure = err.to_string();
                continue;
            }
        };
        if !start_wait.is_zero() {
            thread::sleep(start_wait);
        }
        if process.poll() {
            tracing::debug!(device, "player started");
            return Ok((process, device.clone()));
        }
        tracing::debug!(device, "player exited during startup");
        last_failure = format!("player exited immediately on {device}");
    }
    Err(LipsyncError::PlaybackStart(format!(
        "{last_failure} (tried {} device(s))",
        devices.len()
    )))
}

/// Timing of the motion thread.
#[derive(Debug, Clone, Copy)]
pub struct MotionTiming {
    pub lead: Duration,
    pub settle: Duration,
    pub poll: Duration,
    pub park_hold: Duration,
}

impl MotionTiming {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            lead: Duration::from_millis(config.lead_ms),
            ..Self::default()
        }
    }
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            lead: Duration::from_millis(180),
            settle: SETTLE,
            poll: PROCESS_POLL,
            park_hold: PARK_HOLD,
        }
    }
}

type SharedProcess = Arc<Mutex<Box<dyn PlaybackProcess>>>;

fn lock_process(process: &SharedProcess) -> MutexGuard<'_, Box<dyn PlaybackProcess>> {
    match process.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Body of the motion thread.
///
/// Replays `envelope` against a clock started `lead` early, then waits for
/// the player to exit and parks the servo. Cancellation cuts every wait
/// short; parking always happens.
fn run_motion(
    envelope: Option<Arc<Envelope>>,
    driver: &ServoDriver,
    process: &SharedProcess,
    cancel: &CancelToken,
    timing: MotionTiming,
) {
    driver.close();
    let mut cancelled = cancel.wait_timeout(timing.settle);

    if !cancelled {
        if let Some(envelope) = envelope.as_deref() {
            let start = Instant::now();
            for sample in &envelope.samples {
                let offset = Duration::from_secs_f32(sample.time.max(0.0));
                if cancel.wait_until(start + offset.saturating_sub(timing.lead)) {
                    cancelled = true;
                    break;
                }
                driver.set_level(sample.level);
            }
        }
    }

    while !cancelled && lock_process(process).poll() {
        cancelled = cancel.wait_timeout(timing.poll);
    }

    driver.park(timing.park_hold);
}

/// Everything needed to start playback sessions.
pub struct PlaybackController {
    extractor: Arc<EnvelopeExtractor>,
    launcher: Arc<dyn PlaybackLauncher>,
    driver: Arc<ServoDriver>,
    devices: Vec<String>,
    start_wait: Duration,
    timing: MotionTiming,
}

impl PlaybackController {
    pub fn new(
        extractor: Arc<EnvelopeExtractor>,
        launcher: Arc<dyn PlaybackLauncher>,
        driver: Arc<ServoDriver>,
        output_device: &str,
        config: &PlaybackConfig,
    ) -> Self {
        Self {
            extractor,
            launcher,
            driver,
            devices: candidate_devices(output_device, &config.fallback_devices),
            start_wait: Duration::from_millis(config.start_wait_ms),
            timing: MotionTiming::from_config(config),
        }
    }

    /// Overrides the motion thread timing.
    pub fn with_timing(mut self, timing: MotionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn extractor(&self) -> &Arc<EnvelopeExtractor> {
        &self.extractor
    }

    /// Starts the player and the motion thread. No session exists when this
    /// returns an error.
    pub fn launch(&self, id: SessionId, clip: &Path, cancel: CancelToken) -> Result<PlaybackSession> {
        let envelope = match self.extractor.envelope(clip) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                tracing::warn!(%err, clip = %clip.display(), "no envelope, playing without motion");
                None
            }
        };

        let (process, device) =
            match start_with_fallback(self.launcher.as_ref(), clip, &self.devices, self.start_wait) {
                Ok(started) => started,
                Err(err) => {
                    self.driver.power_off();
                    return Err(err);
                }
            };
        let process: SharedProcess = Arc::new(Mutex::new(process));

        self.driver.power_on();
        let motion = {
            let driver = self.driver.clone();
            let process = process.clone();
            let cancel = cancel.clone();
            let timing = self.timing;
            thread::Builder::new()
                .name(format!("mouthsync-motion-{}", id.0))
                .spawn(move || run_motion(envelope, &driver, &process, &cancel, timing))
        };
        let motion = match motion {
            Ok(handle) => handle,
            Err(err) => {
                lock_process(&process).terminate();
                self.driver.park(self.timing.park_hold);
                return Err(err.into());
            }
        };

        tracing::info!(%id, clip = %clip.display(), device, "playback started");
        Ok(PlaybackSession {
            id,
            clip: clip.to_path_buf(),
            device,
            cancel,
            process,
            motion: Some(motion),
            driver: self.driver.clone(),
            park_hold: self.timing.park_hold,
        })
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("devices", &self.devices)
            .field("start_wait", &self.start_wait)
            .field("timing", &self.timing)
            .finish()
    }
}

/// One clip being played with motion.
pub struct PlaybackSession {
    id: SessionId,
    clip: PathBuf,
    device: String,
    cancel: CancelToken,
    process: SharedProcess,
    motion: Option<JoinHandle<()>>,
    driver: Arc<ServoDriver>,
    park_hold: Duration,
}

impl PlaybackSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn clip(&self) -> &Path {
        &self.clip
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// `true` once the motion thread has parked on its own.
    pub fn is_finished(&self) -> bool {
        self.motion.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Tears the session down: cancel, join, terminate the player, park.
    /// Every step runs regardless of the previous ones.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(motion) = self.motion.take() {
            join_with_timeout(motion, JOIN_TIMEOUT, "motion");
        }
        lock_process(&self.process).terminate();
        self.driver.park(self.park_hold);
        tracing::info!(id = %self.id, "playback stopped");
    }

    /// Cleans up after a session that already finished by itself.
    pub fn reap(mut self) {
        if let Some(motion) = self.motion.take() {
            join_with_timeout(motion, JOIN_TIMEOUT, "motion");
        }
        lock_process(&self.process).terminate();
        tracing::info!(id = %self.id, "playback finished");
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.id)
            .field("clip", &self.clip)
            .field("device", &self.device)
            .finish()
    }
}

/// In-process stand-ins for the player, shared by unit and integration tests.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// A player that runs until terminated, or for a fixed time.
    #[derive(Debug, Clone, Default)]
    pub struct FakeProcess {
        state: Arc<FakeProcessState>,
        runs_for: Option<Duration>,
        started: Option<Instant>,
    }

    #[derive(Debug, Default)]
    pub struct FakeProcessState {
        pub terminated: AtomicBool,
    }

    impl FakeProcess {
        pub fn terminated(&self) -> bool {
            self.state.terminated.load(Ordering::SeqCst)
        }
    }

    impl PlaybackProcess for FakeProcess {
        fn poll(&mut self) -> bool {
            if self.terminated() {
                return false;
            }
            match (self.runs_for, self.started) {
                (Some(limit), Some(started)) => started.elapsed() < limit,
                _ => true,
            }
        }

        fn terminate(&mut self) {
            self.state.terminated.store(true, Ordering::SeqCst);
        }
    }

    /// Launcher that hands out [`FakeProcess`]es and records which devices
    /// were tried. Devices listed in `dead_devices` exit immediately.
    #[derive(Debug, Default)]
    pub struct FakeLauncher {
        dead_devices: Vec<String>,
        runs_for: Option<Duration>,
        launch_delay: Duration,
        attempts: Mutex<Vec<String>>,
        launched: Mutex<Vec<FakeProcess>>,
        launches: AtomicUsize,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn running_for(duration: Duration) -> Self {
            Self {
                runs_for: Some(duration),
                ..Self::default()
            }
        }

        /// Devices on which the player exits immediately.
        pub fn with_dead_devices<I, S>(mut self, devices: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.dead_devices = devices.into_iter().map(Into::into).collect();
            self
        }

        /// Delay before each launch returns, to hold a start in `Starting`.
        pub fn with_launch_delay(mut self, delay: Duration) -> Self {
            self.launch_delay = delay;
            self
        }

        pub fn attempts(&self) -> Vec<String> {
            self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
        }

        pub fn launched(&self) -> Vec<FakeProcess> {
            self.launched.lock().map(|l| l.clone()).unwrap_or_default()
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    impl PlaybackLauncher for FakeLauncher {
        fn launch(&self, _clip: &Path, device: &str) -> Result<Box<dyn PlaybackProcess>> {
            if !self.launch_delay.is_zero() {
                thread::sleep(self.launch_delay);
            }
            self.launches.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut attempts) = self.attempts.lock() {
                attempts.push(device.to_owned());
            }
            let process = FakeProcess {
                state: Arc::default(),
                runs_for: if self.dead_devices.iter().any(|dead| dead == device) {
                    Some(Duration::ZERO)
                } else {
                    self.runs_for
                },
                started: Some(Instant::now()),
            };
            if let Ok(mut launched) = self.launched.lock() {
                launched.push(process.clone());
            }
            Ok(Box::new(process))
        }
    }
}
