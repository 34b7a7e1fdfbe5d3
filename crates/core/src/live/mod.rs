//! Live microphone sessions: the per-block processor that runs inside the
//! audio callback, the helper threads it hands work to, and the session
//! lifecycle around them.

pub mod effects;
pub mod render_queue;
#[cfg(feature = "cpal")]
pub mod cpal_backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;

pub use crate::config::LiveMode;
use crate::analysis::EnvelopeParams;
use crate::config::{DirectConfig, EffectsConfig, LiveConfig};
use crate::delay::DelayLine;
use crate::servo::{ServoDriver, PARK_HOLD};
use crate::session::{join_with_timeout, SessionId};
use crate::tracker::EnvelopeTracker;
use crate::Result;

pub use effects::{DspSink, EffectsLauncher, EffectsProcess, SoxLauncher, EXIT_GRACE};

/// How long teardown waits for each helper thread.
const HELPER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Motion updates buffered between the callback and the servo writer.
const MOTION_QUEUE: usize = 16;

/// What the capture/render backend is asked to open.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_device: Option<String>,
    /// `None` with `with_output == true` means the default output device.
    pub output_device: Option<String>,
    pub with_output: bool,
    pub low_latency: bool,
}

/// One callback's worth of interleaved audio.
pub struct BlockIo<'a> {
    pub input: &'a [f32],
    pub input_channels: usize,
    /// Empty when the stream was opened without output.
    pub output: &'a mut [f32],
    pub output_channels: usize,
}

pub type StreamCallback = Box<dyn FnMut(BlockIo<'_>) + Send + 'static>;

/// An open capture (and optionally render) stream.
///
/// Closing or dropping the handle stops the callbacks and drops the
/// callback itself.
pub trait ActiveStream: Send {
    fn close(&mut self);
}

/// Capture/render subsystem.
pub trait AudioBackend: Send + Sync {
    fn open(&self, request: &StreamRequest, callback: StreamCallback) -> Result<Box<dyn ActiveStream>>;
}

/// Counters written from the real-time side and read at teardown.
#[derive(Debug, Default)]
pub struct LiveStats {
    pub blocks: AtomicU64,
    pub motion_dropped: AtomicU64,
    pub dsp_dropped: AtomicU64,
    pub dsp_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LiveStatsSnapshot {
    pub blocks: u64,
    pub motion_dropped: u64,
    pub dsp_dropped: u64,
    pub dsp_failed: u64,
}

impl LiveStats {
    pub fn snapshot(&self) -> LiveStatsSnapshot {
        LiveStatsSnapshot {
            blocks: self.blocks.load(Ordering::Relaxed),
            motion_dropped: self.motion_dropped.load(Ordering::Relaxed),
            dsp_dropped: self.dsp_dropped.load(Ordering::Relaxed),
            dsp_failed: self.dsp_failed.load(Ordering::Relaxed),
        }
    }
}

/// Resolved per-session settings shared by both modes.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSettings {
    pub mode: LiveMode,
    pub sample_rate: u32,
    pub block_size: usize,
    pub input_gain_db: f32,
    pub output_gain_db: f32,
    pub servo_delay_ms: f32,
}

impl LiveSettings {
    pub fn from_config(config: &LiveConfig) -> Self {
        match config.mode {
            LiveMode::Direct => Self::direct(&config.direct),
            LiveMode::Effects => Self::effects(&config.effects),
        }
    }

    pub fn direct(config: &DirectConfig) -> Self {
        Self {
            mode: LiveMode::Direct,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            input_gain_db: config.input_gain_db,
            output_gain_db: config.output_gain_db,
            servo_delay_ms: 0.0,
        }
    }

    pub fn effects(config: &EffectsConfig) -> Self {
        Self {
            mode: LiveMode::Effects,
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            input_gain_db: config.input_gain_db,
            output_gain_db: 0.0,
            servo_delay_ms: config.servo_delay_ms,
        }
    }
}

pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Callback-side end of the servo writer thread.
pub struct MotionSender {
    tx: Sender<f32>,
    stats: Arc<LiveStats>,
}

impl MotionSender {
    pub fn send(&self, level: f32) {
        if self.tx.try_send(level).is_err() {
            self.stats.motion_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Starts the servo writer. It applies only the newest queued level and
/// exits once the sender is dropped.
pub fn spawn_motion_writer(
    driver: Arc<ServoDriver>,
    stats: Arc<LiveStats>,
) -> Result<(MotionSender, JoinHandle<()>)> {
    let (tx, rx) = bounded(MOTION_QUEUE);
    let writer = thread::Builder::new()
        .name("mouthsync-servo-writer".into())
        .spawn(move || write_motion(&rx, &driver))?;
    Ok((MotionSender { tx, stats }, writer))
}

fn write_motion(rx: &Receiver<f32>, driver: &ServoDriver) {
    while let Ok(mut level) = rx.recv() {
        while let Ok(newer) = rx.try_recv() {
            level = newer;
        }
        driver.set_level(level);
    }
}

/// The work done for every audio block. Allocation-free once constructed.
pub struct LiveProcessor {
    mode: LiveMode,
    input_gain: f32,
    output_gain: f32,
    mono: Vec<f32>,
    tracker: EnvelopeTracker,
    delay: Option<DelayLine>,
    dsp: Option<DspSink>,
    motion: MotionSender,
    stats: Arc<LiveStats>,
}

impl LiveProcessor {
    pub fn new(
        settings: &LiveSettings,
        params: EnvelopeParams,
        dsp: Option<DspSink>,
        motion: MotionSender,
    ) -> Self {
        let block_size = settings.block_size.max(1);
        let delay = (settings.mode == LiveMode::Effects).then(|| {
            DelayLine::for_delay(settings.servo_delay_ms, settings.sample_rate, block_size)
        });
        let stats = motion.stats.clone();
        Self {
            mode: settings.mode,
            input_gain: db_to_gain(settings.input_gain_db),
            output_gain: db_to_gain(settings.output_gain_db),
            mono: Vec::with_capacity(block_size),
            tracker: EnvelopeTracker::new(settings.sample_rate, block_size, params),
            delay,
            dsp,
            motion,
            stats,
        }
    }

    pub fn mode(&self) -> LiveMode {
        self.mode
    }

    /// Processes one callback block and returns the motion level produced,
    /// if any. Effects mode yields nothing while the delay line fills.
    pub fn process(&mut self, io: BlockIo<'_>) -> Option<f32> {
        self.stats.blocks.fetch_add(1, Ordering::Relaxed);

        let channels = io.input_channels.max(1);
        let gain = self.input_gain;
        self.mono.clear();
        self.mono.extend(io.input.chunks_exact(channels).map(|frame| {
            let mixed = frame.iter().sum::<f32>() / channels as f32;
            (mixed * gain).clamp(-1.0, 1.0)
        }));

        let tracker = &mut self.tracker;
        let level = match self.mode {
            LiveMode::Direct => {
                write_output(&self.mono, self.output_gain, io.output, io.output_channels);
                Some(tracker.process_block(&self.mono))
            }
            LiveMode::Effects => {
                silence(io.output);
                if let Some(dsp) = &self.dsp {
                    dsp.send(&self.mono);
                }
                match &mut self.delay {
                    Some(delay) => delay
                        .push(&self.mono)
                        .map(|block| tracker.process_block(block)),
                    None => Some(tracker.process_block(&self.mono)),
                }
            }
        };

        if let Some(level) = level {
            self.motion.send(level);
        }
        level
    }
}

fn write_output(mono: &[f32], gain: f32, output: &mut [f32], channels: usize) {
    if output.is_empty() {
        return;
    }
    let channels = channels.max(1);
    for (index, frame) in output.chunks_mut(channels).enumerate() {
        let value = mono
            .get(index)
            .map_or(0.0, |sample| (sample * gain).clamp(-1.0, 1.0));
        frame.fill(value);
    }
}

fn silence(output: &mut [f32]) {
    output.fill(0.0);
}

/// Everything needed to start live sessions.
pub struct LiveController {
    backend: Arc<dyn AudioBackend>,
    effects: Arc<dyn EffectsLauncher>,
    driver: Arc<ServoDriver>,
    params: EnvelopeParams,
    exit_grace: Duration,
}

impl LiveController {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        effects: Arc<dyn EffectsLauncher>,
        driver: Arc<ServoDriver>,
        params: EnvelopeParams,
    ) -> Self {
        Self {
            backend,
            effects,
            driver,
            params,
            exit_grace: EXIT_GRACE,
        }
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Opens the stream and helper threads for `config.mode`. On error
    /// everything started so far is torn down again.
    pub fn launch(&self, id: SessionId, config: &LiveConfig) -> Result<LiveSession> {
        let settings = LiveSettings::from_config(config);
        let stats = Arc::new(LiveStats::default());
        let mut session = LiveSession {
            id,
            mode: settings.mode,
            stream: None,
            effects: None,
            feeder: None,
            writer: None,
            driver: self.driver.clone(),
            stats: stats.clone(),
            exit_grace: self.exit_grace,
        };

        self.driver.power_on();
        self.driver.close();

        let dsp = match settings.mode {
            LiveMode::Direct => None,
            LiveMode::Effects => match self.start_effects(&config.effects, &stats, &mut session) {
                Ok(sink) => sink,
                Err(err) => {
                    session.teardown();
                    return Err(err);
                }
            },
        };

        let motion = match spawn_motion_writer(self.driver.clone(), stats) {
            Ok((motion, writer)) => {
                session.writer = Some(writer);
                motion
            }
            Err(err) => {
                drop(dsp);
                session.teardown();
                return Err(err);
            }
        };

        let request = stream_request(config);
        let mut processor = LiveProcessor::new(&settings, self.params, dsp, motion);
        let callback: StreamCallback = Box::new(move |io: BlockIo<'_>| {
            processor.process(io);
        });
        match self.backend.open(&request, callback) {
            Ok(stream) => session.stream = Some(stream),
            Err(err) => {
                session.teardown();
                return Err(err);
            }
        }

        tracing::info!(%id, mode = ?settings.mode, sample_rate = settings.sample_rate, block_size = settings.block_size, "live session started");
        Ok(session)
    }

    fn start_effects(
        &self,
        config: &EffectsConfig,
        stats: &Arc<LiveStats>,
        session: &mut LiveSession,
    ) -> Result<Option<DspSink>> {
        let mut process = self.effects.spawn(config)?;
        let input = process.take_input();
        session.effects = Some(process);
        let Some(input) = input else {
            tracing::warn!("effects process has no input, motion only");
            return Ok(None);
        };
        let (sink, feeder) = effects::spawn_feeder(input, config.block_size, stats.clone())?;
        session.feeder = Some(feeder);
        Ok(Some(sink))
    }
}

impl std::fmt::Debug for LiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveController")
            .field("params", &self.params)
            .field("exit_grace", &self.exit_grace)
            .finish()
    }
}

pub fn stream_request(config: &LiveConfig) -> StreamRequest {
    match config.mode {
        LiveMode::Direct => StreamRequest {
            sample_rate: config.direct.sample_rate,
            block_size: config.direct.block_size,
            input_device: config.direct.input_device.clone(),
            output_device: config.direct.output_device.clone(),
            with_output: true,
            low_latency: config.direct.low_latency,
        },
        LiveMode::Effects => StreamRequest {
            sample_rate: config.effects.sample_rate,
            block_size: config.effects.block_size,
            input_device: config.effects.input_device.clone(),
            output_device: None,
            with_output: false,
            low_latency: config.effects.low_latency,
        },
    }
}

/// A running live session.
pub struct LiveSession {
    id: SessionId,
    mode: LiveMode,
    stream: Option<Box<dyn ActiveStream>>,
    effects: Option<Box<dyn EffectsProcess>>,
    feeder: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    driver: Arc<ServoDriver>,
    stats: Arc<LiveStats>,
    exit_grace: Duration,
}

impl LiveSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn mode(&self) -> LiveMode {
        self.mode
    }

    pub fn stats(&self) -> LiveStatsSnapshot {
        self.stats.snapshot()
    }

    /// Closes the stream, lets the effects process drain, and parks the
    /// servo. Every step runs regardless of the previous ones.
    pub fn stop(mut self) {
        self.teardown();
        tracing::info!(id = %self.id, stats = ?self.stats.snapshot(), "live session stopped");
    }

    fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        // The feeder exits once the callback, and with it the sink, is gone;
        // that closes the effects input.
        if let Some(feeder) = self.feeder.take() {
            join_with_timeout(feeder, HELPER_JOIN_TIMEOUT, "dsp-feeder");
        }
        if let Some(mut process) = self.effects.take() {
            effects::shutdown(process.as_mut(), self.exit_grace);
        }
        if let Some(writer) = self.writer.take() {
            join_with_timeout(writer, HELPER_JOIN_TIMEOUT, "servo-writer");
        }
        self.driver.park(PARK_HOLD);
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

/// In-process stand-ins for the audio backend and the effects process.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use std::io::{self, Write};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use super::*;
    use crate::LipsyncError;

    /// Backend whose stream is driven by hand through [`FakeBackend::feed`].
    #[derive(Default)]
    pub struct FakeBackend {
        callback: Arc<Mutex<Option<StreamCallback>>>,
        requests: Mutex<Vec<StreamRequest>>,
        pub refuse: bool,
    }

    impl FakeBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }

        pub fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }

        pub fn is_open(&self) -> bool {
            self.callback.lock().map(|c| c.is_some()).unwrap_or(false)
        }

        /// Runs the callback once with `input`; returns the output it wrote,
        /// or `None` when no stream is open.
        pub fn feed(&self, input: &[f32], input_channels: usize, output_channels: usize) -> Option<Vec<f32>> {
            let mut guard = self.callback.lock().ok()?;
            let callback = guard.as_mut()?;
            let frames = input.len() / input_channels.max(1);
            let mut output = vec![0.0; frames * output_channels];
            callback(BlockIo {
                input,
                input_channels,
                output: &mut output,
                output_channels,
            });
            Some(output)
        }
    }

    impl AudioBackend for FakeBackend {
        fn open(&self, request: &StreamRequest, callback: StreamCallback) -> Result<Box<dyn ActiveStream>> {
            if self.refuse {
                return Err(LipsyncError::Stream("no capture device".into()));
            }
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if let Ok(mut slot) = self.callback.lock() {
                *slot = Some(callback);
            }
            Ok(Box::new(FakeStream {
                callback: self.callback.clone(),
            }))
        }
    }

    struct FakeStream {
        callback: Arc<Mutex<Option<StreamCallback>>>,
    }

    impl ActiveStream for FakeStream {
        fn close(&mut self) {
            if let Ok(mut slot) = self.callback.lock() {
                slot.take();
            }
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.close();
        }
    }

    /// Effects process that collects the bytes written to it.
    #[derive(Clone, Default)]
    pub struct FakeEffects {
        pub received: Arc<Mutex<Vec<u8>>>,
        pub exited: Arc<AtomicBool>,
        pub terminated: Arc<AtomicBool>,
        pub killed: Arc<AtomicBool>,
        /// Exit as soon as the input is closed.
        pub exits_on_eof: bool,
        /// Exit when asked to terminate.
        pub exits_on_terminate: bool,
    }

    struct FakeInput {
        effects: FakeEffects,
    }

    impl Write for FakeInput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut received) = self.effects.received.lock() {
                received.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for FakeInput {
        fn drop(&mut self) {
            if self.effects.exits_on_eof {
                self.effects.exited.store(true, Ordering::SeqCst);
            }
        }
    }

    struct FakeEffectsProcess {
        effects: FakeEffects,
        input_taken: bool,
    }

    impl EffectsProcess for FakeEffectsProcess {
        fn take_input(&mut self) -> Option<Box<dyn Write + Send>> {
            if std::mem::replace(&mut self.input_taken, true) {
                return None;
            }
            Some(Box::new(FakeInput {
                effects: self.effects.clone(),
            }))
        }

        fn has_exited(&mut self) -> bool {
            self.effects.exited.load(Ordering::SeqCst)
        }

        fn terminate(&mut self) {
            self.effects.terminated.store(true, Ordering::SeqCst);
            if self.effects.exits_on_terminate {
                self.effects.exited.store(true, Ordering::SeqCst);
            }
        }

        fn kill(&mut self) {
            self.effects.killed.store(true, Ordering::SeqCst);
            self.effects.exited.store(true, Ordering::SeqCst);
        }
    }

    /// Launcher handing out [`FakeEffects`] processes, or failing to spawn.
    #[derive(Default)]
    pub struct FakeEffectsLauncher {
        pub effects: FakeEffects,
        pub fail: bool,
        spawned: Mutex<Vec<EffectsConfig>>,
    }

    impl FakeEffectsLauncher {
        pub fn new(effects: FakeEffects) -> Self {
            Self {
                effects,
                ..Self::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn spawned(&self) -> Vec<EffectsConfig> {
            self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    impl EffectsLauncher for FakeEffectsLauncher {
        fn spawn(&self, config: &EffectsConfig) -> Result<Box<dyn EffectsProcess>> {
            if self.fail {
                return Err(LipsyncError::DspProcess("cannot run sox: not found".into()));
            }
            if let Ok(mut spawned) = self.spawned.lock() {
                spawned.push(config.clone());
            }
            Ok(Box::new(FakeEffectsProcess {
                effects: self.effects.clone(),
                input_taken: false,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::fake::{FakeBackend, FakeEffects, FakeEffectsLauncher};
    use super::*;
    use crate::servo::{angle_to_pulse_us, Geometry, MemoryActuator, PowerLevel};
    use crate::LipsyncError;

    const BLOCK: usize = 64;

    fn square(amplitude: f32, channels: usize) -> Vec<f32> {
        (0..BLOCK * channels)
            .map(|i| if (i / channels) % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn motion_pair() -> (MotionSender, Receiver<f32>) {
        let (tx, rx) = bounded(1024);
        let sender = MotionSender {
            tx,
            stats: Arc::new(LiveStats::default()),
        };
        (sender, rx)
    }

    fn settings(mode: LiveMode, servo_delay_ms: f32) -> LiveSettings {
        LiveSettings {
            mode,
            sample_rate: 8_000,
            block_size: BLOCK,
            input_gain_db: 0.0,
            output_gain_db: 0.0,
            servo_delay_ms,
        }
    }

    #[test]
    fn gain_from_decibels() {
        assert_eq!(db_to_gain(0.0), 1.0);
        assert!((db_to_gain(20.0) - 10.0).abs() < 1e-4);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 1e-3);
    }

    #[test]
    fn direct_mode_copies_mono_to_every_output_channel() {
        let (motion, levels) = motion_pair();
        let mut processor = LiveProcessor::new(
            &LiveSettings {
                output_gain_db: 6.0,
                ..settings(LiveMode::Direct, 0.0)
            },
            EnvelopeParams::default(),
            None,
            motion,
        );

        // Left channel loud, right silent: the mono mix is half amplitude.
        let input: Vec<f32> = (0..BLOCK).flat_map(|_| [0.8, 0.0]).collect();
        let mut output = vec![0.0; BLOCK * 3];
        let level = processor.process(BlockIo {
            input: &input,
            input_channels: 2,
            output: &mut output,
            output_channels: 3,
        });

        let expected = (0.4 * db_to_gain(6.0)).clamp(-1.0, 1.0);
        assert!(output.iter().all(|&sample| (sample - expected).abs() < 1e-6));
        assert!(level.unwrap() > 0.0);
        assert_eq!(levels.try_iter().count(), 1);
    }

    #[test]
    fn input_gain_clips_to_full_scale() {
        let (motion, _levels) = motion_pair();
        let mut processor = LiveProcessor::new(
            &LiveSettings {
                input_gain_db: 20.0,
                ..settings(LiveMode::Direct, 0.0)
            },
            EnvelopeParams::default(),
            None,
            motion,
        );
        let input = square(0.5, 1);
        let mut output = vec![0.0; BLOCK];
        processor.process(BlockIo {
            input: &input,
            input_channels: 1,
            output: &mut output,
            output_channels: 1,
        });
        assert!(output.iter().all(|sample| sample.abs() == 1.0));
    }

    #[test]
    fn effects_mode_delays_motion_by_whole_blocks() {
        let (motion, levels) = motion_pair();
        // 24 ms at 8 kHz with 64-sample blocks is three blocks.
        let mut processor =
            LiveProcessor::new(&settings(LiveMode::Effects, 24.0), EnvelopeParams::default(), None, motion);

        let loud = square(0.9, 1);
        let quiet = vec![0.0; BLOCK];
        let mut results = Vec::new();
        for block in [&loud, &quiet, &quiet, &quiet, &quiet] {
            results.push(processor.process(BlockIo {
                input: block,
                input_channels: 1,
                output: &mut [],
                output_channels: 0,
            }));
        }

        assert_eq!(results[..3], [None, None, None]);
        // The loud block only reaches the tracker on the fourth push.
        assert!(results[3].unwrap() > 0.0);
        assert!(results[4].unwrap() < results[3].unwrap());
        assert_eq!(levels.try_iter().count(), 2);
    }

    #[test]
    fn full_motion_queue_counts_drops() {
        let (tx, _rx) = bounded(1);
        let stats = Arc::new(LiveStats::default());
        let motion = MotionSender {
            tx,
            stats: stats.clone(),
        };
        motion.send(0.1);
        motion.send(0.2);
        motion.send(0.3);
        assert_eq!(stats.snapshot().motion_dropped, 2);
    }

    fn controller(
        backend: Arc<FakeBackend>,
        launcher: Arc<FakeEffectsLauncher>,
        actuator: Arc<MemoryActuator>,
    ) -> LiveController {
        let driver = Arc::new(ServoDriver::new(actuator, Geometry::new(0.0, 90.0)));
        LiveController::new(backend, launcher, driver, EnvelopeParams::default())
            .with_exit_grace(Duration::from_millis(50))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn effects_session_feeds_the_process_and_drives_the_servo() {
        let effects = FakeEffects {
            exits_on_eof: true,
            ..FakeEffects::default()
        };
        let backend = Arc::new(FakeBackend::new());
        let launcher = Arc::new(FakeEffectsLauncher::new(effects.clone()));
        let actuator = Arc::new(MemoryActuator::new());
        let controller = controller(backend.clone(), launcher.clone(), actuator.clone());

        let mut config = LiveConfig::default();
        config.effects.servo_delay_ms = 0.0;
        config.effects.block_size = BLOCK;
        let session = controller.launch(SessionId(7), &config).unwrap();
        assert_eq!(session.mode(), LiveMode::Effects);
        assert!(!backend.requests()[0].with_output);

        let loud = square(0.9, 1);
        for _ in 0..100 {
            backend.feed(&loud, 1, 0).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        wait_for(|| actuator.last_pulse().is_some_and(|pulse| pulse > angle_to_pulse_us(45.0)));
        wait_for(|| effects.received.lock().unwrap().len() >= BLOCK * 4);

        session.stop();
        assert!(!backend.is_open());
        assert!(!effects.terminated.load(Ordering::SeqCst));
        assert!(!effects.killed.load(Ordering::SeqCst));
        assert_eq!(launcher.spawned().len(), 1);
        assert_eq!(actuator.last_pulse(), Some(0));
        assert_eq!(actuator.last_power(), Some(PowerLevel::Low));
    }

    #[test]
    fn stubborn_effects_process_is_killed() {
        let effects = FakeEffects::default();
        let backend = Arc::new(FakeBackend::new());
        let launcher = Arc::new(FakeEffectsLauncher::new(effects.clone()));
        let controller = controller(backend, launcher, Arc::new(MemoryActuator::new()));

        let session = controller.launch(SessionId(1), &LiveConfig::default()).unwrap();
        session.stop();
        assert!(effects.terminated.load(Ordering::SeqCst));
        assert!(effects.killed.load(Ordering::SeqCst));
    }

    #[test]
    fn effects_process_that_honours_terminate_is_not_killed() {
        let effects = FakeEffects {
            exits_on_terminate: true,
            ..FakeEffects::default()
        };
        let backend = Arc::new(FakeBackend::new());
        let launcher = Arc::new(FakeEffectsLauncher::new(effects.clone()));
        let actuator = Arc::new(MemoryActuator::new());
        let controller = controller(backend, launcher, actuator.clone());

        let session = controller.launch(SessionId(5), &LiveConfig::default()).unwrap();
        session.stop();
        assert!(effects.terminated.load(Ordering::SeqCst));
        assert!(!effects.killed.load(Ordering::SeqCst));
        assert_eq!(actuator.last_power(), Some(PowerLevel::Low));
    }

    #[test]
    fn direct_session_needs_no_effects_process() {
        let backend = Arc::new(FakeBackend::new());
        let launcher = Arc::new(FakeEffectsLauncher::failing());
        let controller = controller(backend.clone(), launcher, Arc::new(MemoryActuator::new()));

        let config = LiveConfig {
            mode: LiveMode::Direct,
            ..LiveConfig::default()
        };
        let session = controller.launch(SessionId(2), &config).unwrap();
        let output = backend.feed(&square(0.5, 1)[..], 1, 2).unwrap();
        assert_eq!(output.len(), BLOCK * 2);
        assert!(backend.requests()[0].with_output);
        session.stop();
    }

    #[test]
    fn spawn_failure_aborts_the_start() {
        let backend = Arc::new(FakeBackend::new());
        let actuator = Arc::new(MemoryActuator::new());
        let controller = controller(backend.clone(), Arc::new(FakeEffectsLauncher::failing()), actuator.clone());

        let err = controller.launch(SessionId(3), &LiveConfig::default()).unwrap_err();
        assert!(matches!(err, LipsyncError::DspProcess(_)));
        assert!(backend.requests().is_empty());
        assert_eq!(actuator.last_power(), Some(PowerLevel::Low));
    }

    #[test]
    fn stream_failure_cleans_up_the_effects_process() {
        let effects = FakeEffects {
            exits_on_eof: true,
            ..FakeEffects::default()
        };
        let backend = Arc::new(FakeBackend::refusing());
        let launcher = Arc::new(FakeEffectsLauncher::new(effects.clone()));
        let actuator = Arc::new(MemoryActuator::new());
        let controller = controller(backend, launcher, actuator.clone());

        let err = controller.launch(SessionId(4), &LiveConfig::default()).unwrap_err();
        assert!(matches!(err, LipsyncError::Stream(_)));
        assert!(effects.exited.load(Ordering::SeqCst));
        assert_eq!(actuator.last_power(), Some(PowerLevel::Low));
    }
}
