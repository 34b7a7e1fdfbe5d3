//! External voice-effects process and the thread that feeds it.

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::LiveStats;
use crate::config::EffectsConfig;
use crate::{LipsyncError, Result};

/// How long a closed effects process gets to drain before it is killed.
pub const EXIT_GRACE: Duration = Duration::from_millis(1500);

/// Blocks in flight between the audio callback and the feeder thread.
const POOL_BLOCKS: usize = 8;

/// A running effects process reading raw little-endian `f32` mono samples.
pub trait EffectsProcess: Send {
    /// Hands out the sample sink. Returns `None` after the first call.
    fn take_input(&mut self) -> Option<Box<dyn Write + Send>>;
    /// Returns `true` once the process has exited.
    fn has_exited(&mut self) -> bool;
    /// Asks the process to exit; it may take a moment or ignore the request.
    fn terminate(&mut self);
    fn kill(&mut self);
}

pub trait EffectsLauncher: Send + Sync {
    fn spawn(&self, config: &EffectsConfig) -> Result<Box<dyn EffectsProcess>>;
}

/// Runs the effects chain with `sox`, playing straight into ALSA.
#[derive(Debug, Clone)]
pub struct SoxLauncher {
    program: String,
}

impl SoxLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(config: &EffectsConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-V1".into(),
            "-q".into(),
            "--buffer".into(),
            config.sox_buffer_frames.max(64).to_string(),
            "-t".into(),
            "raw".into(),
            "-e".into(),
            "floating-point".into(),
            "-b".into(),
            "32".into(),
            "-L".into(),
            "-c".into(),
            "1".into(),
            "-r".into(),
            config.sample_rate.to_string(),
            "-".into(),
            "-t".into(),
            "alsa".into(),
            config.alsa_out.clone(),
        ];

        let cents = config.pitch_semitones * 100.0;
        if cents.abs() > 0.01 {
            args.extend(["pitch".into(), format!("{cents:.1}")]);
        }
        if config.reverb > 0.0 {
            args.extend(["reverb".into(), format!("{:.1}", config.reverb)]);
        }
        if config.bass_db.abs() > 0.01 {
            args.extend(["bass".into(), format!("{:+.1}", config.bass_db)]);
        }
        if config.treble_db.abs() > 0.01 {
            args.extend(["treble".into(), format!("{:+.1}", config.treble_db)]);
        }
        args
    }
}

impl Default for SoxLauncher {
    fn default() -> Self {
        Self::new("sox")
    }
}

impl EffectsLauncher for SoxLauncher {
    fn spawn(&self, config: &EffectsConfig) -> Result<Box<dyn EffectsProcess>> {
        let args = Self::args(config);
        tracing::debug!(program = %self.program, ?args, "spawning effects process");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| LipsyncError::DspProcess(format!("cannot run {}: {err}", self.program)))?;
        let stdin = child.stdin.take();
        Ok(Box::new(ChildEffects { child, stdin }))
    }
}

struct ChildEffects {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl EffectsProcess for ChildEffects {
    fn take_input(&mut self) -> Option<Box<dyn Write + Send>> {
        self.stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn Write + Send>)
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            self.kill();
            return;
        };
        // SAFETY: the child has not been waited on, so its pid is still ours.
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            let err = std::io::Error::last_os_error();
            tracing::warn!(%err, "failed to signal effects process");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        self.kill();
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.kill() {
            tracing::warn!(%err, "failed to kill effects process");
        }
        let _ = self.child.wait();
    }
}

/// Asks a process that is still running to terminate, waits up to `grace`,
/// then kills it.
pub fn shutdown(process: &mut dyn EffectsProcess, grace: Duration) {
    if process.has_exited() {
        return;
    }
    process.terminate();
    let deadline = Instant::now() + grace;
    while !process.has_exited() {
        if Instant::now() >= deadline {
            tracing::warn!(?grace, "effects process did not exit, killing it");
            process.kill();
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Callback-side end of the feeder: copies blocks into pooled buffers.
pub struct DspSink {
    free_rx: Receiver<Vec<f32>>,
    free_tx: Sender<Vec<f32>>,
    filled_tx: Sender<Vec<f32>>,
    stats: Arc<LiveStats>,
}

impl DspSink {
    /// Queues a copy of `block` for the effects process. Never blocks; a
    /// block is dropped and counted when no pooled buffer is free.
    pub fn send(&self, block: &[f32]) {
        let Ok(mut buffer) = self.free_rx.try_recv() else {
            self.stats.dsp_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        buffer.clear();
        buffer.extend_from_slice(block);
        if let Err(err) = self.filled_tx.try_send(buffer) {
            self.stats.dsp_dropped.fetch_add(1, Ordering::Relaxed);
            let buffer = match err {
                TrySendError::Full(buffer) | TrySendError::Disconnected(buffer) => buffer,
            };
            let _ = self.free_tx.try_send(buffer);
        }
    }
}

/// Starts the feeder thread writing to `input`. The thread ends, closing
/// `input`, once the returned sink is dropped.
pub fn spawn_feeder(
    input: Box<dyn Write + Send>,
    block_size: usize,
    stats: Arc<LiveStats>,
) -> Result<(DspSink, JoinHandle<()>)> {
    let (free_tx, free_rx) = bounded(POOL_BLOCKS);
    let (filled_tx, filled_rx) = bounded::<Vec<f32>>(POOL_BLOCKS);
    for _ in 0..POOL_BLOCKS {
        let _ = free_tx.try_send(Vec::with_capacity(block_size));
    }

    let feeder = {
        let free_tx = free_tx.clone();
        let stats = stats.clone();
        thread::Builder::new()
            .name("mouthsync-dsp-feeder".into())
            .spawn(move || feed(input, filled_rx, free_tx, block_size, &stats))?
    };

    Ok((
        DspSink {
            free_rx,
            free_tx,
            filled_tx,
            stats,
        },
        feeder,
    ))
}

fn feed(
    mut input: Box<dyn Write + Send>,
    filled_rx: Receiver<Vec<f32>>,
    free_tx: Sender<Vec<f32>>,
    block_size: usize,
    stats: &LiveStats,
) {
    let mut bytes = Vec::with_capacity(block_size * 4);
    let mut broken = false;
    for block in filled_rx {
        if !broken {
            bytes.clear();
            bytes.extend(block.iter().flat_map(|sample| sample.to_le_bytes()));
            if let Err(err) = input.write_all(&bytes) {
                // Reported once; the session keeps running without effects.
                tracing::warn!(%err, "effects process stopped accepting audio");
                broken = true;
            }
        }
        if broken {
            stats.dsp_failed.fetch_add(1, Ordering::Relaxed);
        }
        let _ = free_tx.try_send(block);
    }
    let _ = input.flush();
    tracing::debug!("effects feeder finished");
}
