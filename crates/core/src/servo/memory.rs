use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{Actuator, PowerLevel};
use crate::ActuatorError;

/// A command accepted by [`MemoryActuator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    Pulse(u32),
    Power(PowerLevel),
}

/// Actuator that records commands instead of driving hardware. Used for dry
/// runs and tests.
#[derive(Debug, Default)]
pub struct MemoryActuator {
    commands: Mutex<Vec<ActuatorCommand>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl MemoryActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// An actuator whose every write fails with a broken-pipe error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub fn pulses(&self) -> Vec<u32> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                ActuatorCommand::Pulse(micros) => Some(micros),
                ActuatorCommand::Power(_) => None,
            })
            .collect()
    }

    pub fn last_power(&self) -> Option<PowerLevel> {
        self.commands()
            .into_iter()
            .rev()
            .find_map(|command| match command {
                ActuatorCommand::Power(level) => Some(level),
                ActuatorCommand::Pulse(_) => None,
            })
    }

    pub fn last_pulse(&self) -> Option<u32> {
        self.pulses().last().copied()
    }

    /// Number of writes attempted, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn record(&self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ActuatorError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "actuator offline",
            )));
        }
        tracing::trace!(?command, "actuator");
        match self.commands.lock() {
            Ok(mut commands) => commands.push(command),
            Err(poisoned) => poisoned.into_inner().push(command),
        }
        Ok(())
    }
}

impl Actuator for MemoryActuator {
    fn set_pulse_width(&self, micros: u32) -> Result<(), ActuatorError> {
        self.record(ActuatorCommand::Pulse(micros))
    }

    fn write_power(&self, level: PowerLevel) -> Result<(), ActuatorError> {
        self.record(ActuatorCommand::Power(level))
    }
}
