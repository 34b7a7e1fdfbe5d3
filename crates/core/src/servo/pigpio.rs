//! Client for the pigpio daemon's socket interface.
//!
//! Each request is four little-endian `u32` words (`cmd, p1, p2, p3`); the
//! daemon echoes the first three and puts a signed status in the fourth.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Actuator, PowerLevel};
use crate::ActuatorError;

const CMD_MODES: u32 = 0;
const CMD_WRITE: u32 = 4;
const CMD_SERVO: u32 = 8;
const MODE_OUTPUT: u32 = 1;

const IO_TIMEOUT: Duration = Duration::from_millis(250);

/// Servo and power outputs driven through `pigpiod`.
///
/// `None` for a pin disables that channel; writes to it become no-ops.
#[derive(Debug)]
pub struct PigpiodActuator {
    servo_gpio: Option<u32>,
    power_gpio: Option<u32>,
    stream: Mutex<TcpStream>,
}

impl PigpiodActuator {
    /// Connects to the daemon, configures both pins as outputs and leaves them
    /// idle (pulse released, power low).
    pub fn connect(
        addr: impl ToSocketAddrs,
        servo_gpio: Option<u32>,
        power_gpio: Option<u32>,
    ) -> Result<Self, ActuatorError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let actuator = Self {
            servo_gpio,
            power_gpio,
            stream: Mutex::new(stream),
        };
        for gpio in [servo_gpio, power_gpio].into_iter().flatten() {
            actuator.command(CMD_MODES, gpio, MODE_OUTPUT)?;
        }
        actuator.set_pulse_width(0)?;
        actuator.write_power(PowerLevel::Low)?;

        tracing::info!(?servo_gpio, ?power_gpio, "connected to pigpiod");
        Ok(actuator)
    }

    fn command(&self, cmd: u32, p1: u32, p2: u32) -> Result<(), ActuatorError> {
        let mut request = [0u8; 16];
        request[0..4].copy_from_slice(&cmd.to_le_bytes());
        request[4..8].copy_from_slice(&p1.to_le_bytes());
        request[8..12].copy_from_slice(&p2.to_le_bytes());

        let mut stream = self.lock_stream();
        stream.write_all(&request)?;
        let mut response = [0u8; 16];
        stream.read_exact(&mut response)?;

        let status = i32::from_le_bytes([response[12], response[13], response[14], response[15]]);
        if status < 0 {
            return Err(ActuatorError::Rejected {
                command: cmd,
                status,
            });
        }
        Ok(())
    }

    fn lock_stream(&self) -> MutexGuard<'_, TcpStream> {
        match self.stream.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Actuator for PigpiodActuator {
    fn set_pulse_width(&self, micros: u32) -> Result<(), ActuatorError> {
        match self.servo_gpio {
            Some(gpio) => self.command(CMD_SERVO, gpio, micros),
            None => Ok(()),
        }
    }

    fn write_power(&self, level: PowerLevel) -> Result<(), ActuatorError> {
        match self.power_gpio {
            Some(gpio) => self.command(CMD_WRITE, gpio, u32::from(level == PowerLevel::High)),
            None => Ok(()),
        }
    }
}
