//! Level → angle → pulse-width mapping and the actuator seam.

mod memory;
mod pigpio;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use memory::{ActuatorCommand, MemoryActuator};
pub use pigpio::PigpiodActuator;

use crate::{ActuatorError, LipsyncError, Result};

pub const PULSE_MIN_US: u32 = 500;
pub const PULSE_MAX_US: u32 = 2500;

/// How long the closed position is held before the pulse output is released.
pub const PARK_HOLD: Duration = Duration::from_millis(150);

/// Closed and open mouth angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub closed_angle: f32,
    pub open_angle: f32,
}

impl Geometry {
    pub fn new(closed_angle: f32, open_angle: f32) -> Self {
        Self {
            closed_angle,
            open_angle,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |angle: f32| (0.0..=180.0).contains(&angle);
        if !in_range(self.closed_angle) || !in_range(self.open_angle) {
            return Err(LipsyncError::config("servo angles must lie within 0..=180"));
        }
        if self.open_angle < self.closed_angle {
            return Err(LipsyncError::config(
                "open_angle must be greater than or equal to closed_angle",
            ));
        }
        Ok(())
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(5.0, 65.0)
    }
}

/// Stateless conversion from loudness to servo commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoMapper {
    geometry: Geometry,
}

impl ServoMapper {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn angle(&self, level: f32) -> f32 {
        let Geometry {
            closed_angle,
            open_angle,
        } = self.geometry;
        closed_angle + (open_angle - closed_angle) * level.clamp(0.0, 1.0)
    }

    pub fn pulse_us(&self, level: f32) -> u32 {
        angle_to_pulse_us(self.angle(level))
    }
}

pub fn angle_to_pulse_us(angle: f32) -> u32 {
    let span = (PULSE_MAX_US - PULSE_MIN_US) as f32;
    PULSE_MIN_US + (span * angle.clamp(0.0, 180.0) / 180.0) as u32
}

/// Power line level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerLevel {
    Low,
    High,
}

/// Hardware seam for the servo output and its supply switch.
///
/// Implementations treat an unconfigured channel as a silent no-op.
pub trait Actuator: Send + Sync {
    /// Sets the servo pulse width; `0` releases the output.
    fn set_pulse_width(&self, micros: u32) -> std::result::Result<(), ActuatorError>;
    fn write_power(&self, level: PowerLevel) -> std::result::Result<(), ActuatorError>;
}

/// Actuator with both channels disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledActuator;

impl Actuator for DisabledActuator {
    fn set_pulse_width(&self, _micros: u32) -> std::result::Result<(), ActuatorError> {
        Ok(())
    }

    fn write_power(&self, _level: PowerLevel) -> std::result::Result<(), ActuatorError> {
        Ok(())
    }
}

/// Session-side handle that turns angles into actuator writes.
///
/// Write failures are logged and swallowed here so callers never have to
/// handle them. Repeating the last pulse width is not sent again.
pub struct ServoDriver {
    actuator: Arc<dyn Actuator>,
    mapper: ServoMapper,
    last_pulse: Mutex<Option<u32>>,
}

impl ServoDriver {
    pub fn new(actuator: Arc<dyn Actuator>, geometry: Geometry) -> Self {
        Self {
            actuator,
            mapper: ServoMapper::new(geometry),
            last_pulse: Mutex::new(None),
        }
    }

    pub fn mapper(&self) -> &ServoMapper {
        &self.mapper
    }

    pub fn set_level(&self, level: f32) {
        self.set_pulse(self.mapper.pulse_us(level));
    }

    pub fn set_angle(&self, angle: f32) {
        self.set_pulse(angle_to_pulse_us(angle));
    }

    pub fn close(&self) {
        self.set_angle(self.mapper.geometry().closed_angle);
    }

    /// Releases the pulse output (servo goes limp).
    pub fn release(&self) {
        self.set_pulse(0);
    }

    pub fn power_on(&self) {
        if let Err(err) = self.actuator.write_power(PowerLevel::High) {
            tracing::warn!(%err, "failed to switch servo power on");
        }
    }

    pub fn power_off(&self) {
        if let Err(err) = self.actuator.write_power(PowerLevel::Low) {
            tracing::warn!(%err, "failed to switch servo power off");
        }
    }

    /// Closes the mouth, holds it for `hold`, releases the output and cuts
    /// power. Every step runs even if an earlier one failed.
    pub fn park(&self, hold: Duration) {
        self.close();
        if !hold.is_zero() {
            thread::sleep(hold);
        }
        self.release();
        self.power_off();
    }

    fn set_pulse(&self, micros: u32) {
        let mut last = match self.last_pulse.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *last == Some(micros) {
            return;
        }
        match self.actuator.set_pulse_width(micros) {
            Ok(()) => *last = Some(micros),
            Err(err) => {
                *last = None;
                tracing::warn!(%err, micros, "servo write failed");
            }
        }
    }
}

impl std::fmt::Debug for ServoDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServoDriver")
            .field("mapper", &self.mapper)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_map_exactly() {
        for (closed, open) in [(0.0, 180.0), (5.0, 65.0), (90.0, 90.0), (12.5, 47.25)] {
            let mapper = ServoMapper::new(Geometry::new(closed, open));
            assert_eq!(mapper.angle(0.0), closed);
            assert_eq!(mapper.angle(1.0), open);
            assert_eq!(mapper.angle(-3.0), closed);
            assert_eq!(mapper.angle(7.0), open);
        }
    }

    #[test]
    fn pulse_width_spans_fixed_bounds() {
        assert_eq!(angle_to_pulse_us(0.0), 500);
        assert_eq!(angle_to_pulse_us(90.0), 1500);
        assert_eq!(angle_to_pulse_us(180.0), 2500);
        assert_eq!(angle_to_pulse_us(400.0), 2500);
        assert_eq!(angle_to_pulse_us(-10.0), 500);
    }

    #[test]
    fn geometry_validation() {
        assert!(Geometry::new(5.0, 65.0).validate().is_ok());
        assert!(Geometry::new(70.0, 65.0).validate().is_err());
        assert!(Geometry::new(5.0, 181.0).validate().is_err());
    }

    #[test]
    fn repeated_angle_is_not_resent() {
        let actuator = Arc::new(MemoryActuator::new());
        let driver = ServoDriver::new(actuator.clone(), Geometry::default());

        driver.set_angle(30.0);
        driver.set_angle(30.0);
        driver.set_angle(31.0);

        assert_eq!(actuator.pulses(), vec![angle_to_pulse_us(30.0), angle_to_pulse_us(31.0)]);
    }

    #[test]
    fn park_closes_releases_and_powers_off() {
        let actuator = Arc::new(MemoryActuator::new());
        let driver = ServoDriver::new(actuator.clone(), Geometry::new(10.0, 60.0));
        driver.power_on();
        driver.set_level(1.0);
        driver.park(Duration::ZERO);

        assert_eq!(
            actuator.commands(),
            vec![
                ActuatorCommand::Power(PowerLevel::High),
                ActuatorCommand::Pulse(angle_to_pulse_us(60.0)),
                ActuatorCommand::Pulse(angle_to_pulse_us(10.0)),
                ActuatorCommand::Pulse(0),
                ActuatorCommand::Power(PowerLevel::Low),
            ]
        );
    }

    #[test]
    fn failed_writes_are_swallowed_and_retried() {
        let actuator = Arc::new(MemoryActuator::failing());
        let driver = ServoDriver::new(actuator.clone(), Geometry::default());

        driver.set_angle(20.0);
        driver.set_angle(20.0);
        driver.park(Duration::ZERO);

        assert_eq!(actuator.attempts(), 5);
        assert!(actuator.commands().is_empty());
    }
}
