//! In-process field bus for CI and `--simulate` runs.
//!
//! [`SimBus`] acknowledges every register write and records it.  A
//! [`SimBusProbe`] cloned off the bus before it is handed to the driver layer
//! lets tests inspect the traffic, read back the decoded motor state, and
//! inject failures.
//!
//! # Example
//!
//! ```rust
//! use cablebot_hal::sim::SimBus;
//! use cablebot_hal::{DriverLayer, WinchTarget};
//!
//! let bus = SimBus::new();
//! let probe = bus.probe();
//! let driver = DriverLayer::new(Box::new(bus), WinchTarget::sequential(&[1, 2, 3, 4]));
//! assert_eq!(driver.winch_count(), 4);
//! assert!(probe.writes().is_empty());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cablebot_types::{DriverError, Spin};

use crate::bus::FieldBus;
use crate::modbus::{CTRL_BRAKE, CTRL_FORWARD, CTRL_REVERSE, CTRL_STOP, REG_CONTROL, REG_SPEED};

/// One acknowledged (or refused) register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusWrite {
    pub slave: u8,
    pub register: u16,
    pub value: u16,
}

/// Motor state as reconstructed from the writes a slave has received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimMotor {
    /// `Some` while the last control word started the motor.
    pub running: Option<Spin>,
    pub rpm: u16,
    pub braked: bool,
}

#[derive(Default)]
struct SimBusState {
    writes: Vec<BusWrite>,
    motors: HashMap<u8, SimMotor>,
    failing: HashMap<u8, DriverError>,
    fail_next: Option<DriverError>,
}

impl SimBusState {
    fn apply(&mut self, w: BusWrite) {
        let motor = self.motors.entry(w.slave).or_default();
        match (w.register, w.value) {
            (REG_SPEED, v) => motor.rpm = v.swap_bytes(),
            (REG_CONTROL, CTRL_FORWARD) => {
                motor.running = Some(Spin::Forward);
                motor.braked = false;
            }
            (REG_CONTROL, CTRL_REVERSE) => {
                motor.running = Some(Spin::Reverse);
                motor.braked = false;
            }
            (REG_CONTROL, CTRL_STOP) => motor.running = None,
            (REG_CONTROL, CTRL_BRAKE) => {
                motor.running = None;
                motor.braked = true;
            }
            _ => {}
        }
    }
}

fn lock(state: &Mutex<SimBusState>) -> MutexGuard<'_, SimBusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A field bus that never touches hardware.
#[derive(Default)]
pub struct SimBus {
    state: Arc<Mutex<SimBusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observation and fault-injection handle sharing this bus's state.
    pub fn probe(&self) -> SimBusProbe {
        SimBusProbe {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl FieldBus for SimBus {
    async fn write_register(
        &mut self,
        slave: u8,
        register: u16,
        value: u16,
    ) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if let Some(err) = state.failing.get(&slave) {
            return Err(err.clone());
        }
        let write = BusWrite {
            slave,
            register,
            value,
        };
        state.writes.push(write);
        state.apply(write);
        Ok(())
    }
}

/// Test-side view of a [`SimBus`].
#[derive(Clone)]
pub struct SimBusProbe {
    state: Arc<Mutex<SimBusState>>,
}

impl SimBusProbe {
    /// Every acknowledged write, oldest first.
    pub fn writes(&self) -> Vec<BusWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    pub fn motor(&self, slave: u8) -> SimMotor {
        lock(&self.state).motors.get(&slave).copied().unwrap_or_default()
    }

    /// `true` when any simulated motor is turning.
    pub fn any_running(&self) -> bool {
        lock(&self.state).motors.values().any(|m| m.running.is_some())
    }

    /// Make every write to `slave` fail with `err` until [`heal`](Self::heal).
    pub fn fail_slave(&self, slave: u8, err: DriverError) {
        lock(&self.state).failing.insert(slave, err);
    }

    /// Fail only the next write, whichever slave it targets.
    pub fn fail_next(&self, err: DriverError) {
        lock(&self.state).fail_next = Some(err);
    }

    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.failing.clear();
        state.fail_next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_writes_and_decodes_motor_state() {
        let mut bus = SimBus::new();
        let probe = bus.probe();
        bus.write_register(2, REG_SPEED, 350u16.swap_bytes()).await.unwrap();
        bus.write_register(2, REG_CONTROL, CTRL_REVERSE).await.unwrap();

        assert_eq!(probe.writes().len(), 2);
        assert_eq!(
            probe.motor(2),
            SimMotor {
                running: Some(Spin::Reverse),
                rpm: 350,
                braked: false
            }
        );
        assert!(probe.any_running());

        bus.write_register(2, REG_CONTROL, CTRL_BRAKE).await.unwrap();
        assert!(!probe.any_running());
        assert!(probe.motor(2).braked);
    }

    #[tokio::test]
    async fn injected_failures() {
        let mut bus = SimBus::new();
        let probe = bus.probe();

        probe.fail_next(DriverError::BusTimeout { slave: 1 });
        assert!(bus.write_register(1, REG_CONTROL, CTRL_STOP).await.is_err());
        assert!(bus.write_register(1, REG_CONTROL, CTRL_STOP).await.is_ok());

        probe.fail_slave(3, DriverError::DeviceNack { slave: 3, code: 4 });
        assert!(bus.write_register(3, REG_CONTROL, CTRL_STOP).await.is_err());
        assert!(bus.write_register(4, REG_CONTROL, CTRL_STOP).await.is_ok());
        probe.heal();
        assert!(bus.write_register(3, REG_CONTROL, CTRL_STOP).await.is_ok());
    }
}
