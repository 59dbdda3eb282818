//! [`DriverLayer`] – the sole path from software to the winch motors.
//!
//! Commands are addressed by winch id; the layer resolves the field-bus
//! slave address and issues the register writes.  It keeps no safety state
//! of its own: deciding *whether* a motor may move is the motion
//! controller's job, and the controller takes ownership of the
//! `DriverLayer` when it is built.  The type is deliberately not `Clone`.

use std::collections::HashMap;

use cablebot_types::{DriverError, MAX_RPM, MotorAction, Spin};
use tracing::{debug, error, info};

use crate::bus::FieldBus;
use crate::modbus::register_writes;

/// Maps a winch id to the field-bus address of its motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinchTarget {
    pub winch: u8,
    pub slave: u8,
}

impl WinchTarget {
    pub fn new(winch: u8, slave: u8) -> Self {
        Self { winch, slave }
    }

    /// Targets whose slave address equals the winch id.
    pub fn sequential(winches: &[u8]) -> Vec<Self> {
        winches.iter().map(|&w| Self::new(w, w)).collect()
    }
}

/// Owns its field bus.  The bus is moved in at construction and the layer
/// itself is moved into the motion controller, so one bus connection has
/// exactly one writer.  A second `DriverLayer` needs a second bus
/// connection opened by the binary's wiring.
///
/// ```compile_fail
/// use cablebot_hal::{DriverLayer, WinchTarget, sim::SimBus};
///
/// let driver = DriverLayer::new(Box::new(SimBus::new()), WinchTarget::sequential(&[1]));
/// let second = driver.clone();
/// ```
pub struct DriverLayer {
    bus: Box<dyn FieldBus>,
    /// Winch order is the order spin patterns are applied in.
    targets: Vec<WinchTarget>,
    last_action: HashMap<u8, MotorAction>,
}

impl DriverLayer {
    pub fn new(bus: Box<dyn FieldBus>, targets: Vec<WinchTarget>) -> Self {
        Self {
            bus,
            targets,
            last_action: HashMap::new(),
        }
    }

    pub fn winch_count(&self) -> usize {
        self.targets.len()
    }

    pub fn winch_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.targets.iter().map(|t| t.winch)
    }

    /// Last action successfully applied to `winch`.
    pub fn last_action(&self, winch: u8) -> Option<MotorAction> {
        self.last_action.get(&winch).copied()
    }

    fn slave_for(&self, winch: u8) -> Result<u8, DriverError> {
        self.targets
            .iter()
            .find(|t| t.winch == winch)
            .map(|t| t.slave)
            .ok_or_else(|| DriverError::InvalidTarget(format!("unknown winch {winch}")))
    }

    fn check_rpm(rpm: u16) -> Result<(), DriverError> {
        if rpm > MAX_RPM {
            return Err(DriverError::InvalidTarget(format!(
                "rpm {rpm} exceeds maximum {MAX_RPM}"
            )));
        }
        Ok(())
    }

    /// Apply `action` to one winch motor.
    ///
    /// # Errors
    ///
    /// [`DriverError::InvalidTarget`] for an unknown winch or an out-of-range
    /// speed (nothing is sent); otherwise whatever the bus reports.
    pub async fn command_motor(&mut self, winch: u8, action: MotorAction) -> Result<(), DriverError> {
        let slave = self.slave_for(winch)?;
        if let MotorAction::Run { rpm, .. } = action {
            Self::check_rpm(rpm)?;
        }
        for (register, value) in register_writes(action) {
            self.bus.write_register(slave, register, value).await?;
        }
        debug!(winch, slave, ?action, "motor command applied");
        self.last_action.insert(winch, action);
        Ok(())
    }

    /// Run every winch at `rpm`, each in the sense given by `pattern`
    /// (one entry per winch, in winch order).
    ///
    /// Stops at the first failing motor and returns its error; motors
    /// already started keep running, so the caller must follow up with
    /// [`stop_all`](Self::stop_all).
    pub async fn drive(&mut self, pattern: &[Spin], rpm: u16) -> Result<(), DriverError> {
        let runs: Vec<(Spin, u16)> = pattern.iter().map(|&spin| (spin, rpm)).collect();
        self.drive_each(&runs).await?;
        info!(rpm, ?pattern, "winches driving");
        Ok(())
    }

    /// Like [`drive`](Self::drive), with a speed per winch.
    ///
    /// Every speed is checked before anything is sent.
    pub async fn drive_each(&mut self, runs: &[(Spin, u16)]) -> Result<(), DriverError> {
        if runs.len() != self.targets.len() {
            return Err(DriverError::InvalidTarget(format!(
                "pattern has {} entries for {} winches",
                runs.len(),
                self.targets.len()
            )));
        }
        for &(_, rpm) in runs {
            Self::check_rpm(rpm)?;
        }

        let winches: Vec<u8> = self.winch_ids().collect();
        for (winch, &(spin, rpm)) in winches.into_iter().zip(runs) {
            self.command_motor(winch, MotorAction::Run { spin, rpm }).await?;
        }
        Ok(())
    }

    /// Stop every motor, whatever state it is believed to be in.
    ///
    /// A failure on one motor does not prevent the others from being
    /// commanded; the first error is returned once all have been tried.
    pub async fn stop_all(&mut self) -> Result<(), DriverError> {
        let mut first_err = None;
        let winches: Vec<u8> = self.winch_ids().collect();
        for winch in winches {
            if let Err(e) = self.command_motor(winch, MotorAction::Stop { brake: false }).await {
                error!(winch, error = %e, "failed to stop winch");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("all winches stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{CTRL_FORWARD, CTRL_STOP, REG_CONTROL};
    use crate::sim::{SimBus, SimBusProbe};
    use cablebot_types::Direction;

    fn layer() -> (DriverLayer, SimBusProbe) {
        let bus = SimBus::new();
        let probe = bus.probe();
        let targets = vec![
            WinchTarget::new(1, 11),
            WinchTarget::new(2, 12),
            WinchTarget::new(3, 13),
            WinchTarget::new(4, 14),
        ];
        (DriverLayer::new(Box::new(bus), targets), probe)
    }

    #[tokio::test]
    async fn command_motor_routes_to_slave() {
        let (mut d, probe) = layer();
        d.command_motor(
            2,
            MotorAction::Run {
                spin: Spin::Forward,
                rpm: 200,
            },
        )
        .await
        .unwrap();

        let motor = probe.motor(12);
        assert_eq!(motor.running, Some(Spin::Forward));
        assert_eq!(motor.rpm, 200);
        let last = probe.writes().last().copied().unwrap();
        assert_eq!((last.slave, last.register, last.value), (12, REG_CONTROL, CTRL_FORWARD));
        assert_eq!(
            d.last_action(2),
            Some(MotorAction::Run {
                spin: Spin::Forward,
                rpm: 200
            })
        );
    }

    #[tokio::test]
    async fn unknown_winch_is_invalid_target() {
        let (mut d, probe) = layer();
        let err = d
            .command_motor(9, MotorAction::Stop { brake: false })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidTarget(_)));
        assert!(probe.writes().is_empty());
    }

    #[tokio::test]
    async fn excessive_rpm_sends_nothing() {
        let (mut d, probe) = layer();
        let err = d
            .drive(&Direction::Up.pattern(), MAX_RPM + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidTarget(_)));
        assert!(probe.writes().is_empty());
    }

    #[tokio::test]
    async fn drive_applies_pattern_in_winch_order() {
        let (mut d, probe) = layer();
        d.drive(&Direction::Forward.pattern(), 350).await.unwrap();
        assert_eq!(probe.motor(11).running, Some(Spin::Forward));
        assert_eq!(probe.motor(12).running, Some(Spin::Forward));
        assert_eq!(probe.motor(13).running, Some(Spin::Reverse));
        assert_eq!(probe.motor(14).running, Some(Spin::Reverse));
    }

    #[tokio::test]
    async fn drive_rejects_wrong_pattern_length() {
        let (mut d, _probe) = layer();
        let err = d.drive(&[Spin::Forward; 3], 100).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn drive_each_sets_individual_speeds() {
        let (mut d, probe) = layer();
        let runs = [
            (Spin::Forward, 200),
            (Spin::Forward, 750),
            (Spin::Reverse, 1500),
            (Spin::Reverse, 300),
        ];
        d.drive_each(&runs).await.unwrap();
        assert_eq!(probe.motor(12).rpm, 750);
        assert_eq!(probe.motor(13).rpm, 1500);
        assert_eq!(probe.motor(13).running, Some(Spin::Reverse));
    }

    #[tokio::test]
    async fn drive_each_checks_every_speed_first() {
        let (mut d, probe) = layer();
        let runs = [
            (Spin::Forward, 200),
            (Spin::Forward, 200),
            (Spin::Forward, 200),
            (Spin::Forward, MAX_RPM + 1),
        ];
        assert!(matches!(
            d.drive_each(&runs).await,
            Err(DriverError::InvalidTarget(_))
        ));
        assert!(probe.writes().is_empty());
    }

    #[tokio::test]
    async fn drive_stops_at_first_failure() {
        let (mut d, probe) = layer();
        probe.fail_slave(13, DriverError::BusTimeout { slave: 13 });
        let err = d.drive(&Direction::Up.pattern(), 100).await.unwrap_err();
        assert_eq!(err, DriverError::BusTimeout { slave: 13 });
        assert!(probe.motor(12).running.is_some());
        assert!(probe.motor(14).running.is_none());
    }

    #[tokio::test]
    async fn stop_all_continues_past_failures() {
        let (mut d, probe) = layer();
        d.drive(&Direction::Up.pattern(), 100).await.unwrap();
        probe.fail_slave(12, DriverError::DeviceNack { slave: 12, code: 4 });

        let err = d.stop_all().await.unwrap_err();
        assert_eq!(err, DriverError::DeviceNack { slave: 12, code: 4 });
        for slave in [11, 13, 14] {
            assert!(probe.motor(slave).running.is_none(), "slave {slave} still running");
        }
    }

    #[tokio::test]
    async fn stop_all_sends_even_when_idle() {
        let (mut d, probe) = layer();
        d.stop_all().await.unwrap();
        let stops = probe
            .writes()
            .iter()
            .filter(|w| w.register == REG_CONTROL && w.value == CTRL_STOP)
            .count();
        assert_eq!(stops, 4);
    }
}
