//! Motion vocabulary: what an operator may ask the robot to do.
//!
//! A [`MotionRequest`] is a value object consumed synchronously by the motion
//! controller.  It is never persisted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mode::Mode;

/// Highest speed the winch motor controllers accept.
pub const MAX_RPM: u16 = 4000;

/// Number of winches the direction patterns are defined for.  Smaller rigs
/// use the leading entries; larger rigs cannot be driven.
pub const MAX_WINCHES: usize = 4;

/// Rotation sense of a single winch motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Spin {
    Forward,
    Reverse,
}

impl Spin {
    fn from_sign(sign: i8) -> Self {
        if sign >= 0 { Spin::Forward } else { Spin::Reverse }
    }
}

/// A single command for one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MotorAction {
    /// Set the speed and start turning.
    Run { spin: Spin, rpm: u16 },
    /// Stop turning; `brake` selects a braking stop over coasting.
    Stop { brake: bool },
}

/// Directional test moves of the cable robot's platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    pub const ALL: [Direction; 6] = [
        Direction::Forward,
        Direction::Back,
        Direction::Left,
        Direction::Right,
        Direction::Up,
        Direction::Down,
    ];

    /// Per-winch spin pattern, in winch order, for a four-winch rig.
    pub fn pattern(self) -> [Spin; MAX_WINCHES] {
        let signs: [i8; MAX_WINCHES] = match self {
            Direction::Forward => [1, 1, -1, -1],
            Direction::Back => [-1, -1, 1, 1],
            Direction::Left => [-1, 1, -1, 1],
            Direction::Right => [1, -1, 1, -1],
            Direction::Up => [1, 1, 1, 1],
            Direction::Down => [-1, -1, -1, -1],
        };
        signs.map(Spin::from_sign)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Forward => "forward",
            Direction::Back => "back",
            Direction::Left => "left",
            Direction::Right => "right",
            Direction::Up => "up",
            Direction::Down => "down",
        };
        f.write_str(name)
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|d| d.to_string() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown direction '{}'", s.trim()))
    }
}

/// Setup-mode jog axis.  Jogging pays cable in or out on every winch at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JogDirection {
    Forward,
    Reverse,
}

impl JogDirection {
    /// Jog forward winds every winch like [`Direction::Up`], reverse like
    /// [`Direction::Down`].
    pub fn pattern(self) -> [Spin; MAX_WINCHES] {
        match self {
            JogDirection::Forward => Direction::Up.pattern(),
            JogDirection::Reverse => Direction::Down.pattern(),
        }
    }
}

impl FromStr for JogDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(JogDirection::Forward),
            "reverse" => Ok(JogDirection::Reverse),
            other => Err(format!("unknown jog direction '{other}'")),
        }
    }
}

/// Parameters of a setup-mode jog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JogParams {
    pub direction: JogDirection,
    pub rpm: u16,
    /// Run time before the controller stops the motors on its own.
    /// `None` runs until an explicit stop.
    pub duration: Option<Duration>,
}

/// Parameters of a test-mode directional move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMoveParams {
    pub direction: Direction,
    pub rpm: u16,
    pub duration: Option<Duration>,
}

/// Parameters of a setup-mode hall run.
///
/// Every winch turns in the jog sense of `direction`, each at a speed
/// derived from its own hall reading by the controller's
/// [`HallRunProfile`].  Speeds follow the readings until the run is
/// stopped or `duration` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HallRunParams {
    pub direction: JogDirection,
    pub duration: Option<Duration>,
}

/// Maps a hall reading to a winch speed for hall runs.
///
/// Readings from the safety floor up to `hall_max` scale linearly onto
/// `0..=rpm_max`, clamped below at `rpm_min`.  Readings under the floor
/// map to zero; the motion gate refuses those before any speed is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HallRunProfile {
    pub hall_max: u16,
    pub rpm_min: u16,
    pub rpm_max: u16,
}

impl Default for HallRunProfile {
    fn default() -> Self {
        Self {
            hall_max: 2800,
            rpm_min: 200,
            rpm_max: 1500,
        }
    }
}

impl HallRunProfile {
    pub fn rpm_for(&self, hall: u16, min_hall: u16) -> u16 {
        if self.hall_max <= min_hall {
            return self.rpm_min;
        }
        if hall < min_hall {
            return 0;
        }
        let span = f64::from(self.hall_max - min_hall);
        let ratio = f64::from(hall - min_hall) / span;
        let rpm = (ratio * f64::from(self.rpm_max)).clamp(0.0, f64::from(self.rpm_max));
        rpm.max(f64::from(self.rpm_min)) as u16
    }
}

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum MotionCommand {
    Jog(JogParams),
    /// Setup-mode run with per-winch speeds following the hall readings.
    HallRun(HallRunParams),
    TestMove(TestMoveParams),
    /// Soft stop: motors stop, mode and fault untouched.
    Stop,
    /// Emergency stop: motors stop and the fault latch is set.
    StopAll,
    SetMode(Mode),
}

impl MotionCommand {
    /// `true` for the commands that put motors in motion.
    pub fn moves_motors(&self) -> bool {
        matches!(
            self,
            MotionCommand::Jog(_) | MotionCommand::HallRun(_) | MotionCommand::TestMove(_)
        )
    }

    /// `true` for the stop commands, which are dispatched ahead of anything
    /// else waiting for the controller.
    pub fn is_stop(&self) -> bool {
        matches!(self, MotionCommand::Stop | MotionCommand::StopAll)
    }

    /// Short label used in logs and status reports.
    pub fn label(&self) -> String {
        match self {
            MotionCommand::Jog(p) => format!("jog_{:?}", p.direction).to_lowercase(),
            MotionCommand::HallRun(p) => format!("setup_hall_{:?}", p.direction).to_lowercase(),
            MotionCommand::TestMove(p) => format!("test_{}", p.direction),
            MotionCommand::Stop => "stop".to_string(),
            MotionCommand::StopAll => "stop_all".to_string(),
            MotionCommand::SetMode(m) => format!("mode_{m}"),
        }
    }
}

/// A request as issued by the control facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionRequest {
    pub id: Uuid,
    pub command: MotionCommand,
    /// Issuing context, e.g. `"console"` or `"web"`.
    pub source: String,
    pub issued_at: DateTime<Utc>,
}

impl MotionRequest {
    pub fn new(command: MotionCommand, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            source: source.into(),
            issued_at: Utc::now(),
        }
    }
}
