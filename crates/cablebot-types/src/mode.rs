//! Operating mode and fault latch vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The single active operating mode of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Powered, no motion permitted.  Initial mode.
    #[default]
    Idle,
    /// Rigging / cable tensioning: jog commands are permitted.
    Setup,
    /// Directional test moves are permitted.
    Test,
    /// Latched unsafe state.  Only left through an explicit fault clear.
    Fault,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Setup => write!(f, "setup"),
            Mode::Test => write!(f, "test"),
            Mode::Fault => write!(f, "fault"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Mode::Idle),
            "setup" => Ok(Mode::Setup),
            "test" => Ok(Mode::Test),
            "fault" => Ok(Mode::Fault),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// Why the fault latch was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCause {
    /// A hall reading fell below the configured minimum.
    HallThresholdViolation,
    /// The sensor bridge link failed while motors were running.
    CommFailure,
    /// No sufficiently fresh sensor bundle was available.
    StaleData,
    /// Operator emergency stop or an explicit request for `Fault` mode.
    ManualTrigger,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::HallThresholdViolation => write!(f, "hall threshold violation"),
            FaultCause::CommFailure => write!(f, "communication failure"),
            FaultCause::StaleData => write!(f, "stale telemetry"),
            FaultCause::ManualTrigger => write!(f, "manual trigger"),
        }
    }
}
