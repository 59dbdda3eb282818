//! Error taxonomy shared across the controller.
//!
//! Decode and link errors stay inside their own crates and never reach the
//! motion controller; only [`DriverError`] and [`SafetyRejection`] are
//! surfaced to the control facade, wrapped in [`ControlError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::{FaultCause, Mode};

/// Field-bus level failure reported by the driver layer.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverError {
    #[error("bus timeout waiting for slave {slave}")]
    BusTimeout { slave: u8 },

    #[error("slave {slave} rejected the command (exception code {code})")]
    DeviceNack { slave: u8, code: u8 },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("bus i/o error: {0}")]
    Io(String),
}

/// A correct refusal by the motion controller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyRejection {
    #[error("motion refused: controller is faulted ({0})")]
    Faulted(FaultCause),

    #[error("motion refused: telemetry is stale or missing")]
    StaleTelemetry,

    #[error("motion refused: winch {winch} hall reading {value} below minimum {min}")]
    HallUnsafe { winch: u8, value: u16, min: u16 },

    #[error("'{action}' is not permitted in {current} mode")]
    ModeMismatch { action: String, current: Mode },

    #[error("mode change refused: controller is still faulted ({0}); clear the fault first")]
    StillFaulted(FaultCause),

    #[error("no fault to clear")]
    NotFaulted,
}

/// Result discriminant of every control facade operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlError {
    #[error(transparent)]
    Rejected(#[from] SafetyRejection),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("motion controller is not running")]
    Unavailable,
}

impl ControlError {
    /// The safety rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<&SafetyRejection> {
        match self {
            ControlError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_converts_into_control_error() {
        let err: ControlError = SafetyRejection::StaleTelemetry.into();
        assert_eq!(err.rejection(), Some(&SafetyRejection::StaleTelemetry));
    }

    #[test]
    fn driver_error_is_not_a_rejection() {
        let err: ControlError = DriverError::BusTimeout { slave: 3 }.into();
        assert!(err.rejection().is_none());
        assert!(err.to_string().contains("slave 3"));
    }

    #[test]
    fn hall_rejection_display_names_winch() {
        let err = SafetyRejection::HallUnsafe {
            winch: 2,
            value: 1400,
            min: 1500,
        };
        let text = err.to_string();
        assert!(text.contains("winch 2"));
        assert!(text.contains("1400"));
    }

    #[test]
    fn control_error_roundtrip() {
        let err = ControlError::Rejected(SafetyRejection::ModeMismatch {
            action: "jog_forward".into(),
            current: Mode::Test,
        });
        let json = serde_json::to_string(&err).unwrap();
        let back: ControlError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
