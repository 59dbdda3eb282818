//! `cablebot-types` – shared vocabulary of the winch robot controller.
//!
//! Every other crate speaks in these types: the operating [`Mode`] and the
//! latched [`FaultCause`], the [`SensorBundle`] snapshot produced by the
//! telemetry link, the [`MotionRequest`] value objects handed to the motion
//! controller, and the error taxonomy ([`DriverError`], [`SafetyRejection`],
//! [`ControlError`]).

pub mod error;
pub mod mode;
pub mod motion;
pub mod sensor;
pub mod status;

pub use error::{ControlError, DriverError, SafetyRejection};
pub use mode::{FaultCause, Mode};
pub use motion::{
    Direction, HallRunParams, HallRunProfile, JogDirection, JogParams, MAX_RPM, MAX_WINCHES,
    MotionCommand, MotionRequest, MotorAction, Spin, TestMoveParams,
};
pub use sensor::{DistanceReading, ImuReading, SafetyThresholds, SensorBundle, WinchReading};
pub use status::ControllerStatus;
