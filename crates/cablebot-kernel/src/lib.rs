//! `cablebot-kernel` – the movement authority.
//!
//! Owns the robot's mode and fault latch and decides whether a requested
//! motion reaches the motors.  It does not talk to the sensor bridge; it
//! reads the telemetry link's published snapshot and nothing else.
//!
//! # Modules
//!
//! - [`safety`] – [`SafetyMonitor`][safety::SafetyMonitor]: ordered
//!   [`SafetyRule`][safety::SafetyRule]s evaluated against one bundle
//!   snapshot (freshness first, then hall floor).
//! - [`motion_controller`] – [`MotionController`][motion_controller::MotionController]:
//!   the state machine.  It is constructed with the
//!   [`DriverLayer`][cablebot_hal::DriverLayer] by value, so no other
//!   component can command a motor once the controller exists.

pub mod motion_controller;
pub mod safety;

pub use motion_controller::{BundleFeed, MotionController};
pub use safety::{FreshnessRule, HallFloorRule, SafetyMonitor, SafetyRule, Violation};
