//! `cablebot-hal` – hardware abstraction for the winch motors.
//!
//! The only code in the system that speaks the motor field bus.  Everything
//! above this crate commands motors through [`DriverLayer`] and never sees a
//! register address.
//!
//! # Modules
//!
//! - [`modbus`] – Modbus RTU framing and the BLD-510B register map.
//! - [`bus`] – the [`FieldBus`] seam and the [`RtuBus`] stream transport.
//! - [`driver`] – [`DriverLayer`]: per-winch motor commands, pattern drives,
//!   and the unconditional `stop_all`.
//! - [`sim`] – [`SimBus`][sim::SimBus], an in-process field bus for tests and
//!   `--simulate` runs.

pub mod bus;
pub mod driver;
pub mod modbus;
pub mod sim;

pub use bus::{FieldBus, RtuBus};
pub use driver::{DriverLayer, WinchTarget};
