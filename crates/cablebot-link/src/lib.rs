//! `cablebot-link` – the single channel to the sensor bridge.
//!
//! No other component opens a socket to the bridge or sees its bytes.  The
//! link polls the bridge, assembles a [`SensorBundle`][cablebot_types::SensorBundle]
//! per poll, and publishes it on a `watch` feed that the motion controller
//! reads without ever blocking on I/O.
//!
//! # Modules
//!
//! - [`link`] – [`TelemetryLink`]: session, reconnect backoff, poller.
//! - [`sim`] – [`SimBridge`][sim::SimBridge], a local TCP stand-in for the
//!   bridge firmware.

pub mod link;
pub mod sim;

pub use link::{BundleFeed, LinkConfig, LinkError, LinkHealth, TelemetryLink};
