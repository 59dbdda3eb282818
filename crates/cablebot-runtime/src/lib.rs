//! `cablebot-runtime` – runs the movement authority.
//!
//! # Modules
//!
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   single task that owns the [`MotionController`][cablebot_kernel::MotionController].
//!   Requests are processed one at a time, stops ahead of everything else,
//!   and the active motion is supervised every tick.
//! - [`handle`] – [`ControllerHandle`][handle::ControllerHandle]: the
//!   cloneable operation set used by the operator console and any other
//!   front end.
//! - [`logging`] – [`init_tracing`][logging::init_tracing]: global `tracing`
//!   subscriber with an optional OTLP span exporter.

pub mod control_loop;
pub mod handle;
pub mod logging;

pub use control_loop::ControlLoop;
pub use handle::ControllerHandle;
pub use logging::{TracerProviderGuard, init_tracing};
