//! `cablebot-protocol` – sensor bridge wire codec.
//!
//! Pure, stateless translation between structured bridge messages and their
//! byte representation.  No I/O, no retries: callers treat every
//! [`DecodeError`] as a failed exchange.
//!
//! # Modules
//!
//! - [`crc`] – CRC-8 (poly 0x07) used as the frame trailer.
//! - [`frame`] – framing: `[type u8][length u16 LE][payload][crc8]`.
//! - [`message`] – typed [`Request`] and [`Response`] payloads.

pub mod crc;
pub mod frame;
pub mod message;

pub use frame::{DecodeError, Frame, HEADER_LEN, MAX_PAYLOAD, TRAILER_LEN};
pub use message::{DeviceFault, MessageType, Request, Response};
