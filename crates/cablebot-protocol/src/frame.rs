//! Frame encoding and decoding.
//!
//! Frame format:
//! - TYPE (1 byte): message type identifier
//! - LENGTH (2 bytes, little-endian): payload length
//! - PAYLOAD (LENGTH bytes): type-specific data
//! - CRC (1 byte): CRC-8 over TYPE, LENGTH and PAYLOAD
//!
//! Length and checksum are validated before any payload byte is interpreted.
//! A frame that fails either check is rejected as a whole.

use thiserror::Error;

use crate::crc::crc8;

/// TYPE + LENGTH.
pub const HEADER_LEN: usize = 3;

/// CRC byte.
pub const TRAILER_LEN: usize = 1;

/// Largest payload the codec accepts.  Guards the reader against allocating
/// for a garbage length field.
pub const MAX_PAYLOAD: usize = 512;

/// Malformed wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("frame length mismatch: header declares {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("checksum mismatch: frame carries 0x{received:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch { received: u8, computed: u8 },

    #[error("unknown message type 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("message type 0x{msg_type:02X} expects {expected} payload bytes, got {actual}")]
    PayloadLength {
        msg_type: u8,
        expected: usize,
        actual: usize,
    },
}

/// A checksum-verified frame whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self { msg_type, payload }
    }

    /// Total encoded size of this frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.msg_type);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.push(crc8(&out));
        out
    }

    /// Read the header of a frame.  Returns the message type and the payload
    /// length; the caller then needs `length + TRAILER_LEN` more bytes.
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u8, usize), DecodeError> {
        let len = u16::from_le_bytes([header[1], header[2]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(DecodeError::PayloadTooLarge(len));
        }
        Ok((header[0], len))
    }

    /// Decode exactly one frame from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header: &[u8; HEADER_LEN] = bytes
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(DecodeError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            })?;
        let (msg_type, len) = Self::parse_header(header)?;

        let total = HEADER_LEN + len + TRAILER_LEN;
        if bytes.len() < total {
            return Err(DecodeError::Truncated {
                needed: total,
                got: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(DecodeError::LengthMismatch {
                declared: total,
                actual: bytes.len(),
            });
        }

        let (body, trailer) = bytes.split_at(total - TRAILER_LEN);
        let computed = crc8(body);
        if trailer[0] != computed {
            return Err(DecodeError::ChecksumMismatch {
                received: trailer[0],
                computed,
            });
        }

        Ok(Self {
            msg_type,
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}
