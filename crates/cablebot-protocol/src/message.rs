//! Typed sensor bridge messages.
//!
//! Payload layouts (all multi-byte fields little-endian):
//!
//! | Type | Request | Response |
//! |---|---|---|
//! | `Ping` 0x01 | empty | empty |
//! | `Distance` 0x07 | empty | 13 bytes |
//! | `Bundle` 0x09 | `winch u8` | 32 bytes |
//! | `Imu` 0x0A | empty | 44 bytes |
//! | `Error` 0xE0 | n/a | `orig_type u8, winch u8, code u8` |

use std::fmt;

use cablebot_types::{DistanceReading, ImuReading, WinchReading};

use crate::frame::{DecodeError, Frame};

pub const BUNDLE_PAYLOAD_LEN: usize = 32;
pub const IMU_PAYLOAD_LEN: usize = 44;
pub const DISTANCE_PAYLOAD_LEN: usize = 13;
pub const ERROR_PAYLOAD_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x01,
    Distance = 0x07,
    Bundle = 0x09,
    Imu = 0x0A,
    Error = 0xE0,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x01 => Ok(Self::Ping),
            0x07 => Ok(Self::Distance),
            0x09 => Ok(Self::Bundle),
            0x0A => Ok(Self::Imu),
            0xE0 => Ok(Self::Error),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Requests
// ────────────────────────────────────────────────────────────────────────────

/// Host → bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Ping,
    Bundle { winch: u8 },
    Imu,
    Distance,
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Ping => MessageType::Ping,
            Request::Bundle { .. } => MessageType::Bundle,
            Request::Imu => MessageType::Imu,
            Request::Distance => MessageType::Distance,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Request::Bundle { winch } => vec![*winch],
            Request::Ping | Request::Imu | Request::Distance => Vec::new(),
        };
        Frame::new(self.message_type().into(), payload).encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_frame(&Frame::decode(bytes)?)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        let request = match MessageType::try_from(frame.msg_type)? {
            MessageType::Ping => {
                expect_len(frame, 0)?;
                Request::Ping
            }
            MessageType::Bundle => {
                expect_len(frame, 1)?;
                Request::Bundle {
                    winch: frame.payload[0],
                }
            }
            MessageType::Imu => {
                expect_len(frame, 0)?;
                Request::Imu
            }
            MessageType::Distance => {
                expect_len(frame, 0)?;
                Request::Distance
            }
            // The bridge never receives error frames.
            MessageType::Error => return Err(DecodeError::UnknownMessageType(frame.msg_type)),
        };
        Ok(request)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Responses
// ────────────────────────────────────────────────────────────────────────────

/// Error report from the bridge firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFault {
    /// Message type of the request that failed.
    pub orig_type: u8,
    pub winch: u8,
    pub code: u8,
}

impl DeviceFault {
    pub const BAD_LENGTH: u8 = 1;
    pub const COMPACT_TIMEOUT: u8 = 2;
    pub const UNKNOWN_COMMAND: u8 = 3;

    pub fn description(&self) -> &'static str {
        match self.code {
            Self::BAD_LENGTH => "bad length",
            Self::COMPACT_TIMEOUT => "compact read timeout",
            Self::UNKNOWN_COMMAND => "unknown command",
            _ => "unrecognised error code",
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bridge error {} ({}) for type 0x{:02X} winch {}",
            self.code,
            self.description(),
            self.orig_type,
            self.winch
        )
    }
}

/// Bridge → host.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Pong,
    Bundle(WinchReading),
    Imu(ImuReading),
    Distance(DistanceReading),
    Error(DeviceFault),
}

impl Response {
    pub fn message_type(&self) -> MessageType {
        match self {
            Response::Pong => MessageType::Ping,
            Response::Bundle(_) => MessageType::Bundle,
            Response::Imu(_) => MessageType::Imu,
            Response::Distance(_) => MessageType::Distance,
            Response::Error(_) => MessageType::Error,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Response::Pong => {}
            Response::Bundle(r) => {
                w.u8(r.winch);
                w.u8(r.flags);
                w.i32(r.total_count);
                w.i32(r.delta_count);
                w.u16(r.hall_raw);
                w.u16(r.dist_mm);
                w.u16(r.strength);
                w.u16(r.temp_raw);
                w.u16(r.age_ms);
                w.u16(r.bus_mv);
                w.i16(r.current_ma);
                w.u32(r.power_mw);
                w.u32(r.cache_age_ms);
            }
            Response::Imu(r) => {
                for v in r.gyro.iter().chain(r.accel.iter()) {
                    w.f32(*v);
                }
                w.f32(r.temp_c);
                w.f32(r.pitch);
                w.f32(r.roll);
                w.f32(r.yaw);
                w.u32(r.cache_age_ms);
            }
            Response::Distance(r) => {
                w.u8(r.ok);
                w.u16(r.dist_mm);
                w.u16(r.strength);
                w.u16(r.temp_raw);
                w.u16(r.age_ms);
                w.u32(r.cache_age_ms);
            }
            Response::Error(e) => {
                w.u8(e.orig_type);
                w.u8(e.winch);
                w.u8(e.code);
            }
        }
        Frame::new(self.message_type().into(), w.0).encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::from_frame(&Frame::decode(bytes)?)
    }

    /// Interpret an already checksum-verified frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        let msg_type = MessageType::try_from(frame.msg_type)?;
        let mut r = Reader::new(&frame.payload);
        let response = match msg_type {
            MessageType::Ping => {
                expect_len(frame, 0)?;
                Response::Pong
            }
            MessageType::Bundle => {
                expect_len(frame, BUNDLE_PAYLOAD_LEN)?;
                Response::Bundle(WinchReading {
                    winch: r.u8()?,
                    flags: r.u8()?,
                    total_count: r.i32()?,
                    delta_count: r.i32()?,
                    hall_raw: r.u16()?,
                    dist_mm: r.u16()?,
                    strength: r.u16()?,
                    temp_raw: r.u16()?,
                    age_ms: r.u16()?,
                    bus_mv: r.u16()?,
                    current_ma: r.i16()?,
                    power_mw: r.u32()?,
                    cache_age_ms: r.u32()?,
                })
            }
            MessageType::Imu => {
                expect_len(frame, IMU_PAYLOAD_LEN)?;
                let gyro = [r.f32()?, r.f32()?, r.f32()?];
                let accel = [r.f32()?, r.f32()?, r.f32()?];
                Response::Imu(ImuReading {
                    gyro,
                    accel,
                    temp_c: r.f32()?,
                    pitch: r.f32()?,
                    roll: r.f32()?,
                    yaw: r.f32()?,
                    cache_age_ms: r.u32()?,
                })
            }
            MessageType::Distance => {
                expect_len(frame, DISTANCE_PAYLOAD_LEN)?;
                Response::Distance(DistanceReading {
                    ok: r.u8()?,
                    dist_mm: r.u16()?,
                    strength: r.u16()?,
                    temp_raw: r.u16()?,
                    age_ms: r.u16()?,
                    cache_age_ms: r.u32()?,
                })
            }
            MessageType::Error => {
                expect_len(frame, ERROR_PAYLOAD_LEN)?;
                Response::Error(DeviceFault {
                    orig_type: r.u8()?,
                    winch: r.u8()?,
                    code: r.u8()?,
                })
            }
        };
        Ok(response)
    }
}

fn expect_len(frame: &Frame, expected: usize) -> Result<(), DecodeError> {
    if frame.payload.len() != expected {
        return Err(DecodeError::PayloadLength {
            msg_type: frame.msg_type,
            expected,
            actual: frame.payload.len(),
        });
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Little-endian field helpers
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn i16(&mut self, v: i16) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + N)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or(DecodeError::Truncated {
                needed: self.pos + N,
                got: self.buf.len(),
            })?;
        self.pos += N;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }
    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.take().map(u16::from_le_bytes)
    }
    fn i16(&mut self) -> Result<i16, DecodeError> {
        self.take().map(i16::from_le_bytes)
    }
    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.take().map(u32::from_le_bytes)
    }
    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.take().map(i32::from_le_bytes)
    }
    fn f32(&mut self) -> Result<f32, DecodeError> {
        self.take().map(f32::from_le_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_winch() -> WinchReading {
        WinchReading {
            winch: 2,
            flags: 0x03,
            total_count: -12_345,
            delta_count: 17,
            hall_raw: 1620,
            dist_mm: 880,
            strength: 4000,
            temp_raw: 2100,
            age_ms: 12,
            bus_mv: 24_100,
            current_ma: -350,
            power_mw: 8_400,
            cache_age_ms: 5,
        }
    }

    #[test]
    fn bundle_request_layout() {
        let bytes = Request::Bundle { winch: 3 }.encode();
        assert_eq!(&bytes[..4], &[0x09, 0x01, 0x00, 0x03]);
        assert_eq!(Request::decode(&bytes).unwrap(), Request::Bundle { winch: 3 });
    }

    #[test]
    fn empty_requests_roundtrip() {
        for req in [Request::Ping, Request::Imu, Request::Distance] {
            assert_eq!(Request::decode(&req.encode()).unwrap(), req);
        }
    }

    #[test]
    fn bundle_payload_is_32_bytes() {
        let bytes = Response::Bundle(sample_winch()).encode();
        assert_eq!(bytes.len(), 3 + BUNDLE_PAYLOAD_LEN + 1);
        // hall_raw sits after winch, flags and the two i32 counters.
        assert_eq!(u16::from_le_bytes([bytes[3 + 10], bytes[3 + 11]]), 1620);
    }

    #[test]
    fn imu_and_distance_sizes() {
        let imu = Response::Imu(ImuReading::default()).encode();
        assert_eq!(imu.len(), 3 + IMU_PAYLOAD_LEN + 1);
        let dist = Response::Distance(DistanceReading::default()).encode();
        assert_eq!(dist.len(), 3 + DISTANCE_PAYLOAD_LEN + 1);
    }

    #[test]
    fn device_error_decodes() {
        let fault = DeviceFault {
            orig_type: 0x09,
            winch: 4,
            code: DeviceFault::COMPACT_TIMEOUT,
        };
        let decoded = Response::decode(&Response::Error(fault).encode()).unwrap();
        assert_eq!(decoded, Response::Error(fault));
        assert!(fault.to_string().contains("compact read timeout"));
    }

    #[test]
    fn unknown_type_with_valid_crc_is_rejected() {
        let bytes = Frame::new(0x42, vec![]).encode();
        assert_eq!(
            Response::decode(&bytes),
            Err(DecodeError::UnknownMessageType(0x42))
        );
    }

    #[test]
    fn wrong_payload_size_is_rejected() {
        let bytes = Frame::new(0x09, vec![0; 31]).encode();
        assert_eq!(
            Response::decode(&bytes),
            Err(DecodeError::PayloadLength {
                msg_type: 0x09,
                expected: 32,
                actual: 31
            })
        );
    }

    fn arb_winch() -> impl Strategy<Value = WinchReading> {
        (
            (any::<u8>(), any::<u8>(), any::<i32>(), any::<i32>()),
            (any::<u16>(), any::<u16>(), any::<u16>(), any::<u16>()),
            (any::<u16>(), any::<u16>(), any::<i16>(), any::<u32>(), any::<u32>()),
        )
            .prop_map(
                |(
                    (winch, flags, total_count, delta_count),
                    (hall_raw, dist_mm, strength, temp_raw),
                    (age_ms, bus_mv, current_ma, power_mw, cache_age_ms),
                )| WinchReading {
                    winch,
                    flags,
                    total_count,
                    delta_count,
                    hall_raw,
                    dist_mm,
                    strength,
                    temp_raw,
                    age_ms,
                    bus_mv,
                    current_ma,
                    power_mw,
                    cache_age_ms,
                },
            )
    }

    fn arb_imu() -> impl Strategy<Value = ImuReading> {
        let f = -1.0e6f32..1.0e6f32;
        (
            proptest::array::uniform3(f.clone()),
            proptest::array::uniform3(f.clone()),
            (f.clone(), f.clone(), f.clone(), f),
            any::<u32>(),
        )
            .prop_map(|(gyro, accel, (temp_c, pitch, roll, yaw), cache_age_ms)| {
                ImuReading {
                    gyro,
                    accel,
                    temp_c,
                    pitch,
                    roll,
                    yaw,
                    cache_age_ms,
                }
            })
    }

    fn arb_response() -> impl Strategy<Value = Response> {
        prop_oneof![
            Just(Response::Pong),
            arb_winch().prop_map(Response::Bundle),
            arb_imu().prop_map(Response::Imu),
            (any::<u8>(), any::<u16>(), any::<u16>(), any::<u16>(), any::<u16>(), any::<u32>())
                .prop_map(|(ok, dist_mm, strength, temp_raw, age_ms, cache_age_ms)| {
                    Response::Distance(DistanceReading {
                        ok,
                        dist_mm,
                        strength,
                        temp_raw,
                        age_ms,
                        cache_age_ms,
                    })
                }),
            (any::<u8>(), any::<u8>(), any::<u8>()).prop_map(|(orig_type, winch, code)| {
                Response::Error(DeviceFault {
                    orig_type,
                    winch,
                    code,
                })
            }),
        ]
    }

    proptest! {
        #[test]
        fn response_roundtrip(resp in arb_response()) {
            prop_assert_eq!(Response::decode(&resp.encode()).unwrap(), resp);
        }

        #[test]
        fn any_single_byte_corruption_is_an_error(
            reading in arb_winch(),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = Response::Bundle(reading).encode();
            let i = index.index(bytes.len());
            bytes[i] ^= flip;
            prop_assert!(Response::decode(&bytes).is_err());
        }

        #[test]
        fn truncation_is_an_error(reading in arb_winch(), cut in 1usize..36) {
            let bytes = Response::Bundle(reading).encode();
            prop_assert!(Response::decode(&bytes[..bytes.len() - cut]).is_err());
        }
    }
}
