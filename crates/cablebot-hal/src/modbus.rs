//! Modbus RTU framing for the BLD-510B brushless motor controller.
//!
//! Only function `0x06` (write single register) is used.  The controller
//! echoes a successful write byte for byte; a failed one comes back as a
//! five-byte exception reply with the high bit of the function code set.

use cablebot_types::{MAX_RPM, MotorAction, Spin};

pub const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Run/stop control register.
pub const REG_CONTROL: u16 = 0x8000;
/// Target speed register.
pub const REG_SPEED: u16 = 0x8005;

pub const CTRL_FORWARD: u16 = 0x0902;
pub const CTRL_REVERSE: u16 = 0x0B02;
pub const CTRL_STOP: u16 = 0x0802;
pub const CTRL_BRAKE: u16 = 0x0D02;

/// Length of a write request and of its echo.
pub const WRITE_FRAME_LEN: usize = 8;
/// Length of an exception reply.
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |mut crc, &b| {
        crc ^= b as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
        crc
    })
}

/// Build a write-single-register request.  The CRC is sent low byte first.
pub fn write_single_register(slave: u8, register: u16, value: u16) -> [u8; WRITE_FRAME_LEN] {
    let [rh, rl] = register.to_be_bytes();
    let [vh, vl] = value.to_be_bytes();
    let mut frame = [slave, FN_WRITE_SINGLE_REGISTER, rh, rl, vh, vl, 0, 0];
    let [cl, ch] = crc16(&frame[..6]).to_le_bytes();
    frame[6] = cl;
    frame[7] = ch;
    frame
}

/// `true` when the trailing two bytes are a valid CRC of the rest.
pub fn crc_ok(frame: &[u8]) -> bool {
    match frame.len().checked_sub(2) {
        Some(n) if n > 0 => crc16(&frame[..n]).to_le_bytes() == [frame[n], frame[n + 1]],
        _ => false,
    }
}

/// Speed register value for `rpm`.  The controller reads the register
/// byte-swapped, so 0x0190 (400 rpm) is written as 0x9001.  Values above
/// [`MAX_RPM`] are clamped.
pub fn encode_rpm(rpm: u16) -> u16 {
    rpm.min(MAX_RPM).swap_bytes()
}

pub fn control_word(spin: Spin) -> u16 {
    match spin {
        Spin::Forward => CTRL_FORWARD,
        Spin::Reverse => CTRL_REVERSE,
    }
}

/// Register writes that carry out `action`, in order.
pub fn register_writes(action: MotorAction) -> Vec<(u16, u16)> {
    match action {
        MotorAction::Run { spin, rpm } => vec![
            (REG_SPEED, encode_rpm(rpm)),
            (REG_CONTROL, control_word(spin)),
        ],
        MotorAction::Stop { brake: false } => vec![(REG_CONTROL, CTRL_STOP)],
        MotorAction::Stop { brake: true } => vec![(REG_CONTROL, CTRL_BRAKE)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_reference_value() {
        // Standard CRC-16/MODBUS check value.
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn forward_command_frame() {
        let frame = write_single_register(1, REG_CONTROL, CTRL_FORWARD);
        assert_eq!(&frame[..6], &[0x01, 0x06, 0x80, 0x00, 0x09, 0x02]);
        assert!(crc_ok(&frame));
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let mut frame = write_single_register(2, REG_SPEED, encode_rpm(350));
        frame[4] ^= 0x10;
        assert!(!crc_ok(&frame));
        assert!(!crc_ok(&[0x01]));
    }

    #[test]
    fn rpm_is_byte_swapped_and_clamped() {
        assert_eq!(encode_rpm(400), 0x9001);
        assert_eq!(encode_rpm(0), 0);
        assert_eq!(encode_rpm(9000), MAX_RPM.swap_bytes());
    }

    #[test]
    fn run_sets_speed_before_starting() {
        let writes = register_writes(MotorAction::Run {
            spin: Spin::Reverse,
            rpm: 200,
        });
        assert_eq!(
            writes,
            vec![(REG_SPEED, encode_rpm(200)), (REG_CONTROL, CTRL_REVERSE)]
        );
    }

    #[test]
    fn stop_variants() {
        assert_eq!(
            register_writes(MotorAction::Stop { brake: false }),
            vec![(REG_CONTROL, CTRL_STOP)]
        );
        assert_eq!(
            register_writes(MotorAction::Stop { brake: true }),
            vec![(REG_CONTROL, CTRL_BRAKE)]
        );
    }
}
