//! Frame codec for the motor drive's binary protocol.
//!
//! Frame layout, both directions:
//!
//! ```text
//! HDR0 HDR1 | LEN | ID | OP | PAYLOAD... | CK
//! ```
//!
//! The host sends with header `55 AA`, the drive answers with `AA 55`. LEN
//! counts the OP byte plus the payload, so a complete frame is `5 + LEN`
//! bytes. CK is the low byte of the sum of LEN, ID, OP, and every payload
//! byte. Multi-byte values are little-endian u16 on the wire; readings at or
//! above 0x8000 decode as negative.

use needle_types::{ControlMode, FrameError, MotorId};

/// Header on host-to-drive frames.
pub const HOST_HEADER: [u8; 2] = [0x55, 0xAA];

/// Header on drive-to-host frames.
pub const DRIVE_HEADER: [u8; 2] = [0xAA, 0x55];

/// Status read request opcode.
pub const OP_STATUS_READ: u8 = 0x30;

/// Register write opcode used by every motion/force command.
pub const OP_REGISTER_WRITE: u8 = 0x32;

/// Control-mode register.
pub const REG_CONTROL_MODE: u8 = 0x25;

/// Smallest complete frame: header + LEN + ID + OP + CK.
pub const MIN_FRAME_LEN: usize = 6;

/// Smallest inbound frame that carries a full status report.
pub const MIN_STATUS_FRAME_LEN: usize = 18;

/// Total frame length implied by a LEN byte.
#[must_use]
pub fn total_len(len_byte: u8) -> usize {
    5 + len_byte as usize
}

fn checksum(len: u8, id: u8, op: u8, payload: &[u8]) -> u8 {
    let sum = u32::from(len)
        + u32::from(id)
        + u32::from(op)
        + payload.iter().map(|&b| u32::from(b)).sum::<u32>();
    (sum & 0xFF) as u8
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub op: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// LEN byte for this frame: opcode plus payload.
    #[must_use]
    pub fn len_byte(&self) -> u8 {
        1 + self.payload.len() as u8
    }

    /// Encode with the given direction header. Total for any in-range input.
    #[must_use]
    pub fn encode_with_header(&self, header: [u8; 2]) -> Vec<u8> {
        let len = self.len_byte();
        let mut bytes = Vec::with_capacity(total_len(len));
        bytes.extend_from_slice(&header);
        bytes.push(len);
        bytes.push(self.id);
        bytes.push(self.op);
        bytes.extend_from_slice(&self.payload);
        bytes.push(checksum(len, self.id, self.op, &self.payload));
        bytes
    }

    /// Encode as a host-to-drive frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_header(HOST_HEADER)
    }

    /// Decode a frame with the expected direction header, verifying length
    /// and checksum. Any single-byte corruption of a valid frame is
    /// rejected.
    pub fn decode(bytes: &[u8], header: [u8; 2]) -> Result<Frame, FrameError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(FrameError::Short {
                len: bytes.len(),
                min: MIN_FRAME_LEN,
            });
        }
        if bytes[0] != header[0] || bytes[1] != header[1] {
            return Err(FrameError::BadHeader {
                found: (u16::from(bytes[0]) << 8) | u16::from(bytes[1]),
            });
        }
        let len = bytes[2];
        let total = total_len(len);
        if bytes.len() < total {
            return Err(FrameError::Short {
                len: bytes.len(),
                min: total,
            });
        }
        let id = bytes[3];
        let op = bytes[4];
        let payload = &bytes[5..total - 1];
        let computed = checksum(len, id, op, payload);
        let carried = bytes[total - 1];
        if computed != carried {
            return Err(FrameError::Checksum { computed, carried });
        }
        Ok(Frame {
            id,
            op,
            payload: payload.to_vec(),
        })
    }
}

fn register_write_payload(mode: u8, force_g: u16, speed: u16, position: i16) -> Vec<u8> {
    let force = force_g.to_le_bytes();
    let speed = speed.to_le_bytes();
    let position = position.to_le_bytes();
    vec![
        REG_CONTROL_MODE,
        0x00,
        mode,
        0x00,
        0x00,
        0x00,
        force[0],
        force[1],
        speed[0],
        speed[1],
        position[0],
        position[1],
    ]
}

/// Status read request: LEN=0x01, OP=0x30, zero payload.
#[must_use]
pub fn status_read(motor: MotorId) -> Vec<u8> {
    Frame {
        id: motor.into(),
        op: OP_STATUS_READ,
        payload: Vec::new(),
    }
    .encode()
}

/// Control-mode composite: sets register 0x25 to the mode code and writes
/// force, speed, and position in one LEN=0x0D frame.
#[must_use]
pub fn mode_move(
    motor: MotorId,
    mode: ControlMode,
    force_g: u16,
    speed: u16,
    position: i16,
) -> Vec<u8> {
    Frame {
        id: motor.into(),
        op: OP_REGISTER_WRITE,
        payload: register_write_payload(mode.into(), force_g, speed, position),
    }
    .encode()
}

/// Speed-mode composite: register 0x25 <- 0x02, target speed into 0x28,
/// target position into 0x29.
#[must_use]
pub fn speed_move(motor: MotorId, speed: u16, position: i16) -> Vec<u8> {
    mode_move(motor, ControlMode::Speed, 0, speed, position)
}

/// Force-only command: LEN=0x09, force register write without speed or
/// position words.
#[must_use]
pub fn force_only(motor: MotorId, force_g: u16) -> Vec<u8> {
    let force = force_g.to_le_bytes();
    Frame {
        id: motor.into(),
        op: OP_REGISTER_WRITE,
        payload: vec![
            REG_CONTROL_MODE,
            0x00,
            ControlMode::Force.into(),
            0x00,
            0x00,
            0x00,
            force[0],
            force[1],
        ],
    }
    .encode()
}

/// Parsed fields of an inbound status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub set_pos: i16,
    pub position: i16,
    pub force_raw: i16,
    pub sensor: i16,
}

impl StatusReport {
    /// Payload bytes a status frame must carry: set-pos at 2..4, actual
    /// position at 4..6, force at 8..10, sensor at 10..12.
    pub const MIN_PAYLOAD: usize = 12;

    /// Parse a status report from a decoded frame.
    ///
    /// Payload offsets 6..8 are skipped; every production firmware
    /// iteration leaves that word unread and its meaning is unresolved
    /// against the drive datasheet.
    pub fn parse(frame: &Frame) -> Result<StatusReport, FrameError> {
        if frame.payload.len() < Self::MIN_PAYLOAD {
            return Err(FrameError::Short {
                len: total_len(frame.len_byte()),
                min: MIN_STATUS_FRAME_LEN,
            });
        }
        let word = |at: usize| i16::from_le_bytes([frame.payload[at], frame.payload[at + 1]]);
        Ok(StatusReport {
            set_pos: word(2),
            position: word(4),
            force_raw: word(8),
            sensor: word(10),
        })
    }
}
