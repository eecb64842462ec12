//! Motor identities, control modes, and per-motor state.

use serde::{Deserialize, Serialize};

/// Grams per newton used when converting UI force values to the drive's
/// gram-denominated force registers (1 N = 101.97 g).
pub const GRAMS_PER_NEWTON: f64 = 101.97;

/// One of the two linear actuators on the shared RS-485 bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotorId {
    /// Needle-drive motor.
    One = 1,

    /// Resistance-measurement motor.
    Two = 2,
}

impl MotorId {
    pub const COUNT: usize = 2;

    /// Encoder counts per millimetre of travel for this motor.
    #[must_use]
    pub fn counts_per_mm(self) -> i32 {
        match self {
            MotorId::One => 100,
            MotorId::Two => 40,
        }
    }

    /// Zero-based index for per-motor state arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl From<MotorId> for u8 {
    fn from(motor: MotorId) -> Self {
        motor as u8
    }
}

impl TryFrom<u8> for MotorId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MotorId::One),
            2 => Ok(MotorId::Two),
            _ => Err(()),
        }
    }
}

/// Drive control mode written to register 0x25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ControlMode {
    /// Position control, drive-managed profile.
    Position = 0x00,

    /// Servo (tracking) position control.
    Servo = 0x01,

    /// Speed control toward a target position.
    Speed = 0x02,

    /// Force control only.
    Force = 0x03,

    /// Combined speed and force control.
    SpeedForce = 0x05,
}

impl From<ControlMode> for u8 {
    fn from(mode: ControlMode) -> Self {
        mode as u8
    }
}

impl TryFrom<u8> for ControlMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlMode::Position),
            0x01 => Ok(ControlMode::Servo),
            0x02 => Ok(ControlMode::Speed),
            0x03 => Ok(ControlMode::Force),
            0x05 => Ok(ControlMode::SpeedForce),
            _ => Err(()),
        }
    }
}

/// Latest parsed state of one motor.
///
/// All fields are sign-extended from the little-endian u16 values the drive
/// reports. Mutated only on inbound frame parse, keyed by the frame id byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorState {
    /// Commanded position in encoder counts.
    pub set_pos: i16,

    /// Actual position in encoder counts.
    pub position: i16,

    /// Raw force reading (grams).
    pub force_raw: i16,

    /// Auxiliary sensor reading.
    pub sensor: i16,
}

impl MotorState {
    /// Force in newtons, rounded to 0.1 N as the UI displays it.
    #[must_use]
    pub fn force_newtons(&self) -> f64 {
        (f64::from(self.force_raw) * 0.001 * 9.81 * 10.0).round() / 10.0
    }

    /// Actual position converted to millimetres for the given motor.
    #[must_use]
    pub fn position_mm(&self, motor: MotorId) -> f64 {
        f64::from(self.position) / f64::from(motor.counts_per_mm())
    }
}
