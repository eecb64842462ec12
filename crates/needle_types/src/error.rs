//! Error types shared across the instrument core.

use std::time::Duration;
use thiserror::Error;

/// Frame-level decode failures on the motor wire protocol.
///
/// These are recovered locally by the transport's resync scan and never
/// surface to clients on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the smallest complete frame.
    #[error("frame too short: {len} bytes, need at least {min}")]
    Short { len: usize, min: usize },

    /// The first two bytes are not the expected header.
    #[error("bad frame header {found:#06x}, resync required")]
    BadHeader { found: u16 },

    /// Checksum over LEN, ID, OP and payload did not match.
    #[error("checksum mismatch: computed {computed:#04x}, frame carried {carried:#04x}")]
    Checksum { computed: u8, carried: u8 },
}

/// Failures in the motor serial plane: port lifecycle, the command queue,
/// and completion waits.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("failed to open serial port {port}: {reason}")]
    SerialOpen { port: String, reason: String },

    #[error("serial write failed: {0}")]
    SerialWrite(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("command queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    #[error("motor {motor} did not reach {target} within {timeout:?}")]
    WaitTimeout {
        motor: u8,
        target: i16,
        timeout: Duration,
    },

    #[error("motor port is not connected")]
    NotConnected,
}

/// Failures on the auxiliary buses: tip EEPROM, ohmmeter, panel GPIO.
#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    #[error("i2c bus error: {0}")]
    I2cBus(String),

    #[error("ohmmeter timed out after {0:?}")]
    ModbusTimeout(Duration),

    #[error("ohmmeter read failed: {0}")]
    ModbusRead(String),

    #[error("gpio unavailable: {0}")]
    GpioUnavailable(String),
}

/// A client message the control server could not act on.
#[derive(Debug, Clone, Error)]
#[error("bad command: {0}")]
pub struct BadCommand(pub String);

/// Top-level error type for the instrument core.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Drive(#[from] DriveError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Command(#[from] BadCommand),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        Error::Drive(DriveError::Frame(err))
    }
}

/// Convenience result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
