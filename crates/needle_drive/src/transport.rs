//! Serial transport for the motor bus.
//!
//! One port, one writer. The port is split into read and write halves behind
//! async mutexes so the supervisor can restart the coordinator tasks without
//! reopening the device. Inbound bytes go through [`FrameAccumulator`],
//! which finds `AA 55` headers in a rolling buffer, bounds each frame by its
//! LEN byte, and resyncs by dropping a single byte on any corruption.

use std::time::Duration;

use needle_types::DriveError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::trace;

use crate::frame::{self, DRIVE_HEADER, Frame};

/// Symlink the production udev rule creates for the motor adapter.
pub const DEFAULT_MOTOR_PORT: &str = "/dev/usb-motor";

/// Upper bound on a plausible frame; anything longer is treated as line
/// noise and resynced away.
const MAX_FRAME_LEN: usize = 64;

/// Serial parameters for the motor port, as the `connect` command supplies
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// Normalize the string-typed fields a UI sends. Unknown parity or
    /// data-bit values are rejected; stop bits follow the production
    /// mapping ("2" and "3" mean two, anything else means one). The port
    /// name resolves against `fallback_port`, the configured device behind
    /// the `"auto"` alias.
    pub fn from_request(
        port: &str,
        baudrate: u32,
        parity: &str,
        databits: u8,
        stopbits: &str,
        fallback_port: &str,
    ) -> Result<Self, DriveError> {
        let parity = match parity.to_ascii_lowercase().as_str() {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            other => {
                return Err(DriveError::SerialOpen {
                    port: port.to_owned(),
                    reason: format!("unsupported parity {other:?}"),
                });
            }
        };
        let data_bits = match databits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(DriveError::SerialOpen {
                    port: port.to_owned(),
                    reason: format!("unsupported data bits {other}"),
                });
            }
        };
        let stop_bits = match stopbits {
            "2" | "3" => StopBits::Two,
            _ => StopBits::One,
        };
        Ok(SerialSettings {
            port: resolve_port(port, fallback_port),
            baudrate,
            parity,
            data_bits,
            stop_bits,
        })
    }

    /// Open the port this configuration names.
    pub fn open(&self) -> Result<SerialStream, DriveError> {
        tokio_serial::new(&self.port, self.baudrate)
            .parity(self.parity)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|err| DriveError::SerialOpen {
                port: self.port.clone(),
                reason: err.to_string(),
            })
    }
}

/// Map a UI port name to a device path. On Linux, "auto" or a bare name
/// selects `fallback` — the configured motor device, by default the udev
/// symlink in [`DEFAULT_MOTOR_PORT`].
#[must_use]
pub fn resolve_port(port: &str, fallback: &str) -> String {
    if cfg!(target_os = "linux") && (port.eq_ignore_ascii_case("auto") || !port.starts_with("/dev/"))
    {
        fallback.to_owned()
    } else {
        port.to_owned()
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The motor port, split for the coordinator's writer and reader tasks.
pub struct SerialTransport {
    writer: Mutex<BoxedWriter>,
    reader: Mutex<BoxedReader>,
}

impl SerialTransport {
    /// Wrap any duplex byte stream. Production passes the opened
    /// [`SerialStream`]; tests pass a `tokio::io::duplex` end.
    pub fn new(stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        SerialTransport {
            writer: Mutex::new(Box::new(writer)),
            reader: Mutex::new(Box::new(reader)),
        }
    }

    /// Open the port described by `settings` and take ownership of it.
    pub fn open(settings: &SerialSettings) -> Result<Self, DriveError> {
        Ok(Self::new(settings.open()?))
    }

    /// Write a complete frame and flush before returning.
    pub async fn write_frame(&self, bytes: &[u8]) -> Result<(), DriveError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|err| DriveError::SerialWrite(err.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|err| DriveError::SerialWrite(err.to_string()))?;
        Ok(())
    }

    /// Read whatever bytes are available into `buf`. Returns 0 at EOF.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await
    }
}

/// Rolling reassembly buffer for inbound drive frames.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    resyncs: u64,
}

impl FrameAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes dropped so far while hunting for a valid frame.
    #[must_use]
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Extract the next complete, checksum-valid frame, or `None` if the
    /// buffer does not hold one yet. Corrupt data costs exactly one byte
    /// per attempt; parser state is never reset wholesale.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match find_header(&self.buf) {
                Some(0) => {}
                Some(at) => {
                    self.resyncs += at as u64;
                    self.buf.drain(..at);
                }
                None => {
                    // Everything before a possible half-header is noise.
                    let keep = usize::from(self.buf.last() == Some(&DRIVE_HEADER[0]));
                    let drop = self.buf.len() - keep;
                    self.resyncs += drop as u64;
                    self.buf.drain(..drop);
                    return None;
                }
            }
            if self.buf.len() < 3 {
                return None;
            }
            let total = frame::total_len(self.buf[2]);
            if total > MAX_FRAME_LEN {
                trace!(len = self.buf[2], "implausible frame length, resyncing");
                self.drop_one();
                continue;
            }
            if self.buf.len() < total {
                return None;
            }
            match Frame::decode(&self.buf[..total], DRIVE_HEADER) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    return Some(frame);
                }
                Err(err) => {
                    trace!(%err, "dropping one byte to resync");
                    self.drop_one();
                }
            }
        }
    }

    fn drop_one(&mut self) {
        self.resyncs += 1;
        self.buf.drain(..1);
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|pair| pair == DRIVE_HEADER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OP_STATUS_READ;

    fn drive_frame(id: u8, position: i16) -> Vec<u8> {
        let mut payload = vec![0u8; 12];
        payload[4..6].copy_from_slice(&position.to_le_bytes());
        Frame {
            id,
            op: OP_STATUS_READ,
            payload,
        }
        .encode_with_header(DRIVE_HEADER)
    }

    #[test]
    fn accumulator_extracts_back_to_back_frames() {
        let mut acc = FrameAccumulator::new();
        let mut stream = drive_frame(1, 100);
        stream.extend_from_slice(&drive_frame(2, -200));
        acc.push(&stream);

        let first = acc.next_frame().unwrap();
        assert_eq!(first.id, 1);
        let second = acc.next_frame().unwrap();
        assert_eq!(second.id, 2);
        assert!(acc.next_frame().is_none());
        assert_eq!(acc.resync_count(), 0);
    }

    #[test]
    fn accumulator_handles_split_delivery() {
        let mut acc = FrameAccumulator::new();
        let bytes = drive_frame(1, 42);
        acc.push(&bytes[..7]);
        assert!(acc.next_frame().is_none());
        acc.push(&bytes[7..]);
        assert_eq!(acc.next_frame().unwrap().id, 1);
    }

    #[test]
    fn accumulator_skips_leading_garbage() {
        let mut acc = FrameAccumulator::new();
        acc.push(&[0x00, 0x13, 0x37]);
        acc.push(&drive_frame(2, 7));
        let frame = acc.next_frame().unwrap();
        assert_eq!(frame.id, 2);
        assert!(acc.resync_count() > 0);
    }

    #[test]
    fn accumulator_resyncs_past_corrupt_checksum() {
        let mut acc = FrameAccumulator::new();
        let mut corrupt = drive_frame(1, 99);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        acc.push(&corrupt);
        acc.push(&drive_frame(2, 11));

        let frame = acc.next_frame().unwrap();
        assert_eq!(frame.id, 2);
    }

    #[test]
    fn accumulator_keeps_half_header_tail() {
        let mut acc = FrameAccumulator::new();
        acc.push(&[0x01, 0x02, 0xAA]);
        assert!(acc.next_frame().is_none());
        // Second header byte plus the rest of a frame arrives later.
        let bytes = drive_frame(1, 5);
        acc.push(&bytes[1..]);
        assert_eq!(acc.next_frame().unwrap().id, 1);
    }

    #[test]
    fn settings_normalize_like_production() {
        let settings =
            SerialSettings::from_request("/dev/ttyUSB3", 115_200, "NONE", 8, "1", DEFAULT_MOTOR_PORT)
                .unwrap();
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.stop_bits, StopBits::One);

        let two =
            SerialSettings::from_request("/dev/ttyUSB3", 9600, "even", 7, "3", DEFAULT_MOTOR_PORT)
                .unwrap();
        assert_eq!(two.parity, Parity::Even);
        assert_eq!(two.stop_bits, StopBits::Two);

        assert!(
            SerialSettings::from_request("/dev/ttyUSB3", 9600, "mark", 8, "1", DEFAULT_MOTOR_PORT)
                .is_err()
        );
        assert!(
            SerialSettings::from_request("/dev/ttyUSB3", 9600, "none", 9, "1", DEFAULT_MOTOR_PORT)
                .is_err()
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn port_alias_resolves_to_configured_device() {
        assert_eq!(resolve_port("auto", DEFAULT_MOTOR_PORT), DEFAULT_MOTOR_PORT);
        assert_eq!(resolve_port("COM3", DEFAULT_MOTOR_PORT), DEFAULT_MOTOR_PORT);
        assert_eq!(resolve_port("/dev/ttyUSB0", DEFAULT_MOTOR_PORT), "/dev/ttyUSB0");
        // An operator override replaces the udev symlink for the alias.
        assert_eq!(resolve_port("auto", "/dev/ttyAMA1"), "/dev/ttyAMA1");
    }

    #[tokio::test]
    async fn transport_writes_and_reads_through_duplex() {
        let (ours, theirs) = tokio::io::duplex(256);
        let transport = SerialTransport::new(ours);
        let (mut their_rx, mut their_tx) = tokio::io::split(theirs);

        transport
            .write_frame(&crate::frame::status_read(needle_types::MotorId::One))
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = their_rx.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], crate::frame::status_read(needle_types::MotorId::One).as_slice());

        their_tx.write_all(&drive_frame(2, 77)).await.unwrap();
        let mut inbound = [0u8; 64];
        let n = transport.read_chunk(&mut inbound).await.unwrap();
        let mut acc = FrameAccumulator::new();
        acc.push(&inbound[..n]);
        assert_eq!(acc.next_frame().unwrap().id, 2);
    }
}
