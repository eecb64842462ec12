//! Modbus-RTU ohmmeter client.
//!
//! The two measurement channels are slave ids 1 and 2 on a dedicated RS-485
//! port. Every measurement opens the port, reads holding register 0 from
//! each slave, and closes the port again so nothing holds the adapter
//! between UI requests.

use std::time::Duration;

use needle_types::{HardwareError, Verdict};
use serde::Serialize;
use tokio_modbus::client::{Context, rtu};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::{debug, warn};

/// Fixed ohmmeter line settings.
pub const OHMMETER_BAUD: u32 = 9600;

/// Per-read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Holding register carrying the measurement, identical on both slaves.
pub const MEASUREMENT_REGISTER: u16 = 0;

const CHANNEL_SLAVES: [u8; 2] = [1, 2];

/// Per-channel read outcome, serialized as the UI status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Ok,
    ReadFail,
    Disconnected,
    ConnectionFailed,
}

/// Result of one measurement pass. Resistances are raw milliohms.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResistanceReading {
    pub resistance1: Option<u16>,
    pub resistance2: Option<u16>,
    pub status1: ChannelStatus,
    pub status2: ChannelStatus,
    pub connected: bool,
}

impl ResistanceReading {
    /// Reading reported when the meter's port cannot be opened.
    #[must_use]
    pub fn connection_failed() -> Self {
        ResistanceReading {
            resistance1: None,
            resistance2: None,
            status1: ChannelStatus::ConnectionFailed,
            status2: ChannelStatus::ConnectionFailed,
            connected: false,
        }
    }

    /// Whether either channel exceeds the threshold (in milliohms).
    #[must_use]
    pub fn exceeds(&self, threshold_mohm: u32) -> bool {
        [self.resistance1, self.resistance2]
            .into_iter()
            .flatten()
            .any(|value| u32::from(value) > threshold_mohm)
    }

    /// Judge this reading against a threshold. A meter that cannot be read
    /// is an NG outcome, as is any channel above the threshold.
    #[must_use]
    pub fn verdict(&self, threshold_mohm: u32) -> Verdict {
        if !self.connected || self.exceeds(threshold_mohm) {
            Verdict::Ng
        } else {
            Verdict::Pass
        }
    }
}

/// One-shot ohmmeter client.
#[derive(Debug, Clone)]
pub struct Ohmmeter {
    port: String,
}

impl Ohmmeter {
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Ohmmeter { port: port.into() }
    }

    /// Open, read both channels, close. Never fails outright; connection
    /// problems come back encoded in the reading.
    pub async fn measure(&self) -> ResistanceReading {
        let builder = tokio_serial::new(&self.port, OHMMETER_BAUD);
        let stream = match SerialStream::open(&builder) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(port = %self.port, %err, "ohmmeter port open failed");
                return ResistanceReading::connection_failed();
            }
        };

        let mut ctx = rtu::attach_slave(stream, Slave(CHANNEL_SLAVES[0]));
        let first = read_channel(&mut ctx).await;
        ctx.set_slave(Slave(CHANNEL_SLAVES[1]));
        let second = read_channel(&mut ctx).await;
        // Dropping the context closes the port; nothing holds the adapter
        // between measurements.
        drop(ctx);

        let (resistance1, status1) = flatten(first);
        let (resistance2, status2) = flatten(second);
        let reading = ResistanceReading {
            resistance1,
            resistance2,
            status1,
            status2,
            connected: true,
        };
        debug!(?reading, "resistance measured");
        reading
    }
}

fn flatten(result: Result<u16, HardwareError>) -> (Option<u16>, ChannelStatus) {
    match result {
        Ok(value) => (Some(value), ChannelStatus::Ok),
        Err(err) => {
            warn!(%err, "ohmmeter channel read failed");
            (None, ChannelStatus::ReadFail)
        }
    }
}

async fn read_channel(ctx: &mut Context) -> Result<u16, HardwareError> {
    match tokio::time::timeout(
        READ_TIMEOUT,
        ctx.read_holding_registers(MEASUREMENT_REGISTER, 1),
    )
    .await
    {
        Err(_) => Err(HardwareError::ModbusTimeout(READ_TIMEOUT)),
        Ok(Err(err)) => Err(HardwareError::ModbusRead(err.to_string())),
        Ok(Ok(Err(exception))) => Err(HardwareError::ModbusRead(exception.to_string())),
        Ok(Ok(Ok(registers))) => registers
            .first()
            .copied()
            .ok_or_else(|| HardwareError::ModbusRead("empty register response".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(r1: Option<u16>, r2: Option<u16>) -> ResistanceReading {
        ResistanceReading {
            resistance1: r1,
            resistance2: r2,
            status1: if r1.is_some() {
                ChannelStatus::Ok
            } else {
                ChannelStatus::ReadFail
            },
            status2: if r2.is_some() {
                ChannelStatus::Ok
            } else {
                ChannelStatus::ReadFail
            },
            connected: true,
        }
    }

    #[test]
    fn threshold_compare_is_per_channel() {
        // 50 Ω threshold = 50_000 mΩ
        assert!(reading(Some(60_000), Some(10)).exceeds(50_000));
        assert!(reading(Some(10), Some(60_000)).exceeds(50_000));
        assert!(!reading(Some(10), Some(20)).exceeds(50_000));
    }

    #[test]
    fn failed_channels_do_not_trip_threshold() {
        assert!(!reading(None, None).exceeds(1));
    }

    #[test]
    fn verdict_rules() {
        assert_eq!(reading(Some(10), Some(20)).verdict(50_000), Verdict::Pass);
        assert_eq!(reading(Some(60_000), Some(20)).verdict(50_000), Verdict::Ng);
        assert_eq!(
            ResistanceReading::connection_failed().verdict(50_000),
            Verdict::Ng
        );
    }

    #[test]
    fn statuses_serialize_as_ui_strings() {
        let json = serde_json::to_value(ResistanceReading::connection_failed()).unwrap();
        assert_eq!(json["status1"], "CONNECTION_FAILED");
        assert_eq!(json["connected"], false);
        assert_eq!(json["resistance1"], serde_json::Value::Null);

        let ok = serde_json::to_value(reading(Some(42), None)).unwrap();
        assert_eq!(ok["status1"], "OK");
        assert_eq!(ok["status2"], "READ_FAIL");
        assert_eq!(ok["resistance1"], 42);
    }
}
