//! Tip EEPROM driver.
//!
//! Byte-level access to the needle-tip EEPROM over the Pi's I²C bus. Every
//! operation opens the bus, works, and drops it, so the bus is never held
//! between UI requests. The device needs its internal program cycle between
//! byte writes, hence the write pacing; reads ride out transient bus noise
//! with a short retry loop. The blocking work runs on the runtime's
//! blocking pool.

use std::time::Duration;

use needle_types::{HardwareError, RECORD_WINDOW, TipLayout, TipRecord, offset};
use rppal::i2c::I2c;
use tracing::{debug, warn};

/// Delay between byte writes for the device's internal program cycle.
pub const WRITE_PACING: Duration = Duration::from_millis(10);

/// Read attempts before a bus error surfaces to the UI.
pub const READ_ATTEMPTS: u32 = 3;

/// Back-off between read attempts.
pub const READ_BACKOFF: Duration = Duration::from_millis(100);

/// Window offsets that actually hold record data; the reserved span in the
/// middle is never touched.
const DATA_OFFSETS: [u8; 7] = [
    offset::TIP_TYPE,
    offset::SHOT_COUNT,
    offset::SHOT_COUNT + 1,
    offset::YEAR,
    offset::MONTH,
    offset::DAY,
    offset::MAKER_CODE,
];

/// Tip EEPROM access for one I²C bus.
#[derive(Debug, Clone, Copy)]
pub struct TipEeprom {
    bus: u8,
}

impl TipEeprom {
    #[must_use]
    pub fn new(bus: u8) -> Self {
        TipEeprom { bus }
    }

    /// Read the record at `layout`, retrying transient bus errors.
    pub async fn read(&self, layout: TipLayout) -> Result<TipRecord, HardwareError> {
        let bus = self.bus;
        run_blocking(move || read_with_retry(bus, layout)).await
    }

    /// Write `record` at `layout`. The caller re-reads afterwards to verify.
    pub async fn write(&self, layout: TipLayout, record: TipRecord) -> Result<(), HardwareError> {
        let bus = self.bus;
        run_blocking(move || write_once(bus, layout, record)).await
    }
}

async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, HardwareError> + Send + 'static,
) -> Result<T, HardwareError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| HardwareError::I2cBus(format!("eeprom task failed: {err}")))?
}

fn open_device(bus: u8, layout: TipLayout) -> Result<I2c, HardwareError> {
    let mut i2c =
        I2c::with_bus(bus).map_err(|err| HardwareError::I2cBus(format!("open bus {bus}: {err}")))?;
    i2c.set_slave_address(layout.address())
        .map_err(|err| HardwareError::I2cBus(format!("address {:#04x}: {err}", layout.address())))?;
    Ok(i2c)
}

fn read_with_retry(bus: u8, layout: TipLayout) -> Result<TipRecord, HardwareError> {
    let mut last_error = None;
    for attempt in 1..=READ_ATTEMPTS {
        match read_once(bus, layout) {
            Ok(record) => {
                debug!(?layout, ?record, "eeprom read");
                return Ok(record);
            }
            Err(err) => {
                warn!(?layout, attempt, %err, "eeprom read attempt failed");
                last_error = Some(err);
                if attempt < READ_ATTEMPTS {
                    std::thread::sleep(READ_BACKOFF);
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| HardwareError::I2cBus("eeprom read failed without a cause".to_owned())))
}

fn read_once(bus: u8, layout: TipLayout) -> Result<TipRecord, HardwareError> {
    let mut i2c = open_device(bus, layout)?;
    let base = layout.base();
    let mut window = [0u8; RECORD_WINDOW];
    for off in DATA_OFFSETS {
        window[off as usize] = i2c
            .smbus_read_byte(base + off)
            .map_err(|err| HardwareError::I2cBus(format!("read {:#04x}: {err}", base + off)))?;
    }
    Ok(TipRecord::from_window(&window))
}

fn write_once(bus: u8, layout: TipLayout, record: TipRecord) -> Result<(), HardwareError> {
    let mut i2c = open_device(bus, layout)?;
    let base = layout.base();
    let window = record.to_window();
    for off in DATA_OFFSETS {
        i2c.smbus_write_byte(base + off, window[off as usize])
            .map_err(|err| HardwareError::I2cBus(format!("write {:#04x}: {err}", base + off)))?;
        std::thread::sleep(WRITE_PACING);
    }
    debug!(?layout, ?record, "eeprom written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_offsets_skip_the_reserved_span() {
        for off in 3..9 {
            assert!(!DATA_OFFSETS.contains(&off));
        }
        // A full record round-trips through exactly these offsets.
        let record = TipRecord {
            tip_type: 208,
            shot_count: 1234,
            year: 2025,
            month: 3,
            day: 14,
            maker_code: 5,
        };
        let window = record.to_window();
        let mut rebuilt = [0u8; RECORD_WINDOW];
        for off in DATA_OFFSETS {
            rebuilt[off as usize] = window[off as usize];
        }
        assert_eq!(TipRecord::from_window(&rebuilt), record);
    }

    #[test]
    fn cutera_layout_addresses_match_request_routing() {
        let layout = TipLayout::from_request("2.0", "CUTERA");
        assert_eq!(layout.address(), 0x50);
        assert_eq!(layout.base(), 0x80);
    }
}
