//! Needle-tip EEPROM layouts and the decoded tip record.
//!
//! The disposable tip carries a small I²C EEPROM. Two device addresses and
//! three base offsets are in the field, depending on the tip generation and
//! customer; the field layout inside the window is identical across all of
//! them.

use serde::{Deserialize, Serialize};

/// Size of the EEPROM window a tip record occupies.
pub const RECORD_WINDOW: usize = 13;

/// Relative field offsets inside a layout window.
pub mod offset {
    pub const TIP_TYPE: u8 = 0;
    /// Big-endian u16, high byte first.
    pub const SHOT_COUNT: u8 = 1;
    /// Offsets 3..=8 are reserved.
    pub const YEAR: u8 = 9;
    pub const MONTH: u8 = 10;
    pub const DAY: u8 = 11;
    pub const MAKER_CODE: u8 = 12;
}

/// EEPROM layout variants for the tip generations in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TipLayout {
    /// MTR 2.0 tips, CLASSYS build: device 0x50, window base 0x10.
    Mtr20Classys,

    /// MTR 2.0 tips, CUTERA build: device 0x50, window base 0x80.
    Mtr20Cutera,

    /// MTR 4.0 tips: device 0x51, window base 0x70.
    Mtr40,
}

impl TipLayout {
    /// I²C device address of the tip EEPROM for this layout.
    #[must_use]
    pub fn address(self) -> u16 {
        match self {
            TipLayout::Mtr20Classys | TipLayout::Mtr20Cutera => 0x50,
            TipLayout::Mtr40 => 0x51,
        }
    }

    /// Base offset of the record window inside the device.
    #[must_use]
    pub fn base(self) -> u8 {
        match self {
            TipLayout::Mtr20Classys => 0x10,
            TipLayout::Mtr20Cutera => 0x80,
            TipLayout::Mtr40 => 0x70,
        }
    }

    /// MTR version string as the UI names it.
    #[must_use]
    pub fn mtr_version(self) -> &'static str {
        match self {
            TipLayout::Mtr20Classys | TipLayout::Mtr20Cutera => "2.0",
            TipLayout::Mtr40 => "4.0",
        }
    }

    /// Country/customer string as the UI names it.
    #[must_use]
    pub fn country(self) -> &'static str {
        match self {
            TipLayout::Mtr20Classys => "CLASSYS",
            TipLayout::Mtr20Cutera => "CUTERA",
            TipLayout::Mtr40 => "ALL",
        }
    }

    /// Resolve the layout a UI request names. `mtr_version` "4.0" selects
    /// MTR40 regardless of country; otherwise the country picks the MTR 2.0
    /// window, defaulting to CLASSYS as the production server does.
    #[must_use]
    pub fn from_request(mtr_version: &str, country: &str) -> Self {
        if mtr_version == "4.0" {
            TipLayout::Mtr40
        } else if country.eq_ignore_ascii_case("CUTERA") {
            TipLayout::Mtr20Cutera
        } else {
            TipLayout::Mtr20Classys
        }
    }
}

/// Decoded tip record. Field names serialize camelCase because the UI
/// consumes them verbatim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipRecord {
    pub tip_type: u8,
    pub shot_count: u16,
    /// Full year; stored on the device as an offset from 2000.
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub maker_code: u8,
}

impl TipRecord {
    /// Encode into the 13-byte window image written to the device. Reserved
    /// bytes stay zero; the driver skips them on write anyway.
    #[must_use]
    pub fn to_window(&self) -> [u8; RECORD_WINDOW] {
        let mut image = [0u8; RECORD_WINDOW];
        image[offset::TIP_TYPE as usize] = self.tip_type;
        image[offset::SHOT_COUNT as usize] = (self.shot_count >> 8) as u8;
        image[offset::SHOT_COUNT as usize + 1] = (self.shot_count & 0xFF) as u8;
        image[offset::YEAR as usize] = (self.year.saturating_sub(2000) & 0xFF) as u8;
        image[offset::MONTH as usize] = self.month;
        image[offset::DAY as usize] = self.day;
        image[offset::MAKER_CODE as usize] = self.maker_code;
        image
    }

    /// Decode from a window image read back from the device.
    #[must_use]
    pub fn from_window(image: &[u8; RECORD_WINDOW]) -> Self {
        TipRecord {
            tip_type: image[offset::TIP_TYPE as usize],
            shot_count: (u16::from(image[offset::SHOT_COUNT as usize]) << 8)
                | u16::from(image[offset::SHOT_COUNT as usize + 1]),
            year: 2000 + u16::from(image[offset::YEAR as usize]),
            month: image[offset::MONTH as usize],
            day: image[offset::DAY as usize],
            maker_code: image[offset::MAKER_CODE as usize],
        }
    }

    /// Human label for known tip types, if this id is in the catalog.
    #[must_use]
    pub fn tip_type_label(&self) -> Option<&'static str> {
        Some(match self.tip_type {
            208 => "cutera-1&10",
            209 => "cutera-10",
            210 => "cutera-64",
            211 => "cutera-25",
            216 => "ilooda-25&16",
            217 => "ilooda-1&10",
            218 => "ilooda-10",
            219 => "ilooda-64",
            220 => "ilooda-25",
            230 => "cutera-25&16",
            _ => return None,
        })
    }

    /// Human label for known maker codes.
    #[must_use]
    pub fn maker_label(&self) -> Option<&'static str> {
        match self.maker_code {
            4 => Some("maker A"),
            5 => Some("maker B"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_addressing() {
        assert_eq!(TipLayout::Mtr20Classys.address(), 0x50);
        assert_eq!(TipLayout::Mtr20Classys.base(), 0x10);
        assert_eq!(TipLayout::Mtr20Cutera.address(), 0x50);
        assert_eq!(TipLayout::Mtr20Cutera.base(), 0x80);
        assert_eq!(TipLayout::Mtr40.address(), 0x51);
        assert_eq!(TipLayout::Mtr40.base(), 0x70);
    }

    #[test]
    fn test_layout_from_request() {
        assert_eq!(
            TipLayout::from_request("2.0", "CLASSYS"),
            TipLayout::Mtr20Classys
        );
        assert_eq!(
            TipLayout::from_request("2.0", "CUTERA"),
            TipLayout::Mtr20Cutera
        );
        assert_eq!(TipLayout::from_request("4.0", "CLASSYS"), TipLayout::Mtr40);
        // Unknown country falls back to CLASSYS, as production does.
        assert_eq!(
            TipLayout::from_request("2.0", "OTHER"),
            TipLayout::Mtr20Classys
        );
    }

    #[test]
    fn test_record_window_round_trip() {
        for layout_sample in [
            TipRecord {
                tip_type: 208,
                shot_count: 1234,
                year: 2025,
                month: 3,
                day: 14,
                maker_code: 5,
            },
            TipRecord {
                tip_type: 230,
                shot_count: 0,
                year: 2000,
                month: 1,
                day: 1,
                maker_code: 4,
            },
            TipRecord {
                tip_type: 0xFF,
                shot_count: u16::MAX,
                year: 2255,
                month: 12,
                day: 31,
                maker_code: 0xFF,
            },
        ] {
            let image = layout_sample.to_window();
            assert_eq!(TipRecord::from_window(&image), layout_sample);
        }
    }

    #[test]
    fn test_shot_count_is_big_endian() {
        let record = TipRecord {
            shot_count: 0x1234,
            ..TipRecord::default()
        };
        let image = record.to_window();
        assert_eq!(image[1], 0x12);
        assert_eq!(image[2], 0x34);
    }

    #[test]
    fn test_year_stored_as_offset_from_2000() {
        let record = TipRecord {
            year: 2025,
            ..TipRecord::default()
        };
        assert_eq!(record.to_window()[offset::YEAR as usize], 25);
    }

    #[test]
    fn test_reserved_bytes_stay_zero() {
        let record = TipRecord {
            tip_type: 1,
            shot_count: 0xFFFF,
            year: 2099,
            month: 12,
            day: 31,
            maker_code: 9,
        };
        let image = record.to_window();
        assert_eq!(&image[3..9], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_catalog_labels() {
        let record = TipRecord {
            tip_type: 208,
            maker_code: 5,
            ..TipRecord::default()
        };
        assert_eq!(record.tip_type_label(), Some("cutera-1&10"));
        assert_eq!(record.maker_label(), Some("maker B"));

        let unknown = TipRecord::default();
        assert_eq!(unknown.tip_type_label(), None);
        assert_eq!(unknown.maker_label(), None);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = TipRecord {
            tip_type: 208,
            shot_count: 7,
            year: 2024,
            month: 6,
            day: 2,
            maker_code: 4,
        };
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["tipType"], 208);
        assert_eq!(json["shotCount"], 7);
        assert_eq!(json["makerCode"], 4);
    }
}
