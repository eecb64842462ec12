//! WebSocket control-plane message model.
//!
//! Inbound messages are JSON objects dispatched on their `cmd` field;
//! outbound messages carry a `type` field and are newline-terminated so
//! line-reading clients can frame them. Field names (including the
//! camelCase EEPROM fields) are part of the UI contract and must not drift.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ohmmeter::ResistanceReading;

/// Default speed used when the UI asks for a motor-2 positioning move
/// without naming one.
pub const DEFAULT_NEEDLE_SPEED: u16 = 1000;

fn de_flexible_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| serde::de::Error::custom("expected an unsigned integer")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom("expected a numeric string")),
        _ => Err(serde::de::Error::custom("expected a number or string")),
    }
}

fn de_flexible_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = de_flexible_u32(deserializer)?;
    u8::try_from(value).map_err(|_| serde::de::Error::custom("value out of range"))
}

fn de_flexible_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected a string or number")),
    }
}

/// A client request, dispatched on `cmd`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ClientCommand {
    Connect(ConnectRequest),
    Disconnect,
    Check,
    Move(MoveRequest),
    GpioRead,
    EepromWrite(EepromWriteRequest),
    EepromRead(EepromReadRequest),
    MeasureResistance(MeasureRequest),
    LedControl(LedControlRequest),
    SetStartState(StateRequest),
    SetNeedleShortFixed(StateRequest),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectRequest {
    pub port: String,
    #[serde(deserialize_with = "de_flexible_u32")]
    pub baudrate: u32,
    pub parity: String,
    #[serde(deserialize_with = "de_flexible_u8")]
    pub databits: u8,
    #[serde(deserialize_with = "de_flexible_string")]
    pub stopbits: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    #[serde(default = "default_motor_id")]
    pub motor_id: u8,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub position: Option<i16>,
    #[serde(default)]
    pub speed: Option<u16>,
    /// Speed field the frontend sends; its presence rewrites the mode to
    /// `speed`.
    #[serde(default)]
    pub needle_speed: Option<u16>,
    /// Force in newtons.
    #[serde(default)]
    pub force: Option<f64>,
    #[serde(default)]
    pub deceleration_enabled: bool,
    /// Deceleration window in millimetres before the target.
    #[serde(default)]
    pub deceleration_position: u16,
    #[serde(default)]
    pub deceleration_speed: u16,
}

fn default_motor_id() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EepromWriteRequest {
    pub tip_type: u8,
    #[serde(default)]
    pub shot_count: u16,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub maker_code: u8,
    #[serde(default = "default_mtr_version")]
    pub mtr_version: String,
    #[serde(default = "default_country")]
    pub country: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EepromReadRequest {
    #[serde(default = "default_mtr_version")]
    pub mtr_version: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_mtr_version() -> String {
    "2.0".to_owned()
}

fn default_country() -> String {
    "CLASSYS".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeasureRequest {
    /// Abnormality threshold in ohms; the comparison happens in milliohms.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    100.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedControlRequest {
    #[serde(rename = "type")]
    pub led: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateRequest {
    pub state: bool,
}

/// An outbound message, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Serial { result: String },
    Error { result: String },
    Status { data: StatusData },
    Gpio { data: GpioSnapshot },
    EepromRead { result: Value },
    EepromWrite { result: Value },
    Resistance { data: ResistanceReading },
    LedControl { result: Value },
    SetStartState { result: Value },
    SetNeedleShortFixed { result: Value },
    GpioStateChange { data: GpioEdge },
    GpioStartButton { data: ButtonPress },
    GpioPassButton { data: ButtonPress },
    GpioNgButton { data: ButtonPress },
    NeedleStateChange { data: NeedleChange },
}

impl ServerMessage {
    /// Serialize with the trailing newline every client line-reads on.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of these types cannot fail; keep the stream
            // alive if it somehow does.
            r#"{"type":"error","result":"internal serialization failure"}"#.to_owned()
        });
        line.push('\n');
        line
    }
}

/// Telemetry snapshot broadcast at the status cadence. Field names match
/// the production stream the UI already parses.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusData {
    pub position: i16,
    pub force: f64,
    pub sensor: i16,
    #[serde(rename = "setPos")]
    pub set_pos: i16,
    pub motor2_position: i16,
    pub motor2_force: f64,
    pub motor2_sensor: i16,
    #[serde(rename = "motor2_setPos")]
    pub motor2_set_pos: i16,
    pub command_queue_size: usize,
    pub needle_tip_connected: bool,
    pub is_started: bool,
}

/// Current debounced input states, one flag per panel line.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GpioSnapshot {
    pub tip_present: bool,
    pub short: bool,
    pub start: bool,
    pub pass: bool,
    pub ng: bool,
}

/// One debounced edge, for the debugging panel.
#[derive(Debug, Clone, Serialize)]
pub struct GpioEdge {
    pub pin: u8,
    /// "HIGH" while the line is active, "LOW" otherwise.
    pub state: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ButtonPress {
    pub triggered: bool,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct NeedleChange {
    pub is_started: bool,
    pub timestamp: f64,
}

/// Seconds since the Unix epoch, as the UI timestamps expect.
#[must_use]
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Uppercase hex with byte spacing, as command echoes display frames.
#[must_use]
pub fn hex_pretty(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
