//! Control plane for the needle-inspector instrument.
//!
//! This crate hosts the WebSocket control server and every hardware
//! collaborator outside the motor bus: the GPIO input watcher and LED bank,
//! the indicator controller, the tip EEPROM driver, the ohmmeter client,
//! the telemetry broadcaster, and the supervisor that watches over the
//! motor coordinator.

pub mod config;
pub mod eeprom;
pub mod events;
pub mod gpio;
pub mod indicator;
pub mod instrument;
pub mod ohmmeter;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod telemetry;
