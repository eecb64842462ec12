//! Motor serial plane for the needle-inspector instrument core.
//!
//! This crate owns everything that touches the dual-motor RS-485 bus: the
//! framed binary codec, the serial transport with its resync scanner, the
//! single-consumer command queue, the coordinator task that interleaves
//! queued commands with status polls, and the two-phase deceleration
//! planner for motor 2.

pub mod coordinator;
pub mod decel;
pub mod frame;
pub mod queue;
pub mod transport;

pub use coordinator::*;
pub use decel::*;
pub use frame::{Frame, StatusReport};
pub use queue::*;
pub use transport::*;
