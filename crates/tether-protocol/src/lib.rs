//! Tether Protocol - Wire protocol for daemon communication
//!
//! This crate provides the JSON-lines message types exchanged between
//! clients and the tether daemon over its Unix socket.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType, ResponseBody};
pub use version::{ProtocolVersion, VersionError};
