//! Ledsim Server - UDP protocol front end for the simulated device
//!
//! This crate provides:
//! - The wire codec: command decoding and reply encoding/fragmentation
//! - The UDP server owning the socket and the receive loop
//! - Best-effort mDNS announcement so control applications can find the
//!   simulated device

pub mod announce;
pub mod protocol;
pub mod server;

pub use announce::Announcer;
pub use protocol::{Command, ProtocolError, PROTOCOL_VERSION};
pub use server::DeviceServer;
