//! SCS Serial Protocol
//!
//! Implements the SCS meter protocol over a byte-stream transport: CRC and
//! 24-bit address encoding, request framing, response classification,
//! retries with NAK resynchronisation, chunked memory transfers and the
//! post-login keep-alive.

pub mod address;
pub mod commands;
pub mod config;
pub mod crc;
mod error;
mod keepalive;
mod link;
pub mod packet;
pub mod serial;
mod session;
mod stats;
pub mod stream;

pub use address::{Address, MAX_ADDRESS};
pub use commands::{Command, ResponseCode};
pub use config::SessionConfig;
pub use crc::{append_crc, compute_crc, verify_crc};
pub use error::ProtocolError;
pub use packet::{DeviceIdentity, FrameBuilder, Response};
pub use serial::{list_ports, PortInfo, SerialTransport};
pub use session::{ProtocolSession, SessionState, SharedTransport};
pub use stats::{LinkStats, StatsSnapshot};
pub use stream::{RxNotify, RxQueue, Transport};

/// Default baud rate for meter communication (8N1)
pub const DEFAULT_BAUD_RATE: u32 = 9600;
