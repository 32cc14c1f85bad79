//! # SCSLink Core Library
//!
//! Core functionality for talking to SCS meters over a serial line.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - SCS frame encoding with CRC and 24-bit addresses
//! - Response classification and retry handling
//! - Meter identification and security login
//! - Chunked memory Upload and two-phase Download
//! - A keep-alive timer that holds the login open while idle
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//! use scslink_core::protocol::{Address, ProtocolSession, SerialTransport, SessionConfig, Transport};
//!
//! let transport = Arc::new(Mutex::new(SerialTransport::new(9600)));
//! transport.lock().unwrap().open("/dev/ttyUSB0")?;
//!
//! let mut session = ProtocolSession::new(transport, SessionConfig::default());
//! session.wake_up()?;
//! session.identify()?;
//! session.security("SECRET")?;
//!
//! let mut buf = vec![0u8; 64];
//! session.upload(Address::new(0x1000)?, &mut buf)?;
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        Address, DeviceIdentity, ProtocolError, ProtocolSession, ResponseCode, SerialTransport,
        SessionConfig, SessionState, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
