//! Protocol errors

use thiserror::Error;

use super::commands::Command;

/// Errors that can occur during protocol communication.
///
/// Expected protocol outcomes (NAK, CAN, silence that retries recovered from)
/// are reported as [`ResponseCode`](super::ResponseCode) values instead.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Serial port failure
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No response code after the last retry; ends the logical session
    #[error("Timed out waiting for {command} response after {attempts} attempt(s)")]
    Timeout { command: Command, attempts: u32 },

    /// Operation attempted on a closed transport
    #[error("Transport is not open")]
    NotOpen,

    /// `open` called twice
    #[error("Transport is already open")]
    AlreadyOpen,

    /// A thread panicked while holding the transport
    #[error("Transport lock poisoned by a panicked thread")]
    LinkPoisoned,

    /// Address or range end beyond 0xFFFFFF
    #[error("Address {0:#08x} is outside the 24-bit device address space")]
    AddressOutOfRange(u32),

    /// Zero-length Upload or Download
    #[error("Transfer length must be non-zero")]
    EmptyTransfer,

    /// Serial device does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Config file could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for the exhausted-retry timeout that tears down the logical session
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            _ => ProtocolError::SerialError(e.to_string()),
        }
    }
}
