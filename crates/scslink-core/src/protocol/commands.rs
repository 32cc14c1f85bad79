//! Protocol commands
//!
//! Defines the SCS command bytes, their fixed request layouts and the closed
//! set of response codes a meter can answer with.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::address::ADDRESS_LEN;
use super::crc::CRC_LEN;

/// Acknowledge
pub const ACK: u8 = 0x06;
/// Negative acknowledge
pub const NAK: u8 = 0x15;
/// Cancel (security rejection)
pub const CAN: u8 = 0x18;

/// Length of the device type field in an Identify response
pub const DEVICE_TYPE_LEN: usize = 3;
/// Length of the device ID field in an Identify response
pub const DEVICE_ID_LEN: usize = 8;
/// Length of the null-padded security code field
pub const SECURITY_CODE_LEN: usize = 8;
/// Unused payload bytes in an Identify request
pub const IDENTIFY_PADDING_LEN: usize = 11;

/// Identify response payload: type, id, start and stop address
pub const IDENTIFY_PAYLOAD_LEN: usize = DEVICE_TYPE_LEN + DEVICE_ID_LEN + 2 * ADDRESS_LEN;

/// Full Identify response including the ACK and CRC. This is the longest
/// fixed-size response in the protocol.
pub const IDENTIFY_RESPONSE_LEN: usize = 1 + IDENTIFY_PAYLOAD_LEN + CRC_LEN;

/// Bytes an Upload response adds around the data: ACK plus CRC
pub const UPLOAD_OVERHEAD: usize = 1 + CRC_LEN;

/// SCS commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Wake/keep-alive probe (ENQ)
    Enquire,

    /// Fetch device type, ID and memory range ('I')
    Identify,

    /// Log in with the security code ('S')
    Security,

    /// Read device memory ('U')
    Upload,

    /// Announce a device memory write ('D')
    Download,

    /// Second phase of a Download: the raw data block
    DownloadData,
}

impl Command {
    /// Leading command byte, or `None` for the raw data phase
    pub fn code(&self) -> Option<u8> {
        match self {
            Command::Enquire => Some(0x05),
            Command::Identify => Some(b'I'),
            Command::Security => Some(b'S'),
            Command::Upload => Some(b'U'),
            Command::Download => Some(b'D'),
            Command::DownloadData => None,
        }
    }

    /// Statically known request length, including the CRC
    pub fn request_len(&self) -> Option<usize> {
        match self {
            Command::Enquire => Some(1),
            Command::Identify => Some(1 + IDENTIFY_PADDING_LEN + CRC_LEN),
            Command::Security => Some(1 + SECURITY_CODE_LEN + CRC_LEN),
            Command::Upload | Command::Download => Some(1 + 2 * ADDRESS_LEN + CRC_LEN),
            Command::DownloadData => None,
        }
    }

    /// Whether the success response carries a payload protected by a CRC
    pub fn has_checked_payload(&self) -> bool {
        matches!(self, Command::Identify | Command::Upload)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Enquire => "Enquire",
            Command::Identify => "Identify",
            Command::Security => "Security",
            Command::Upload => "Upload",
            Command::Download => "Download",
            Command::DownloadData => "Download data",
        };
        f.write_str(name)
    }
}

/// First byte of a meter response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Nothing recognisable arrived (silence, garbage or a bad CRC)
    NoResponse,
    /// Request accepted
    Ack,
    /// Request rejected; the link may be out of sync
    Nak,
    /// Request refused for security reasons
    Can,
}

impl ResponseCode {
    /// Classify a response byte. Anything outside ACK/NAK/CAN is `NoResponse`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            ACK => ResponseCode::Ack,
            NAK => ResponseCode::Nak,
            CAN => ResponseCode::Can,
            _ => ResponseCode::NoResponse,
        }
    }

    /// Wire value of this code (`0` for `NoResponse`)
    pub fn as_byte(&self) -> u8 {
        match self {
            ResponseCode::NoResponse => 0,
            ResponseCode::Ack => ACK,
            ResponseCode::Nak => NAK,
            ResponseCode::Can => CAN,
        }
    }

    /// True only for ACK
    pub fn is_ack(&self) -> bool {
        *self == ResponseCode::Ack
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseCode::NoResponse => "no response",
            ResponseCode::Ack => "ACK",
            ResponseCode::Nak => "NAK",
            ResponseCode::Can => "CAN",
        };
        f.write_str(name)
    }
}
