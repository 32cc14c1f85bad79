//! Frame encoding/decoding
//!
//! Request layout:
//! - 1 byte: command code (absent for the Download data phase)
//! - N bytes: fixed-format fields (addresses are 3 bytes big-endian)
//! - 2 bytes: CRC over every preceding byte
//!
//! Success responses start with ACK. Identify and Upload responses follow it
//! with a payload and a CRC computed over that payload alone.

use super::address::{Address, ADDRESS_LEN};
use super::commands::{
    Command, ResponseCode, DEVICE_ID_LEN, DEVICE_TYPE_LEN, IDENTIFY_PADDING_LEN,
    IDENTIFY_PAYLOAD_LEN, SECURITY_CODE_LEN,
};
use super::crc::{append_crc, verify_crc, CRC_LEN};

/// Builder for request frames. `build` appends the CRC.
pub struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Add a command byte
    pub fn command(mut self, cmd: u8) -> Self {
        self.bytes.push(cmd);
        self
    }

    /// Add a 24-bit address
    pub fn address(mut self, addr: Address) -> Self {
        let at = self.bytes.len();
        self.bytes.resize(at + ADDRESS_LEN, 0);
        addr.insert(&mut self.bytes, at);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    /// Add `data` truncated or null-padded to exactly `width` bytes
    pub fn padded(mut self, data: &[u8], width: usize) -> Self {
        let take = data.len().min(width);
        self.bytes.extend_from_slice(&data[..take]);
        self.bytes.resize(self.bytes.len() + (width - take), 0);
        self
    }

    /// Finish the frame with its CRC
    pub fn build(mut self) -> Vec<u8> {
        append_crc(&mut self.bytes);
        self.bytes
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Enquire probe. The only frame without a CRC.
pub fn enquire_frame() -> Vec<u8> {
    vec![command_byte(Command::Enquire)]
}

/// Identify request: command byte and zero padding
pub fn identify_frame() -> Vec<u8> {
    FrameBuilder::new()
        .command(command_byte(Command::Identify))
        .padded(&[], IDENTIFY_PADDING_LEN)
        .build()
}

/// Security request carrying `code`, null-padded or truncated to 8 bytes
pub fn security_frame(code: &str) -> Vec<u8> {
    FrameBuilder::new()
        .command(command_byte(Command::Security))
        .padded(code.as_bytes(), SECURITY_CODE_LEN)
        .build()
}

/// Upload request for the inclusive range `start..=end`
pub fn upload_frame(start: Address, end: Address) -> Vec<u8> {
    range_frame(Command::Upload, start, end)
}

/// Download announcement for the inclusive range `start..=end`
pub fn download_frame(start: Address, end: Address) -> Vec<u8> {
    range_frame(Command::Download, start, end)
}

/// Download data phase: the raw block followed by its CRC
pub fn download_data_frame(data: &[u8]) -> Vec<u8> {
    FrameBuilder::new().bytes(data).build()
}

fn range_frame(cmd: Command, start: Address, end: Address) -> Vec<u8> {
    FrameBuilder::new()
        .command(command_byte(cmd))
        .address(start)
        .address(end)
        .build()
}

fn command_byte(cmd: Command) -> u8 {
    // Only DownloadData lacks a code and it never goes through here
    cmd.code().unwrap_or_default()
}

/// A complete response read back from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Classified first byte
    pub code: ResponseCode,
    /// Every byte received, first byte included
    pub raw: Vec<u8>,
}

impl Response {
    /// Payload between the ACK and the trailing CRC, if the CRC matches.
    ///
    /// Returns `None` for non-ACK responses, truncated frames and CRC
    /// mismatches alike.
    pub fn checked_payload(&self) -> Option<&[u8]> {
        if self.code != ResponseCode::Ack || self.raw.len() < 1 + CRC_LEN {
            return None;
        }
        let body = &self.raw[1..];
        if verify_crc(body) {
            Some(&body[..body.len() - CRC_LEN])
        } else {
            None
        }
    }
}

/// Device identity decoded from an Identify response payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    /// Three-character device family
    pub device_type: String,
    /// Eight-character device serial
    pub device_id: String,
    /// First valid memory address
    pub start_address: Address,
    /// Last valid memory address
    pub stop_address: Address,
}

impl DeviceIdentity {
    /// Decode a verified Identify payload. Returns `None` on a length mismatch.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() != IDENTIFY_PAYLOAD_LEN {
            return None;
        }
        let (device_type, rest) = payload.split_at(DEVICE_TYPE_LEN);
        let (device_id, rest) = rest.split_at(DEVICE_ID_LEN);
        Some(Self {
            device_type: ascii_field(device_type),
            device_id: ascii_field(device_id),
            start_address: Address::extract(rest, 0),
            stop_address: Address::extract(rest, ADDRESS_LEN),
        })
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}
