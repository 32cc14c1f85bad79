//! 24-bit device memory addresses
//!
//! SCS frames carry memory offsets as 3 bytes, most significant first.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Number of bytes an address occupies on the wire
pub const ADDRESS_LEN: usize = 3;

/// Highest addressable device offset
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// A device memory offset in the range `0..=0xFFFFFF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Address(u32);

impl Address {
    /// Address zero
    pub const ZERO: Address = Address(0);

    /// Create an address, rejecting values wider than 24 bits
    pub fn new(value: u32) -> Result<Self, ProtocolError> {
        if value > MAX_ADDRESS {
            return Err(ProtocolError::AddressOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Raw numeric value
    pub fn value(self) -> u32 {
        self.0
    }

    /// Write the address big-endian into `buf[offset..offset + 3]`
    ///
    /// Panics if the buffer is too short, like slice indexing.
    pub fn insert(self, buf: &mut [u8], offset: usize) {
        BigEndian::write_u24(&mut buf[offset..offset + ADDRESS_LEN], self.0);
    }

    /// Read a big-endian address from `buf[offset..offset + 3]`
    pub fn extract(buf: &[u8], offset: usize) -> Self {
        Self(BigEndian::read_u24(&buf[offset..offset + ADDRESS_LEN]))
    }

    /// The address `len` bytes further on, if it still fits in 24 bits
    pub fn checked_add(self, len: usize) -> Option<Self> {
        let len = u32::try_from(len).ok()?;
        self.0
            .checked_add(len)
            .filter(|v| *v <= MAX_ADDRESS)
            .map(Self)
    }

    /// Inclusive end address of a `len`-byte range starting here
    pub fn range_end(self, len: usize) -> Result<Self, ProtocolError> {
        if len == 0 {
            return Err(ProtocolError::EmptyTransfer);
        }
        self.checked_add(len - 1).ok_or_else(|| {
            let last = u64::from(self.0) + len as u64 - 1;
            ProtocolError::AddressOutOfRange(last.min(u64::from(u32::MAX)) as u32)
        })
    }
}

impl TryFrom<u32> for Address {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Address::new(value)
    }
}

impl From<Address> for u32 {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}
