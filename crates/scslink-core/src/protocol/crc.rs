//! SCS frame checksum
//!
//! Every SCS frame ends in a 2-byte CRC computed over all bytes before it.
//! The device firmware computes it with a byte-wise shift/XOR transposition
//! seeded with `0xFF, 0xFF`; the routine below reproduces it bit for bit with
//! 8-bit wrapping arithmetic.

/// Length of the CRC trailer on every frame
pub const CRC_LEN: usize = 2;

/// Compute the 2-byte frame CRC (`[msb, lsb]`) over `data`.
pub fn compute_crc(data: &[u8]) -> [u8; CRC_LEN] {
    let mut msb: u8 = 0xFF;
    let mut lsb: u8 = 0xFF;

    for &byte in data {
        let mut acc = byte ^ msb;
        let mut scratch = acc;
        acc = (acc >> 4) ^ scratch;
        scratch = acc;
        acc = (acc << 4) ^ lsb;
        msb = acc;
        acc = scratch >> 3;
        msb ^= acc;
        acc = scratch << 5;
        lsb = acc ^ scratch;
    }

    [msb, lsb]
}

/// Append the CRC of `frame` to it
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = compute_crc(frame);
    frame.extend_from_slice(&crc);
}

/// Check that the last two bytes of `data` are the CRC of everything before them.
///
/// Buffers shorter than the trailer never verify.
pub fn verify_crc(data: &[u8]) -> bool {
    if data.len() < CRC_LEN {
        return false;
    }
    let (body, trailer) = data.split_at(data.len() - CRC_LEN);
    compute_crc(body) == trailer
}
