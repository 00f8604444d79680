//! The 4+4 chunk header shared by every data socket after the handshake.
//!
//! A predecessor of this protocol used a 2-byte serial and a 4-byte length;
//! that variant is not implemented here, not even behind a flag.

use crate::error::SessionError;

/// `[serial: u32 BE][length: u32 BE]`.
pub const HEADER_SIZE: usize = 8;

/// Sanity bound on a declared chunk length. A peer advertising more than
/// this is treated as a protocol violation, not a large transfer.
pub const MAX_CHUNK_LENGTH: u32 = 16 * 1024 * 1024;

/// Upper bound on bytes moved out of one remote's socket per reassembly
/// callback, so a single busy remote cannot starve the others in the
/// reactor. Roughly 16 typical MSS segments.
pub const MAX_CHUNK_SLICE: usize = 23 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub serial: u32,
    pub length: u32,
}

impl ChunkHeader {
    pub fn new(serial: u32, length: u32) -> Self {
        Self { serial, length }
    }

    pub fn encode(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.serial.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let serial = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        Self { serial, length }
    }

    /// Enforces `length > 0` and the sanity bound from §6/§7 of the wire
    /// protocol: zero-length chunks never occur on the sending side (the
    /// scheduler only opens a chunk when bytes are staged) and an oversize
    /// length is a protocol violation, not a legitimately large transfer.
    pub fn validate(self) -> Result<(), SessionError> {
        if self.length == 0 {
            return Err(SessionError::ZeroLength);
        }
        if self.length > MAX_CHUNK_LENGTH {
            return Err(SessionError::OversizeLength(self.length, MAX_CHUNK_LENGTH));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = ChunkHeader::new(1, 4096);
        let buf = h.encode();
        assert_eq!(ChunkHeader::decode(&buf), h);
    }

    #[test]
    fn encodes_big_endian() {
        let h = ChunkHeader::new(0x0102_0304, 0x0506_0708);
        let buf = h.encode();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn rejects_zero_length() {
        assert!(matches!(
            ChunkHeader::new(1, 0).validate(),
            Err(SessionError::ZeroLength)
        ));
    }

    #[test]
    fn accepts_exactly_the_sanity_bound() {
        assert!(ChunkHeader::new(1, MAX_CHUNK_LENGTH).validate().is_ok());
    }

    #[test]
    fn rejects_one_byte_over_the_sanity_bound() {
        assert!(matches!(
            ChunkHeader::new(1, MAX_CHUNK_LENGTH + 1).validate(),
            Err(SessionError::OversizeLength(_, _))
        ));
    }
}
