//! Ethernet II (DIX) framing.

use super::{BytesExt, Mac};
use thiserror::Error as ThisError;

/// The number of bytes in a DIX header.
pub const HEADER_LEN: usize = 14;
/// The largest frame accepted from or handed to a device.
pub const MRU: usize = 1518;

/// The EtherTypes the stack demultiplexes on.
pub mod ethertype {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DixHeader {
    pub destination: Mac,
    pub source: Mac,
    pub ethertype: u16,
}

impl DixHeader {
    pub fn new(destination: Mac, source: Mac, ethertype: u16) -> Self {
        Self {
            destination,
            source,
            ethertype,
        }
    }

    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;
        Ok(Self {
            destination: bytes.next_mac().ok_or(HTS)?,
            source: bytes.next_mac().ok_or(HTS)?,
            ethertype: bytes.next_u16_be().ok_or(HTS)?,
        })
    }

    /// Writes the header into the first [`HEADER_LEN`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.destination.to_bytes());
        out[6..12].copy_from_slice(&self.source.to_bytes());
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The DIX header is incomplete")]
    HeaderTooShort,
}
