//! ICMP messages, RFC 792.

use super::{checksum, BytesExt};
use thiserror::Error as ThisError;

/// ICMP message types.
pub mod kind {
    pub const ECHO_REPLY: u8 = 0;
    pub const UNREACHABLE: u8 = 3;
    pub const ECHO_REQUEST: u8 = 8;
}

/// Codes carried by [`kind::UNREACHABLE`] messages.
pub mod unreachable {
    pub const NET: u8 = 0;
    pub const HOST: u8 = 1;
    pub const PROTOCOL: u8 = 2;
    pub const PORT: u8 = 3;
}

/// The fixed eight bytes at the front of every ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpHeader {
    pub kind: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier and sequence number for echoes, unused for unreachables.
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub const SIZE: usize = 8;

    pub fn echo(kind: u8, identifier: u16, sequence: u16) -> Self {
        let mut rest = [0; 4];
        rest[..2].copy_from_slice(&identifier.to_be_bytes());
        rest[2..].copy_from_slice(&sequence.to_be_bytes());
        Self {
            kind,
            code: 0,
            checksum: 0,
            rest,
        }
    }

    pub fn unreachable(code: u8) -> Self {
        Self {
            kind: kind::UNREACHABLE,
            code,
            checksum: 0,
            rest: [0; 4],
        }
    }

    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.rest[0], self.rest[1]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.rest[2], self.rest[3]])
    }

    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;
        Ok(Self {
            kind: bytes.next_u8().ok_or(HTS)?,
            code: bytes.next_u8().ok_or(HTS)?,
            checksum: bytes.next_u16_be().ok_or(HTS)?,
            rest: bytes.next_n().ok_or(HTS)?,
        })
    }

    /// Writes the header with the stored checksum.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.kind;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        out[4..8].copy_from_slice(&self.rest);
    }
}

/// Computes and stores the checksum of a whole ICMP message in place.
pub fn seal(message: &mut [u8]) {
    message[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum::checksum(message);
    message[2..4].copy_from_slice(&sum.to_be_bytes());
}

/// Checks the length and checksum of a whole ICMP message.
pub fn verify(message: &[u8]) -> Result<IcmpHeader, ParseError> {
    let header = IcmpHeader::from_bytes(message.iter().cloned())?;
    if checksum::checksum(message) != 0 {
        Err(ParseError::Checksum)?
    }
    Ok(header)
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The ICMP header is incomplete")]
    HeaderTooShort,
    #[error("The ICMP checksum does not verify")]
    Checksum,
}
