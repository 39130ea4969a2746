//! UDP headers, RFC 768.

use super::{ipv4::protocol, BytesExt, Checksum, Ipv4Address};
use thiserror::Error as ThisError;

/// The number of bytes in a UDP header
pub const HEADER_OCTETS: usize = 8;

/// Represents a UDP header, either one that was parsed or one we are going to
/// serialize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// The source port
    pub source: u16,
    /// The destination port
    pub destination: u16,
    /// The length of the UDP packet in bytes, including the header
    pub length: u16,
    /// The UDP checksum, zero when the sender did not compute one
    pub checksum: u16,
}

impl UdpHeader {
    /// Reads the header fields without validating them against a payload.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;
        Ok(Self {
            source: bytes.next_u16_be().ok_or(HTS)?,
            destination: bytes.next_u16_be().ok_or(HTS)?,
            length: bytes.next_u16_be().ok_or(HTS)?,
            checksum: bytes.next_u16_be().ok_or(HTS)?,
        })
    }

    /// Parses and validates the header of a complete datagram (header and
    /// payload) carried between the given addresses.
    pub fn from_bytes_ipv4(
        datagram: &[u8],
        source_address: Ipv4Address,
        destination_address: Ipv4Address,
    ) -> Result<Self, ParseError> {
        let header = Self::from_bytes(datagram.iter().cloned())?;
        if (header.length as usize) < HEADER_OCTETS || header.length as usize > datagram.len() {
            Err(ParseError::LengthMismatch)?
        }
        if header.checksum != 0 {
            let mut checksum = Checksum::new();
            checksum.add_pseudo_header(
                source_address,
                destination_address,
                protocol::UDP,
                header.length,
            );
            checksum.add_bytes(&datagram[..header.length as usize]);
            if checksum.as_u16() != 0 {
                Err(ParseError::Checksum {
                    expected: header.checksum,
                    actual: checksum.as_u16(),
                })?
            }
        }
        Ok(header)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute a UDP header")]
    HeaderTooShort,
    #[error(
        "The computed checksum {actual:#06x} did not match the header checksum {expected:#06x}"
    )]
    Checksum { actual: u16, expected: u16 },
    #[error("The number of message bytes differs from the header")]
    LengthMismatch,
}

/// Creates a serialized UDP packet header with the values provided
pub fn build_udp_header(
    source_address: Ipv4Address,
    source_port: u16,
    destination_address: Ipv4Address,
    destination_port: u16,
    text: &[u8],
) -> Result<[u8; HEADER_OCTETS], BuildHeaderError> {
    let length: u16 = (text.len() + HEADER_OCTETS)
        .try_into()
        .map_err(|_| BuildHeaderError::OverlyLongPayload)?;

    let mut checksum = Checksum::new();
    checksum.add_pseudo_header(source_address, destination_address, protocol::UDP, length);
    checksum.add_u16(source_port);
    checksum.add_u16(destination_port);
    checksum.add_u16(length);
    checksum.add_bytes(text);
    // A computed zero is transmitted as all ones
    let checksum = match checksum.as_u16() {
        0 => 0xffff,
        sum => sum,
    };

    let mut out = [0u8; HEADER_OCTETS];
    out[0..2].copy_from_slice(&source_port.to_be_bytes());
    out[2..4].copy_from_slice(&destination_port.to_be_bytes());
    out[4..6].copy_from_slice(&length.to_be_bytes());
    out[6..8].copy_from_slice(&checksum.to_be_bytes());
    Ok(out)
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum BuildHeaderError {
    #[error("The UDP payload is longer than can fit into a single packet")]
    OverlyLongPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_ADDRESS: [u8; 4] = [127, 0, 0, 1];
    const SOURCE_PORT: u16 = 12345;
    const DESTINATION_ADDRESS: [u8; 4] = [123, 45, 67, 89];
    const DESTINATION_PORT: u16 = 53;
    const PAYLOAD: &[u8] = b"Hello, world!";

    #[test]
    fn checksum_matches_etherparse() -> anyhow::Result<()> {
        let ip_header = etherparse::Ipv4Header::new(
            (PAYLOAD.len() + HEADER_OCTETS).try_into()?,
            30,
            etherparse::IpNumber::Udp,
            SOURCE_ADDRESS,
            DESTINATION_ADDRESS,
        );
        let theirs =
            etherparse::UdpHeader::with_ipv4_checksum(SOURCE_PORT, DESTINATION_PORT, &ip_header, PAYLOAD)?;
        let ours = build_udp_header(
            SOURCE_ADDRESS.into(),
            SOURCE_PORT,
            DESTINATION_ADDRESS.into(),
            DESTINATION_PORT,
            PAYLOAD,
        )?;
        let parsed = UdpHeader::from_bytes(ours.iter().cloned())?;
        assert_eq!(parsed.source, theirs.source_port);
        assert_eq!(parsed.destination, theirs.destination_port);
        assert_eq!(parsed.length, theirs.length);
        assert_eq!(parsed.checksum, theirs.checksum);
        Ok(())
    }

    #[test]
    fn datagram_round_trip() -> anyhow::Result<()> {
        let mut datagram = build_udp_header(
            SOURCE_ADDRESS.into(),
            SOURCE_PORT,
            DESTINATION_ADDRESS.into(),
            DESTINATION_PORT,
            PAYLOAD,
        )?
        .to_vec();
        datagram.extend_from_slice(PAYLOAD);
        let header = UdpHeader::from_bytes_ipv4(
            &datagram,
            SOURCE_ADDRESS.into(),
            DESTINATION_ADDRESS.into(),
        )?;
        assert_eq!(header.source, SOURCE_PORT);
        assert_eq!(header.destination, DESTINATION_PORT);
        assert_eq!(header.length as usize, datagram.len());
        assert_eq!(&datagram[HEADER_OCTETS..], PAYLOAD);
        Ok(())
    }

    #[test]
    fn detects_corruption_and_truncation() -> anyhow::Result<()> {
        let mut datagram = build_udp_header(
            SOURCE_ADDRESS.into(),
            SOURCE_PORT,
            DESTINATION_ADDRESS.into(),
            DESTINATION_PORT,
            PAYLOAD,
        )?
        .to_vec();
        datagram.extend_from_slice(PAYLOAD);

        let mut corrupted = datagram.clone();
        corrupted[10] ^= 1;
        assert!(matches!(
            UdpHeader::from_bytes_ipv4(&corrupted, SOURCE_ADDRESS.into(), DESTINATION_ADDRESS.into()),
            Err(ParseError::Checksum { .. })
        ));

        assert_eq!(
            UdpHeader::from_bytes_ipv4(
                &datagram[..datagram.len() - 1],
                SOURCE_ADDRESS.into(),
                DESTINATION_ADDRESS.into()
            ),
            Err(ParseError::LengthMismatch)
        );
        Ok(())
    }

    #[test]
    fn zero_checksum_is_not_verified() -> anyhow::Result<()> {
        let datagram = [0, 68, 0, 67, 0, 9, 0, 0, 42];
        let header =
            UdpHeader::from_bytes_ipv4(&datagram, Ipv4Address::UNSPECIFIED, Ipv4Address::BROADCAST)?;
        assert_eq!(header.checksum, 0);
        Ok(())
    }
}
