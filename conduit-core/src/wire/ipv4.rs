//! IPv4 headers, RFC 791.

use super::{checksum, BytesExt, Checksum, Ipv4Address};
use thiserror::Error as ThisError;

/// The number of `u32` words in a basic IPv4 header
const BASE_WORDS: u8 = 5;
/// The number of `u8` bytes in a basic IPv4 header
pub const BASE_OCTETS: u16 = BASE_WORDS as u16 * 4;
/// The largest header, with 40 bytes of options.
pub const MAX_OCTETS: usize = 60;
/// Bitwise anded with the `u16` containing flags and fragment offset to
/// extract the fragment offset part.
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;
const DONT_FRAGMENT: u16 = 0x4000;
const MORE_FRAGMENTS: u16 = 0x2000;

/// IP protocol numbers carried in the header's protocol field.
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const IGMP: u8 = 2;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// An IPv4 header, as described in RFC791 p11 s3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Header {
    /// Internet Header Length, the number of `u32` words in the IPv4 header
    pub ihl: u8,
    /// The quality of service desired
    pub type_of_service: u8,
    /// The length of the datagram in bytes
    pub total_length: u16,
    /// Assigned by the sender to aid in assembling fragments
    pub identification: u16,
    /// Where in the datagram this fragment belongs in units of 8 bytes
    pub fragment_offset: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// The number of remaining hops this datagram can take before being removed
    pub time_to_live: u8,
    /// Indicates the next level protocol in the data portion of the datagram
    pub protocol: u8,
    /// The IPv4 header checksum
    pub checksum: u16,
    pub source: Ipv4Address,
    pub destination: Ipv4Address,
}

impl Ipv4Header {
    /// Parses the header at the front of `packet`. The slice must contain the
    /// whole datagram: the total length is checked against it.
    pub fn from_bytes(packet: &[u8]) -> Result<Self, ParseError> {
        let mut bytes = packet.iter().cloned();
        let hts = ParseError::HeaderTooShort;

        let version_and_ihl = bytes.next_u8().ok_or(hts)?;
        if version_and_ihl >> 4 != 4 {
            Err(ParseError::IncorrectIpv4Version)?
        }
        let ihl = version_and_ihl & 0b1111;
        if ihl < BASE_WORDS {
            Err(ParseError::InvalidHeaderLength)?
        }
        let header_len = ihl as usize * 4;
        if packet.len() < header_len {
            Err(ParseError::HeaderTooShort)?
        }

        let type_of_service = bytes.next_u8().ok_or(hts)?;
        let total_length = bytes.next_u16_be().ok_or(hts)?;
        if (total_length as usize) < header_len || total_length as usize > packet.len() {
            Err(ParseError::LengthMismatch)?
        }
        let identification = bytes.next_u16_be().ok_or(hts)?;
        let flags_and_fragment_offset = bytes.next_u16_be().ok_or(hts)?;
        if flags_and_fragment_offset & 0x8000 != 0 {
            Err(ParseError::UsedReservedFlag)?
        }
        let time_to_live = bytes.next_u8().ok_or(hts)?;
        let protocol = bytes.next_u8().ok_or(hts)?;
        let expected_checksum = bytes.next_u16_be().ok_or(hts)?;
        let source = bytes.next_ipv4addr().ok_or(hts)?;
        let destination = bytes.next_ipv4addr().ok_or(hts)?;

        if checksum::checksum(&packet[..header_len]) != 0 {
            let mut actual = Checksum::new();
            actual.add_bytes(&packet[..10]);
            actual.add_bytes(&packet[12..header_len]);
            Err(ParseError::Checksum {
                expected: expected_checksum,
                actual: actual.as_u16(),
            })?
        }

        Ok(Self {
            ihl,
            type_of_service,
            total_length,
            identification,
            fragment_offset: flags_and_fragment_offset & FRAGMENT_OFFSET_MASK,
            dont_fragment: flags_and_fragment_offset & DONT_FRAGMENT != 0,
            more_fragments: flags_and_fragment_offset & MORE_FRAGMENTS != 0,
            time_to_live,
            protocol,
            checksum: expected_checksum,
            source,
            destination,
        })
    }

    /// The header length in bytes.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn payload_len(&self) -> usize {
        self.total_length as usize - self.header_len()
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The IPv4 header is incomplete")]
    HeaderTooShort,
    #[error("Expected version 4 in IPv4 header")]
    IncorrectIpv4Version,
    #[error("The header length field is smaller than a basic header")]
    InvalidHeaderLength,
    #[error("The total length disagrees with the bytes received")]
    LengthMismatch,
    #[error("The reserved control flags bit was used")]
    UsedReservedFlag,
    #[error(
        "The header checksum {expected:#06x} does not match the calculated checksum {actual:#06x}"
    )]
    Checksum { expected: u16, actual: u16 },
}

/// A builder for basic (option-free) IPv4 headers.
pub struct Ipv4HeaderBuilder {
    type_of_service: u8,
    payload_length: usize,
    identification: u16,
    dont_fragment: bool,
    time_to_live: u8,
    protocol: u8,
    source: Ipv4Address,
    destination: Ipv4Address,
}

impl Ipv4HeaderBuilder {
    pub fn new(
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        payload_length: usize,
    ) -> Self {
        Self {
            type_of_service: 0,
            payload_length,
            identification: 0,
            dont_fragment: false,
            time_to_live: 64,
            protocol,
            source,
            destination,
        }
    }

    pub fn identification(mut self, identification: u16) -> Self {
        self.identification = identification;
        self
    }

    pub fn time_to_live(mut self, time_to_live: u8) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    #[allow(dead_code)]
    pub fn type_of_service(mut self, type_of_service: u8) -> Self {
        self.type_of_service = type_of_service;
        self
    }

    #[allow(dead_code)]
    pub fn dont_fragment(mut self, dont_fragment: bool) -> Self {
        self.dont_fragment = dont_fragment;
        self
    }

    /// Creates a serialized header with its checksum filled in.
    pub fn build(self) -> Result<[u8; BASE_OCTETS as usize], HeaderBuildError> {
        let total_length: u16 = (self.payload_length + BASE_OCTETS as usize)
            .try_into()
            .map_err(|_| HeaderBuildError::OverlyLongPayload)?;
        let flags = if self.dont_fragment { DONT_FRAGMENT } else { 0 };

        let mut out = [0u8; BASE_OCTETS as usize];
        out[0] = (4u8 << 4) | BASE_WORDS;
        out[1] = self.type_of_service;
        out[2..4].copy_from_slice(&total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&flags.to_be_bytes());
        out[8] = self.time_to_live;
        out[9] = self.protocol;
        out[12..16].copy_from_slice(&self.source.to_bytes());
        out[16..20].copy_from_slice(&self.destination.to_bytes());
        let sum = checksum::checksum(&out);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
        Ok(out)
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum HeaderBuildError {
    #[error("The payload is longer than is allowed")]
    OverlyLongPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: [u8; 4] = [169, 254, 0, 1];
    const DESTINATION: [u8; 4] = [169, 254, 0, 2];

    fn etherparse_datagram(payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let header = etherparse::Ipv4Header::new(
            payload.len().try_into()?,
            30,
            etherparse::IpNumber::Udp,
            SOURCE,
            DESTINATION,
        );
        let mut out = vec![];
        header.write(&mut out)?;
        out.extend_from_slice(payload);
        Ok(out)
    }

    #[test]
    fn parses_etherparse_header() -> anyhow::Result<()> {
        let datagram = etherparse_datagram(b"Hello, world!")?;
        let parsed = Ipv4Header::from_bytes(&datagram)?;
        assert_eq!(parsed.source, SOURCE.into());
        assert_eq!(parsed.destination, DESTINATION.into());
        assert_eq!(parsed.protocol, protocol::UDP);
        assert_eq!(parsed.time_to_live, 30);
        assert_eq!(parsed.payload_len(), 13);
        assert!(!parsed.is_fragment());
        Ok(())
    }

    #[test]
    fn built_header_matches_etherparse() -> anyhow::Result<()> {
        let ours = Ipv4HeaderBuilder::new(SOURCE.into(), DESTINATION.into(), protocol::UDP, 13)
            .identification(7)
            .time_to_live(30)
            .build()?;
        let theirs = etherparse::Ipv4HeaderSlice::from_slice(&ours)?.to_header();
        assert_eq!(theirs.payload_len, 13);
        assert_eq!(theirs.identification, 7);
        assert_eq!(theirs.header_checksum, theirs.calc_header_checksum()?);
        Ok(())
    }

    #[test]
    fn checksum_verifies_to_zero() -> anyhow::Result<()> {
        let header = Ipv4HeaderBuilder::new(SOURCE.into(), DESTINATION.into(), protocol::ICMP, 0)
            .identification(0x1234)
            .build()?;
        assert_eq!(checksum::checksum(&header), 0);
        Ok(())
    }

    #[test]
    fn any_flipped_bit_is_detected() -> anyhow::Result<()> {
        let header = Ipv4HeaderBuilder::new(SOURCE.into(), DESTINATION.into(), protocol::TCP, 0)
            .identification(99)
            .build()?;
        for byte in 0..header.len() {
            for bit in 0..8 {
                let mut corrupted = header;
                corrupted[byte] ^= 1 << bit;
                assert_ne!(
                    checksum::checksum(&corrupted),
                    0,
                    "flip of bit {bit} in byte {byte} went unnoticed"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_bad_headers() -> anyhow::Result<()> {
        let good = Ipv4HeaderBuilder::new(SOURCE.into(), DESTINATION.into(), protocol::UDP, 4)
            .build()?;
        let mut datagram = good.to_vec();
        datagram.extend_from_slice(&[1, 2, 3, 4]);

        let mut wrong_version = datagram.clone();
        wrong_version[0] = 0x65;
        assert_eq!(
            Ipv4Header::from_bytes(&wrong_version),
            Err(ParseError::IncorrectIpv4Version)
        );

        assert_eq!(
            Ipv4Header::from_bytes(&datagram[..22]),
            Err(ParseError::LengthMismatch)
        );

        let mut bad_sum = datagram.clone();
        bad_sum[8] = 1;
        assert!(matches!(
            Ipv4Header::from_bytes(&bad_sum),
            Err(ParseError::Checksum { .. })
        ));

        let mut short_ihl = datagram;
        short_ihl[0] = 0x44;
        assert_eq!(
            Ipv4Header::from_bytes(&short_ihl),
            Err(ParseError::InvalidHeaderLength)
        );
        Ok(())
    }

    #[test]
    fn refuses_overlong_payload() {
        let result =
            Ipv4HeaderBuilder::new(SOURCE.into(), DESTINATION.into(), protocol::UDP, 65_516)
                .build();
        assert_eq!(result, Err(HeaderBuildError::OverlyLongPayload));
    }
}
