//! TCP segment headers, RFC 793, and the constants the stream layer uses.
//!
//! Only the header layout is modeled here. Congestion control and
//! retransmission are not implemented; the timing constants are kept so the
//! stream layer and its callers agree on them.

use super::{ipv4::protocol, BytesExt, Checksum, Ipv4Address};
use thiserror::Error as ThisError;

pub const MIN_HLEN: usize = 20;
pub const MAX_HLEN: usize = 60;
pub const DEF_SSTHRESH: u32 = 65535;
/// Maximum segment lifetime, in seconds.
pub const MSL: u32 = 120;
/// Bounds on the round trip estimate, in milliseconds and seconds.
pub const MIN_RTT: u32 = 1000;
pub const MAX_RTT: u32 = 2 * MSL;
pub const DEF_RTT: u32 = 3;
pub const R1: u32 = 3;
pub const PMTUD_BACKOFF: u32 = 4;
pub const MAX_BACKOFF: u32 = 16;
pub const RXMIT_THRESH: u32 = 3;
pub const LIMITED_THRESH: u32 = 2;
/// Delayed acknowledgement timer, in milliseconds.
pub const DACK_TIME: u32 = 200;
/// Initial sequence number clock rate, in ticks per second.
pub const IIS_CLOCK: u32 = 250_000;

/// Control bits in the low byte of the offset/flags word.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Option kinds.
pub mod option_kind {
    pub const EOL: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const WS: u8 = 3;
    pub const SACKP: u8 = 4;
    pub const SACK: u8 = 5;
    pub const TS: u8 = 8;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    Nop,
    MaximumSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    Sack(Vec<(u32, u32)>),
    Timestamp { value: u32, echo: u32 },
    Unknown { kind: u8, data: Vec<u8> },
}

impl TcpOption {
    fn encoded_len(&self) -> usize {
        match self {
            TcpOption::Nop => 1,
            TcpOption::MaximumSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Sack(blocks) => 2 + 8 * blocks.len(),
            TcpOption::Timestamp { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::Nop => out.push(option_kind::NOP),
            TcpOption::MaximumSegmentSize(mss) => {
                out.extend_from_slice(&[option_kind::MSS, 4]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            TcpOption::WindowScale(shift) => out.extend_from_slice(&[option_kind::WS, 3, *shift]),
            TcpOption::SackPermitted => out.extend_from_slice(&[option_kind::SACKP, 2]),
            TcpOption::Sack(blocks) => {
                out.extend_from_slice(&[option_kind::SACK, (2 + 8 * blocks.len()) as u8]);
                for (left, right) in blocks {
                    out.extend_from_slice(&left.to_be_bytes());
                    out.extend_from_slice(&right.to_be_bytes());
                }
            }
            TcpOption::Timestamp { value, echo } => {
                out.extend_from_slice(&[option_kind::TS, 10]);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo.to_be_bytes());
            }
            TcpOption::Unknown { kind, data } => {
                out.extend_from_slice(&[*kind, (2 + data.len()) as u8]);
                out.extend_from_slice(data);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source: u16,
    pub destination: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    pub fn new(source: u16, destination: u16, sequence: u32, flags: u8) -> Self {
        Self {
            source,
            destination,
            sequence,
            acknowledgement: 0,
            flags,
            window: 0,
            checksum: 0,
            urgent: 0,
            options: vec![],
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// The encoded header length in bytes, options padded to a word.
    pub fn header_len(&self) -> usize {
        let options: usize = self.options.iter().map(TcpOption::encoded_len).sum();
        MIN_HLEN + (options + 3) / 4 * 4
    }

    /// Parses the header at the front of `segment`, options included.
    pub fn from_bytes(segment: &[u8]) -> Result<Self, ParseError> {
        let mut bytes = segment.iter().cloned();
        let hts = ParseError::HeaderTooShort;

        let source = bytes.next_u16_be().ok_or(hts)?;
        let destination = bytes.next_u16_be().ok_or(hts)?;
        let sequence = bytes.next_u32_be().ok_or(hts)?;
        let acknowledgement = bytes.next_u32_be().ok_or(hts)?;
        let offset_and_flags = bytes.next_u16_be().ok_or(hts)?;
        let header_len = ((offset_and_flags & 0xf000) >> 10) as usize;
        if header_len < MIN_HLEN {
            Err(ParseError::InvalidHeaderLength)?
        }
        if header_len > segment.len() {
            Err(ParseError::HeaderTooShort)?
        }
        let window = bytes.next_u16_be().ok_or(hts)?;
        let checksum = bytes.next_u16_be().ok_or(hts)?;
        let urgent = bytes.next_u16_be().ok_or(hts)?;

        Ok(Self {
            source,
            destination,
            sequence,
            acknowledgement,
            flags: offset_and_flags as u8,
            window,
            checksum,
            urgent,
            options: parse_options(&segment[MIN_HLEN..header_len])?,
        })
    }

    /// Serializes the header with a zero checksum. See [`seal_ipv4`].
    pub fn build(&self) -> Vec<u8> {
        let header_len = self.header_len();
        let mut out = Vec::with_capacity(header_len);
        out.extend_from_slice(&self.source.to_be_bytes());
        out.extend_from_slice(&self.destination.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.acknowledgement.to_be_bytes());
        let offset_and_flags = ((header_len as u16) << 10) | self.flags as u16;
        out.extend_from_slice(&offset_and_flags.to_be_bytes());
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.urgent.to_be_bytes());
        for option in &self.options {
            option.write(&mut out);
        }
        out.resize(header_len, option_kind::EOL);
        out
    }
}

fn parse_options(mut bytes: &[u8]) -> Result<Vec<TcpOption>, ParseError> {
    let mut options = vec![];
    while let Some((&kind, rest)) = bytes.split_first() {
        match kind {
            option_kind::EOL => break,
            option_kind::NOP => {
                options.push(TcpOption::Nop);
                bytes = rest;
                continue;
            }
            _ => {}
        }
        let len = *rest.first().ok_or(ParseError::MalformedOption)? as usize;
        if len < 2 || len > bytes.len() {
            Err(ParseError::MalformedOption)?
        }
        let data = &bytes[2..len];
        let option = match (kind, data.len()) {
            (option_kind::MSS, 2) => TcpOption::MaximumSegmentSize(u16::from_be_bytes([data[0], data[1]])),
            (option_kind::WS, 1) => TcpOption::WindowScale(data[0]),
            (option_kind::SACKP, 0) => TcpOption::SackPermitted,
            (option_kind::SACK, n) if n % 8 == 0 => TcpOption::Sack(
                data.chunks_exact(8)
                    .map(|block| {
                        let mut block = block.iter().cloned();
                        (
                            block.next_u32_be().unwrap_or_default(),
                            block.next_u32_be().unwrap_or_default(),
                        )
                    })
                    .collect(),
            ),
            (option_kind::TS, 8) => {
                let mut data = data.iter().cloned();
                TcpOption::Timestamp {
                    value: data.next_u32_be().unwrap_or_default(),
                    echo: data.next_u32_be().unwrap_or_default(),
                }
            }
            (option_kind::MSS | option_kind::WS | option_kind::SACKP | option_kind::SACK | option_kind::TS, _) => {
                Err(ParseError::MalformedOption)?
            }
            _ => TcpOption::Unknown {
                kind,
                data: data.to_vec(),
            },
        };
        options.push(option);
        bytes = &bytes[len..];
    }
    Ok(options)
}

/// Fills in the checksum of a complete segment (header and payload).
pub fn seal_ipv4(segment: &mut [u8], source: Ipv4Address, destination: Ipv4Address) {
    segment[16..18].copy_from_slice(&[0, 0]);
    let sum = segment_checksum(segment, source, destination);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());
}

/// Checks the checksum of a complete segment.
pub fn verify_ipv4(
    segment: &[u8],
    source: Ipv4Address,
    destination: Ipv4Address,
) -> Result<(), ParseError> {
    if segment.len() < MIN_HLEN {
        Err(ParseError::HeaderTooShort)?
    }
    match segment_checksum(segment, source, destination) {
        0 => Ok(()),
        _ => Err(ParseError::Checksum),
    }
}

fn segment_checksum(segment: &[u8], source: Ipv4Address, destination: Ipv4Address) -> u16 {
    let mut checksum = Checksum::new();
    checksum.add_pseudo_header(source, destination, protocol::TCP, segment.len() as u16);
    checksum.add_bytes(segment);
    checksum.as_u16()
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Too few bytes to constitute a TCP header")]
    HeaderTooShort,
    #[error("The data offset is smaller than a basic header")]
    InvalidHeaderLength,
    #[error("A TCP option overruns the header")]
    MalformedOption,
    #[error("The TCP checksum does not verify")]
    Checksum,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
    const DESTINATION: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

    #[test]
    fn options_round_trip() -> anyhow::Result<()> {
        let mut header = TcpHeader::new(40000, 80, 0xdead_beef, flags::SYN);
        header.window = 4096;
        header.options = vec![
            TcpOption::MaximumSegmentSize(1460),
            TcpOption::SackPermitted,
            TcpOption::Timestamp { value: 1, echo: 0 },
            TcpOption::Nop,
            TcpOption::WindowScale(7),
        ];
        let bytes = header.build();
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes.len(), header.header_len());
        let parsed = TcpHeader::from_bytes(&bytes)?;
        assert_eq!(parsed, header);
        assert!(parsed.has(flags::SYN));
        assert!(!parsed.has(flags::ACK));
        Ok(())
    }

    #[test]
    fn data_offset_is_in_words() -> anyhow::Result<()> {
        let bytes = TcpHeader::new(1, 2, 3, flags::ACK | flags::PSH).build();
        assert_eq!(bytes[12], 0x50);
        assert_eq!(bytes[13], flags::ACK | flags::PSH);
        Ok(())
    }

    #[test]
    fn sealed_segment_verifies() -> anyhow::Result<()> {
        let mut segment = TcpHeader::new(1234, 80, 1, flags::ACK).build();
        segment.extend_from_slice(b"odd");
        seal_ipv4(&mut segment, SOURCE, DESTINATION);
        verify_ipv4(&segment, SOURCE, DESTINATION)?;
        assert_eq!(
            verify_ipv4(&segment, DESTINATION, Ipv4Address::LOCALHOST),
            Err(ParseError::Checksum)
        );
        Ok(())
    }

    #[test]
    fn rejects_overrunning_option() {
        let mut bytes = TcpHeader::new(1, 2, 3, 0).build();
        bytes[12] = 0x60;
        bytes.extend_from_slice(&[option_kind::MSS, 9, 0, 0]);
        assert_eq!(TcpHeader::from_bytes(&bytes), Err(ParseError::MalformedOption));
    }
}
