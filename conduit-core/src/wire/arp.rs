//! ARP for IPv4 over Ethernet, RFC 826.
//!
//! <https://en.wikipedia.org/wiki/Address_Resolution_Protocol#Packet_structure>

use super::{dix::ethertype, BytesExt, Ipv4Address, Mac};
use thiserror::Error as ThisError;

/// Hardware type numbers, as used in ARP and in interface registration.
pub mod hardware {
    pub const ETHERNET: u16 = 1;
    pub const LOOPBACK: u16 = 772;
}

const HLEN: u8 = 6;
const PLEN: u8 = 4;

/// An ARP packet. Parsing only succeeds for IPv4 over Ethernet.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct ArpHeader {
    pub operation: Operation,
    pub sender_mac: Mac,
    pub sender_ip: Ipv4Address,
    pub target_mac: Mac,
    pub target_ip: Ipv4Address,
}

impl ArpHeader {
    /// The size of an ARP packet in bytes (28).
    pub const SIZE: usize = 28;

    pub fn new_request(sender_mac: Mac, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self {
            operation: Operation::Request,
            sender_mac,
            sender_ip,
            target_mac: Mac::ZERO,
            target_ip,
        }
    }

    pub fn new_reply(
        sender_mac: Mac,
        sender_ip: Ipv4Address,
        target_mac: Mac,
        target_ip: Ipv4Address,
    ) -> Self {
        Self {
            operation: Operation::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }

    /// An RFC 5227 probe: a request whose sender address is unspecified.
    pub fn new_probe(sender_mac: Mac, target_ip: Ipv4Address) -> Self {
        Self::new_request(sender_mac, Ipv4Address::UNSPECIFIED, target_ip)
    }

    /// An RFC 5227 announcement: a request for our own address.
    pub fn new_announcement(sender_mac: Mac, ip: Ipv4Address) -> Self {
        Self::new_request(sender_mac, ip, ip)
    }

    /// Writes the packet into the first [`Self::SIZE`] bytes of `out`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&hardware::ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&ethertype::IPV4.to_be_bytes());
        out[4] = HLEN;
        out[5] = PLEN;
        out[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac.to_bytes());
        out[14..18].copy_from_slice(&self.sender_ip.to_bytes());
        out[18..24].copy_from_slice(&self.target_mac.to_bytes());
        out[24..28].copy_from_slice(&self.target_ip.to_bytes());
    }

    pub fn build(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        self.write(&mut out);
        out
    }

    /// Parses an ARP packet from a byte iterator.
    pub fn from_bytes(mut bytes: impl Iterator<Item = u8>) -> Result<Self, ParseError> {
        const HTS: ParseError = ParseError::HeaderTooShort;

        let htype = bytes.next_u16_be().ok_or(HTS)?;
        let ptype = bytes.next_u16_be().ok_or(HTS)?;
        let hlen = bytes.next_u8().ok_or(HTS)?;
        let plen = bytes.next_u8().ok_or(HTS)?;
        if htype != hardware::ETHERNET || ptype != ethertype::IPV4 || hlen != HLEN || plen != PLEN
        {
            return Err(ParseError::Unsupported);
        }

        let operation = match bytes.next_u16_be().ok_or(HTS)? {
            1 => Operation::Request,
            2 => Operation::Reply,
            _ => return Err(ParseError::InvalidOperation),
        };

        Ok(Self {
            operation,
            sender_mac: bytes.next_mac().ok_or(HTS)?,
            sender_ip: bytes.next_ipv4addr().ok_or(HTS)?,
            target_mac: bytes.next_mac().ok_or(HTS)?,
            target_ip: bytes.next_ipv4addr().ok_or(HTS)?,
        })
    }

    /// The protocol address this packet is "about": the target of a request,
    /// the sender of a reply.
    pub fn subject(&self) -> Ipv4Address {
        match self.operation {
            Operation::Request => self.target_ip,
            Operation::Reply => self.sender_ip,
        }
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("The ARP header is incomplete")]
    HeaderTooShort,
    #[error("Only IPv4 over Ethernet is supported")]
    Unsupported,
    #[error("Invalid operation: should be 1 for request, 2 for reply")]
    InvalidOperation,
}

/// Represents a request or reply operation of an ARP packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Request = 1,
    Reply = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_round_trip() -> anyhow::Result<()> {
        let reply = ArpHeader::new_reply(
            Mac::new([2, 0, 0, 0, 0, 1]),
            Ipv4Address::new([169, 254, 0, 1]),
            Mac::new([2, 0, 0, 0, 0, 2]),
            Ipv4Address::new([169, 254, 0, 2]),
        );
        let bytes = reply.build();
        assert_eq!(&bytes[..8], &[0, 1, 8, 0, 6, 4, 0, 2]);
        assert_eq!(ArpHeader::from_bytes(bytes.iter().cloned())?, reply);
        Ok(())
    }

    #[test]
    fn request_round_trip() -> anyhow::Result<()> {
        let request = ArpHeader::new_request(
            Mac::new([2, 0, 0, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 1]),
            Ipv4Address::new([10, 0, 0, 2]),
        );
        let parsed = ArpHeader::from_bytes(request.build().iter().cloned())?;
        assert_eq!(parsed, request);
        assert_eq!(parsed.subject(), Ipv4Address::new([10, 0, 0, 2]));
        Ok(())
    }

    #[test]
    fn probe_has_unspecified_sender() {
        let probe = ArpHeader::new_probe(Mac::ZERO, Ipv4Address::new([169, 254, 3, 3]));
        assert!(probe.sender_ip.is_unspecified());
        assert_eq!(probe.operation, Operation::Request);
    }

    #[test]
    fn rejects_foreign_hardware() {
        let mut bytes = ArpHeader::new_probe(Mac::ZERO, Ipv4Address::LOCALHOST).build();
        bytes[1] = 6;
        assert_eq!(
            ArpHeader::from_bytes(bytes.iter().cloned()),
            Err(ParseError::Unsupported)
        );
    }

    #[test]
    fn too_short() {
        ArpHeader::from_bytes([0u8, 1, 8, 0, 6, 4, 0].iter().cloned())
            .expect_err("packet was too short; should not have been parsed");
    }
}
