//! Byte-exact layouts for the headers the stack speaks.
//!
//! Every codec reads and writes multi-byte fields in network byte order
//! explicitly. Parsers never trust a length field without checking it against
//! the bytes actually present, and report problems through a per-codec
//! `ParseError` so that the receiving protocol can reject the packet.

mod bytes;
pub use bytes::BytesExt;

pub mod checksum;
pub use checksum::Checksum;

mod ipv4_address;
pub use ipv4_address::Ipv4Address;

mod mac;
pub use mac::Mac;

pub mod arp;
pub mod dhcp;
pub mod dix;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;
