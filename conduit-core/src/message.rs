//! The in-flight packet.
//!
//! A [`Message`] owns one buffer and a cursor into it. On input the cursor
//! starts at the link header and each protocol consumes its header by moving
//! the cursor forward. On output the payload is placed behind enough headroom
//! for every header below it, and each protocol reserves its header by moving
//! the cursor backward and writing into the window returned by [`Message::fix`].

use crate::{
    address::Inet4Address,
    wire::{checksum, dix, ipv4, tcp, Mac},
};
use std::sync::Arc;

/// Identifies the interface an address or packet belongs to. Zero means
/// "unspecified".
pub type ScopeId = usize;

/// Headroom reserved in front of every outgoing payload: a link header and the
/// largest network and transport headers.
pub const HEADROOM: usize = dix::HEADER_LEN + ipv4::MAX_OCTETS + tcp::MAX_HLEN;

/// Selects which [`Receiver`](crate::conduit::Receiver) method a traversal
/// invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// A packet travelling up from a device.
    Input,
    /// A packet travelling down toward a device.
    Output,
    /// A negative signal (such as ICMP unreachable) travelling up.
    Error,
    /// A request for buffered data on behalf of a socket.
    Read,
}

/// A packet in flight through the conduit graph.
#[derive(Debug, Clone)]
pub struct Message {
    buffer: Vec<u8>,
    position: usize,
    end: usize,
    fixed: usize,
    pub command: Command,
    /// The address on this host the packet belongs to.
    pub local: Option<Arc<Inet4Address>>,
    /// The peer address.
    pub remote: Option<Arc<Inet4Address>>,
    pub local_port: u16,
    pub remote_port: u16,
    pub scope: ScopeId,
    /// The type tag handed between adjacent layers: an EtherType below the
    /// network layer and an IP protocol number above it.
    pub packet_type: u16,
    /// Where the network header starts, set by the network layer on input.
    pub network_offset: usize,
    /// The neighbor a packet is handed to on output.
    pub next_hop: Option<Arc<Inet4Address>>,
    /// Overrides the link destination, used by ARP.
    pub link_destination: Option<Mac>,
    /// The link source of a received frame.
    pub link_source: Option<Mac>,
    /// Transport control bits requested by a socket (SYN, FIN) or reported
    /// to it.
    pub control: u8,
    /// The ICMP code carried by an error message.
    pub error_code: u8,
    /// Set once a receiver has filled a read request.
    pub produced: bool,
}

impl Message {
    fn with_buffer(buffer: Vec<u8>, position: usize, command: Command) -> Self {
        let end = buffer.len();
        Self {
            buffer,
            position,
            end,
            fixed: 0,
            command,
            local: None,
            remote: None,
            local_port: 0,
            remote_port: 0,
            scope: 0,
            packet_type: 0,
            network_offset: 0,
            next_hop: None,
            link_destination: None,
            link_source: None,
            control: 0,
            error_code: 0,
            produced: false,
        }
    }

    /// A received frame.
    pub fn input(frame: &[u8], scope: ScopeId) -> Self {
        let mut message = Self::with_buffer(frame.to_vec(), 0, Command::Input);
        message.scope = scope;
        message
    }

    /// An outgoing payload with `headroom` bytes free in front of it.
    pub fn output(payload: &[u8], headroom: usize) -> Self {
        let mut buffer = vec![0u8; headroom + payload.len()];
        buffer[headroom..].copy_from_slice(payload);
        Self::with_buffer(buffer, headroom, Command::Output)
    }

    /// A read request able to carry up to `capacity` bytes.
    pub fn read(capacity: usize) -> Self {
        let mut message = Self::with_buffer(vec![0u8; capacity], 0, Command::Read);
        message.end = 0;
        message
    }

    /// The cursor position within the buffer.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The number of bytes between the cursor and the logical end.
    pub fn len(&self) -> usize {
        self.end - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes from the cursor to the logical end.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.position..self.end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.position..self.end]
    }

    /// The bytes from the network header to the logical end.
    pub fn datagram(&self) -> &[u8] {
        &self.buffer[self.network_offset.min(self.end)..self.end]
    }

    /// The size of the window most recently returned by [`Message::fix`].
    pub fn fixed(&self) -> usize {
        self.fixed
    }

    /// Makes the next `n` bytes from the cursor addressable. The cursor does
    /// not move.
    ///
    /// # Panics
    ///
    /// Panics if the window would run past the buffer. Sizing the buffer is the
    /// caller's job.
    pub fn fix(&mut self, n: usize) -> &mut [u8] {
        assert!(
            self.position + n <= self.buffer.len(),
            "fix({n}) at {} overruns a {} byte buffer",
            self.position,
            self.buffer.len()
        );
        self.fixed = n;
        if self.position + n > self.end {
            self.end = self.position + n;
        }
        &mut self.buffer[self.position..self.position + n]
    }

    /// The next `n` bytes from the cursor, if that many are present. Used on
    /// input where lengths come from the wire.
    pub fn header(&self, n: usize) -> Option<&[u8]> {
        self.buffer.get(self.position..self.position + n)
            .filter(|_| self.position + n <= self.end)
    }

    /// Moves the cursor. A positive delta consumes a header on input, a
    /// negative one reserves room for a header on output.
    ///
    /// # Panics
    ///
    /// Panics if the cursor would leave the buffer.
    pub fn move_position(&mut self, delta: isize) {
        let position = self.position as isize + delta;
        assert!(
            position >= 0 && position as usize <= self.end,
            "cursor moved to {position}, outside 0..={}",
            self.end
        );
        self.position = position as usize;
        self.fixed = 0;
    }

    /// Sets the logical length measured from the cursor, dropping trailing
    /// bytes such as link padding.
    ///
    /// # Panics
    ///
    /// Panics if the length runs past the buffer.
    pub fn set_len(&mut self, len: usize) {
        assert!(self.position + len <= self.buffer.len());
        self.end = self.position + len;
    }

    /// The unfolded one's-complement sum of `len` bytes from the cursor.
    pub fn sum_up(&self, len: usize) -> u32 {
        checksum::sum(&self.buffer[self.position..self.position + len])
    }

    /// Answers a read request with `bytes`, truncated to the request's
    /// capacity. Returns how many bytes were taken.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.buffer.len() - self.position);
        self.buffer[self.position..self.position + count].copy_from_slice(&bytes[..count]);
        self.end = self.position + count;
        self.produced = true;
        count
    }

    /// The remote address value, or `0.0.0.0` when there is none.
    pub fn remote_value(&self) -> crate::wire::Ipv4Address {
        self.remote
            .as_ref()
            .map(|address| address.value())
            .unwrap_or(crate::wire::Ipv4Address::UNSPECIFIED)
    }

    /// The local address value, or `0.0.0.0` when there is none.
    pub fn local_value(&self) -> crate::wire::Ipv4Address {
        self.local
            .as_ref()
            .map(|address| address.value())
            .unwrap_or(crate::wire::Ipv4Address::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_headers_grow_backward() {
        let mut message = Message::output(b"data", 8);
        assert_eq!(message.len(), 4);
        message.move_position(-4);
        message.fix(4).copy_from_slice(b"hdr:");
        assert_eq!(message.payload(), b"hdr:data");
        assert_eq!(message.fixed(), 4);
    }

    #[test]
    fn input_headers_are_consumed() {
        let mut message = Message::input(&[1, 2, 3, 4, 5, 6], 1);
        assert_eq!(message.header(2), Some(&[1u8, 2][..]));
        message.move_position(2);
        assert_eq!(message.payload(), &[3, 4, 5, 6]);
        message.set_len(2);
        assert_eq!(message.payload(), &[3, 4]);
        assert_eq!(message.header(3), None);
    }

    #[test]
    fn sum_up_matches_checksum() {
        let message = Message::input(&[0x45, 0x00, 0x00, 0x1c], 1);
        assert_eq!(message.sum_up(4), 0x4500 + 0x001c);
    }

    #[test]
    fn fill_truncates_to_capacity() {
        let mut message = Message::read(3);
        assert!(message.is_empty());
        assert_eq!(message.fill(b"abcdef"), 3);
        assert!(message.produced);
        assert_eq!(message.payload(), b"abc");
    }

    #[test]
    #[should_panic]
    fn fix_past_the_buffer_panics() {
        let mut message = Message::output(b"", 4);
        message.fix(1);
    }

    #[test]
    #[should_panic]
    fn moving_before_the_buffer_panics() {
        let mut message = Message::output(b"x", 2);
        message.move_position(-3);
    }
}
