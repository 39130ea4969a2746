//! The 16-bit one's-complement checksum shared by IPv4, ICMP, UDP and TCP.

use super::Ipv4Address;

/// A running checksum. Words are accumulated into 32 bits and the carries are
/// folded back in when the value is read out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u32);

impl Checksum {
    /// Creates a new checksum calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `u16` to the checksum value.
    pub fn add_u16(&mut self, value: u16) {
        self.add_partial(value as u32);
    }

    /// Adds `u16` formed by two `u8`s to the checksum value.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s to the checksum value by splitting a `u32` in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds a partial sum such as the one returned by
    /// [`Message::sum_up`](crate::Message::sum_up).
    pub fn add_partial(&mut self, partial: u32) {
        let (sum, carry) = self.0.overflowing_add(partial);
        self.0 = sum + carry as u32;
    }

    /// Adds a byte slice. An odd trailing byte is padded with zero.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.add_partial(sum(bytes));
    }

    /// Adds the TCP/UDP pseudo header.
    pub fn add_pseudo_header(
        &mut self,
        source: Ipv4Address,
        destination: Ipv4Address,
        protocol: u8,
        length: u16,
    ) {
        self.add_u32(source.into());
        self.add_u32(destination.into());
        self.add_u8(0, protocol);
        self.add_u16(length);
    }

    /// The folded sum, before complementing.
    pub fn fold(&self) -> u16 {
        fold(self.0)
    }

    /// Computes the final checksum value. Verifying a region that already
    /// contains its checksum yields zero.
    pub fn as_u16(&self) -> u16 {
        !self.fold()
    }
}

/// Folds the carries of a partial sum until it fits in 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// The unfolded sum of the big-endian 16-bit words in `bytes`.
pub fn sum(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        sum = fold_add(sum, u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = fold_add(sum, u16::from_be_bytes([*last, 0]) as u32);
    }
    sum
}

/// The complemented checksum of a byte slice.
pub fn checksum(bytes: &[u8]) -> u16 {
    !fold(sum(bytes))
}

fn fold_add(a: u32, b: u32) -> u32 {
    let (sum, carry) = a.overflowing_add(b);
    sum + carry as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        // The worked example from RFC 1071 section 3.
        let bytes = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold(sum(&bytes)), 0xddf2);
        assert_eq!(checksum(&bytes), !0xddf2);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(sum(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
    }

    #[test]
    fn incremental_matches_slice() {
        let bytes = [0x45, 0x00, 0x00, 0x54, 0xab, 0xcd, 0x40, 0x00];
        let mut incremental = Checksum::new();
        incremental.add_u8(0x45, 0x00);
        incremental.add_u16(0x0054);
        incremental.add_u32([0xab, 0xcd, 0x40, 0x00]);
        assert_eq!(incremental.as_u16(), checksum(&bytes));
    }
}
