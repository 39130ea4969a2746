use std::fmt::{self, Display};

/// An IPv4 address value. The stateful, per-scope counterpart lives in
/// [`Inet4Address`](crate::address::Inet4Address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `0.0.0.0`.
    pub const UNSPECIFIED: Self = Self([0u8, 0, 0, 0]);

    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127u8, 0, 0, 1]);

    /// The limited broadcast address `255.255.255.255`.
    pub const BROADCAST: Self = Self([255u8, 255, 255, 255]);

    /// Creates a new address. The number can be provided as a `[u8; 4]` or a
    /// `u32`.
    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    /// Gets the address as a `u32`.
    pub fn to_u32(self) -> u32 {
        self.into()
    }

    /// Gets the address as a `[u8; 4]`.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0
    }

    pub fn is_unspecified(self) -> bool {
        self == Self::UNSPECIFIED
    }

    /// Anything in `127.0.0.0/8`.
    pub fn is_loopback(self) -> bool {
        self.0[0] == 127
    }

    /// Anything in `224.0.0.0/4`.
    pub fn is_multicast(self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// Anything in `240.0.0.0/4` other than the limited broadcast address.
    pub fn is_reserved(self) -> bool {
        self.0[0] & 0xf0 == 0xf0 && !self.is_broadcast()
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Anything in `169.254.0.0/16`.
    pub fn is_link_local(self) -> bool {
        self.0[0] == 169 && self.0[1] == 254
    }

    /// Keeps the first `prefix` bits of the address.
    pub fn mask(self, prefix: u8) -> Self {
        let mask = match prefix {
            0 => 0,
            p if p >= 32 => u32::MAX,
            p => u32::MAX << (32 - p),
        };
        (self.to_u32() & mask).into()
    }

    /// Whether `other` shares the first `prefix` bits with this address.
    pub fn same_subnet(self, other: Self, prefix: u8) -> bool {
        self.mask(prefix) == other.mask(prefix)
    }

    /// The subnet mask for a prefix length, e.g. `255.255.255.0` for 24.
    pub fn netmask(prefix: u8) -> Self {
        Self::BROADCAST.mask(prefix)
    }

    /// The prefix length of a contiguous subnet mask.
    pub fn prefix_len(self) -> u8 {
        self.to_u32().leading_ones() as u8
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self::from(n.to_be_bytes())
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<Ipv4Address> for u32 {
    fn from(address: Ipv4Address) -> Self {
        u32::from_be_bytes(address.0)
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_special_addresses() {
        assert!(Ipv4Address::UNSPECIFIED.is_unspecified());
        assert!(Ipv4Address::new([127, 4, 5, 6]).is_loopback());
        assert!(Ipv4Address::new([224, 0, 0, 251]).is_multicast());
        assert!(Ipv4Address::new([240, 0, 0, 1]).is_reserved());
        assert!(!Ipv4Address::BROADCAST.is_reserved());
        assert!(Ipv4Address::new([169, 254, 0, 1]).is_link_local());
    }

    #[test]
    fn subnet_arithmetic() {
        let a = Ipv4Address::new([10, 0, 0, 17]);
        let b = Ipv4Address::new([10, 0, 0, 200]);
        assert!(a.same_subnet(b, 24));
        assert!(!a.same_subnet(b, 25));
        assert_eq!(Ipv4Address::netmask(24), Ipv4Address::new([255, 255, 255, 0]));
        assert_eq!(Ipv4Address::netmask(24).prefix_len(), 24);
        assert_eq!(a.mask(0), Ipv4Address::UNSPECIFIED);
    }
}
