use super::{Ipv4Address, Mac};

/// An extension trait for `Iterator<Item = u8>` that reads big-endian fields
/// off the front of a header.
///
/// # Example
///
/// ```
/// # use conduit_core::wire::BytesExt;
/// let arr = [0xFF, 0x01, 0x09, 0x69];
/// let mut iter = arr.iter().cloned();
/// assert_eq!(iter.next_u16_be(), Some(0xFF01));
/// assert_eq!(iter.next_u8(), Some(0x09));
/// assert_eq!(iter.next_u32_be(), None);
/// ```
pub trait BytesExt: Iterator<Item = u8> {
    /// Functions identically to `Iterator<Item = u8>::next`.
    fn next_u8(&mut self) -> Option<u8> {
        self.next()
    }

    /// Combines the next 2 bytes in big-endian order. Returns None if there
    /// were fewer than 2 bytes left.
    fn next_u16_be(&mut self) -> Option<u16> {
        Some(u16::from_be_bytes(self.next_n()?))
    }

    /// Combines the next 4 bytes in big-endian order. Returns None if there
    /// were fewer than 4 bytes left.
    fn next_u32_be(&mut self) -> Option<u32> {
        Some(u32::from_be_bytes(self.next_n()?))
    }

    fn next_ipv4addr(&mut self) -> Option<Ipv4Address> {
        self.next_n::<4>().map(Ipv4Address::from)
    }

    fn next_mac(&mut self) -> Option<Mac> {
        self.next_n::<6>().map(Mac::from)
    }

    /// Collects the next `N` items of the iterator into an array.
    /// Returns `None` if there were fewer than `N` bytes left in the iterator.
    fn next_n<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut result = [0; N];
        for element in &mut result {
            *element = self.next()?
        }
        Some(result)
    }

    /// Discards `n` bytes, returning None if the iterator ran dry first.
    fn skip_n(&mut self, n: usize) -> Option<()> {
        for _ in 0..n {
            self.next()?;
        }
        Some(())
    }
}

impl<T: Iterator<Item = u8>> BytesExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_addresses() {
        let arr = [10, 0, 0, 1, 0xde, 0xad, 0xbe, 0xef, 0, 1, 7];
        let mut iter = arr.iter().cloned();
        assert_eq!(iter.next_ipv4addr(), Some(Ipv4Address::new([10, 0, 0, 1])));
        assert_eq!(
            iter.next_mac(),
            Some(Mac::new([0xde, 0xad, 0xbe, 0xef, 0, 1]))
        );
        assert_eq!(iter.skip_n(2), None);
    }
}
