//! A packed, MSB-first bit sequence.
//!
//! Used both for a peer's advertised piece availability (one bit per piece)
//! and for a piece's sub-piece completion mask (one bit per block). Bit 0 is
//! the most significant bit of byte 0 (`0x80`), matching the wire format of
//! the BITFIELD message.

use bitvec::prelude::{BitVec, Msb0};

/// A fixed-length, MSB-first packed bit sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitfield(BitVec<Msb0, u8>);

impl Bitfield {
    /// Creates a bitfield of `len` bits, all initially unset.
    pub fn new(len: usize) -> Self {
        Self(BitVec::repeat(false, len))
    }

    /// Builds a bitfield of `len` bits from a received byte buffer.
    ///
    /// The buffer is copied. If it carries more bits than `len`, the extra
    /// trailing bits are ignored (truncated); if it carries fewer bytes than
    /// needed, the remainder is implicitly unset.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits: BitVec<Msb0, u8> = BitVec::from_slice(bytes);
        bits.resize(len, false);
        Self(bits)
    }

    /// The number of bits (logical length) of this bitfield.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether the bit at `index` is set.
    ///
    /// Returns `false` for an out of bounds index rather than panicking,
    /// since a peer-supplied index (e.g. from a HAVE message) is untrusted
    /// input.
    pub fn get(&self, index: usize) -> bool {
        self.0.get(index).map(|b| *b).unwrap_or(false)
    }

    /// Sets the bit at `index` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&mut self, index: usize, value: bool) {
        self.0.set(index, value);
    }

    /// The number of set bits.
    pub fn count_ones(&self) -> usize {
        self.0.count_ones()
    }

    /// Returns true if every bit is set.
    pub fn all(&self) -> bool {
        self.0.all()
    }

    /// Sets every bit to `value`.
    pub fn fill(&mut self, value: bool) {
        self.0.set_all(value);
    }

    /// Returns the underlying bytes, MSB-first, padded with zero bits in the
    /// last byte as needed. This is the wire representation of a BITFIELD
    /// message payload.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.0.clone().into_vec()
    }

    /// Iterates over the indices of the bits that are set.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().filter_map(|(i, b)| if *b { Some(i) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_first_bit_order() {
        // 0b1100_0001 => bits 0, 1, and 7 set.
        let bf = Bitfield::from_bytes(&[0b1100_0001], 8);
        assert!(bf.get(0));
        assert!(bf.get(1));
        assert!(!bf.get(2));
        assert!(bf.get(7));
        assert_eq!(bf.count_ones(), 3);
    }

    #[test]
    fn trailing_bits_past_len_are_ignored() {
        // declares only 3 pieces even though the byte carries 8 bits
        let bf = Bitfield::from_bytes(&[0xFF], 3);
        assert_eq!(bf.len(), 3);
        assert_eq!(bf.count_ones(), 3);
        assert!(bf.all());
    }

    #[test]
    fn misaligned_length_is_permitted() {
        let mut bf = Bitfield::new(5);
        assert_eq!(bf.len(), 5);
        bf.set(4, true);
        assert_eq!(bf.count_ones(), 1);
        assert_eq!(bf.as_bytes(), vec![0b0000_1000]);
    }

    #[test]
    fn set_and_count_ones() {
        let mut bf = Bitfield::new(16);
        bf.set(0, true);
        bf.set(15, true);
        assert_eq!(bf.count_ones(), 2);
        bf.set(0, false);
        assert_eq!(bf.count_ones(), 1);
    }

    #[test]
    fn fill_sets_every_bit() {
        let mut bf = Bitfield::new(10);
        bf.fill(true);
        assert!(bf.all());
        assert_eq!(bf.count_ones(), 10);
    }

    #[test]
    fn iter_ones_yields_set_indices() {
        let bf = Bitfield::from_bytes(&[0b1010_0000], 8);
        let ones: Vec<_> = bf.iter_ones().collect();
        assert_eq!(ones, vec![0, 2]);
    }
}
