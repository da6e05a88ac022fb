//! Wrapper types around bitvec.

use bitvec::prelude::*;

/// Bitfield where index = piece.
///
/// The wire order matches the `bitfield` message: MSB of byte 0 is piece 0,
/// trailing bits of the last byte are padding and must stay zero.
pub type Bitfield = BitVec<u8, Msb0>;

/// Construct an all-zero bitfield with one bit per piece.
pub fn from_pieces(num_pieces: usize) -> Bitfield {
    bitvec![u8, Msb0; 0; num_pieces]
}

/// True if any padding bit beyond `num_pieces` is set.
///
/// A peer setting spare bits is announcing pieces that do not exist.
pub fn has_spare_bits(bitfield: &Bitfield, num_pieces: usize) -> bool {
    bitfield.iter_ones().any(|i| i >= num_pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_order_is_msb_first() {
        // 0b1100_0001 means pieces 0, 1 and 7
        let bitfield = Bitfield::from_vec(vec![0b1100_0001]);

        assert!(bitfield[0]);
        assert!(bitfield[1]);
        assert!(!bitfield[2]);
        assert!(bitfield[7]);
    }

    #[test]
    fn spare_bits() {
        let mut bitfield = from_pieces(10);
        bitfield.extend_from_bitslice(&bitvec![u8, Msb0; 0; 6]);
        assert!(!has_spare_bits(&bitfield, 10));

        bitfield.set(12, true);
        assert!(has_spare_bits(&bitfield, 10));
    }
}
