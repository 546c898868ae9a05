//! Spend checksums.
//!
//! A `Spend` history row does not repeat the funding outpoint. It carries a
//! 64-bit checksum of it instead, and consumers pair spends with outputs by
//! recomputing [`checksum`] over each `Output` row's point.
//!
//! Layout: the upper 49 bits are the upper 49 bits of the first eight txid
//! bytes read little-endian, the lower 15 bits are the low bits of the output
//! index. Transaction ids are uniformly distributed hashes, so collisions
//! between unrelated outpoints are rare but possible. A match is a
//! candidate, corroborated by the spend height being at or above the
//! funding height.

use crate::types::OutPoint;

/// Bits of the checksum taken from the transaction id.
const TXID_MASK: u64 = 0xffff_8000_0000_0000;

/// Bits of the checksum taken from the output index.
const INDEX_MASK: u64 = 0x0000_0000_0000_7fff;

/// Derive the matching token for an outpoint.
///
/// Depends only on the point, never on the output's value or lock, and is
/// stable across restarts and storage backends.
pub fn checksum(outpoint: &OutPoint) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&outpoint.txid.as_bytes()[..8]);
    (u64::from_le_bytes(head) & TXID_MASK) | (outpoint.index & INDEX_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;
    use proptest::prelude::*;

    fn point(byte: u8, index: u64) -> OutPoint {
        OutPoint {
            txid: Hash256([byte; 32]),
            index,
        }
    }

    #[test]
    fn index_occupies_low_bits() {
        let c0 = checksum(&point(0xAB, 0));
        let c5 = checksum(&point(0xAB, 5));
        assert_eq!(c5 - c0, 5);
        assert_eq!(c0 & INDEX_MASK, 0);
    }

    #[test]
    fn txid_occupies_high_bits() {
        let mut txid = [0u8; 32];
        txid[7] = 0x80;
        let c = checksum(&OutPoint { txid: Hash256(txid), index: 0 });
        assert_eq!(c, 0x8000_0000_0000_0000);
    }

    #[test]
    fn only_first_eight_txid_bytes_matter() {
        let mut a = [0x55u8; 32];
        let mut b = [0x55u8; 32];
        a[20] = 1;
        b[20] = 2;
        assert_eq!(
            checksum(&OutPoint { txid: Hash256(a), index: 3 }),
            checksum(&OutPoint { txid: Hash256(b), index: 3 })
        );
    }

    #[test]
    fn index_wraps_beyond_fifteen_bits() {
        assert_eq!(checksum(&point(1, 0)), checksum(&point(1, 0x8000)));
    }

    proptest! {
        #[test]
        fn deterministic(bytes in any::<[u8; 32]>(), index in any::<u64>()) {
            let p = OutPoint { txid: Hash256(bytes), index };
            prop_assert_eq!(checksum(&p), checksum(&p));
        }

        #[test]
        fn distinct_small_indices_differ(bytes in any::<[u8; 32]>(), a in 0u64..0x8000, b in 0u64..0x8000) {
            prop_assume!(a != b);
            let pa = OutPoint { txid: Hash256(bytes), index: a };
            let pb = OutPoint { txid: Hash256(bytes), index: b };
            prop_assert_ne!(checksum(&pa), checksum(&pb));
        }
    }
}
