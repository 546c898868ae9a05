//! Stealth prefixes and prefix filters.
//!
//! Every stealth output carries a [`StealthMarker`]. Its 32-bit prefix is the
//! first four bytes, big-endian, of `SHA-256d(ephemeral_key || nonce_le)`.
//! A recipient publishes the first few bits of a prefix it can recognise and
//! queries with a [`BinaryPrefix`] of that length. Shorter prefixes return
//! more candidates and reveal less about the recipient.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PrefixError;
use crate::types::StealthMarker;

/// Longest prefix a filter may carry, in bits.
pub const MAX_PREFIX_BITS: usize = 32;

/// The 32-bit stealth prefix of a marker.
pub fn stealth_prefix(marker: &StealthMarker) -> u32 {
    let mut data = [0u8; 40];
    data[..32].copy_from_slice(marker.ephemeral_key.as_bytes());
    data[32..].copy_from_slice(&marker.nonce.to_le_bytes());
    let digest = Sha256::digest(Sha256::digest(data));
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// A left-aligned bit string of up to [`MAX_PREFIX_BITS`] bits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BinaryPrefix {
    /// Prefix bits, left-aligned. Bits beyond `len` are always zero.
    bits: u32,
    len: u8,
}

impl BinaryPrefix {
    /// The empty prefix, which matches every stealth row.
    pub const EMPTY: Self = Self { bits: 0, len: 0 };

    /// Take the leading `len` bits of `bits`.
    pub fn new(bits: u32, len: usize) -> Result<Self, PrefixError> {
        if len > MAX_PREFIX_BITS {
            return Err(PrefixError::TooLong {
                len,
                max: MAX_PREFIX_BITS,
            });
        }
        Ok(Self {
            bits: bits & Self::mask(len),
            len: len as u8,
        })
    }

    /// Take the leading `len` bits of a byte string, most significant bit first.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, PrefixError> {
        if len > MAX_PREFIX_BITS || len > bytes.len() * 8 {
            return Err(PrefixError::TooLong {
                len,
                max: MAX_PREFIX_BITS.min(bytes.len() * 8),
            });
        }
        let mut word = [0u8; 4];
        for (slot, byte) in word.iter_mut().zip(bytes) {
            *slot = *byte;
        }
        Self::new(u32::from_be_bytes(word), len)
    }

    /// Number of significant bits.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Left-aligned prefix bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Whether a 32-bit stealth prefix starts with these bits.
    pub fn matches(&self, prefix: u32) -> bool {
        prefix & Self::mask(self.len()) == self.bits
    }

    /// Inclusive range of 32-bit prefixes this filter matches.
    pub fn range(&self) -> RangeInclusive<u32> {
        let low = self.bits;
        let high = self.bits | !Self::mask(self.len());
        low..=high
    }

    fn mask(len: usize) -> u32 {
        match len {
            0 => 0,
            n => u32::MAX << (32 - n),
        }
    }
}

impl FromStr for BinaryPrefix {
    type Err = PrefixError;

    /// Parse a string of `0` and `1` digits, most significant first.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_PREFIX_BITS {
            return Err(PrefixError::TooLong {
                len: s.len(),
                max: MAX_PREFIX_BITS,
            });
        }
        let mut bits = 0u32;
        for (position, digit) in s.chars().enumerate() {
            match digit {
                '0' => {}
                '1' => bits |= 1 << (31 - position),
                other => return Err(PrefixError::InvalidDigit(other)),
            }
        }
        Self::new(bits, s.len())
    }
}

impl fmt::Display for BinaryPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for position in 0..self.len() {
            let bit = (self.bits >> (31 - position)) & 1;
            write!(f, "{bit}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Hash256;

    fn marker(byte: u8, nonce: u64) -> StealthMarker {
        StealthMarker {
            ephemeral_key: Hash256([byte; 32]),
            nonce,
        }
    }

    #[test]
    fn prefix_is_deterministic_and_nonce_sensitive() {
        let m = marker(9, 0);
        assert_eq!(stealth_prefix(&m), stealth_prefix(&m));
        let differs = (1..16).any(|n| stealth_prefix(&marker(9, n)) != stealth_prefix(&m));
        assert!(differs);
    }

    #[test]
    fn parse_and_display() {
        let p: BinaryPrefix = "1011".parse().unwrap();
        assert_eq!(p.len(), 4);
        assert_eq!(p.bits(), 0xB000_0000);
        assert_eq!(p.to_string(), "1011");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("10a1".parse::<BinaryPrefix>(), Err(PrefixError::InvalidDigit('a')));
        let long = "1".repeat(33);
        assert!(matches!(long.parse::<BinaryPrefix>(), Err(PrefixError::TooLong { len: 33, .. })));
    }

    #[test]
    fn new_clears_trailing_bits() {
        let p = BinaryPrefix::new(0xFFFF_FFFF, 8).unwrap();
        assert_eq!(p.bits(), 0xFF00_0000);
    }

    #[test]
    fn from_bytes_reads_msb_first() {
        let p = BinaryPrefix::from_bytes(&[0b1010_0000], 3).unwrap();
        assert_eq!(p.to_string(), "101");
        assert!(BinaryPrefix::from_bytes(&[0xFF], 9).is_err());
    }

    #[test]
    fn matches_and_range_agree() {
        let p: BinaryPrefix = "110".parse().unwrap();
        assert_eq!(p.range(), 0xC000_0000..=0xDFFF_FFFF);
        assert!(p.matches(0xC000_0000));
        assert!(p.matches(0xDFFF_FFFF));
        assert!(!p.matches(0xE000_0000));
        assert!(!p.matches(0xBFFF_FFFF));
    }

    #[test]
    fn empty_prefix_matches_everything() {
        assert_eq!(BinaryPrefix::EMPTY.range(), 0..=u32::MAX);
        assert!(BinaryPrefix::EMPTY.matches(12345));
        assert!(BinaryPrefix::EMPTY.is_empty());
    }

    #[test]
    fn full_length_prefix_is_exact() {
        let p = BinaryPrefix::new(0x1234_5678, 32).unwrap();
        assert_eq!(p.range(), 0x1234_5678..=0x1234_5678);
    }
}
