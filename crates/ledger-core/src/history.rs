//! Address history and stealth rows, and the consumer-side helpers that
//! pair spends with their funding outputs.

use serde::{Deserialize, Serialize};

use crate::checksum::checksum;
use crate::types::{Hash256, InputPoint, OutPoint};

/// One received or spent event for an address.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum HistoryRow {
    /// Value received at `point`.
    Output {
        point: OutPoint,
        height: u64,
        value: u64,
    },
    /// A spend of one of the address's outputs by `point`.
    ///
    /// `previous_checksum` equals [`checksum`] of the funding outpoint.
    Spend {
        point: InputPoint,
        height: u64,
        previous_checksum: u64,
    },
}

impl HistoryRow {
    /// Height of the block containing the event.
    pub fn height(&self) -> u64 {
        match self {
            Self::Output { height, .. } | Self::Spend { height, .. } => *height,
        }
    }

    /// Whether this spend row plausibly consumed `output`: the checksums
    /// match and the spend is not older than the output.
    pub fn spends(&self, output: &HistoryRow) -> bool {
        match (self, output) {
            (
                Self::Spend { height: spend_height, previous_checksum, .. },
                Self::Output { point, height: output_height, .. },
            ) => *previous_checksum == checksum(point) && spend_height >= output_height,
            _ => false,
        }
    }
}

/// A candidate stealth payment.
///
/// False positives are expected; the recipient filters them with its scan key.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct StealthRow {
    /// Ephemeral public key without its sign byte.
    pub ephemeral_key: Hash256,
    /// Public-key hash of the paid output.
    pub address: Hash256,
    /// Transaction carrying the payment.
    pub txid: Hash256,
}

/// Find the spend row, if any, that consumed `output`.
pub fn find_spend<'a>(rows: &'a [HistoryRow], output: &HistoryRow) -> Option<&'a HistoryRow> {
    rows.iter().find(|row| row.spends(output))
}

/// Sum of all `Output` values in `rows` that no `Spend` row in `rows` consumes.
pub fn balance(rows: &[HistoryRow]) -> u64 {
    rows.iter()
        .filter_map(|row| match row {
            HistoryRow::Output { value, .. } if find_spend(rows, row).is_none() => Some(*value),
            _ => None,
        })
        .fold(0u64, u64::saturating_add)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(byte: u8, index: u64, height: u64, value: u64) -> HistoryRow {
        HistoryRow::Output {
            point: OutPoint { txid: Hash256([byte; 32]), index },
            height,
            value,
        }
    }

    fn spend_of(row: &HistoryRow, height: u64) -> HistoryRow {
        let HistoryRow::Output { point, .. } = row else {
            panic!("not an output row");
        };
        HistoryRow::Spend {
            point: InputPoint { txid: Hash256([0xEE; 32]), index: 0 },
            height,
            previous_checksum: checksum(point),
        }
    }

    #[test]
    fn spend_matches_its_output() {
        let out = output(1, 0, 10, 500);
        let spend = spend_of(&out, 20);
        assert!(spend.spends(&out));
        assert!(!out.spends(&spend));
        assert_eq!(spend.height(), 20);
    }

    #[test]
    fn spend_below_output_height_is_rejected() {
        let out = output(1, 0, 10, 500);
        let spend = spend_of(&out, 9);
        assert!(!spend.spends(&out));
    }

    #[test]
    fn balance_counts_unspent_only() {
        let a = output(1, 0, 10, 500);
        let b = output(2, 1, 11, 70);
        let rows = vec![a, b, spend_of(&a, 20)];
        assert_eq!(balance(&rows), 70);
        assert_eq!(find_spend(&rows, &a), Some(&rows[2]));
        assert_eq!(find_spend(&rows, &b), None);
    }

    #[test]
    fn balance_of_empty_history_is_zero() {
        assert_eq!(balance(&[]), 0);
    }
}
