//! Chain storage interface and in-memory implementation.
//!
//! [`ChainStore`] is the backend seam: typed point reads, two indexed range
//! scans, and one atomic [`commit`](ChainStore::commit) of a [`ChainBatch`].
//! Everything above it (index maintenance, fork choice, reorganization) is
//! backend-independent and lives in [`crate::index`] and
//! [`crate::organizer`]. The [`MemoryChainStore`] is suitable for testing;
//! the production node uses RocksDB (ledger-node).
//!
//! A backend must apply a batch completely or not at all.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::error::ChainError;
use crate::history::{HistoryRow, StealthRow};
use crate::types::{Block, BlockHeader, Hash256, InputPoint, OutPoint};

/// Branch bookkeeping for a stored block, canonical or not.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockRecord {
    pub header: BlockHeader,
    /// Height within the block's own branch.
    pub height: u64,
    /// Cumulative work from genesis through this block.
    pub chain_work: u128,
}

/// Location of a canonical transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxPosition {
    pub block_hash: Hash256,
    pub height: u64,
    /// Index of the transaction within its block.
    pub index: u64,
}

/// One input of a connected block whose funding output was resolved.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SpentOutput {
    pub outpoint: OutPoint,
    pub spender: InputPoint,
    /// Address of the funding output.
    pub address: Hash256,
}

/// Undo data for a connected block.
///
/// Records the addresses of the outputs its inputs consumed so the `Spend`
/// history rows can be retracted when the block is disconnected.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockUndo {
    pub spent: Vec<SpentOutput>,
}

/// A single mutation inside a [`ChainBatch`].
#[derive(Clone, Debug)]
pub enum ChainOp {
    PutBlock { record: BlockRecord, block: Arc<Block> },
    PutCanonical { height: u64, hash: Hash256 },
    DeleteCanonical { height: u64, hash: Hash256 },
    SetTip { height: u64, hash: Hash256 },
    PutTxPosition { txid: Hash256, position: TxPosition },
    DeleteTxPosition { txid: Hash256 },
    PutSpend { outpoint: OutPoint, spender: InputPoint },
    DeleteSpend { outpoint: OutPoint },
    PutHistory { address: Hash256, row: HistoryRow },
    DeleteHistory { address: Hash256, row: HistoryRow },
    PutStealth { prefix: u32, height: u64, point: OutPoint, row: StealthRow },
    DeleteStealth { prefix: u32, height: u64, point: OutPoint },
    PutUndo { hash: Hash256, undo: BlockUndo },
    DeleteUndo { hash: Hash256 },
    /// Drop every derived index: transaction positions, spends, history,
    /// stealth rows and undo data. Blocks and the canonical sequence stay.
    ClearIndexes,
}

/// An ordered list of mutations committed atomically.
#[derive(Clone, Debug, Default)]
pub struct ChainBatch {
    ops: Vec<ChainOp>,
}

impl ChainBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: ChainOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = ChainOp>) {
        self.ops.extend(ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[ChainOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<ChainOp> {
        self.ops
    }
}

/// Block store backend.
///
/// Reads never observe a partially applied batch. Thread-safety of the
/// read/commit interleaving is the caller's concern; the service wraps the
/// store in a `RwLock`.
pub trait ChainStore: Send + Sync {
    /// Full block by hash, canonical or not.
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError>;

    /// Branch record by hash, canonical or not.
    fn get_block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError>;

    /// Whether a block with this hash has been stored.
    fn contains_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.get_block_record(hash)?.is_some())
    }

    /// Canonical block hash at a height.
    fn get_canonical_hash(&self, height: u64) -> Result<Option<Hash256>, ChainError>;

    /// Height of a block if it is canonical.
    fn get_canonical_height(&self, hash: &Hash256) -> Result<Option<u64>, ChainError>;

    /// Current canonical tip as `(height, hash)`, `None` while empty.
    fn chain_tip(&self) -> Result<Option<(u64, Hash256)>, ChainError>;

    /// Position of a canonical transaction.
    fn get_tx_position(&self, txid: &Hash256) -> Result<Option<TxPosition>, ChainError>;

    /// Canonical input that spent an outpoint.
    fn get_spend(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>, ChainError>;

    /// Undo data of a connected block.
    fn get_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainError>;

    /// History rows of `address` at or above `from_height`, ascending by
    /// height, at most `limit` rows (`0` means no limit).
    fn scan_history(
        &self,
        address: &Hash256,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<HistoryRow>, ChainError>;

    /// Stealth rows whose prefix lies in `prefixes` and whose height is at
    /// or above `from_height`.
    fn scan_stealth(
        &self,
        prefixes: RangeInclusive<u32>,
        from_height: u64,
    ) -> Result<Vec<StealthRow>, ChainError>;

    /// Apply every operation in `batch`, or none of them.
    fn commit(&mut self, batch: ChainBatch) -> Result<(), ChainError>;

    /// Push buffered writes to durable storage.
    fn flush(&self) -> Result<(), ChainError> {
        Ok(())
    }

    /// Whether no canonical block exists.
    fn is_empty(&self) -> Result<bool, ChainError> {
        Ok(self.chain_tip()?.is_none())
    }
}

/// History index key: address, height, kind, point hash, point index.
type HistoryKey = (Hash256, u64, u8, Hash256, u64);

/// Stealth index key: prefix, height, outpoint.
type StealthKey = (u32, u64, Hash256, u64);

const KIND_OUTPUT: u8 = 0;
const KIND_SPEND: u8 = 1;

fn history_key(address: &Hash256, row: &HistoryRow) -> (HistoryKey, u64) {
    match row {
        HistoryRow::Output { point, height, value } => {
            ((*address, *height, KIND_OUTPUT, point.txid, point.index), *value)
        }
        HistoryRow::Spend { point, height, previous_checksum } => {
            ((*address, *height, KIND_SPEND, point.txid, point.index), *previous_checksum)
        }
    }
}

fn history_row(key: &HistoryKey, payload: u64) -> HistoryRow {
    let (_, height, kind, txid, index) = *key;
    if kind == KIND_OUTPUT {
        HistoryRow::Output {
            point: OutPoint { txid, index },
            height,
            value: payload,
        }
    } else {
        HistoryRow::Spend {
            point: InputPoint { txid, index },
            height,
            previous_checksum: payload,
        }
    }
}

/// In-memory block store for testing.
///
/// Ordered maps stand in for the RocksDB column families so range scans
/// behave the same way. No persistence.
#[derive(Default)]
pub struct MemoryChainStore {
    blocks: HashMap<Hash256, Arc<Block>>,
    records: HashMap<Hash256, BlockRecord>,
    height_to_hash: BTreeMap<u64, Hash256>,
    hash_to_height: HashMap<Hash256, u64>,
    tip: Option<(u64, Hash256)>,
    tx_positions: HashMap<Hash256, TxPosition>,
    spends: HashMap<OutPoint, InputPoint>,
    history: BTreeMap<HistoryKey, u64>,
    stealth: BTreeMap<StealthKey, (Hash256, Hash256)>,
    undo: HashMap<Hash256, BlockUndo>,
    #[cfg(any(test, feature = "testing"))]
    fail_next_commit: bool,
}

impl MemoryChainStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored, canonical or not.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of history rows across all addresses.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Number of stealth rows.
    pub fn stealth_len(&self) -> usize {
        self.stealth.len()
    }

    /// Number of recorded spends.
    pub fn spend_count(&self) -> usize {
        self.spends.len()
    }

    /// Make the next [`commit`](ChainStore::commit) fail without applying anything.
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    fn apply(&mut self, op: ChainOp) {
        match op {
            ChainOp::PutBlock { record, block } => {
                let hash = block.hash();
                self.records.insert(hash, record);
                self.blocks.insert(hash, block);
            }
            ChainOp::PutCanonical { height, hash } => {
                self.height_to_hash.insert(height, hash);
                self.hash_to_height.insert(hash, height);
            }
            ChainOp::DeleteCanonical { height, hash } => {
                self.height_to_hash.remove(&height);
                self.hash_to_height.remove(&hash);
            }
            ChainOp::SetTip { height, hash } => {
                self.tip = Some((height, hash));
            }
            ChainOp::PutTxPosition { txid, position } => {
                self.tx_positions.insert(txid, position);
            }
            ChainOp::DeleteTxPosition { txid } => {
                self.tx_positions.remove(&txid);
            }
            ChainOp::PutSpend { outpoint, spender } => {
                self.spends.insert(outpoint, spender);
            }
            ChainOp::DeleteSpend { outpoint } => {
                self.spends.remove(&outpoint);
            }
            ChainOp::PutHistory { address, row } => {
                let (key, payload) = history_key(&address, &row);
                self.history.insert(key, payload);
            }
            ChainOp::DeleteHistory { address, row } => {
                let (key, _) = history_key(&address, &row);
                self.history.remove(&key);
            }
            ChainOp::PutStealth { prefix, height, point, row } => {
                self.stealth.insert(
                    (prefix, height, point.txid, point.index),
                    (row.ephemeral_key, row.address),
                );
            }
            ChainOp::DeleteStealth { prefix, height, point } => {
                self.stealth.remove(&(prefix, height, point.txid, point.index));
            }
            ChainOp::PutUndo { hash, undo } => {
                self.undo.insert(hash, undo);
            }
            ChainOp::DeleteUndo { hash } => {
                self.undo.remove(&hash);
            }
            ChainOp::ClearIndexes => {
                self.tx_positions.clear();
                self.spends.clear();
                self.history.clear();
                self.stealth.clear();
                self.undo.clear();
            }
        }
    }
}

impl ChainStore for MemoryChainStore {
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.get(hash).map(|block| Block::clone(block)))
    }

    fn get_block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        Ok(self.records.get(hash).cloned())
    }

    fn get_canonical_hash(&self, height: u64) -> Result<Option<Hash256>, ChainError> {
        Ok(self.height_to_hash.get(&height).copied())
    }

    fn get_canonical_height(&self, hash: &Hash256) -> Result<Option<u64>, ChainError> {
        Ok(self.hash_to_height.get(hash).copied())
    }

    fn chain_tip(&self) -> Result<Option<(u64, Hash256)>, ChainError> {
        Ok(self.tip)
    }

    fn get_tx_position(&self, txid: &Hash256) -> Result<Option<TxPosition>, ChainError> {
        Ok(self.tx_positions.get(txid).copied())
    }

    fn get_spend(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>, ChainError> {
        Ok(self.spends.get(outpoint).copied())
    }

    fn get_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainError> {
        Ok(self.undo.get(hash).cloned())
    }

    fn scan_history(
        &self,
        address: &Hash256,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<HistoryRow>, ChainError> {
        let start = (*address, from_height, 0u8, Hash256::ZERO, 0u64);
        let end = (*address, u64::MAX, u8::MAX, Hash256([0xFF; 32]), u64::MAX);
        let rows = self
            .history
            .range(start..=end)
            .map(|(key, payload)| history_row(key, *payload));
        Ok(match limit {
            0 => rows.collect(),
            n => rows.take(n).collect(),
        })
    }

    fn scan_stealth(
        &self,
        prefixes: RangeInclusive<u32>,
        from_height: u64,
    ) -> Result<Vec<StealthRow>, ChainError> {
        let start = (*prefixes.start(), 0u64, Hash256::ZERO, 0u64);
        let end = (*prefixes.end(), u64::MAX, Hash256([0xFF; 32]), u64::MAX);
        Ok(self
            .stealth
            .range(start..=end)
            .filter(|((_, height, _, _), _)| *height >= from_height)
            .map(|((_, _, txid, _), (ephemeral_key, address))| StealthRow {
                ephemeral_key: *ephemeral_key,
                address: *address,
                txid: *txid,
            })
            .collect())
    }

    fn commit(&mut self, batch: ChainBatch) -> Result<(), ChainError> {
        #[cfg(any(test, feature = "testing"))]
        if std::mem::take(&mut self.fail_next_commit) {
            return Err(ChainError::Storage("injected commit failure".into()));
        }

        for op in batch.into_ops() {
            self.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, Transaction};

    fn block(nonce: u64) -> Arc<Block> {
        Arc::new(Block {
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: 1_000,
                difficulty_target: u64::MAX,
                nonce,
            },
            transactions: Vec::<Transaction>::new(),
        })
    }

    fn addr(seed: u8) -> Hash256 {
        Hash256([seed; 32])
    }

    fn out_row(seed: u8, height: u64, value: u64) -> HistoryRow {
        HistoryRow::Output {
            point: OutPoint { txid: Hash256([seed; 32]), index: 0 },
            height,
            value,
        }
    }

    #[test]
    fn empty_store_has_no_tip() {
        let store = MemoryChainStore::new();
        assert!(store.is_empty().unwrap());
        assert!(store.chain_tip().unwrap().is_none());
        assert!(store.get_canonical_hash(0).unwrap().is_none());
    }

    #[test]
    fn commit_applies_block_and_canonical_entries() {
        let mut store = MemoryChainStore::new();
        let b = block(0);
        let hash = b.hash();
        let mut batch = ChainBatch::new();
        batch.push(ChainOp::PutBlock {
            record: BlockRecord { header: b.header.clone(), height: 0, chain_work: 1 },
            block: Arc::clone(&b),
        });
        batch.push(ChainOp::PutCanonical { height: 0, hash });
        batch.push(ChainOp::SetTip { height: 0, hash });
        store.commit(batch).unwrap();

        assert_eq!(store.chain_tip().unwrap(), Some((0, hash)));
        assert_eq!(store.get_canonical_height(&hash).unwrap(), Some(0));
        assert_eq!(store.get_block(&hash).unwrap().as_ref(), Some(b.as_ref()));
        assert!(store.contains_block(&hash).unwrap());
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn injected_failure_applies_nothing() {
        let mut store = MemoryChainStore::new();
        store.fail_next_commit();
        let mut batch = ChainBatch::new();
        batch.push(ChainOp::SetTip { height: 0, hash: addr(1) });
        assert!(matches!(store.commit(batch.clone()), Err(ChainError::Storage(_))));
        assert!(store.chain_tip().unwrap().is_none());

        // The hook is one-shot.
        store.commit(batch).unwrap();
        assert_eq!(store.chain_tip().unwrap(), Some((0, addr(1))));
    }

    #[test]
    fn history_scan_orders_filters_and_limits() {
        let mut store = MemoryChainStore::new();
        let mut batch = ChainBatch::new();
        for (seed, height) in [(3u8, 30u64), (1, 10), (2, 20)] {
            batch.push(ChainOp::PutHistory { address: addr(0xA), row: out_row(seed, height, 5) });
        }
        batch.push(ChainOp::PutHistory { address: addr(0xB), row: out_row(9, 15, 5) });
        store.commit(batch).unwrap();

        let all = store.scan_history(&addr(0xA), 0, 0).unwrap();
        let heights: Vec<u64> = all.iter().map(HistoryRow::height).collect();
        assert_eq!(heights, vec![10, 20, 30]);

        let from = store.scan_history(&addr(0xA), 15, 0).unwrap();
        assert_eq!(from.len(), 2);

        let limited = store.scan_history(&addr(0xA), 0, 1).unwrap();
        assert_eq!(limited, vec![out_row(1, 10, 5)]);
    }

    #[test]
    fn history_delete_removes_exact_row() {
        let mut store = MemoryChainStore::new();
        let row = out_row(1, 10, 5);
        let mut batch = ChainBatch::new();
        batch.push(ChainOp::PutHistory { address: addr(1), row });
        batch.push(ChainOp::DeleteHistory { address: addr(1), row });
        store.commit(batch).unwrap();
        assert_eq!(store.history_len(), 0);
    }

    #[test]
    fn stealth_scan_respects_range_and_height() {
        let mut store = MemoryChainStore::new();
        let row = |seed: u8| StealthRow {
            ephemeral_key: Hash256([seed; 32]),
            address: addr(seed),
            txid: Hash256([seed; 32]),
        };
        let mut batch = ChainBatch::new();
        batch.push(ChainOp::PutStealth {
            prefix: 0x1000_0000,
            height: 5,
            point: OutPoint { txid: Hash256([1; 32]), index: 0 },
            row: row(1),
        });
        batch.push(ChainOp::PutStealth {
            prefix: 0x1FFF_FFFF,
            height: 9,
            point: OutPoint { txid: Hash256([2; 32]), index: 0 },
            row: row(2),
        });
        batch.push(ChainOp::PutStealth {
            prefix: 0x2000_0000,
            height: 9,
            point: OutPoint { txid: Hash256([3; 32]), index: 0 },
            row: row(3),
        });
        store.commit(batch).unwrap();

        let hits = store.scan_stealth(0x1000_0000..=0x1FFF_FFFF, 0).unwrap();
        assert_eq!(hits, vec![row(1), row(2)]);
        let late = store.scan_stealth(0x1000_0000..=0x1FFF_FFFF, 6).unwrap();
        assert_eq!(late, vec![row(2)]);
    }

    #[test]
    fn clear_indexes_keeps_blocks_and_canonical_chain() {
        let mut store = MemoryChainStore::new();
        let b = block(1);
        let hash = b.hash();
        let mut batch = ChainBatch::new();
        batch.push(ChainOp::PutBlock {
            record: BlockRecord { header: b.header.clone(), height: 0, chain_work: 1 },
            block: b,
        });
        batch.push(ChainOp::PutCanonical { height: 0, hash });
        batch.push(ChainOp::SetTip { height: 0, hash });
        batch.push(ChainOp::PutHistory { address: addr(1), row: out_row(1, 0, 5) });
        batch.push(ChainOp::PutSpend {
            outpoint: OutPoint { txid: addr(1), index: 0 },
            spender: InputPoint { txid: addr(2), index: 0 },
        });
        store.commit(batch).unwrap();

        let mut clear = ChainBatch::new();
        clear.push(ChainOp::ClearIndexes);
        store.commit(clear).unwrap();

        assert_eq!(store.history_len(), 0);
        assert_eq!(store.spend_count(), 0);
        assert_eq!(store.chain_tip().unwrap(), Some((0, hash)));
        assert!(store.contains_block(&hash).unwrap());
    }
}
