//! RocksDB-backed persistent block store.
//!
//! Implements [`ChainStore`] using one column family per record kind. Every
//! [`ChainBatch`] is translated into a single [`WriteBatch`], so a commit is
//! atomic on disk and a crash leaves either the old or the new chain.
//!
//! Key layouts (all integers big-endian so byte order is numeric order):
//!
//! | column family  | key                                         | value                    |
//! |----------------|---------------------------------------------|--------------------------|
//! | `blocks`       | block hash                                  | bincode `Block`          |
//! | `headers`      | block hash                                  | bincode `BlockRecord`    |
//! | `height_index` | height                                      | block hash               |
//! | `block_heights`| block hash                                  | height                   |
//! | `tx_index`     | txid                                        | bincode `TxPosition`     |
//! | `spends`       | txid ‖ output index                         | txid ‖ input index       |
//! | `history`      | address ‖ height ‖ kind ‖ txid ‖ index      | value or checksum (LE)   |
//! | `stealth`      | prefix ‖ height ‖ txid ‖ output index       | ephemeral key ‖ address  |
//! | `undo`         | block hash                                  | bincode `BlockUndo`      |
//! | `metadata`     | `tip_height`, `tip_hash`                    |                          |

use std::ops::RangeInclusive;
use std::path::Path;

use rocksdb::{
    ColumnFamilyDescriptor, Direction, IteratorMode, Options, ReadOptions, SliceTransform,
    WriteBatch, DB,
};

use ledger_core::chain_state::{BlockRecord, BlockUndo, ChainBatch, ChainOp, ChainStore, TxPosition};
use ledger_core::error::ChainError;
use ledger_core::history::{HistoryRow, StealthRow};
use ledger_core::types::{Block, Hash256, InputPoint, OutPoint};

// --- Column family names ---

const CF_BLOCKS: &str = "blocks";
const CF_HEADERS: &str = "headers";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_BLOCK_HEIGHTS: &str = "block_heights";
const CF_TX_INDEX: &str = "tx_index";
const CF_SPENDS: &str = "spends";
const CF_HISTORY: &str = "history";
const CF_STEALTH: &str = "stealth";
const CF_UNDO: &str = "undo";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_BLOCKS,
    CF_HEADERS,
    CF_HEIGHT_INDEX,
    CF_BLOCK_HEIGHTS,
    CF_TX_INDEX,
    CF_SPENDS,
    CF_HISTORY,
    CF_STEALTH,
    CF_UNDO,
    CF_METADATA,
];

/// Column families holding derived indexes, emptied by `ClearIndexes`.
const INDEX_CFS: &[&str] = &[CF_TX_INDEX, CF_SPENDS, CF_HISTORY, CF_STEALTH, CF_UNDO];

// --- Metadata keys ---

const META_TIP_HEIGHT: &[u8] = b"tip_height";
const META_TIP_HASH: &[u8] = b"tip_hash";

const HISTORY_KEY_LEN: usize = 32 + 8 + 1 + 32 + 8;
const STEALTH_KEY_LEN: usize = 4 + 8 + 32 + 8;

const KIND_OUTPUT: u8 = 0;
const KIND_SPEND: u8 = 1;

fn db_err(e: impl ToString) -> ChainError {
    ChainError::Storage(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, ChainError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(db_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, ChainError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard()).map_err(db_err)?;
    Ok(value)
}

fn read_hash(bytes: &[u8]) -> Result<Hash256, ChainError> {
    Hash256::from_slice(bytes).ok_or_else(|| ChainError::Storage("invalid hash length".into()))
}

fn read_u64_be(bytes: &[u8]) -> Result<u64, ChainError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::Storage("invalid integer length".into()))?;
    Ok(u64::from_be_bytes(array))
}

/// Encode a point as `txid || index(BE)`.
fn point_key(txid: &Hash256, index: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(txid.as_bytes());
    key[32..].copy_from_slice(&index.to_be_bytes());
    key
}

fn history_key(address: &Hash256, row: &HistoryRow) -> ([u8; HISTORY_KEY_LEN], u64) {
    let (height, kind, txid, index, payload) = match row {
        HistoryRow::Output { point, height, value } => (*height, KIND_OUTPUT, point.txid, point.index, *value),
        HistoryRow::Spend { point, height, previous_checksum } => {
            (*height, KIND_SPEND, point.txid, point.index, *previous_checksum)
        }
    };
    let mut key = [0u8; HISTORY_KEY_LEN];
    key[..32].copy_from_slice(address.as_bytes());
    key[32..40].copy_from_slice(&height.to_be_bytes());
    key[40] = kind;
    key[41..81].copy_from_slice(&point_key(&txid, index));
    (key, payload)
}

fn decode_history(key: &[u8], value: &[u8]) -> Result<HistoryRow, ChainError> {
    if key.len() != HISTORY_KEY_LEN || value.len() != 8 {
        return Err(ChainError::Storage("malformed history entry".into()));
    }
    let height = read_u64_be(&key[32..40])?;
    let txid = read_hash(&key[41..73])?;
    let index = read_u64_be(&key[73..81])?;
    let mut payload = [0u8; 8];
    payload.copy_from_slice(value);
    let payload = u64::from_le_bytes(payload);
    match key[40] {
        KIND_OUTPUT => Ok(HistoryRow::Output {
            point: OutPoint { txid, index },
            height,
            value: payload,
        }),
        KIND_SPEND => Ok(HistoryRow::Spend {
            point: InputPoint { txid, index },
            height,
            previous_checksum: payload,
        }),
        other => Err(ChainError::Storage(format!("unknown history kind {other}"))),
    }
}

fn stealth_key(prefix: u32, height: u64, point: &OutPoint) -> [u8; STEALTH_KEY_LEN] {
    let mut key = [0u8; STEALTH_KEY_LEN];
    key[..4].copy_from_slice(&prefix.to_be_bytes());
    key[4..12].copy_from_slice(&height.to_be_bytes());
    key[12..52].copy_from_slice(&point_key(&point.txid, point.index));
    key
}

/// RocksDB-backed persistent block store.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist. An empty database
    /// stays empty; seeding genesis is the service's job.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // History is always scanned per address.
                if *name == CF_HISTORY {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(db_err)?;
        tracing::debug!(path = %path.as_ref().display(), "opened block store");
        Ok(Self { db })
    }

    /// Trigger manual compaction across all column families.
    ///
    /// Reclaims space from index entries deleted by reorganizations and
    /// rebuilds.
    pub fn compact(&self) -> Result<(), ChainError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    /// Number of stored blocks, canonical or not.
    pub fn block_count(&self) -> Result<u64, ChainError> {
        let cf = self.cf_handle(CF_HEADERS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(db_err)?;
            count += 1;
        }
        Ok(count)
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ChainError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Storage(format!("missing column family: {name}")))
    }

    fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let cf = self.cf_handle(cf_name)?;
        self.db.get_cf(cf, key).map_err(db_err)
    }

    /// Queue deletion of every key in the derived index column families.
    fn clear_indexes(&self, batch: &mut WriteBatch) -> Result<(), ChainError> {
        for cf_name in INDEX_CFS {
            let cf = self.cf_handle(cf_name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item.map_err(db_err)?;
                batch.delete_cf(cf, key);
            }
        }
        Ok(())
    }

    fn write_op(&self, batch: &mut WriteBatch, op: ChainOp) -> Result<(), ChainError> {
        match op {
            ChainOp::PutBlock { record, block } => {
                let hash = block.hash();
                batch.put_cf(self.cf_handle(CF_BLOCKS)?, hash.as_bytes(), encode(&*block)?);
                batch.put_cf(self.cf_handle(CF_HEADERS)?, hash.as_bytes(), encode(&record)?);
            }
            ChainOp::PutCanonical { height, hash } => {
                batch.put_cf(self.cf_handle(CF_HEIGHT_INDEX)?, height.to_be_bytes(), hash.as_bytes());
                batch.put_cf(self.cf_handle(CF_BLOCK_HEIGHTS)?, hash.as_bytes(), height.to_be_bytes());
            }
            ChainOp::DeleteCanonical { height, hash } => {
                batch.delete_cf(self.cf_handle(CF_HEIGHT_INDEX)?, height.to_be_bytes());
                batch.delete_cf(self.cf_handle(CF_BLOCK_HEIGHTS)?, hash.as_bytes());
            }
            ChainOp::SetTip { height, hash } => {
                let cf = self.cf_handle(CF_METADATA)?;
                batch.put_cf(cf, META_TIP_HEIGHT, height.to_be_bytes());
                batch.put_cf(cf, META_TIP_HASH, hash.as_bytes());
            }
            ChainOp::PutTxPosition { txid, position } => {
                batch.put_cf(self.cf_handle(CF_TX_INDEX)?, txid.as_bytes(), encode(&position)?);
            }
            ChainOp::DeleteTxPosition { txid } => {
                batch.delete_cf(self.cf_handle(CF_TX_INDEX)?, txid.as_bytes());
            }
            ChainOp::PutSpend { outpoint, spender } => {
                batch.put_cf(
                    self.cf_handle(CF_SPENDS)?,
                    point_key(&outpoint.txid, outpoint.index),
                    point_key(&spender.txid, spender.index),
                );
            }
            ChainOp::DeleteSpend { outpoint } => {
                batch.delete_cf(self.cf_handle(CF_SPENDS)?, point_key(&outpoint.txid, outpoint.index));
            }
            ChainOp::PutHistory { address, row } => {
                let (key, payload) = history_key(&address, &row);
                batch.put_cf(self.cf_handle(CF_HISTORY)?, key, payload.to_le_bytes());
            }
            ChainOp::DeleteHistory { address, row } => {
                let (key, _) = history_key(&address, &row);
                batch.delete_cf(self.cf_handle(CF_HISTORY)?, key);
            }
            ChainOp::PutStealth { prefix, height, point, row } => {
                let mut value = [0u8; 64];
                value[..32].copy_from_slice(row.ephemeral_key.as_bytes());
                value[32..].copy_from_slice(row.address.as_bytes());
                batch.put_cf(self.cf_handle(CF_STEALTH)?, stealth_key(prefix, height, &point), value);
            }
            ChainOp::DeleteStealth { prefix, height, point } => {
                batch.delete_cf(self.cf_handle(CF_STEALTH)?, stealth_key(prefix, height, &point));
            }
            ChainOp::PutUndo { hash, undo } => {
                batch.put_cf(self.cf_handle(CF_UNDO)?, hash.as_bytes(), encode(&undo)?);
            }
            ChainOp::DeleteUndo { hash } => {
                batch.delete_cf(self.cf_handle(CF_UNDO)?, hash.as_bytes());
            }
            ChainOp::ClearIndexes => self.clear_indexes(batch)?,
        }
        Ok(())
    }
}

impl ChainStore for RocksStore {
    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.get(CF_BLOCKS, hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn get_block_record(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        self.get(CF_HEADERS, hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn get_canonical_hash(&self, height: u64) -> Result<Option<Hash256>, ChainError> {
        self.get(CF_HEIGHT_INDEX, &height.to_be_bytes())?
            .map(|bytes| read_hash(&bytes))
            .transpose()
    }

    fn get_canonical_height(&self, hash: &Hash256) -> Result<Option<u64>, ChainError> {
        self.get(CF_BLOCK_HEIGHTS, hash.as_bytes())?
            .map(|bytes| read_u64_be(&bytes))
            .transpose()
    }

    fn chain_tip(&self) -> Result<Option<(u64, Hash256)>, ChainError> {
        let Some(hash) = self.get(CF_METADATA, META_TIP_HASH)? else {
            return Ok(None);
        };
        let height = self
            .get(CF_METADATA, META_TIP_HEIGHT)?
            .ok_or_else(|| ChainError::Storage("tip hash without tip height".into()))?;
        Ok(Some((read_u64_be(&height)?, read_hash(&hash)?)))
    }

    fn get_tx_position(&self, txid: &Hash256) -> Result<Option<TxPosition>, ChainError> {
        self.get(CF_TX_INDEX, txid.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn get_spend(&self, outpoint: &OutPoint) -> Result<Option<InputPoint>, ChainError> {
        let Some(bytes) = self.get(CF_SPENDS, &point_key(&outpoint.txid, outpoint.index))? else {
            return Ok(None);
        };
        if bytes.len() != 40 {
            return Err(ChainError::Storage("malformed spend entry".into()));
        }
        Ok(Some(InputPoint {
            txid: read_hash(&bytes[..32])?,
            index: read_u64_be(&bytes[32..])?,
        }))
    }

    fn get_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainError> {
        self.get(CF_UNDO, hash.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn scan_history(
        &self,
        address: &Hash256,
        from_height: u64,
        limit: usize,
    ) -> Result<Vec<HistoryRow>, ChainError> {
        let cf = self.cf_handle(CF_HISTORY)?;
        let mut start = [0u8; 40];
        start[..32].copy_from_slice(address.as_bytes());
        start[32..].copy_from_slice(&from_height.to_be_bytes());

        let mut read_opts = ReadOptions::default();
        read_opts.set_prefix_same_as_start(true);
        let iter = self
            .db
            .iterator_cf_opt(cf, read_opts, IteratorMode::From(&start, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            if limit != 0 && rows.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(db_err)?;
            // Stop once the iterator leaves this address.
            if key.len() < 32 || &key[..32] != address.as_bytes() {
                break;
            }
            rows.push(decode_history(&key, &value)?);
        }
        Ok(rows)
    }

    fn scan_stealth(
        &self,
        prefixes: RangeInclusive<u32>,
        from_height: u64,
    ) -> Result<Vec<StealthRow>, ChainError> {
        let cf = self.cf_handle(CF_STEALTH)?;
        let start = prefixes.start().to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(db_err)?;
            if key.len() != STEALTH_KEY_LEN || value.len() != 64 {
                return Err(ChainError::Storage("malformed stealth entry".into()));
            }
            let prefix = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
            if prefix > *prefixes.end() {
                break;
            }
            if read_u64_be(&key[4..12])? < from_height {
                continue;
            }
            rows.push(StealthRow {
                ephemeral_key: read_hash(&value[..32])?,
                address: read_hash(&value[32..])?,
                txid: read_hash(&key[12..44])?,
            });
        }
        Ok(rows)
    }

    fn commit(&mut self, batch: ChainBatch) -> Result<(), ChainError> {
        let ops = batch.len();
        let mut write = WriteBatch::default();
        for op in batch.into_ops() {
            self.write_op(&mut write, op)?;
        }
        self.db.write(write).map_err(db_err)?;
        tracing::trace!(ops, "committed chain batch");
        Ok(())
    }

    /// Flush all in-memory buffers to disk.
    fn flush(&self) -> Result<(), ChainError> {
        self.db.flush().map_err(db_err)
    }
}
