//! The asynchronous capability surface of a block store service.
//!
//! [`Blockchain`] is what consumers (indexers, wallets, RPC front-ends) hold.
//! Every call completes exactly once with a `Result`; errors never escape
//! as panics across the async boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ChainError;
use crate::history::{HistoryRow, StealthRow};
use crate::stealth::BinaryPrefix;
use crate::subscription::{ReorganizeHandler, ReorganizeNotice};
use crate::types::{Block, BlockHeader, BlockInfo, BlockLocator, Hash256, InputPoint, OutPoint, Transaction};

/// A canonical block addressed by height or by hash.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Height(u64),
    Hash(Hash256),
}

impl From<u64> for BlockRef {
    fn from(height: u64) -> Self {
        Self::Height(height)
    }
}

impl From<Hash256> for BlockRef {
    fn from(hash: Hash256) -> Self {
        Self::Hash(hash)
    }
}

/// Block storage, indexing and change notification.
#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Start serving. Returns `false` if already running.
    async fn start(&self) -> bool;

    /// Drain the in-flight write, flush, and fire `ServiceStopped` to every
    /// pending subscription. Returns `false` if not running.
    async fn stop(&self) -> bool;

    /// Append a block with linkage checks and fork choice.
    async fn store(&self, block: Block) -> Result<BlockInfo, ChainError>;

    /// Append a trusted block without linkage checks or fork choice.
    async fn import(&self, block: Block) -> Result<(), ChainError>;

    async fn fetch_block_header(&self, block: BlockRef) -> Result<BlockHeader, ChainError>;

    async fn fetch_block(&self, block: BlockRef) -> Result<Block, ChainError>;

    async fn fetch_block_transaction_hashes(&self, hash: Hash256) -> Result<Vec<Hash256>, ChainError>;

    async fn fetch_block_height(&self, hash: Hash256) -> Result<u64, ChainError>;

    async fn fetch_last_height(&self) -> Result<u64, ChainError>;

    async fn fetch_transaction(&self, txid: Hash256) -> Result<Transaction, ChainError>;

    /// `(height, index within block)`.
    async fn fetch_transaction_index(&self, txid: Hash256) -> Result<(u64, u64), ChainError>;

    /// The input that spent `outpoint`, `NotFound` while unspent.
    async fn fetch_spend(&self, outpoint: OutPoint) -> Result<InputPoint, ChainError>;

    /// History rows ascending by height. `limit == 0` means no limit.
    async fn fetch_history(
        &self,
        address: Hash256,
        limit: usize,
        from_height: u64,
    ) -> Result<Vec<HistoryRow>, ChainError>;

    async fn fetch_stealth(&self, prefix: BinaryPrefix, from_height: u64) -> Result<Vec<StealthRow>, ChainError>;

    /// Canonical hashes following the first known locator hash, above
    /// `threshold` (zero for none), through the stop hash, at most `limit`
    /// (`0` for no limit).
    async fn fetch_locator_block_hashes(
        &self,
        locator: BlockLocator,
        threshold: Hash256,
        limit: usize,
    ) -> Result<Vec<Hash256>, ChainError>;

    /// Header form of [`fetch_locator_block_hashes`](Self::fetch_locator_block_hashes).
    async fn fetch_locator_block_headers(
        &self,
        locator: BlockLocator,
        threshold: Hash256,
        limit: usize,
    ) -> Result<Vec<BlockHeader>, ChainError>;

    /// Register `handler` for the next reorganization or shutdown.
    fn subscribe_reorganize(&self, handler: ReorganizeHandler);

    /// Channel form of [`subscribe_reorganize`](Self::subscribe_reorganize).
    fn subscribe(&self) -> oneshot::Receiver<ReorganizeNotice>;
}
