//! The asynchronous block store service.
//!
//! [`ChainService`] wires a [`ChainStore`] backend, the single-writer
//! [`Organizer`] and the [`SubscriptionRegistry`] into the [`Blockchain`]
//! capability. Storage work never runs on the async executor: every call
//! hops onto the blocking pool, readers share the backend's read lock, and
//! writers queue on the organizer mutex so at most one append or
//! reorganization commits at a time.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use ledger_core::chain_state::ChainStore;
use ledger_core::error::ChainError;
use ledger_core::genesis::genesis_block;
use ledger_core::history::{HistoryRow, StealthRow};
use ledger_core::organizer::{Admission, Organized, Organizer};
use ledger_core::query;
use ledger_core::stealth::BinaryPrefix;
use ledger_core::subscription::{ReorganizeHandler, ReorganizeNotice, SubscriptionRegistry};
use ledger_core::traits::{BlockRef, Blockchain};
use ledger_core::types::{Block, BlockHeader, BlockInfo, BlockLocator, Hash256, InputPoint, OutPoint, Transaction};

use crate::config::NodeConfig;
use crate::storage::RocksStore;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct Inner<S> {
    chain: RwLock<S>,
    organizer: Mutex<Organizer>,
    subscriptions: SubscriptionRegistry,
    state: AtomicU8,
    /// Set after a failed commit; cleared by a restart.
    writes_disabled: AtomicBool,
    seed_genesis: bool,
}

impl<S: ChainStore> Inner<S> {
    fn ensure_running(&self) -> Result<(), ChainError> {
        match self.state.load(Ordering::Acquire) {
            RUNNING => Ok(()),
            _ => Err(ChainError::ServiceStopped),
        }
    }

    /// Run one write under the organizer lock and notify subscribers of any
    /// canonical change before releasing it.
    fn organize(&self, block: Block, admission: Admission) -> Result<BlockInfo, ChainError> {
        let mut organizer = self.organizer.lock();
        // `stop` flips the state before taking this lock.
        self.ensure_running()?;
        if self.writes_disabled.load(Ordering::Acquire) {
            return Err(ChainError::Storage("writes disabled after a storage failure".into()));
        }

        match organizer.organize(&self.chain, block, admission) {
            Ok(Organized { info, reorganization }) => {
                if let Some(reorganization) = reorganization {
                    self.subscriptions.notify(reorganization);
                }
                Ok(info)
            }
            Err(ChainError::Storage(message)) => {
                error!(%message, "commit failed, refusing further writes until restart");
                self.writes_disabled.store(true, Ordering::Release);
                Err(ChainError::Storage(message))
            }
            Err(e) => Err(e),
        }
    }

    fn seed_genesis(&self) -> Result<(), ChainError> {
        if !self.chain.read().is_empty()? {
            return Ok(());
        }
        let info = self.organize(genesis_block(), Admission::Store)?;
        info!(height = info.height, "seeded genesis block");
        Ok(())
    }
}

/// Block store service over a [`ChainStore`] backend.
///
/// Cheap to clone; clones share the same backend and subscriptions.
pub struct ChainService<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for ChainService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ChainService<RocksStore> {
    /// Open the RocksDB store under `config.data_dir`.
    pub fn open(config: &NodeConfig) -> Result<Self, ChainError> {
        let store = RocksStore::open(config.db_path())?;
        Ok(Self::new(store).with_genesis(config.seed_genesis))
    }

    /// Compact every column family.
    pub async fn compact(&self) -> Result<(), ChainError> {
        self.read(|store| store.compact()).await
    }
}

impl<S: ChainStore + 'static> ChainService<S> {
    /// Wrap `store`. The service starts in the created state; call
    /// [`Blockchain::start`] before issuing operations.
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                chain: RwLock::new(store),
                organizer: Mutex::new(Organizer::new()),
                subscriptions: SubscriptionRegistry::new(),
                state: AtomicU8::new(CREATED),
                writes_disabled: AtomicBool::new(false),
                seed_genesis: false,
            }),
        }
    }

    /// Connect the default genesis block on start when the store is empty.
    ///
    /// Only effective before the service is cloned.
    pub fn with_genesis(mut self, seed: bool) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.seed_genesis = seed;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    /// Whether a storage failure has disabled writes.
    pub fn writes_disabled(&self) -> bool {
        self.inner.writes_disabled.load(Ordering::Acquire)
    }

    /// Direct access to the backend. Writes through it bypass the organizer.
    pub fn chain_store(&self) -> &RwLock<S> {
        &self.inner.chain
    }

    /// Drop and rebuild every derived index from the canonical chain.
    pub async fn rebuild_indexes(&self) -> Result<u64, ChainError> {
        self.inner.ensure_running()?;
        let inner = Arc::clone(&self.inner);
        run_blocking(move || {
            let mut organizer = inner.organizer.lock();
            inner.ensure_running()?;
            organizer.rebuild_indexes(&inner.chain)
        })
        .await
    }

    /// Run `f` against a read snapshot on the blocking pool.
    async fn read<T, F>(&self, f: F) -> Result<T, ChainError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, ChainError> + Send + 'static,
    {
        self.inner.ensure_running()?;
        let inner = Arc::clone(&self.inner);
        run_blocking(move || {
            let store = inner.chain.read();
            f(&*store)
        })
        .await
    }

    async fn write(&self, block: Block, admission: Admission) -> Result<BlockInfo, ChainError> {
        self.inner.ensure_running()?;
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.organize(block, admission)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, ChainError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ChainError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChainError::Storage(format!("storage task failed: {e}")))?
}

#[async_trait]
impl<S: ChainStore + 'static> Blockchain for ChainService<S> {
    async fn start(&self) -> bool {
        let inner = &self.inner;
        let started = [CREATED, STOPPED].into_iter().any(|from| {
            inner
                .state
                .compare_exchange(from, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        if !started {
            return false;
        }
        inner.subscriptions.restart();
        inner.writes_disabled.store(false, Ordering::Release);

        if inner.seed_genesis {
            let seeding = Arc::clone(inner);
            if let Err(e) = run_blocking(move || seeding.seed_genesis()).await {
                error!(error = %e, "failed to seed genesis");
                inner.state.store(STOPPED, Ordering::Release);
                inner.subscriptions.stop();
                return false;
            }
        }
        info!("block store service started");
        true
    }

    async fn stop(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let drained = run_blocking(move || {
            // Waits for the in-flight writer, if any.
            let _organizer = inner.organizer.lock();
            if let Err(e) = inner.chain.read().flush() {
                warn!(error = %e, "flush on stop failed");
            }
            inner.subscriptions.stop();
            Ok(())
        })
        .await;
        if let Err(e) = drained {
            warn!(error = %e, "shutdown task failed");
            self.inner.subscriptions.stop();
        }
        info!("block store service stopped");
        true
    }

    async fn store(&self, block: Block) -> Result<BlockInfo, ChainError> {
        self.write(block, Admission::Store).await
    }

    async fn import(&self, block: Block) -> Result<(), ChainError> {
        let info = self.write(block, Admission::Import).await?;
        debug!(height = info.height, status = ?info.status, "imported block");
        Ok(())
    }

    async fn fetch_block_header(&self, block: BlockRef) -> Result<BlockHeader, ChainError> {
        self.read(move |store| query::block_header(store, block)).await
    }

    async fn fetch_block(&self, block: BlockRef) -> Result<Block, ChainError> {
        self.read(move |store| query::block(store, block)).await
    }

    async fn fetch_block_transaction_hashes(&self, hash: Hash256) -> Result<Vec<Hash256>, ChainError> {
        self.read(move |store| query::block_transaction_hashes(store, &hash)).await
    }

    async fn fetch_block_height(&self, hash: Hash256) -> Result<u64, ChainError> {
        self.read(move |store| query::block_height(store, &hash)).await
    }

    async fn fetch_last_height(&self) -> Result<u64, ChainError> {
        self.read(|store| query::last_height(store)).await
    }

    async fn fetch_transaction(&self, txid: Hash256) -> Result<Transaction, ChainError> {
        self.read(move |store| query::transaction(store, &txid)).await
    }

    async fn fetch_transaction_index(&self, txid: Hash256) -> Result<(u64, u64), ChainError> {
        self.read(move |store| query::transaction_index(store, &txid)).await
    }

    async fn fetch_spend(&self, outpoint: OutPoint) -> Result<InputPoint, ChainError> {
        self.read(move |store| query::spend(store, &outpoint)).await
    }

    async fn fetch_history(
        &self,
        address: Hash256,
        limit: usize,
        from_height: u64,
    ) -> Result<Vec<HistoryRow>, ChainError> {
        self.read(move |store| query::history(store, &address, limit, from_height)).await
    }

    async fn fetch_stealth(&self, prefix: BinaryPrefix, from_height: u64) -> Result<Vec<StealthRow>, ChainError> {
        self.read(move |store| query::stealth(store, &prefix, from_height)).await
    }

    async fn fetch_locator_block_hashes(
        &self,
        locator: BlockLocator,
        threshold: Hash256,
        limit: usize,
    ) -> Result<Vec<Hash256>, ChainError> {
        self.read(move |store| query::locator_block_hashes(store, &locator, &threshold, limit))
            .await
    }

    async fn fetch_locator_block_headers(
        &self,
        locator: BlockLocator,
        threshold: Hash256,
        limit: usize,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.read(move |store| query::locator_block_headers(store, &locator, &threshold, limit))
            .await
    }

    fn subscribe_reorganize(&self, handler: ReorganizeHandler) {
        self.inner.subscriptions.subscribe_handler(handler);
    }

    fn subscribe(&self) -> oneshot::Receiver<ReorganizeNotice> {
        self.inner.subscriptions.subscribe()
    }
}
