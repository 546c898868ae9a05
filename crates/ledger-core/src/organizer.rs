//! Fork choice and chain reorganization.
//!
//! The [`Organizer`] is the only writer of chain state. For every submitted
//! block it decides whether the block extends the canonical tip, overtakes
//! it from a competing branch, or is merely recorded on a side branch. The
//! resulting canonical-chain swap and all index updates go into one
//! [`ChainBatch`], so readers holding the store's read lock see either the
//! old chain or the new one.
//!
//! Branch weight is cumulative header work. A branch replaces the tip only
//! when it is strictly heavier; on equal work the first-seen chain stays.
//!
//! The plan is computed under the read lock and committed under the write
//! lock. That is sound only because `organize` takes `&mut self`: callers
//! must route every write through a single `Organizer`.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::chain_state::{BlockRecord, ChainBatch, ChainOp, ChainStore};
use crate::error::ChainError;
use crate::index::{connect_block, disconnect_block, IndexView};
use crate::types::{Block, BlockInfo, BlockStatus, Hash256};

/// Phase of the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ReorgState {
    #[default]
    Stable,
    /// Walking a competing branch back to its fork point.
    Evaluating,
    /// Committing a canonical-chain change.
    Swapping,
}

/// How a block enters the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Admission {
    /// Linkage-checked, with fork choice.
    Store,
    /// Trusted bulk load. No linkage check and no fork choice; an
    /// already-stored block is an error.
    Import,
}

/// A change of the canonical chain.
///
/// `added` and `removed` are in ascending height order. `fork_height` and
/// `fork_hash` name the last block both chains share. When genesis itself is
/// connected there is no such block and the fork is reported as height 0
/// with the zero hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reorganization {
    pub fork_height: u64,
    pub fork_hash: Hash256,
    pub added: Vec<Arc<Block>>,
    pub removed: Vec<Arc<Block>>,
}

impl Reorganization {
    /// Height of the new tip.
    pub fn new_height(&self) -> u64 {
        if self.fork_hash.is_zero() && self.fork_height == 0 {
            self.added.len().saturating_sub(1) as u64
        } else {
            self.fork_height + self.added.len() as u64
        }
    }
}

/// Outcome of [`Organizer::organize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Organized {
    pub info: BlockInfo,
    /// Set when the canonical chain changed.
    pub reorganization: Option<Reorganization>,
}

/// What `plan` decided, before anything is written.
enum Plan {
    Unchanged(BlockInfo),
    Commit {
        batch: ChainBatch,
        info: BlockInfo,
        reorganization: Option<Reorganization>,
    },
}

/// A non-canonical branch traced back to its fork point.
struct Branch {
    fork_height: u64,
    fork_hash: Hash256,
    fork_work: u128,
    /// Branch blocks in ascending height order, ending with the new block.
    blocks: Vec<Arc<Block>>,
    chain_work: u128,
}

impl Branch {
    fn tip_height(&self) -> u64 {
        self.fork_height + self.blocks.len() as u64
    }
}

/// Single-writer reorganization coordinator.
#[derive(Debug, Default)]
pub struct Organizer {
    state: ReorgState,
}

impl Organizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase. Outside of `organize` and `rebuild_indexes` this is
    /// always [`ReorgState::Stable`]; transitions are logged at debug level.
    pub fn state(&self) -> ReorgState {
        self.state
    }

    /// Admit `block` and commit whatever chain change it causes.
    ///
    /// On a commit failure nothing is applied and the error is returned.
    pub fn organize<S: ChainStore>(
        &mut self,
        chain: &RwLock<S>,
        block: Block,
        admission: Admission,
    ) -> Result<Organized, ChainError> {
        let block = Arc::new(block);
        let outcome = self.organize_inner(chain, block, admission);
        self.enter(ReorgState::Stable);
        outcome
    }

    fn organize_inner<S: ChainStore>(
        &mut self,
        chain: &RwLock<S>,
        block: Arc<Block>,
        admission: Admission,
    ) -> Result<Organized, ChainError> {
        let plan = {
            let store = chain.read();
            self.plan(&*store, &block, admission)?
        };

        match plan {
            Plan::Unchanged(info) => Ok(Organized { info, reorganization: None }),
            Plan::Commit { batch, info, reorganization } => {
                self.enter(ReorgState::Swapping);
                chain.write().commit(batch)?;

                match &reorganization {
                    Some(reorg) if !reorg.removed.is_empty() => info!(
                        fork_height = reorg.fork_height,
                        added = reorg.added.len(),
                        removed = reorg.removed.len(),
                        height = info.height,
                        "chain reorganized"
                    ),
                    Some(_) => info!(height = info.height, hash = %block.hash(), "block connected"),
                    None => debug!(height = info.height, hash = %block.hash(), "block stored on side branch"),
                }
                Ok(Organized { info, reorganization })
            }
        }
    }

    fn plan<S: ChainStore>(
        &mut self,
        store: &S,
        block: &Arc<Block>,
        admission: Admission,
    ) -> Result<Plan, ChainError> {
        let hash = block.hash();
        let prev = block.header.prev_hash;

        if let Some(record) = store.get_block_record(&hash)? {
            return match admission {
                Admission::Store => Ok(Plan::Unchanged(BlockInfo {
                    status: BlockStatus::Duplicate,
                    height: record.height,
                })),
                Admission::Import => Err(ChainError::DuplicateBlock(hash.to_string())),
            };
        }

        let tip = store.chain_tip()?;

        if prev.is_zero() && tip.is_none() {
            return self.connect_genesis(store, block);
        }

        let parent = if prev.is_zero() { None } else { store.get_block_record(&prev)? };
        let Some(parent) = parent else {
            return match admission {
                Admission::Store => Err(ChainError::InvalidLinkage {
                    block: hash.to_string(),
                    parent: prev.to_string(),
                }),
                Admission::Import => {
                    debug!(%hash, %prev, "importing detached block");
                    Ok(side_branch(block, 0, block.header.work()))
                }
            };
        };

        let height = parent.height + 1;
        let chain_work = parent.chain_work.saturating_add(block.header.work());

        let Some((tip_height, tip_hash)) = tip else {
            return Ok(side_branch(block, height, chain_work));
        };

        if prev == tip_hash {
            return self.extend_tip(store, block, tip_height, tip_hash, chain_work);
        }

        if admission == Admission::Import {
            return Ok(side_branch(block, height, chain_work));
        }

        // Weigh from the fork point: records of blocks imported ahead of
        // their parent carry a detached height and work.
        let Some(branch) = self.trace_branch(store, block)? else {
            debug!(%hash, "branch does not reach the canonical chain");
            return Ok(side_branch(block, height, chain_work));
        };

        let tip_work = store
            .get_block_record(&tip_hash)?
            .map(|record| record.chain_work)
            .ok_or_else(|| ChainError::Storage(format!("missing record for tip {tip_hash}")))?;
        if branch.chain_work <= tip_work {
            return Ok(side_branch(block, branch.tip_height(), branch.chain_work));
        }

        self.reorganize(store, branch, tip_height)
    }

    fn enter(&mut self, state: ReorgState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "organizer state");
            self.state = state;
        }
    }

    fn connect_genesis<S: ChainStore>(
        &mut self,
        store: &S,
        block: &Arc<Block>,
    ) -> Result<Plan, ChainError> {
        let hash = block.hash();
        let mut view = IndexView::new(store);
        let mut batch = ChainBatch::new();
        batch.push(put_block(block, 0, block.header.work()));
        batch.extend(connect_block(&mut view, block, 0)?);
        batch.push(ChainOp::SetTip { height: 0, hash });

        Ok(Plan::Commit {
            batch,
            info: BlockInfo { status: BlockStatus::Confirmed, height: 0 },
            reorganization: Some(Reorganization {
                fork_height: 0,
                fork_hash: Hash256::ZERO,
                added: vec![Arc::clone(block)],
                removed: Vec::new(),
            }),
        })
    }

    fn extend_tip<S: ChainStore>(
        &mut self,
        store: &S,
        block: &Arc<Block>,
        tip_height: u64,
        tip_hash: Hash256,
        chain_work: u128,
    ) -> Result<Plan, ChainError> {
        let height = tip_height + 1;
        let mut view = IndexView::new(store);
        let mut batch = ChainBatch::new();
        batch.push(put_block(block, height, chain_work));
        batch.extend(connect_block(&mut view, block, height)?);
        batch.push(ChainOp::SetTip { height, hash: block.hash() });

        Ok(Plan::Commit {
            batch,
            info: BlockInfo { status: BlockStatus::Confirmed, height },
            reorganization: Some(Reorganization {
                fork_height: tip_height,
                fork_hash: tip_hash,
                added: vec![Arc::clone(block)],
                removed: Vec::new(),
            }),
        })
    }

    /// Walk the branch ending at `block` back to the canonical chain.
    ///
    /// Returns `None` when the walk runs into a missing ancestor.
    fn trace_branch<S: ChainStore>(&mut self, store: &S, block: &Arc<Block>) -> Result<Option<Branch>, ChainError> {
        self.enter(ReorgState::Evaluating);

        let mut blocks = vec![Arc::clone(block)];
        let mut cursor = block.header.prev_hash;
        let (fork_height, fork_hash) = loop {
            if let Some(fork_height) = store.get_canonical_height(&cursor)? {
                break (fork_height, cursor);
            }
            if cursor.is_zero() {
                return Ok(None);
            }
            let Some(ancestor) = store.get_block(&cursor)? else {
                return Ok(None);
            };
            cursor = ancestor.header.prev_hash;
            blocks.push(Arc::new(ancestor));
        };
        blocks.reverse();

        let fork_work = store
            .get_block_record(&fork_hash)?
            .map(|record| record.chain_work)
            .ok_or_else(|| ChainError::Storage(format!("missing record for canonical block {fork_hash}")))?;
        let chain_work = blocks
            .iter()
            .fold(fork_work, |work, block| work.saturating_add(block.header.work()));

        Ok(Some(Branch { fork_height, fork_hash, fork_work, blocks, chain_work }))
    }

    /// Swap the canonical chain over to the heavier `branch`.
    fn reorganize<S: ChainStore>(&mut self, store: &S, branch: Branch, tip_height: u64) -> Result<Plan, ChainError> {
        let height = branch.tip_height();
        let Branch { fork_height, fork_hash, fork_work, blocks: added, .. } = branch;

        let mut removed = Vec::with_capacity((tip_height - fork_height) as usize);
        for removed_height in fork_height + 1..=tip_height {
            let hash = store
                .get_canonical_hash(removed_height)?
                .ok_or_else(|| ChainError::Storage(format!("canonical gap at height {removed_height}")))?;
            let removed_block = store
                .get_block(&hash)?
                .ok_or_else(|| ChainError::Storage(format!("missing body for canonical block {hash}")))?;
            removed.push(Arc::new(removed_block));
        }

        let mut view = IndexView::new(store);
        let mut batch = ChainBatch::new();
        for (offset, old) in removed.iter().enumerate().rev() {
            batch.extend(disconnect_block(&mut view, old, fork_height + 1 + offset as u64)?);
        }
        // Every branch record is rewritten with the height and work it has
        // on the new canonical chain.
        let mut chain_work = fork_work;
        for (offset, new) in added.iter().enumerate() {
            let new_height = fork_height + 1 + offset as u64;
            chain_work = chain_work.saturating_add(new.header.work());
            batch.push(put_block(new, new_height, chain_work));
            batch.extend(connect_block(&mut view, new, new_height)?);
        }
        let tip_hash = added.last().map_or(fork_hash, |block| block.hash());
        batch.push(ChainOp::SetTip { height, hash: tip_hash });

        Ok(Plan::Commit {
            batch,
            info: BlockInfo { status: BlockStatus::Confirmed, height },
            reorganization: Some(Reorganization { fork_height, fork_hash, added, removed }),
        })
    }

    /// Drop every derived index and rebuild it from the canonical chain in
    /// one batch. Returns the number of blocks reindexed.
    pub fn rebuild_indexes<S: ChainStore>(&mut self, chain: &RwLock<S>) -> Result<u64, ChainError> {
        let batch = {
            let store = chain.read();
            let Some((tip_height, _)) = store.chain_tip()? else {
                return Ok(0);
            };

            let mut view = IndexView::cleared(&*store);
            let mut batch = ChainBatch::new();
            batch.push(ChainOp::ClearIndexes);
            for height in 0..=tip_height {
                let hash = store
                    .get_canonical_hash(height)?
                    .ok_or_else(|| ChainError::Storage(format!("canonical gap at height {height}")))?;
                let block = store
                    .get_block(&hash)?
                    .ok_or_else(|| ChainError::Storage(format!("missing body for canonical block {hash}")))?;
                batch.extend(connect_block(&mut view, &Arc::new(block), height)?);
            }
            batch
        };

        self.enter(ReorgState::Swapping);
        let result = chain.write().commit(batch);
        self.enter(ReorgState::Stable);
        result?;

        let blocks = chain.read().chain_tip()?.map_or(0, |(height, _)| height + 1);
        info!(blocks, "indexes rebuilt");
        Ok(blocks)
    }
}

fn put_block(block: &Arc<Block>, height: u64, chain_work: u128) -> ChainOp {
    ChainOp::PutBlock {
        record: BlockRecord { header: block.header.clone(), height, chain_work },
        block: Arc::clone(block),
    }
}

fn side_branch(block: &Arc<Block>, height: u64, chain_work: u128) -> Plan {
    let mut batch = ChainBatch::new();
    batch.push(put_block(block, height, chain_work));
    Plan::Commit {
        batch,
        info: BlockInfo { status: BlockStatus::Orphan, height },
        reorganization: None,
    }
}
