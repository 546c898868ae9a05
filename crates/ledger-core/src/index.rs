//! Secondary index maintenance.
//!
//! Connecting a block to the canonical chain produces the operations that
//! insert its transaction positions, spends, address history and stealth
//! rows. Disconnecting produces the exact inverse. Both only emit
//! [`ChainOp`]s; the caller commits them in one batch together with the
//! canonical-chain changes.
//!
//! Funding outputs are resolved through an [`IndexView`], which layers the
//! pending batch over the committed store so a spend can reference an
//! output created earlier in the same block or in an earlier block of the
//! same reorganization.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::chain_state::{BlockUndo, ChainOp, ChainStore, SpentOutput, TxPosition};
use crate::checksum::checksum;
use crate::error::ChainError;
use crate::history::{HistoryRow, StealthRow};
use crate::stealth::stealth_prefix;
use crate::types::{Block, Hash256, InputPoint, OutPoint, TxOutput};

/// The committed store plus the effect of the batch being assembled.
pub struct IndexView<'a, S: ChainStore + ?Sized> {
    store: &'a S,
    /// Transactions connected in this batch: txid -> (block, tx index).
    added: HashMap<Hash256, (Arc<Block>, usize)>,
    /// Transactions disconnected in this batch.
    removed: HashSet<Hash256>,
    /// The batch starts with `ClearIndexes`; committed positions are void.
    cleared: bool,
    blocks: HashMap<Hash256, Arc<Block>>,
}

impl<'a, S: ChainStore + ?Sized> IndexView<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            added: HashMap::new(),
            removed: HashSet::new(),
            cleared: false,
            blocks: HashMap::new(),
        }
    }

    /// A view for a batch that begins by clearing every index.
    pub fn cleared(store: &'a S) -> Self {
        Self {
            cleared: true,
            ..Self::new(store)
        }
    }

    pub fn store(&self) -> &'a S {
        self.store
    }

    /// Resolve the output an outpoint refers to, as it will be once the
    /// pending batch commits. `None` when the funding transaction is not
    /// canonical.
    pub fn funding_output(&mut self, point: &OutPoint) -> Result<Option<TxOutput>, ChainError> {
        let Ok(output_index) = usize::try_from(point.index) else {
            return Ok(None);
        };

        if let Some((block, tx_index)) = self.added.get(&point.txid) {
            return Ok(block.transactions[*tx_index].outputs.get(output_index).cloned());
        }
        if self.cleared || self.removed.contains(&point.txid) {
            return Ok(None);
        }

        let Some(position) = self.store.get_tx_position(&point.txid)? else {
            return Ok(None);
        };
        let block = match self.blocks.get(&position.block_hash) {
            Some(block) => Arc::clone(block),
            None => {
                let Some(block) = self.store.get_block(&position.block_hash)? else {
                    return Ok(None);
                };
                let block = Arc::new(block);
                self.blocks.insert(position.block_hash, Arc::clone(&block));
                block
            }
        };
        let Ok(tx_index) = usize::try_from(position.index) else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .get(tx_index)
            .and_then(|tx| tx.outputs.get(output_index))
            .cloned())
    }
}

/// Operations that make `block` canonical at `height`, excluding the tip
/// marker and the block body.
pub fn connect_block<S: ChainStore + ?Sized>(
    view: &mut IndexView<'_, S>,
    block: &Arc<Block>,
    height: u64,
) -> Result<Vec<ChainOp>, ChainError> {
    let hash = block.hash();
    let mut ops = vec![ChainOp::PutCanonical { height, hash }];
    let mut undo = BlockUndo::default();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        ops.push(ChainOp::PutTxPosition {
            txid,
            position: TxPosition {
                block_hash: hash,
                height,
                index: tx_index as u64,
            },
        });

        for (output_index, output) in tx.outputs.iter().enumerate() {
            let point = OutPoint { txid, index: output_index as u64 };
            ops.push(ChainOp::PutHistory {
                address: output.pubkey_hash,
                row: HistoryRow::Output { point, height, value: output.value },
            });
            if let Some(marker) = &output.stealth {
                ops.push(ChainOp::PutStealth {
                    prefix: stealth_prefix(marker),
                    height,
                    point,
                    row: StealthRow {
                        ephemeral_key: marker.ephemeral_key,
                        address: output.pubkey_hash,
                        txid,
                    },
                });
            }
        }

        if !tx.is_coinbase() {
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let outpoint = input.previous_output;
                if outpoint.is_null() {
                    continue;
                }
                let spender = InputPoint { txid, index: input_index as u64 };
                ops.push(ChainOp::PutSpend { outpoint, spender });

                match view.funding_output(&outpoint)? {
                    Some(funding) => {
                        ops.push(ChainOp::PutHistory {
                            address: funding.pubkey_hash,
                            row: HistoryRow::Spend {
                                point: spender,
                                height,
                                previous_checksum: checksum(&outpoint),
                            },
                        });
                        undo.spent.push(SpentOutput {
                            outpoint,
                            spender,
                            address: funding.pubkey_hash,
                        });
                    }
                    None => debug!(%outpoint, %spender, "funding output not canonical, no spend history row"),
                }
            }
        }

        view.removed.remove(&txid);
        view.added.insert(txid, (Arc::clone(block), tx_index));
    }

    ops.push(ChainOp::PutUndo { hash, undo });
    Ok(ops)
}

/// Operations that retract canonical `block` at `height`.
///
/// Reads the block's undo record from the committed store. Entries that a
/// later block has overwritten (a repeated txid or a conflicting spend) are
/// left alone.
pub fn disconnect_block<S: ChainStore + ?Sized>(
    view: &mut IndexView<'_, S>,
    block: &Block,
    height: u64,
) -> Result<Vec<ChainOp>, ChainError> {
    let store = view.store();
    let hash = block.hash();
    let mut ops = vec![ChainOp::DeleteCanonical { height, hash }];

    let undo = store.get_undo(&hash)?.unwrap_or_else(|| {
        debug!(%hash, height, "no undo record for disconnected block");
        BlockUndo::default()
    });
    for spent in &undo.spent {
        ops.push(ChainOp::DeleteHistory {
            address: spent.address,
            row: HistoryRow::Spend {
                point: spent.spender,
                height,
                previous_checksum: checksum(&spent.outpoint),
            },
        });
    }

    for tx in block.transactions.iter().rev() {
        let txid = tx.txid();

        let position = store.get_tx_position(&txid)?;
        if position.is_some_and(|position| position.block_hash == hash) {
            ops.push(ChainOp::DeleteTxPosition { txid });
        }

        for (output_index, output) in tx.outputs.iter().enumerate() {
            let point = OutPoint { txid, index: output_index as u64 };
            ops.push(ChainOp::DeleteHistory {
                address: output.pubkey_hash,
                row: HistoryRow::Output { point, height, value: output.value },
            });
            if let Some(marker) = &output.stealth {
                ops.push(ChainOp::DeleteStealth {
                    prefix: stealth_prefix(marker),
                    height,
                    point,
                });
            }
        }

        if !tx.is_coinbase() {
            for (input_index, input) in tx.inputs.iter().enumerate() {
                let outpoint = input.previous_output;
                if outpoint.is_null() {
                    continue;
                }
                let spender = InputPoint { txid, index: input_index as u64 };
                if store.get_spend(&outpoint)? == Some(spender) {
                    ops.push(ChainOp::DeleteSpend { outpoint });
                }
            }
        }

        view.removed.insert(txid);
    }

    ops.push(ChainOp::DeleteUndo { hash });
    Ok(ops)
}
