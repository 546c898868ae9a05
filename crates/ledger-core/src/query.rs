//! Read-side lookups over a [`ChainStore`] snapshot.
//!
//! Each function answers one fetch of the external interface and turns a
//! missing record into [`ChainError::NotFound`]. Hash-keyed lookups only
//! answer for canonical blocks and transactions, so a header lookup and a
//! height lookup for the same hash always agree. Callers pass a single
//! read guard to keep a multi-step lookup on one snapshot.

use std::ops::Range;

use crate::chain_state::ChainStore;
use crate::error::ChainError;
use crate::history::{HistoryRow, StealthRow};
use crate::stealth::BinaryPrefix;
use crate::traits::BlockRef;
use crate::types::{Block, BlockHeader, BlockLocator, Hash256, InputPoint, OutPoint, Transaction};

/// Canonical `(height, hash)` for a block reference.
pub fn resolve<S: ChainStore + ?Sized>(store: &S, block: BlockRef) -> Result<(u64, Hash256), ChainError> {
    match block {
        BlockRef::Height(height) => store
            .get_canonical_hash(height)?
            .map(|hash| (height, hash))
            .ok_or_else(|| ChainError::not_found(format_args!("block at height {height}"))),
        BlockRef::Hash(hash) => store
            .get_canonical_height(&hash)?
            .map(|height| (height, hash))
            .ok_or_else(|| ChainError::not_found(format_args!("block {hash}"))),
    }
}

pub fn block<S: ChainStore + ?Sized>(store: &S, block: BlockRef) -> Result<Block, ChainError> {
    let (_, hash) = resolve(store, block)?;
    store
        .get_block(&hash)?
        .ok_or_else(|| ChainError::Storage(format!("missing body for canonical block {hash}")))
}

pub fn block_header<S: ChainStore + ?Sized>(store: &S, block: BlockRef) -> Result<BlockHeader, ChainError> {
    let (_, hash) = resolve(store, block)?;
    store
        .get_block_record(&hash)?
        .map(|record| record.header)
        .ok_or_else(|| ChainError::Storage(format!("missing record for canonical block {hash}")))
}

pub fn block_transaction_hashes<S: ChainStore + ?Sized>(
    store: &S,
    hash: &Hash256,
) -> Result<Vec<Hash256>, ChainError> {
    Ok(block(store, BlockRef::Hash(*hash))?.txids())
}

pub fn block_height<S: ChainStore + ?Sized>(store: &S, hash: &Hash256) -> Result<u64, ChainError> {
    store
        .get_canonical_height(hash)?
        .ok_or_else(|| ChainError::not_found(format_args!("block {hash}")))
}

pub fn last_height<S: ChainStore + ?Sized>(store: &S) -> Result<u64, ChainError> {
    store
        .chain_tip()?
        .map(|(height, _)| height)
        .ok_or_else(|| ChainError::not_found("chain tip"))
}

pub fn transaction<S: ChainStore + ?Sized>(store: &S, txid: &Hash256) -> Result<Transaction, ChainError> {
    let position = store
        .get_tx_position(txid)?
        .ok_or_else(|| ChainError::not_found(format_args!("transaction {txid}")))?;
    let block = store
        .get_block(&position.block_hash)?
        .ok_or_else(|| ChainError::Storage(format!("missing body for block {}", position.block_hash)))?;
    usize::try_from(position.index)
        .ok()
        .and_then(|index| block.transactions.into_iter().nth(index))
        .ok_or_else(|| ChainError::Storage(format!("transaction index out of range for {txid}")))
}

/// `(height, index within block)` of a canonical transaction.
pub fn transaction_index<S: ChainStore + ?Sized>(store: &S, txid: &Hash256) -> Result<(u64, u64), ChainError> {
    store
        .get_tx_position(txid)?
        .map(|position| (position.height, position.index))
        .ok_or_else(|| ChainError::not_found(format_args!("transaction {txid}")))
}

pub fn spend<S: ChainStore + ?Sized>(store: &S, outpoint: &OutPoint) -> Result<InputPoint, ChainError> {
    store
        .get_spend(outpoint)?
        .ok_or_else(|| ChainError::not_found(format_args!("spend of {outpoint}")))
}

/// Rows for `address` at or above `from_height`; `limit == 0` means no limit.
///
/// An address without history yields an empty list, not `NotFound`.
pub fn history<S: ChainStore + ?Sized>(
    store: &S,
    address: &Hash256,
    limit: usize,
    from_height: u64,
) -> Result<Vec<HistoryRow>, ChainError> {
    store.scan_history(address, from_height, limit)
}

pub fn stealth<S: ChainStore + ?Sized>(
    store: &S,
    prefix: &BinaryPrefix,
    from_height: u64,
) -> Result<Vec<StealthRow>, ChainError> {
    store.scan_stealth(prefix.range(), from_height)
}

/// Canonical heights answering a locator request.
///
/// The range starts after the first locator hash on the canonical chain
/// (after genesis when none matches) and after `threshold` when that is
/// canonical. It ends at the stop hash inclusive, at the tip, or after
/// `limit` entries, whichever comes first. `limit == 0` means no limit.
fn locator_range<S: ChainStore + ?Sized>(
    store: &S,
    locator: &BlockLocator,
    threshold: &Hash256,
    limit: usize,
) -> Result<Range<u64>, ChainError> {
    let Some((tip_height, _)) = store.chain_tip()? else {
        return Ok(0..0);
    };

    let mut begin = 1;
    for hash in &locator.start_hashes {
        if let Some(height) = store.get_canonical_height(hash)? {
            begin = height + 1;
            break;
        }
    }
    if !threshold.is_zero() {
        if let Some(height) = store.get_canonical_height(threshold)? {
            begin = begin.max(height + 1);
        }
    }

    let mut end = tip_height + 1;
    if !locator.stop_hash.is_zero() {
        if let Some(height) = store.get_canonical_height(&locator.stop_hash)? {
            end = end.min(height + 1);
        }
    }
    if limit > 0 {
        end = end.min(begin.saturating_add(limit as u64));
    }
    Ok(begin..end.max(begin))
}

pub fn locator_block_hashes<S: ChainStore + ?Sized>(
    store: &S,
    locator: &BlockLocator,
    threshold: &Hash256,
    limit: usize,
) -> Result<Vec<Hash256>, ChainError> {
    locator_range(store, locator, threshold, limit)?
        .map(|height| {
            store
                .get_canonical_hash(height)?
                .ok_or_else(|| ChainError::Storage(format!("canonical gap at height {height}")))
        })
        .collect()
}

pub fn locator_block_headers<S: ChainStore + ?Sized>(
    store: &S,
    locator: &BlockLocator,
    threshold: &Hash256,
    limit: usize,
) -> Result<Vec<BlockHeader>, ChainError> {
    locator_block_hashes(store, locator, threshold, limit)?
        .into_iter()
        .map(|hash| {
            store
                .get_block_record(&hash)?
                .map(|record| record.header)
                .ok_or_else(|| ChainError::Storage(format!("missing record for canonical block {hash}")))
        })
        .collect()
}
