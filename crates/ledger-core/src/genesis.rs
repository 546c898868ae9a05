//! Default genesis block.
//!
//! Every node builds the identical block from the constants below. It
//! carries a single coinbase paying [`GENESIS_REWARD`] to an unspendable
//! all-zero public-key hash.

use std::sync::LazyLock;

use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: u64 = 1_767_225_600;

/// Message embedded in the genesis coinbase input.
pub const GENESIS_MESSAGE: &[u8] = b"ledger genesis";

/// Value of the genesis coinbase output.
pub const GENESIS_REWARD: u64 = 50 * 100_000_000;

struct GenesisData {
    block: Block,
    hash: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(|| {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: GENESIS_MESSAGE.to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput::new(GENESIS_REWARD, Hash256::ZERO)],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: GENESIS_TIMESTAMP,
            difficulty_target: u64::MAX,
            nonce: 0,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    let hash = block.hash();
    GenesisData { block, hash }
});

/// The default genesis block.
pub fn genesis_block() -> Block {
    GENESIS.block.clone()
}

/// Hash of [`genesis_block`].
pub fn genesis_hash() -> Hash256 {
    GENESIS.hash
}
