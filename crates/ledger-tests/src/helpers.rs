//! Shared builders for blocks, transactions and services.

use ledger_core::chain_state::MemoryChainStore;
use ledger_core::traits::Blockchain;
use ledger_core::types::*;
use ledger_node_lib::{ChainService, NodeConfig, RocksStore};

/// Simple pubkey hash from a seed byte.
pub fn pkh(seed: u8) -> Hash256 {
    Hash256([seed; 32])
}

/// Create a coinbase transaction with a unique height marker.
///
/// Sets `lock_time: tag` so that each coinbase produces a distinct txid.
pub fn make_coinbase(value: u64, pubkey_hash: Hash256, tag: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: tag.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput::new(value, pubkey_hash)],
        lock_time: tag,
    }
}

/// Create a simple spending transaction (unsigned).
pub fn make_tx(inputs: Vec<OutPoint>, outputs: Vec<TxOutput>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .into_iter()
            .map(|op| TxInput {
                previous_output: op,
                signature: vec![0; 64],
                public_key: vec![0; 32],
            })
            .collect(),
        outputs,
        lock_time: 0,
    }
}

/// An output paying `pubkey_hash` with a stealth marker attached.
pub fn stealth_output(value: u64, pubkey_hash: Hash256, ephemeral_key: Hash256, nonce: u64) -> TxOutput {
    TxOutput {
        value,
        pubkey_hash,
        stealth: Some(StealthMarker { ephemeral_key, nonce }),
    }
}

/// Create a block at the maximum target with a correct merkle root.
pub fn make_block(prev_hash: Hash256, nonce: u64, txs: Vec<Transaction>) -> Block {
    make_block_with_target(prev_hash, nonce, u64::MAX, txs)
}

pub fn make_block_with_target(prev_hash: Hash256, nonce: u64, difficulty_target: u64, txs: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256::ZERO,
            timestamp: 1_767_225_600 + nonce * 60,
            difficulty_target,
            nonce,
        },
        transactions: txs,
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// `count` coinbase-only blocks on top of `prev_hash`. `tag` keeps branches
/// built from the same parent distinct.
pub fn build_chain(prev_hash: Hash256, count: u64, tag: u64) -> Vec<Block> {
    let mut prev = prev_hash;
    (0..count)
        .map(|i| {
            let nonce = tag * 1_000 + i;
            let block = make_block(prev, nonce, vec![make_coinbase(50, pkh(tag as u8), nonce)]);
            prev = block.hash();
            block
        })
        .collect()
}

/// A started in-memory service with genesis connected.
pub async fn memory_service() -> ChainService<MemoryChainStore> {
    let service = ChainService::new(MemoryChainStore::new()).with_genesis(true);
    assert!(service.start().await);
    service
}

/// A started RocksDB service under `data_dir` with genesis connected.
pub async fn rocks_service(data_dir: &std::path::Path) -> ChainService<RocksStore> {
    let config = NodeConfig {
        data_dir: data_dir.to_path_buf(),
        seed_genesis: true,
        ..NodeConfig::default()
    };
    let service = ChainService::open(&config).expect("open rocks service");
    assert!(service.start().await);
    service
}

/// Store every block in order, asserting success.
pub async fn store_all<B: Blockchain + ?Sized>(service: &B, blocks: &[Block]) -> Vec<BlockInfo> {
    let mut infos = Vec::with_capacity(blocks.len());
    for block in blocks {
        infos.push(service.store(block.clone()).await.expect("store block"));
    }
    infos
}
