//! Criterion benchmarks for ledger-node storage operations.
//!
//! Covers: appending blocks through the organizer onto RocksDB and scanning
//! address history.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use parking_lot::RwLock;
use tempfile::TempDir;

use ledger_core::chain_state::ChainStore;
use ledger_core::genesis::genesis_block;
use ledger_core::organizer::{Admission, Organizer};
use ledger_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use ledger_node_lib::storage::RocksStore;

/// Build a block at `height` paying the same address, on top of `prev_hash`.
fn build_block(prev_hash: Hash256, height: u64) -> Block {
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: height.to_le_bytes().to_vec(),
            public_key: vec![],
        }],
        outputs: vec![TxOutput::new(50, Hash256([0xAA; 32]))],
        lock_time: height,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256::ZERO,
            timestamp: 1_767_225_600 + height * 60,
            difficulty_target: u64::MAX,
            nonce: height,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

fn seeded() -> (RwLock<RocksStore>, Organizer, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let chain = RwLock::new(RocksStore::open(dir.path().join("chaindata")).unwrap());
    let mut organizer = Organizer::new();
    organizer.organize(&chain, genesis_block(), Admission::Store).unwrap();
    (chain, organizer, dir)
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("rocks_append_block", |b| {
        b.iter_batched(
            || {
                let (chain, organizer, dir) = seeded();
                let tip = chain.read().chain_tip().unwrap().unwrap().1;
                (chain, organizer, dir, build_block(tip, 1))
            },
            |(chain, mut organizer, _dir, block)| {
                organizer.organize(&chain, block, Admission::Store).unwrap();
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_history_scan(c: &mut Criterion) {
    let (chain, mut organizer, _dir) = seeded();
    let mut prev = genesis_block().hash();
    for height in 1..=200 {
        let block = build_block(prev, height);
        prev = block.hash();
        organizer.organize(&chain, block, Admission::Store).unwrap();
    }
    let address = Hash256([0xAA; 32]);
    c.bench_function("history_scan_200_rows", |b| {
        b.iter(|| chain.read().scan_history(black_box(&address), 0, 0).unwrap())
    });
}

criterion_group!(benches, bench_append, bench_history_scan);
criterion_main!(benches);
