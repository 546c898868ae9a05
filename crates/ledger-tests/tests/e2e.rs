//! End-to-end tests through the `Blockchain` service surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ledger_core::checksum::checksum;
use ledger_core::error::ChainError;
use ledger_core::genesis::genesis_hash;
use ledger_core::history::{balance, HistoryRow};
use ledger_core::stealth::{stealth_prefix, BinaryPrefix};
use ledger_core::traits::{BlockRef, Blockchain};
use ledger_core::types::{Block, BlockStatus, Hash256, InputPoint, OutPoint, StealthMarker};
use ledger_tests::helpers::*;

fn hashes(blocks: &[Arc<Block>]) -> Vec<Hash256> {
    blocks.iter().map(|block| block.hash()).collect()
}

// ---------------------------------------------------------------------------
// Fork choice
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heavier_branch_takes_over_and_is_announced() {
    let service = memory_service().await;
    let main = build_chain(genesis_hash(), 3, 1);
    let branch = build_chain(main[0].hash(), 3, 2);
    store_all(&service, &main).await;

    let rx = service.subscribe();
    assert_eq!(service.store(branch[0].clone()).await.unwrap().status, BlockStatus::Orphan);
    // Equal work: the first-seen chain keeps the tip.
    assert_eq!(service.store(branch[1].clone()).await.unwrap().status, BlockStatus::Orphan);
    assert_eq!(service.fetch_last_height().await.unwrap(), 3);

    let info = service.store(branch[2].clone()).await.unwrap();
    assert_eq!(info.status, BlockStatus::Confirmed);
    assert_eq!(info.height, 4);

    let reorg = rx.await.unwrap().unwrap();
    assert_eq!(reorg.fork_height, 1);
    assert_eq!(reorg.fork_hash, main[0].hash());
    assert_eq!(hashes(&reorg.added), branch.iter().map(Block::hash).collect::<Vec<_>>());
    assert_eq!(hashes(&reorg.removed), vec![main[1].hash(), main[2].hash()]);
    assert_eq!(reorg.new_height(), 4);

    assert_eq!(service.fetch_last_height().await.unwrap(), 4);
    assert!(matches!(
        service.fetch_block_height(main[2].hash()).await,
        Err(ChainError::NotFound(_))
    ));
    assert_eq!(service.fetch_block_height(branch[2].hash()).await.unwrap(), 4);
    assert_eq!(
        service.fetch_block(BlockRef::Height(2)).await.unwrap(),
        branch[0]
    );

    // Indexes follow the canonical chain.
    assert_eq!(service.fetch_history(pkh(1), 0, 0).await.unwrap().len(), 1);
    assert_eq!(service.fetch_history(pkh(2), 0, 0).await.unwrap().len(), 3);
    let dropped = main[2].transactions[0].txid();
    assert!(matches!(service.fetch_transaction(dropped).await, Err(ChainError::NotFound(_))));
}

#[tokio::test]
async fn unknown_parent_is_rejected() {
    let service = memory_service().await;
    let detached = make_block(pkh(0x77), 1, vec![make_coinbase(50, pkh(1), 1)]);

    assert!(matches!(
        service.store(detached).await,
        Err(ChainError::InvalidLinkage { .. })
    ));
    assert_eq!(service.fetch_last_height().await.unwrap(), 0);
}

#[tokio::test]
async fn storing_twice_is_idempotent() {
    let service = memory_service().await;
    let b1 = make_block(genesis_hash(), 1, vec![make_coinbase(50, pkh(1), 1)]);

    let first = service.store(b1.clone()).await.unwrap();
    let second = service.store(b1.clone()).await.unwrap();
    assert_eq!(first.status, BlockStatus::Confirmed);
    assert_eq!(second.status, BlockStatus::Duplicate);
    assert_eq!(second.height, 1);

    assert_eq!(service.fetch_last_height().await.unwrap(), 1);
    assert_eq!(service.fetch_history(pkh(1), 0, 0).await.unwrap().len(), 1);
    assert!(matches!(service.import(b1).await, Err(ChainError::DuplicateBlock(_))));
}

// ---------------------------------------------------------------------------
// History and spends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_tracks_receive_and_spend() {
    let service = memory_service().await;
    let alice = pkh(0xA);
    let bob = pkh(0xB);

    let mut prev = genesis_hash();
    let mut funding = None;
    let mut payment = None;
    for height in 1..=20u64 {
        let mut txs = Vec::new();
        if height == 10 {
            let coinbase = make_coinbase(500, alice, height);
            funding = Some(OutPoint { txid: coinbase.txid(), index: 0 });
            txs.push(coinbase);
        } else {
            txs.push(make_coinbase(50, pkh(1), height));
        }
        if height == 20 {
            let pay = make_tx(vec![funding.unwrap()], vec![ledger_core::types::TxOutput::new(500, bob)]);
            payment = Some(pay.txid());
            txs.push(pay);
        }
        let block = make_block(prev, height, txs);
        prev = block.hash();
        service.store(block).await.unwrap();
    }
    let funding = funding.unwrap();
    let payment = payment.unwrap();

    let rows = service.fetch_history(alice, 0, 0).await.unwrap();
    assert_eq!(
        rows,
        vec![
            HistoryRow::Output { point: funding, height: 10, value: 500 },
            HistoryRow::Spend {
                point: InputPoint { txid: payment, index: 0 },
                height: 20,
                previous_checksum: checksum(&funding),
            },
        ]
    );
    assert!(rows[1].spends(&rows[0]));
    assert_eq!(balance(&rows), 0);
    assert_eq!(balance(&service.fetch_history(bob, 0, 0).await.unwrap()), 500);

    assert_eq!(service.fetch_history(alice, 1, 0).await.unwrap(), rows[..1].to_vec());
    assert_eq!(service.fetch_history(alice, 0, 15).await.unwrap(), rows[1..].to_vec());
    assert!(service.fetch_history(alice, 0, 21).await.unwrap().is_empty());

    assert_eq!(
        service.fetch_spend(funding).await.unwrap(),
        InputPoint { txid: payment, index: 0 }
    );
    assert_eq!(service.fetch_transaction_index(payment).await.unwrap(), (20, 1));
}

#[tokio::test]
async fn stealth_payment_is_found_by_prefix() {
    let service = memory_service().await;
    let b1 = build_chain(genesis_hash(), 1, 1).remove(0);
    let funding = OutPoint { txid: b1.transactions[0].txid(), index: 0 };
    service.store(b1.clone()).await.unwrap();

    let marker = StealthMarker { ephemeral_key: pkh(0xE), nonce: 7 };
    let pay = make_tx(vec![funding], vec![stealth_output(25, pkh(0xD), marker.ephemeral_key, marker.nonce)]);
    let b2 = make_block(b1.hash(), 2, vec![make_coinbase(50, pkh(1), 2), pay.clone()]);
    service.store(b2).await.unwrap();

    let prefix = stealth_prefix(&marker);
    let filter = BinaryPrefix::new(prefix, 12).unwrap();
    let rows = service.fetch_stealth(filter, 0).await.unwrap();
    assert!(rows
        .iter()
        .any(|row| row.txid == pay.txid() && row.address == pkh(0xD) && row.ephemeral_key == pkh(0xE)));

    assert_eq!(service.fetch_stealth(BinaryPrefix::EMPTY, 0).await.unwrap().len(), 1);
    assert!(service.fetch_stealth(filter, 3).await.unwrap().is_empty());
    let other = BinaryPrefix::new(!prefix, 32).unwrap();
    assert!(service.fetch_stealth(other, 0).await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency and notification
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_observe_consistent_snapshots() {
    let service = memory_service().await;
    let blocks = build_chain(genesis_hash(), 60, 1);

    let writer = {
        let service = service.clone();
        tokio::spawn(async move { store_all(&service, &blocks).await })
    };

    let mut readers = Vec::new();
    for _ in 0..4 {
        let service = service.clone();
        readers.push(tokio::task::spawn_blocking(move || {
            use ledger_core::chain_state::ChainStore;
            for _ in 0..200 {
                let store = service.chain_store().read();
                let (height, hash) = store.chain_tip().unwrap().unwrap();
                assert_eq!(store.get_canonical_hash(height).unwrap(), Some(hash));
                assert_eq!(store.scan_history(&pkh(1), 0, 0).unwrap().len() as u64, height);
            }
        }));
    }

    writer.await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(service.fetch_last_height().await.unwrap(), 60);
}

#[tokio::test]
async fn each_subscription_fires_once() {
    let service = memory_service().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    service.subscribe_reorganize(Box::new(move |notice| {
        assert!(notice.is_ok());
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let rx = service.subscribe();

    let blocks = build_chain(genesis_hash(), 2, 1);
    service.store(blocks[0].clone()).await.unwrap();
    let reorg = rx.await.unwrap().unwrap();
    assert_eq!(reorg.fork_hash, genesis_hash());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    service.store(blocks[1].clone()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let pending = service.subscribe();
    assert!(service.stop().await);
    assert!(matches!(pending.await.unwrap(), Err(ChainError::ServiceStopped)));
    assert!(matches!(service.subscribe().await.unwrap(), Err(ChainError::ServiceStopped)));
    assert!(matches!(service.fetch_last_height().await, Err(ChainError::ServiceStopped)));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reorganized_chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let main = build_chain(genesis_hash(), 3, 1);
    let branch = build_chain(main[0].hash(), 3, 2);

    {
        let service = rocks_service(dir.path()).await;
        store_all(&service, &main).await;
        store_all(&service, &branch).await;
        assert!(service.stop().await);
    }

    let service = rocks_service(dir.path()).await;
    assert_eq!(service.fetch_last_height().await.unwrap(), 4);
    assert_eq!(
        service.fetch_block_header(BlockRef::Height(2)).await.unwrap(),
        branch[0].header
    );
    assert_eq!(
        service.fetch_block_transaction_hashes(branch[2].hash()).await.unwrap(),
        branch[2].txids()
    );
    assert_eq!(service.fetch_history(pkh(1), 0, 0).await.unwrap().len(), 1);

    // The stored side branch is still known, so re-storing it is a no-op.
    let info = service.store(main[2].clone()).await.unwrap();
    assert_eq!(info.status, BlockStatus::Duplicate);
}
