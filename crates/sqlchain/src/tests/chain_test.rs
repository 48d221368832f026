//! Admission, push and restore tests
//!
//! Tests the chain coordinator against a real sled store:
//! - Genesis initialization and restore
//! - Linear extension and fork rejection
//! - Production window boundaries
//! - Concurrent admission at the same height

use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ed25519_dalek::SigningKey;
use tempfile::tempdir;

use super::{genesis_time, passive_capabilities, signing_key, test_config};
use crate::{
    Block, BlockHash, ChainConfig, ChainCoordinator, ChainError, ChainRpcServer, ErrorKind,
    Lifecycle,
};

const PERIOD: Duration = Duration::from_secs(10);

fn period() -> TimeDelta {
    TimeDelta::from_std(PERIOD).unwrap()
}

/// Start of the slot for `height` on the test chain
fn slot(height: i32) -> DateTime<Utc> {
    genesis_time() + period() * height
}

/// Helper to create a block on `parent` signed by `key`
fn block_on(parent: BlockHash, timestamp: DateTime<Utc>, payload: &[u8], key: &SigningKey) -> Block {
    Block::sign(parent, timestamp, payload.to_vec(), key).unwrap()
}

fn fresh_chain(dir: &std::path::Path) -> ChainCoordinator {
    let config = test_config(dir, genesis_time(), PERIOD);
    ChainCoordinator::initialize(config, passive_capabilities()).unwrap()
}

/// Advise `count` blocks, one per slot, each extending the head
fn extend(chain: &ChainCoordinator, count: i32) -> Vec<Block> {
    let key = signing_key(2);
    let mut blocks = Vec::new();

    for _ in 0..count {
        let height = chain.height() + 1;
        let block = block_on(chain.head(), slot(height), &height.to_be_bytes(), &key);
        chain.advise_new_block(&block).unwrap();
        blocks.push(block);
    }

    blocks
}

#[test]
fn test_initialize_accepts_genesis() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), genesis_time(), PERIOD);
    let genesis_hash = *config.genesis.hash();
    let chain = ChainCoordinator::initialize(config, passive_capabilities()).unwrap();

    assert_eq!(chain.lifecycle(), Lifecycle::Active);
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.head(), genesis_hash);
    assert_eq!(chain.index().len(), 1);
    assert_eq!(chain.clock().next_height(), 1);
    assert_eq!(chain.clock().chain_init_time(), genesis_time());

    let state = chain.state();
    let node = chain.index().node(state.node.unwrap()).unwrap();
    assert_eq!(node.hash, state.head);
    assert!(node.is_genesis());
}

#[test]
fn test_initialize_rejects_invalid_genesis() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), genesis_time(), PERIOD).with_root_hash(BlockHash([1u8; 32]));

    let err = ChainCoordinator::initialize(config, passive_capabilities()).err().unwrap();
    assert!(matches!(err, ChainError::InvalidGenesis { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn test_initialize_twice_is_refused() {
    let dir = tempdir().unwrap();
    drop(fresh_chain(dir.path()));

    let config = test_config(dir.path(), genesis_time(), PERIOD);
    let err = ChainCoordinator::initialize(config, passive_capabilities()).err().unwrap();
    assert!(matches!(err, ChainError::AlreadyInitialized));
}

#[test]
fn test_push_extends_head() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());
    let genesis = chain.head();

    let block = block_on(genesis, slot(1), b"insert", &signing_key(2));
    chain.push_block(block.header()).unwrap();

    assert_eq!(chain.height(), 1);
    assert_eq!(chain.head(), *block.hash());

    let node = chain.lookup_node(block.hash()).unwrap();
    let parent = chain.lookup_node(&genesis).unwrap();
    assert_eq!(node.height, parent.height + 1);
    assert_eq!(node.parent_hash, parent.hash);
}

#[test]
fn test_push_rejects_non_extending_parent() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());
    let before = chain.state();

    let block = block_on(BlockHash([9u8; 32]), slot(1), b"fork", &signing_key(2));
    let err = chain.push_block(block.header()).unwrap_err();

    assert!(matches!(err, ChainError::InvalidBlock));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(chain.state(), before);
    assert!(!chain.has_block(block.hash()));
}

#[test]
fn test_push_rejects_sibling_of_head() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());
    let genesis = chain.head();
    extend(&chain, 1);

    let sibling = block_on(genesis, slot(1), b"late sibling", &signing_key(3));
    assert!(matches!(chain.push_block(sibling.header()), Err(ChainError::InvalidBlock)));
    assert_eq!(chain.height(), 1);
}

#[test]
fn test_readvising_block_is_duplicate() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let block = extend(&chain, 1).remove(0);
    let err = chain.advise_new_block(&block).unwrap_err();

    assert!(matches!(err, ChainError::BlockExists(hash) if hash == *block.hash()));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.index().len(), 2);
}

#[test]
fn test_window_start_is_inclusive() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let block = block_on(chain.head(), slot(1), b"on time", &signing_key(2));
    chain.advise_new_block(&block).unwrap();

    assert_eq!(chain.height(), 1);
}

#[test]
fn test_window_end_is_exclusive() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let block = block_on(chain.head(), slot(2), b"too late", &signing_key(2));
    let err = chain.advise_new_block(&block).unwrap_err();

    assert!(matches!(err, ChainError::BlockTimestampOutOfPeriod { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(chain.height(), 0);

    let last_moment = slot(2) - TimeDelta::nanoseconds(1);
    let block = block_on(chain.head(), last_moment, b"just in time", &signing_key(2));
    chain.advise_new_block(&block).unwrap();
    assert_eq!(chain.height(), 1);
}

#[test]
fn test_window_rejects_early_block() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let early = slot(1) - TimeDelta::nanoseconds(1);
    let block = block_on(chain.head(), early, b"too early", &signing_key(2));
    let err = chain.advise_new_block(&block).unwrap_err();

    match err {
        ChainError::BlockTimestampOutOfPeriod { timestamp, start, end } => {
            assert_eq!(timestamp, early);
            assert_eq!(start, slot(1));
            assert_eq!(end, slot(2));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(chain.height(), 0);
}

#[test]
fn test_window_follows_height() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());
    extend(&chain, 3);

    let stale = block_on(chain.head(), slot(3), b"stale slot", &signing_key(2));
    assert!(matches!(
        chain.advise_new_block(&stale),
        Err(ChainError::BlockTimestampOutOfPeriod { .. })
    ));

    let next = block_on(chain.head(), slot(4) + TimeDelta::seconds(9), b"next slot", &signing_key(2));
    chain.advise_new_block(&next).unwrap();
    assert_eq!(chain.height(), 4);
}

#[test]
fn test_advise_propagates_verification_failure() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let mut block = block_on(chain.head(), slot(1), b"forged", &signing_key(2));
    block.header.signature[10] ^= 0x01;
    let err = chain.advise_new_block(&block).unwrap_err();
    assert!(matches!(err, ChainError::InvalidSignature(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut block = block_on(chain.head(), slot(1), b"swapped", &signing_key(2));
    block.payload = b"other".to_vec();
    assert!(matches!(chain.advise_new_block(&block), Err(ChainError::DigestMismatch(_))));

    assert_eq!(chain.height(), 0);
    assert_eq!(chain.index().len(), 1);
}

#[test]
fn test_advise_rejects_fork() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    let block = block_on(BlockHash([4u8; 32]), slot(1), b"fork", &signing_key(2));
    assert!(matches!(chain.advise_new_block(&block), Err(ChainError::InvalidBlock)));
    assert_eq!(chain.height(), 0);
}

#[test]
fn test_every_node_links_to_parent() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());
    let blocks = extend(&chain, 6);

    let path = chain.index().ancestors(&chain.head());
    assert_eq!(path.len(), 7);

    for pair in path.windows(2) {
        let (child, parent) = (pair[0], pair[1]);
        assert_eq!(child.height, parent.height + 1);
        assert_eq!(child.parent_hash, parent.hash);
    }
    assert_eq!(path[0].hash, *blocks[5].hash());
    assert!(path[6].is_genesis());
}

#[test]
fn test_restore_rebuilds_index_and_state() {
    let dir = tempdir().unwrap();
    let blocks = {
        let chain = fresh_chain(dir.path());
        extend(&chain, 5)
    };

    let config = test_config(dir.path(), genesis_time(), PERIOD);
    let chain = ChainCoordinator::restore(config, passive_capabilities()).unwrap();

    let last = blocks.last().unwrap();
    assert_eq!(chain.index().len(), 6);
    assert_eq!(chain.height(), 5);
    assert_eq!(chain.head(), *last.hash());
    assert_eq!(chain.index().node(chain.state().node.unwrap()).unwrap().hash, *last.hash());
    assert_eq!(chain.clock().next_height(), 6);
    assert_eq!(chain.lifecycle(), Lifecycle::Active);

    for block in &blocks {
        assert!(chain.has_block(block.hash()));
    }

    // The restored chain keeps extending
    extend(&chain, 1);
    assert_eq!(chain.height(), 6);
}

#[test]
fn test_restore_with_other_genesis_fails() {
    let dir = tempdir().unwrap();
    drop(fresh_chain(dir.path()));

    let genesis = Block::genesis(BlockHash::ZERO, genesis_time(), &signing_key(7)).unwrap();
    let config = ChainConfig::new(dir.path(), PERIOD, genesis);

    let err = ChainCoordinator::restore(config, passive_capabilities()).err().unwrap();
    assert!(matches!(err, ChainError::GenesisMismatch { .. }));
}

#[test]
fn test_restore_empty_store_fails() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), genesis_time(), PERIOD);

    let err = ChainCoordinator::restore(config, passive_capabilities()).err().unwrap();
    assert!(matches!(err, ChainError::StateNotFound));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_open_initializes_then_restores() {
    let dir = tempdir().unwrap();

    let head = {
        let config = test_config(dir.path(), genesis_time(), PERIOD);
        let chain = ChainCoordinator::open(config, passive_capabilities()).unwrap();
        assert_eq!(chain.height(), 0);
        extend(&chain, 2);
        chain.head()
    };

    let config = test_config(dir.path(), genesis_time(), PERIOD);
    let chain = ChainCoordinator::open(config, passive_capabilities()).unwrap();
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.head(), head);
}

#[test]
fn test_next_slot_missed() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    // Genesis in 2024: the window of height 1 closed long ago
    assert!(chain.next_slot_missed().unwrap());

    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), Utc::now(), PERIOD);
    let chain = ChainCoordinator::initialize(config, passive_capabilities()).unwrap();
    assert!(!chain.next_slot_missed().unwrap());
}

#[test]
fn test_stopped_chain_rejects_blocks() {
    let dir = tempdir().unwrap();
    let chain = fresh_chain(dir.path());

    chain.stop();
    chain.stop();
    assert_eq!(chain.lifecycle(), Lifecycle::Stopped);

    let block = block_on(chain.head(), slot(1), b"after stop", &signing_key(2));
    assert!(matches!(chain.advise_new_block(&block), Err(ChainError::Stopped)));
    assert!(matches!(chain.push_block(block.header()), Err(ChainError::Stopped)));
    assert_eq!(chain.height(), 0);
}

#[test]
fn test_concurrent_admission_single_winner() {
    const CONTENDERS: u8 = 8;

    let dir = tempdir().unwrap();
    let chain = Arc::new(fresh_chain(dir.path()));
    let genesis = chain.head();
    let barrier = Arc::new(Barrier::new(CONTENDERS as usize));

    let handles: Vec<_> = (0..CONTENDERS)
        .map(|i| {
            let chain = chain.clone();
            let barrier = barrier.clone();
            let block = block_on(genesis, slot(1), &[i], &signing_key(10 + i));
            std::thread::spawn(move || {
                barrier.wait();
                chain.advise_new_block(&block)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();

    assert_eq!(winners, 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
    assert_eq!(chain.height(), 1);
    assert_eq!(chain.index().len(), 2);
}
