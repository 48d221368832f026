//! Chain coordinator integration tests

mod chain_test;

use crate::{
    Block, BlockHash, Broadcaster, Capabilities, ChainConfig, LocalKeyStore, ProducerRotation,
    Result, RoundRobin,
};
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create a deterministic signing key
pub(crate) fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Fixed genesis time used by admission tests
pub(crate) fn genesis_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Helper to build a config with a genesis signed by `signing_key(1)`
pub(crate) fn test_config(dir: &Path, genesis_time: DateTime<Utc>, period: Duration) -> ChainConfig {
    let genesis = Block::genesis(BlockHash::ZERO, genesis_time, &signing_key(1)).unwrap();
    ChainConfig::new(dir, period, genesis)
}

/// Broadcaster that keeps every block it is handed
#[derive(Default)]
pub(crate) struct CollectingBroadcaster {
    pub blocks: Mutex<Vec<Block>>,
}

impl Broadcaster for CollectingBroadcaster {
    fn broadcast(&self, block: &Block) -> Result<()> {
        self.blocks.lock().push(block.clone());
        Ok(())
    }
}

/// Rotation that never hands us a turn
pub(crate) struct NeverMyTurn;

impl ProducerRotation for NeverMyTurn {
    fn is_my_turn(&self, _height: i32) -> bool {
        false
    }
}

/// Capabilities of a solo producer that collects produced blocks
pub(crate) fn collecting_capabilities(key: SigningKey) -> (Capabilities, Arc<CollectingBroadcaster>) {
    let broadcaster = Arc::new(CollectingBroadcaster::default());
    let local = key.verifying_key().to_bytes();
    let capabilities = Capabilities::new(
        Arc::new(RoundRobin::solo(local)),
        Arc::new(LocalKeyStore::with_key(key)),
        broadcaster.clone(),
    );
    (capabilities, broadcaster)
}

/// Capabilities that never produce
pub(crate) fn passive_capabilities() -> Capabilities {
    Capabilities::new(
        Arc::new(NeverMyTurn),
        Arc::new(LocalKeyStore::new()),
        Arc::new(CollectingBroadcaster::default()),
    )
}
