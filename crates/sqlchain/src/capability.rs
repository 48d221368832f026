//! Capabilities consumed by the chain coordinator
//!
//! Producer rotation, the local signing key and block broadcast are owned
//! by other subsystems; the coordinator only sees these traits.

use crate::error::{ChainError, Result};
use crate::types::{Block, PRODUCER_KEY_SIZE};
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Decides which producer owns each turn
pub trait ProducerRotation: Send + Sync {
    /// Whether the local node produces the block at `height`
    fn is_my_turn(&self, height: i32) -> bool;
}

/// Source of the local private key
pub trait KeyStore: Send + Sync {
    fn local_private_key(&self) -> Result<SigningKey>;
}

/// Hands produced blocks to the transport layer
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, block: &Block) -> Result<()>;
}

/// Round-robin rotation over a fixed membership list
#[derive(Debug, Clone)]
pub struct RoundRobin {
    members: Vec<[u8; PRODUCER_KEY_SIZE]>,
    local: [u8; PRODUCER_KEY_SIZE],
}

impl RoundRobin {
    pub fn new(members: Vec<[u8; PRODUCER_KEY_SIZE]>, local: [u8; PRODUCER_KEY_SIZE]) -> Self {
        Self { members, local }
    }

    /// Single-member rotation: every turn is ours
    pub fn solo(local: [u8; PRODUCER_KEY_SIZE]) -> Self {
        Self::new(vec![local], local)
    }

    /// Producer owning the turn at `height`
    pub fn producer_at(&self, height: i32) -> Option<&[u8; PRODUCER_KEY_SIZE]> {
        if self.members.is_empty() || height < 0 {
            return None;
        }
        self.members.get(height as usize % self.members.len())
    }

    pub fn members(&self) -> &[[u8; PRODUCER_KEY_SIZE]] {
        &self.members
    }
}

impl ProducerRotation for RoundRobin {
    fn is_my_turn(&self, height: i32) -> bool {
        self.producer_at(height) == Some(&self.local)
    }
}

/// In-memory key store, empty until a key is set
#[derive(Default)]
pub struct LocalKeyStore {
    key: RwLock<Option<SigningKey>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: SigningKey) -> Self {
        Self {
            key: RwLock::new(Some(key)),
        }
    }

    pub fn set_key(&self, key: SigningKey) {
        *self.key.write() = Some(key);
    }

    /// Public key of the stored private key
    pub fn public_key(&self) -> Option<[u8; PRODUCER_KEY_SIZE]> {
        self.key.read().as_ref().map(|k| k.verifying_key().to_bytes())
    }
}

impl KeyStore for LocalKeyStore {
    fn local_private_key(&self) -> Result<SigningKey> {
        self.key.read().clone().ok_or(ChainError::MissingPrivateKey)
    }
}

/// Broadcaster backed by a tokio broadcast channel
///
/// Sending with no subscribers is not an error; the block is dropped.
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<Block>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to produced blocks
    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.tx.subscribe()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast(&self, block: &Block) -> Result<()> {
        match self.tx.send(block.clone()) {
            Ok(n) => tracing::debug!("Broadcast block {} to {} subscribers", block.hash(), n),
            Err(_) => tracing::trace!("No subscribers for block {}", block.hash()),
        }
        Ok(())
    }
}

/// Capabilities handed to the coordinator
#[derive(Clone)]
pub struct Capabilities {
    pub rotation: Arc<dyn ProducerRotation>,
    pub keys: Arc<dyn KeyStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl Capabilities {
    pub fn new(
        rotation: Arc<dyn ProducerRotation>,
        keys: Arc<dyn KeyStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            rotation,
            keys,
            broadcaster,
        }
    }

    /// Single producer signing with `key`; produced blocks go to the returned channel
    pub fn solo(key: SigningKey) -> (Self, Arc<ChannelBroadcaster>) {
        let broadcaster = Arc::new(ChannelBroadcaster::new(64));
        let local = key.verifying_key().to_bytes();
        let capabilities = Self::new(
            Arc::new(RoundRobin::solo(local)),
            Arc::new(LocalKeyStore::with_key(key)),
            broadcaster.clone(),
        );
        (capabilities, broadcaster)
    }
}
