//! SQLChain - Chain coordinator for the SQL ledger
//!
//! This crate keeps the canonical block history of a SQL ledger chain:
//! - In-memory block index (arena of nodes keyed by hash)
//! - Durable chain-state checkpoint and header log on sled
//! - Coordinated-time slot clock
//! - Block admission and slot-timed local production

pub mod block_index;
pub mod capability;
pub mod coordinator;
pub mod error;
pub mod persistence;
pub mod runtime;
pub mod types;

#[cfg(test)]
mod tests;

pub use block_index::{BlockIndex, BlockNode, NodeId};
pub use capability::{
    Broadcaster, Capabilities, ChannelBroadcaster, KeyStore, LocalKeyStore, ProducerRotation,
    RoundRobin,
};
pub use coordinator::{ChainConfig, ChainCoordinator, ChainRpcServer, Lifecycle, PayloadSender};
pub use error::{ChainError, ErrorKind, Result};
pub use persistence::ChainStore;
pub use runtime::ClockRuntime;
pub use types::{Block, BlockHash, ChainState, SignedHeader};

/// Capacity of the pending payload queue drained by local production
pub const MAX_PENDING_PAYLOADS: usize = 1000;

/// Maximum payload records folded into one produced block
pub const MAX_PAYLOADS_PER_BLOCK: usize = 64;
