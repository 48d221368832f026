//! In-memory block index
//!
//! Nodes live in an append-only arena; a hash table maps block hashes to
//! arena slots. Parent links are arena slots, so the tree never holds
//! owning pointers and readers only need the read lock.

use crate::types::{BlockHash, SignedHeader};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Arena slot of a block node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A block in the index tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockNode {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub height: i32,
    pub timestamp: DateTime<Utc>,
    /// `None` only for genesis
    pub parent: Option<NodeId>,
}

impl BlockNode {
    /// Root node at height 0
    pub fn genesis(header: &SignedHeader) -> Self {
        Self {
            hash: *header.block_hash(),
            parent_hash: *header.parent_hash(),
            height: 0,
            timestamp: header.timestamp(),
            parent: None,
        }
    }

    /// Node extending `parent`, which sits in arena slot `parent_id`
    pub fn child_of(header: &SignedHeader, parent_id: NodeId, parent: &BlockNode) -> Self {
        Self {
            hash: *header.block_hash(),
            parent_hash: parent.hash,
            height: parent.height + 1,
            timestamp: header.timestamp(),
            parent: Some(parent_id),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Default)]
struct Arena {
    nodes: Vec<BlockNode>,
    by_hash: HashMap<BlockHash, NodeId>,
}

/// Thread-safe block index
///
/// Supports any number of concurrent readers; writes are expected to be
/// serialized by the chain coordinator.
#[derive(Default)]
pub struct BlockIndex {
    arena: RwLock<Arena>,
}

impl BlockIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. The caller guarantees its hash is not indexed yet.
    pub fn add_block(&self, node: BlockNode) -> NodeId {
        let mut arena = self.arena.write();
        debug_assert!(!arena.by_hash.contains_key(&node.hash));

        let id = NodeId(arena.nodes.len());
        arena.nodes.push(node);
        arena.by_hash.insert(node.hash, id);
        id
    }

    /// Check if a block is indexed
    pub fn has_block(&self, hash: &BlockHash) -> bool {
        self.arena.read().by_hash.contains_key(hash)
    }

    /// Look up a node by hash
    pub fn lookup_node(&self, hash: &BlockHash) -> Option<BlockNode> {
        self.lookup_entry(hash).map(|(_, node)| node)
    }

    /// Look up a node and its arena slot by hash
    pub fn lookup_entry(&self, hash: &BlockHash) -> Option<(NodeId, BlockNode)> {
        let arena = self.arena.read();
        let id = *arena.by_hash.get(hash)?;
        Some((id, arena.nodes[id.0]))
    }

    /// Get a node by arena slot
    pub fn node(&self, id: NodeId) -> Option<BlockNode> {
        self.arena.read().nodes.get(id.0).copied()
    }

    /// First node inserted, which is the genesis
    pub fn genesis(&self) -> Option<BlockNode> {
        self.arena.read().nodes.first().copied()
    }

    /// Walk from `hash` back to genesis, inclusive on both ends
    pub fn ancestors(&self, hash: &BlockHash) -> Vec<BlockNode> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut next = arena.by_hash.get(hash).copied();

        while let Some(id) = next {
            let node = arena.nodes[id.0];
            chain.push(node);
            next = node.parent;
        }

        chain
    }

    /// Number of indexed blocks
    pub fn len(&self) -> usize {
        self.arena.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().nodes.is_empty()
    }
}
