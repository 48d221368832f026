//! Persistence Layer for chain state
//!
//! Uses sled embedded database with two trees:
//! - `meta` holds the single chain-state checkpoint
//! - `header-log` holds one signed header per accepted block, keyed by
//!   height then hash so iteration replays blocks in chain order
//!
//! Records are fixed-width big-endian with no version tag.

use crate::block_index::{BlockIndex, BlockNode, NodeId};
use crate::error::{ChainError, Result};
use crate::types::{BlockHash, SignedHeader, HASH_SIZE, PRODUCER_KEY_SIZE, SIGNATURE_SIZE};
use sled::transaction::{TransactionError, TransactionResult, Transactional};
use sled::{Db, Tree};
use std::path::Path;

/// Tree holding the chain-state checkpoint
pub const META_TREE: &str = "meta";

/// Tree holding the header log
pub const HEADER_TREE: &str = "header-log";

/// Key of the chain-state record in the meta tree
pub const STATE_KEY: &[u8] = b"sqlchain-state";

/// Chain state record: head hash (32) + height (4)
pub const STATE_RECORD_SIZE: usize = HASH_SIZE + 4;

/// Header log key: height (4) + hash (32)
pub const ORDERING_KEY_SIZE: usize = 4 + HASH_SIZE;

/// Header record: parent (32) + timestamp (8) + digest (32) + producer (32) + hash (32) + signature (64)
pub const HEADER_RECORD_SIZE: usize =
    HASH_SIZE + 8 + HASH_SIZE + PRODUCER_KEY_SIZE + HASH_SIZE + SIGNATURE_SIZE;

fn check_len(what: &'static str, bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() != expected {
        return Err(ChainError::Encoding {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

/// Encode the chain-state checkpoint
pub fn encode_state(head: &BlockHash, height: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STATE_RECORD_SIZE);
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf
}

/// Decode the chain-state checkpoint
pub fn decode_state(bytes: &[u8]) -> Result<(BlockHash, i32)> {
    check_len("chain state", bytes, STATE_RECORD_SIZE)?;

    let head = BlockHash(read_array(bytes, 0));
    let height = i32::from_be_bytes(read_array(bytes, HASH_SIZE));
    Ok((head, height))
}

/// Header log key of a node
pub fn ordering_key(node: &BlockNode) -> Vec<u8> {
    let mut key = Vec::with_capacity(ORDERING_KEY_SIZE);
    key.extend_from_slice(&node.height.to_be_bytes());
    key.extend_from_slice(node.hash.as_bytes());
    key
}

fn key_height(key: &[u8]) -> Result<i32> {
    check_len("ordering key", key, ORDERING_KEY_SIZE)?;
    Ok(i32::from_be_bytes(read_array(key, 0)))
}

/// Encode a signed header record
pub fn encode_header(header: &SignedHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_RECORD_SIZE);
    buf.extend_from_slice(header.parent_hash.as_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(header.content_digest.as_bytes());
    buf.extend_from_slice(&header.producer);
    buf.extend_from_slice(header.block_hash.as_bytes());
    buf.extend_from_slice(&header.signature);
    buf
}

/// Decode a signed header record
pub fn decode_header(bytes: &[u8]) -> Result<SignedHeader> {
    check_len("signed header", bytes, HEADER_RECORD_SIZE)?;

    let mut offset = 0;
    let parent_hash = BlockHash(read_array(bytes, offset));
    offset += HASH_SIZE;
    let timestamp = i64::from_be_bytes(read_array(bytes, offset));
    offset += 8;
    let content_digest = BlockHash(read_array(bytes, offset));
    offset += HASH_SIZE;
    let producer = read_array(bytes, offset);
    offset += PRODUCER_KEY_SIZE;
    let block_hash = BlockHash(read_array(bytes, offset));
    offset += HASH_SIZE;
    let signature = read_array(bytes, offset);

    Ok(SignedHeader {
        parent_hash,
        timestamp,
        content_digest,
        producer,
        block_hash,
        signature,
    })
}

/// Persistent storage for the chain
pub struct ChainStore {
    /// Sled database instance
    db: Db,
    /// Chain-state checkpoint tree
    meta: Tree,
    /// Header log tree
    headers: Tree,
}

impl ChainStore {
    /// Open or create a chain store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(&path)?;
        let meta = db.open_tree(META_TREE)?;
        let headers = db.open_tree(HEADER_TREE)?;

        tracing::info!("Opened chain store at {:?}", path.as_ref());

        Ok(Self { db, meta, headers })
    }

    /// Whether a chain-state checkpoint exists
    pub fn has_state(&self) -> Result<bool> {
        Ok(self.meta.contains_key(STATE_KEY)?)
    }

    /// Load the chain-state checkpoint
    pub fn load_state(&self) -> Result<(BlockHash, i32)> {
        let bytes = self.meta.get(STATE_KEY)?.ok_or(ChainError::StateNotFound)?;
        decode_state(&bytes)
    }

    /// Load the checkpoint and resolve its head in a rebuilt `index`
    pub fn load_head(&self, index: &BlockIndex) -> Result<(NodeId, BlockNode)> {
        let (head, height) = self.load_state()?;
        let (id, node) = index.lookup_entry(&head).ok_or(ChainError::HeadNotFound(head))?;

        if node.height != height {
            return Err(ChainError::HeightMismatch {
                stored: height,
                indexed: node.height,
            });
        }

        Ok((id, node))
    }

    /// Number of headers in the log
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Append `header` under the key of `node` and move the checkpoint to it
    ///
    /// Both writes land in one transaction: either the header and the new
    /// checkpoint are visible together, or neither is.
    pub fn commit(&self, node: &BlockNode, header: &SignedHeader) -> Result<()> {
        let key = ordering_key(node);
        let header_record = encode_header(header);
        let state_record = encode_state(&node.hash, node.height);

        let result: TransactionResult<(), ()> =
            (&self.headers, &self.meta).transaction(|(headers, meta)| {
                headers.insert(&key[..], &header_record[..])?;
                meta.insert(STATE_KEY, &state_record[..])?;
                Ok(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(()) => ChainError::Transaction("commit aborted".to_string()),
            TransactionError::Storage(e) => ChainError::Store(e),
        })?;

        self.flush()
    }

    /// Replay the header log into `index`
    ///
    /// The first record must be a valid genesis hanging off `root_hash`.
    /// Every later record is verified and linked to the record before it
    /// when that is its parent, otherwise to a parent already indexed.
    /// Returns the number of replayed headers.
    pub fn rebuild_index(&self, index: &BlockIndex, root_hash: &BlockHash) -> Result<usize> {
        let mut last: Option<(NodeId, BlockNode)> = None;
        let mut count = 0;

        for entry in self.headers.iter() {
            let (key, value) = entry?;
            let header = decode_header(&value)?;

            let node = match last {
                None => {
                    header.verify_as_genesis(root_hash)?;
                    BlockNode::genesis(&header)
                }
                Some((last_id, last_node)) if header.parent_hash() == &last_node.hash => {
                    header.verify()?;
                    BlockNode::child_of(&header, last_id, &last_node)
                }
                Some(_) => {
                    let (parent_id, parent) =
                        index.lookup_entry(header.parent_hash()).ok_or(ChainError::ParentNotFound {
                            hash: *header.block_hash(),
                            parent: *header.parent_hash(),
                        })?;
                    header.verify()?;
                    BlockNode::child_of(&header, parent_id, &parent)
                }
            };

            let stored = key_height(&key)?;
            if stored != node.height {
                return Err(ChainError::OrderingKeyMismatch {
                    hash: node.hash,
                    stored,
                    expected: node.height,
                });
            }

            let id = index.add_block(node);
            last = Some((id, node));
            count += 1;
        }

        tracing::info!("Replayed {} headers from chain store", count);

        Ok(count)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
