//! Core types for the chain: hashes, signed headers, blocks and chain state

use crate::block_index::NodeId;
use crate::error::{ChainError, Result};
use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;

/// Size of a block hash in bytes
pub const HASH_SIZE: usize = 32;

/// Size of a producer public key in bytes
pub const PRODUCER_KEY_SIZE: usize = 32;

/// Size of an ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Content-derived 32-byte block identifier
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    /// Placeholder root hash
    pub const ZERO: Self = Self([0u8; HASH_SIZE]);

    /// Hash arbitrary bytes with blake3
    pub fn digest(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for BlockHash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

/// Convert a timestamp to nanoseconds since the unix epoch
pub(crate) fn timestamp_nanos(timestamp: DateTime<Utc>) -> Result<i64> {
    timestamp
        .timestamp_nanos_opt()
        .ok_or(ChainError::TimestampOutOfRange(timestamp))
}

/// Block header signed by its producer
///
/// The header is immutable once signed. `block_hash` commits to the parent,
/// timestamp, content digest and producer; the signature covers `block_hash`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedHeader {
    pub(crate) parent_hash: BlockHash,
    /// Production time in nanoseconds since the unix epoch
    pub(crate) timestamp: i64,
    pub(crate) content_digest: BlockHash,
    pub(crate) producer: [u8; PRODUCER_KEY_SIZE],
    pub(crate) block_hash: BlockHash,
    pub(crate) signature: [u8; SIGNATURE_SIZE],
}

impl SignedHeader {
    /// Build and sign a header over `payload`
    pub fn sign(
        parent_hash: BlockHash,
        timestamp: DateTime<Utc>,
        payload: &[u8],
        key: &SigningKey,
    ) -> Result<Self> {
        let timestamp = timestamp_nanos(timestamp)?;
        let content_digest = BlockHash::digest(payload);
        let producer = key.verifying_key().to_bytes();
        let block_hash = Self::compute_hash(&parent_hash, timestamp, &content_digest, &producer);
        let signature = key.sign(block_hash.as_bytes()).to_bytes();

        Ok(Self {
            parent_hash,
            timestamp,
            content_digest,
            producer,
            block_hash,
            signature,
        })
    }

    /// Compute the block hash of the signed fields
    pub fn compute_hash(
        parent_hash: &BlockHash,
        timestamp: i64,
        content_digest: &BlockHash,
        producer: &[u8; PRODUCER_KEY_SIZE],
    ) -> BlockHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(parent_hash.as_bytes());
        hasher.update(&timestamp.to_be_bytes());
        hasher.update(content_digest.as_bytes());
        hasher.update(producer);

        BlockHash(*hasher.finalize().as_bytes())
    }

    /// Verify hash integrity and the producer signature
    pub fn verify(&self) -> Result<()> {
        let computed = Self::compute_hash(
            &self.parent_hash,
            self.timestamp,
            &self.content_digest,
            &self.producer,
        );
        if computed != self.block_hash {
            return Err(ChainError::HashMismatch {
                computed,
                claimed: self.block_hash,
            });
        }

        let key = VerifyingKey::from_bytes(&self.producer)
            .map_err(|_| ChainError::InvalidProducerKey(self.block_hash))?;
        let signature = Signature::from_bytes(&self.signature);

        key.verify(self.block_hash.as_bytes(), &signature)
            .map_err(|_| ChainError::InvalidSignature(self.block_hash))
    }

    /// Verify this header as the root of a chain hanging off `root_hash`
    pub fn verify_as_genesis(&self, root_hash: &BlockHash) -> Result<()> {
        if self.parent_hash != *root_hash {
            return Err(ChainError::InvalidGenesis {
                hash: self.block_hash,
                reason: format!("parent {} is not the root hash {}", self.parent_hash, root_hash),
            });
        }

        self.verify().map_err(|e| ChainError::InvalidGenesis {
            hash: self.block_hash,
            reason: e.to_string(),
        })
    }

    pub fn parent_hash(&self) -> &BlockHash {
        &self.parent_hash
    }

    pub fn block_hash(&self) -> &BlockHash {
        &self.block_hash
    }

    pub fn content_digest(&self) -> &BlockHash {
        &self.content_digest
    }

    pub fn producer(&self) -> &[u8; PRODUCER_KEY_SIZE] {
        &self.producer
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signature
    }

    /// Production time
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp)
    }

    /// Production time in nanoseconds since the unix epoch
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
    }
}

/// A signed header plus its opaque payload
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub(crate) header: SignedHeader,
    pub(crate) payload: Vec<u8>,
}

impl Block {
    /// Build and sign a block over `payload`
    pub fn sign(
        parent_hash: BlockHash,
        timestamp: DateTime<Utc>,
        payload: Vec<u8>,
        key: &SigningKey,
    ) -> Result<Self> {
        let header = SignedHeader::sign(parent_hash, timestamp, &payload, key)?;
        Ok(Self { header, payload })
    }

    /// Build a genesis block with an empty payload
    pub fn genesis(root_hash: BlockHash, timestamp: DateTime<Utc>, key: &SigningKey) -> Result<Self> {
        Self::sign(root_hash, timestamp, Vec::new(), key)
    }

    /// Verify the header and that it commits to the payload
    pub fn verify(&self) -> Result<()> {
        self.header.verify()?;
        self.verify_digest()
    }

    /// Verify this block as the genesis of a chain hanging off `root_hash`
    pub fn verify_as_genesis(&self, root_hash: &BlockHash) -> Result<()> {
        self.header.verify_as_genesis(root_hash)?;
        self.verify_digest()
            .map_err(|e| ChainError::InvalidGenesis {
                hash: self.header.block_hash,
                reason: e.to_string(),
            })
    }

    fn verify_digest(&self) -> Result<()> {
        if BlockHash::digest(&self.payload) != self.header.content_digest {
            return Err(ChainError::DigestMismatch(self.header.block_hash));
        }
        Ok(())
    }

    pub fn header(&self) -> &SignedHeader {
        &self.header
    }

    pub fn hash(&self) -> &BlockHash {
        &self.header.block_hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        borsh::to_vec(self).map_err(ChainError::Wire)
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        borsh::from_slice(data).map_err(ChainError::Wire)
    }
}

/// Snapshot of the canonical tip
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainState {
    /// Hash of the head block, or the root placeholder before genesis
    pub head: BlockHash,
    /// Height of the head block, -1 before genesis
    pub height: i32,
    /// Arena slot of the head node
    pub node: Option<NodeId>,
}

impl ChainState {
    /// State before genesis is accepted
    pub fn before_genesis(root_hash: BlockHash) -> Self {
        Self {
            head: root_hash,
            height: -1,
            node: None,
        }
    }
}
