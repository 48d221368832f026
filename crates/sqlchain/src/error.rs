//! Chain errors

use crate::types::BlockHash;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = ChainError> = std::result::Result<T, E>;

/// Coarse classification of a [`ChainError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or badly signed input
    Validation,
    /// Input that collides with the current chain
    Conflict,
    /// A referenced record does not exist
    NotFound,
    /// Underlying store or transport failure
    Store,
    /// Persisted or wire bytes could not be decoded
    Encoding,
}

/// Chain coordinator errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Invalid genesis block {hash}: {reason}")]
    InvalidGenesis { hash: BlockHash, reason: String },

    #[error("Invalid signature on block {0}")]
    InvalidSignature(BlockHash),

    #[error("Block hash mismatch: computed {computed}, claimed {claimed}")]
    HashMismatch {
        computed: BlockHash,
        claimed: BlockHash,
    },

    #[error("Content digest mismatch on block {0}")]
    DigestMismatch(BlockHash),

    #[error("Invalid producer key on block {0}")]
    InvalidProducerKey(BlockHash),

    #[error("Stored genesis {stored} does not match configured genesis {configured}")]
    GenesisMismatch {
        stored: BlockHash,
        configured: BlockHash,
    },

    #[error("Invalid production period {0:?}")]
    InvalidPeriod(Duration),

    #[error("Timestamp {0} is out of the representable range")]
    TimestampOutOfRange(DateTime<Utc>),

    #[error("Slot of height {0} is out of the representable time range")]
    SlotOutOfRange(i32),

    #[error("Block does not extend the current head")]
    InvalidBlock,

    #[error("Block {0} already exists")]
    BlockExists(BlockHash),

    #[error("Block timestamp {timestamp} is outside the production window [{start}, {end})")]
    BlockTimestampOutOfPeriod {
        timestamp: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Chain store already holds a chain state")]
    AlreadyInitialized,

    #[error("Chain coordinator is stopped")]
    Stopped,

    #[error("Parent {parent} of block {hash} not found")]
    ParentNotFound { hash: BlockHash, parent: BlockHash },

    #[error("Chain state record not found")]
    StateNotFound,

    #[error("Head block {0} not found in index")]
    HeadNotFound(BlockHash),

    #[error("Local private key is not initialized")]
    MissingPrivateKey,

    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Store transaction aborted: {0}")]
    Transaction(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("Malformed {what} record: expected {expected} bytes, got {actual}")]
    Encoding {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Header {hash} stored under key for height {stored}, expected height {expected}")]
    OrderingKeyMismatch {
        hash: BlockHash,
        stored: i32,
        expected: i32,
    },

    #[error("Stored height {stored} does not match head node height {indexed}")]
    HeightMismatch { stored: i32, indexed: i32 },

    #[error("Wire encoding error: {0}")]
    Wire(std::io::Error),
}

impl ChainError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidGenesis { .. }
            | Self::InvalidSignature(_)
            | Self::HashMismatch { .. }
            | Self::DigestMismatch(_)
            | Self::InvalidProducerKey(_)
            | Self::GenesisMismatch { .. }
            | Self::InvalidPeriod(_)
            | Self::TimestampOutOfRange(_)
            | Self::SlotOutOfRange(_) => ErrorKind::Validation,

            Self::InvalidBlock
            | Self::BlockExists(_)
            | Self::BlockTimestampOutOfPeriod { .. }
            | Self::AlreadyInitialized
            | Self::Stopped => ErrorKind::Conflict,

            Self::ParentNotFound { .. }
            | Self::StateNotFound
            | Self::HeadNotFound(_)
            | Self::MissingPrivateKey => ErrorKind::NotFound,

            Self::Store(_) | Self::Transaction(_) | Self::Broadcast(_) => ErrorKind::Store,

            Self::Encoding { .. }
            | Self::OrderingKeyMismatch { .. }
            | Self::HeightMismatch { .. }
            | Self::Wire(_) => ErrorKind::Encoding,
        }
    }
}
