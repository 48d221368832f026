//! Chain Coordinator - block admission and slot-timed production
//!
//! Blocks enter the chain through [`ChainCoordinator::push_block`], either
//! from the admission pipeline ([`ChainRpcServer::advise_new_block`]) or as
//! the genesis at initialization. All chain mutation happens under one
//! mutex held across the whole check-commit-apply sequence, so the
//! scheduling thread and inbound network threads never both extend the
//! same head.

use crate::block_index::{BlockIndex, BlockNode};
use crate::capability::Capabilities;
use crate::error::{ChainError, Result};
use crate::persistence::ChainStore;
use crate::runtime::ClockRuntime;
use crate::types::{Block, BlockHash, ChainState, SignedHeader};
use crate::{MAX_PAYLOADS_PER_BLOCK, MAX_PENDING_PAYLOADS};
use chrono::TimeDelta;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Network-facing admission interface
pub trait ChainRpcServer {
    fn advise_new_block(&self, block: &Block) -> Result<()>;
}

/// Chain configuration
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Directory of the chain store
    pub data_dir: PathBuf,
    /// Length of one production slot
    pub period: Duration,
    /// Genesis block; its timestamp is the origin of the slot clock
    pub genesis: Block,
    /// Placeholder head before genesis; the genesis parent must equal it
    pub root_hash: BlockHash,
}

impl ChainConfig {
    pub fn new(data_dir: impl Into<PathBuf>, period: Duration, genesis: Block) -> Self {
        Self {
            data_dir: data_dir.into(),
            period,
            genesis,
            root_hash: BlockHash::ZERO,
        }
    }

    pub fn with_root_hash(mut self, root_hash: BlockHash) -> Self {
        self.root_hash = root_hash;
        self
    }
}

/// Coordinator lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Stopped,
}

/// Handle for submitting payload records to local production
#[derive(Clone)]
pub struct PayloadSender {
    sender: Sender<Vec<u8>>,
}

impl PayloadSender {
    /// Queue a payload record for the next produced block
    pub fn send(&self, payload: Vec<u8>) -> std::result::Result<(), String> {
        self.sender
            .try_send(payload)
            .map_err(|e| format!("Failed to submit payload: {}", e))
    }
}

/// Chain coordinator
pub struct ChainCoordinator {
    config: ChainConfig,
    store: ChainStore,
    index: BlockIndex,
    clock: ClockRuntime,
    /// Canonical tip; held across every chain mutation
    state: Mutex<ChainState>,
    lifecycle: RwLock<Lifecycle>,
    capabilities: Capabilities,
    payload_tx: Sender<Vec<u8>>,
    payload_rx: Receiver<Vec<u8>>,
}

impl ChainCoordinator {
    /// Create a fresh chain whose first block is the configured genesis
    pub fn initialize(config: ChainConfig, capabilities: Capabilities) -> Result<Self> {
        config.genesis.verify_as_genesis(&config.root_hash)?;
        let store = ChainStore::open(&config.data_dir)?;
        Self::initialize_with(config, store, capabilities)
    }

    /// Rebuild the chain from an existing store
    pub fn restore(config: ChainConfig, capabilities: Capabilities) -> Result<Self> {
        let store = ChainStore::open(&config.data_dir)?;
        Self::restore_with(config, store, capabilities)
    }

    /// Restore when the store holds a chain, initialize otherwise
    pub fn open(config: ChainConfig, capabilities: Capabilities) -> Result<Self> {
        let store = ChainStore::open(&config.data_dir)?;
        if store.has_state()? {
            Self::restore_with(config, store, capabilities)
        } else {
            config.genesis.verify_as_genesis(&config.root_hash)?;
            Self::initialize_with(config, store, capabilities)
        }
    }

    fn initialize_with(config: ChainConfig, store: ChainStore, capabilities: Capabilities) -> Result<Self> {
        if store.has_state()? {
            return Err(ChainError::AlreadyInitialized);
        }

        let genesis = config.genesis.header().clone();
        let state = ChainState::before_genesis(config.root_hash);
        let chain = Self::assemble(config, store, BlockIndex::new(), state, 1, capabilities)?;
        {
            let mut state = chain.state.lock();
            chain.push_locked(&mut state, &genesis)?;
        }
        chain.activate();

        tracing::info!("Initialized chain with genesis {}", genesis.block_hash());

        Ok(chain)
    }

    fn restore_with(config: ChainConfig, store: ChainStore, capabilities: Capabilities) -> Result<Self> {
        let index = BlockIndex::new();
        store.rebuild_index(&index, &config.root_hash)?;

        let (node_id, node) = store.load_head(&index)?;
        let (head, height) = (node.hash, node.height);

        let configured = *config.genesis.hash();
        let stored = index.genesis().map(|g| g.hash).unwrap_or(head);
        if stored != configured {
            return Err(ChainError::GenesisMismatch { stored, configured });
        }

        let state = ChainState {
            head,
            height,
            node: Some(node_id),
        };
        let chain = Self::assemble(config, store, index, state, height + 1, capabilities)?;
        chain.activate();

        tracing::info!(
            "Restored chain at height {} (head {}, {} blocks)",
            height,
            head,
            chain.index.len()
        );

        Ok(chain)
    }

    fn assemble(
        config: ChainConfig,
        store: ChainStore,
        index: BlockIndex,
        state: ChainState,
        next_height: i32,
        capabilities: Capabilities,
    ) -> Result<Self> {
        let clock = ClockRuntime::new(config.period, config.genesis.header().timestamp(), next_height)?;
        let (payload_tx, payload_rx) = bounded(MAX_PENDING_PAYLOADS);

        Ok(Self {
            config,
            store,
            index,
            clock,
            state: Mutex::new(state),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            capabilities,
            payload_tx,
            payload_rx,
        })
    }

    fn activate(&self) {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == Lifecycle::Uninitialized {
            *lifecycle = Lifecycle::Active;
        }
    }

    fn ensure_active(&self) -> Result<()> {
        match *self.lifecycle.read() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Uninitialized | Lifecycle::Stopped => Err(ChainError::Stopped),
        }
    }

    /// Extend the current head with `header`
    pub fn push_block(&self, header: &SignedHeader) -> Result<()> {
        self.ensure_active()?;
        let mut state = self.state.lock();
        self.push_locked(&mut state, header)
    }

    fn push_locked(&self, state: &mut ChainState, header: &SignedHeader) -> Result<()> {
        // Pushed block must extend the best chain
        if *header.parent_hash() != state.head {
            tracing::debug!(
                "Rejected block {}: parent {} is not head {}",
                header.block_hash(),
                header.parent_hash(),
                state.head
            );
            return Err(ChainError::InvalidBlock);
        }
        if self.index.has_block(header.block_hash()) {
            return Err(ChainError::BlockExists(*header.block_hash()));
        }

        let node = match state.node {
            Some(parent_id) => {
                let parent = self
                    .index
                    .node(parent_id)
                    .ok_or(ChainError::HeadNotFound(state.head))?;
                BlockNode::child_of(header, parent_id, &parent)
            }
            None => BlockNode::genesis(header),
        };

        // Memory is only touched once the store has committed
        self.store.commit(&node, header)?;
        let id = self.index.add_block(node);
        *state = ChainState {
            head: node.hash,
            height: node.height,
            node: Some(id),
        };

        tracing::debug!("Accepted block {} at height {}", node.hash, node.height);

        Ok(())
    }

    /// Whether the local node owns the next turn
    pub fn is_my_turn(&self) -> bool {
        self.capabilities.rotation.is_my_turn(self.clock.next_height())
    }

    /// Sign the pending payload on top of the current head
    ///
    /// The block is returned for broadcast; it is not pushed locally.
    pub fn produce_block(&self) -> Result<Block> {
        self.produce_with_records().map(|(block, _)| block)
    }

    fn produce_with_records(&self) -> Result<(Block, Vec<Vec<u8>>)> {
        let key = self.capabilities.keys.local_private_key()?;
        let records = self.drain_pending();
        let payload = borsh::to_vec(&records).map_err(ChainError::Wire)?;
        let parent = self.state.lock().head;

        let block = Block::sign(parent, self.clock.now(), payload, &key)?;
        Ok((block, records))
    }

    fn drain_pending(&self) -> Vec<Vec<u8>> {
        let mut records = Vec::new();

        while records.len() < MAX_PAYLOADS_PER_BLOCK {
            match self.payload_rx.try_recv() {
                Ok(record) => records.push(record),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        records
    }

    /// Put records of a dropped block back at the end of the pending queue
    fn requeue(&self, records: Vec<Vec<u8>>) {
        let total = records.len();
        let mut lost = 0;

        for record in records {
            if self.payload_tx.try_send(record).is_err() {
                lost += 1;
            }
        }

        if lost > 0 {
            tracing::error!("Pending queue full: lost {} of {} requeued payload records", lost, total);
        }
    }

    /// One production turn: produce, then hand the block to the broadcaster
    ///
    /// A turn whose slot already ended is skipped without touching the
    /// pending queue. A block finished after its slot ended is dropped
    /// instead of broadcast, and its records are requeued.
    fn cycle(&self) -> Result<()> {
        let height = self.clock.next_height();
        let deadline = self.clock.slot_start(height + 1)?;

        if self.clock.now() >= deadline {
            tracing::warn!("Skipped turn at height {}: slot ended at {}", height, deadline);
            return Ok(());
        }

        let (block, records) = self.produce_with_records()?;

        if self.clock.now() >= deadline {
            tracing::warn!(
                "Dropped block {} for height {}: produced after slot end {}",
                block.hash(),
                height,
                deadline
            );
            self.requeue(records);
            return Ok(());
        }

        self.capabilities.broadcaster.broadcast(&block)?;

        tracing::debug!("Produced block {} for height {}", block.hash(), height);

        Ok(())
    }

    /// Run the block producing cycle (blocking)
    ///
    /// This should be run on a dedicated thread. Any production error stops
    /// the cycle for good.
    pub fn block_producing_cycle(&self) {
        tracing::info!(
            "Block producing cycle started (next height {}, {}ms slots)",
            self.clock.next_height(),
            self.clock.period().num_milliseconds()
        );

        while !self.clock.is_stopped() {
            let till = match self.clock.till_next_wake_up() {
                Ok(till) => till,
                Err(e) => {
                    tracing::error!("Cannot schedule height {}: {}", self.clock.next_height(), e);
                    self.stop();
                    break;
                }
            };
            if till > TimeDelta::zero() {
                if let Ok(duration) = till.to_std() {
                    self.clock.wait(duration);
                }
                continue;
            }

            if self.is_my_turn() {
                if let Err(e) = self.cycle() {
                    tracing::error!(
                        "Block production failed at height {}: {}",
                        self.clock.next_height(),
                        e
                    );
                    self.stop();
                    break;
                }
            }

            self.clock.goto_next_turn();
        }

        tracing::info!("Block producing cycle stopped at height {}", self.height());
    }

    /// Run the block producing cycle on a dedicated thread
    pub fn spawn_block_producing_cycle(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let chain = Arc::clone(self);
        std::thread::Builder::new()
            .name("sqlchain-producer".to_string())
            .spawn(move || chain.block_producing_cycle())
    }

    /// Stop the coordinator. Safe to call more than once.
    pub fn stop(&self) {
        if self.clock.stop() {
            *self.lifecycle.write() = Lifecycle::Stopped;
            tracing::info!("Chain coordinator stopped");
        }
    }

    /// Whether the admission window of the next height has already closed
    ///
    /// Windows follow the head height and slots are never skipped, so no
    /// block can be admitted once this holds.
    pub fn next_slot_missed(&self) -> Result<bool> {
        let end = self.clock.slot_start(self.height() + 2)?;
        Ok(self.clock.now() >= end)
    }

    /// Get a sender for submitting payload records
    pub fn payload_sender(&self) -> PayloadSender {
        PayloadSender {
            sender: self.payload_tx.clone(),
        }
    }

    pub fn state(&self) -> ChainState {
        *self.state.lock()
    }

    pub fn height(&self) -> i32 {
        self.state.lock().height
    }

    pub fn head(&self) -> BlockHash {
        self.state.lock().head
    }

    pub fn has_block(&self, hash: &BlockHash) -> bool {
        self.index.has_block(hash)
    }

    pub fn lookup_node(&self, hash: &BlockHash) -> Option<BlockNode> {
        self.index.lookup_node(hash)
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn clock(&self) -> &ClockRuntime {
        &self.clock
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }
}

impl ChainRpcServer for ChainCoordinator {
    fn advise_new_block(&self, block: &Block) -> Result<()> {
        self.ensure_active()?;
        let mut state = self.state.lock();

        // Check block existence
        let hash = *block.hash();
        if self.index.has_block(&hash) {
            tracing::debug!("Rejected block {}: already exists", hash);
            return Err(ChainError::BlockExists(hash));
        }

        // Verify block producing time
        let height = state.height + 1;
        let start = self.clock.slot_start(height)?;
        let end = self.clock.slot_start(height + 1)?;
        let timestamp = block.header().timestamp();
        if timestamp < start || timestamp >= end {
            tracing::debug!(
                "Rejected block {}: timestamp {} outside slot of height {}",
                hash,
                timestamp,
                height
            );
            return Err(ChainError::BlockTimestampOutOfPeriod { timestamp, start, end });
        }

        // Verify block signatures
        block.verify()?;

        self.push_locked(&mut state, block.header())
    }
}

impl Drop for ChainCoordinator {
    fn drop(&mut self) {
        self.clock.stop();
        if let Err(e) = self.store.flush() {
            tracing::error!("Failed to flush chain store: {}", e);
        }
    }
}
