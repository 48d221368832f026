//! Chain runtime clock
//!
//! Tracks the coordinated chain time (wall clock plus a network-derived
//! offset), the production period and the height of the next turn.

use crate::error::{ChainError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::time::Duration;

struct ClockState {
    /// coordinated chain time - local wall clock
    offset: TimeDelta,
    period: TimeDelta,
    /// Genesis timestamp; slot `h` starts at `chain_init_time + h * period`
    chain_init_time: DateTime<Utc>,
    next_height: i32,
}

fn slot_time(init: DateTime<Utc>, period: TimeDelta, height: i32) -> Option<DateTime<Utc>> {
    init.checked_add_signed(period.checked_mul(height)?)
}

/// Slot clock and stop signal of the block producing cycle
pub struct ClockRuntime {
    state: RwLock<ClockState>,
    /// Dropped on stop, which disconnects `stop_rx`
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl ClockRuntime {
    /// Create a clock whose first turn is `next_height`
    pub fn new(period: Duration, chain_init_time: DateTime<Utc>, next_height: i32) -> Result<Self> {
        let delta = TimeDelta::from_std(period).map_err(|_| ChainError::InvalidPeriod(period))?;
        if delta <= TimeDelta::zero() {
            return Err(ChainError::InvalidPeriod(period));
        }
        // Every slot a height can name must be a representable time
        if slot_time(chain_init_time, delta, i32::MAX).is_none() {
            return Err(ChainError::InvalidPeriod(period));
        }

        let (stop_tx, stop_rx) = bounded(0);

        Ok(Self {
            state: RwLock::new(ClockState {
                offset: TimeDelta::zero(),
                period: delta,
                chain_init_time,
                next_height,
            }),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        })
    }

    /// Current coordinated chain time
    pub fn now(&self) -> DateTime<Utc> {
        let offset = self.state.read().offset;
        Utc::now() + offset
    }

    /// Absorb a coordinated time reading from the time-sync collaborator
    pub fn update_time(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.offset = now - Utc::now();
    }

    /// Time until the slot of the next turn begins; non-positive once it has
    pub fn till_next_wake_up(&self) -> Result<TimeDelta> {
        let (wake_up, offset) = {
            let state = self.state.read();
            let wake_up = slot_time(state.chain_init_time, state.period, state.next_height)
                .ok_or(ChainError::SlotOutOfRange(state.next_height))?;
            (wake_up, state.offset)
        };
        Ok(wake_up - (Utc::now() + offset))
    }

    /// Start of the slot for `height`
    pub fn slot_start(&self, height: i32) -> Result<DateTime<Utc>> {
        let state = self.state.read();
        slot_time(state.chain_init_time, state.period, height).ok_or(ChainError::SlotOutOfRange(height))
    }

    pub fn goto_next_turn(&self) {
        let mut state = self.state.write();
        state.next_height = state.next_height.saturating_add(1);
    }

    pub fn next_height(&self) -> i32 {
        self.state.read().next_height
    }

    pub fn period(&self) -> TimeDelta {
        self.state.read().period
    }

    pub fn offset(&self) -> TimeDelta {
        self.state.read().offset
    }

    pub fn chain_init_time(&self) -> DateTime<Utc> {
        self.state.read().chain_init_time
    }

    /// Signal the cycle to stop. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        self.stop_tx.lock().take().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_tx.lock().is_none()
    }

    /// Sleep for `duration` or until stopped. Returns true if stopped.
    pub fn wait(&self, duration: Duration) -> bool {
        match self.stop_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}
