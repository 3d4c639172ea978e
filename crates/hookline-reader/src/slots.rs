//! Handler slot pool bounding delivery concurrency.
//!
//! A handler slot is a unit of delivery capacity identified by a small
//! integer. The pump acquires one slot per received message and the slot is
//! released when that message completes. Released ids go to the back of a
//! FIFO free-list; new ids are minted above the high-water mark only when the
//! free-list is empty.
//!
//! `acquire` is only ever called from the pump loop, `release` from any
//! completion context. The lock around the free-list is held for a handful of
//! instructions and never across an await.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use hookline_core::SlotId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ReaderError, Result};

#[derive(Debug)]
struct SlotState {
    free: VecDeque<SlotId>,
    leased: HashSet<SlotId>,
    high_water: u32,
}

/// Bounded, growable pool of handler slot ids.
#[derive(Debug)]
pub struct HandlerSlotPool {
    state: Mutex<SlotState>,
    released: Notify,
    max_slots: Option<u32>,
    high_water: AtomicU32,
    exercised: AtomicBool,
}

impl HandlerSlotPool {
    /// Creates a pool pre-seeded with ids `1..=initial_slots`.
    ///
    /// `max_slots` caps growth; `None` lets the pool grow without bound.
    pub fn new(initial_slots: u32, max_slots: Option<u32>) -> Self {
        let initial = max_slots.map_or(initial_slots, |cap| initial_slots.min(cap));
        Self {
            state: Mutex::new(SlotState {
                free: (1..=initial).map(SlotId).collect(),
                leased: HashSet::new(),
                high_water: initial,
            }),
            released: Notify::new(),
            max_slots,
            high_water: AtomicU32::new(initial),
            exercised: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a slot without waiting.
    ///
    /// Pops the oldest free id, or mints `high_water + 1` when the free-list
    /// is empty. Returns `None` only when the pool is at its cap with every
    /// slot leased.
    pub fn try_acquire(&self) -> Option<SlotId> {
        let mut state = self.lock();

        let slot = match state.free.pop_front() {
            Some(slot) => slot,
            None => {
                if self.max_slots.is_some_and(|cap| state.high_water >= cap) {
                    return None;
                }
                state.high_water += 1;
                self.high_water.store(state.high_water, Ordering::Release);
                debug!(slot = state.high_water, "minted new handler slot");
                SlotId(state.high_water)
            },
        };

        state.leased.insert(slot);
        drop(state);

        self.exercised.store(true, Ordering::Release);
        Some(slot)
    }

    /// Takes a slot, waiting for a release while the pool is at its cap.
    ///
    /// # Errors
    ///
    /// Returns `ReaderError::Cancelled` if cancellation is requested while
    /// waiting.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<SlotId> {
        loop {
            if let Some(slot) = self.try_acquire() {
                return Ok(slot);
            }

            debug!(max_slots = ?self.max_slots, "handler slots exhausted, waiting for release");

            tokio::select! {
                () = self.released.notified() => {},
                () = cancel.cancelled() => return Err(ReaderError::Cancelled),
            }
        }
    }

    /// Returns a slot to the free-list.
    ///
    /// Returns `false`, and leaves the pool untouched, if the id is not
    /// currently leased.
    pub fn release(&self, slot: SlotId) -> bool {
        let mut state = self.lock();
        if !state.leased.remove(&slot) {
            drop(state);
            warn!(slot = %slot, "ignoring release of handler slot that is not leased");
            return false;
        }
        state.free.push_back(slot);
        drop(state);

        self.released.notify_one();
        true
    }

    /// Highest id minted so far, including pre-seeded ids.
    pub fn high_water(&self) -> u32 {
        self.high_water.load(Ordering::Acquire)
    }

    /// High-water mark for reporting: zero until the first acquisition.
    pub fn reported_high_water(&self) -> u32 {
        if self.exercised.load(Ordering::Acquire) {
            self.high_water()
        } else {
            0
        }
    }

    /// Number of slots currently leased.
    pub fn leased(&self) -> usize {
        self.lock().leased.len()
    }

    /// Number of ids waiting on the free-list.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Configured growth cap.
    pub fn max_slots(&self) -> Option<u32> {
        self.max_slots
    }
}
