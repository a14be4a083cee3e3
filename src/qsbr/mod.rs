//! # Quiescent-State Based Reclamation
//!
//! A writer that retires a shared structure must wait until every reader
//! that could still observe it has moved on. Readers announce progress by
//! storing a monotonically increasing version into their registration
//! ("the safe point"); a writer's [`Qsbr::wait`] returns once every
//! registered reader has either stored a version at or past the target,
//! parked itself, or unregistered.
//!
//! ## Design Overview
//!
//! Registrations are sharded into fixed-capacity, open-addressed tables
//! keyed by a hash of the registration's address. Reader-side operations
//! (`update`, `park`, `resume`) are a single atomic store on the reader's
//! own state word and never touch the shard tables. A per-shard mutex
//! serialises `wait`'s scan against concurrent register/unregister, so the
//! scan observes a consistent slot set without blocking readers.
//!
//! Parking stores the maximum version, which satisfies any wait target —
//! the parked reader promises it holds no references that a version
//! transition needs to invalidate.
//!
//! ## Guarantees
//!
//! - `wait(t)` returns only after every registration present at any point
//!   during the wait has stored `qstate >= t`, parked, or unregistered.
//! - Reader-side operations are wait-free.
//! - Registration fails with [`QsbrError::CapacityExceeded`] only when a
//!   shard is full; the default geometry supports thousands of concurrent
//!   registrations.

#[cfg(test)]
mod tests;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Number of registration shards (power of two).
const QSBR_SHARDS: usize = 64;

/// Registration slots per shard.
const QSBR_SHARD_CAPACITY: usize = 64;

/// Sentinel state of a parked registration; satisfies every wait target.
const QSTATE_PARKED: u64 = u64::MAX;

/// Backoff between wait scans.
const WAIT_BACKOFF: Duration = Duration::from_micros(50);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Qsbr`] operations.
#[derive(Debug, Error)]
pub enum QsbrError {
    /// The shard selected for this registration has no free slot.
    #[error("registration shard full ({0} slots)")]
    CapacityExceeded(usize),
}

// ------------------------------------------------------------------------------------------------
// Registration state
// ------------------------------------------------------------------------------------------------

/// Shared state of one registration: the reader-owned version word.
#[derive(Debug)]
struct QsbrState {
    /// Latest version this reader has announced, or [`QSTATE_PARKED`].
    qstate: AtomicU64,

    /// Version in effect when the reader parked, restored by `resume`.
    parked_from: AtomicU64,
}

/// A reader's registration with a [`Qsbr`] domain.
///
/// The handle is owned by exactly one reader; all methods take `&self`
/// but are intended for the owning thread. Dropping the handle
/// unregisters it.
#[derive(Debug)]
pub struct QsbrHandle {
    qsbr: Qsbr,
    state: Arc<QsbrState>,
    shard: usize,
}

impl QsbrHandle {
    /// Announces that this reader has reached the safe point for `version`.
    #[inline]
    pub fn update(&self, version: u64) {
        self.state.qstate.store(version, Ordering::Release);
    }

    /// Marks this reader temporarily quiescent.
    ///
    /// Equivalent to storing an infinite version: no wait will block on a
    /// parked reader.
    #[inline]
    pub fn park(&self) {
        let prev = self.state.qstate.load(Ordering::Relaxed);
        self.state.parked_from.store(prev, Ordering::Relaxed);
        self.state.qstate.store(QSTATE_PARKED, Ordering::Release);
    }

    /// Reinstates a parked reader at the version it parked from.
    #[inline]
    pub fn resume(&self) {
        let prev = self.state.parked_from.load(Ordering::Relaxed);
        self.state.qstate.store(prev, Ordering::Release);
    }

    /// The version this reader last announced.
    #[inline]
    pub fn qstate(&self) -> u64 {
        self.state.qstate.load(Ordering::Acquire)
    }
}

impl Drop for QsbrHandle {
    fn drop(&mut self) {
        self.qsbr.unregister_state(self.shard, &self.state);
    }
}

// ------------------------------------------------------------------------------------------------
// Shards
// ------------------------------------------------------------------------------------------------

/// One open-addressed registration table.
#[derive(Debug)]
struct Shard {
    slots: Mutex<Vec<Option<Arc<QsbrState>>>>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Qsbr Core
// ------------------------------------------------------------------------------------------------

/// A reclamation domain: a set of registered readers and the writer-side
/// wait primitive. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Qsbr {
    inner: Arc<QsbrInner>,
}

#[derive(Debug)]
struct QsbrInner {
    shards: Vec<Shard>,
}

impl Qsbr {
    /// Creates a reclamation domain with the default geometry.
    pub fn new() -> Qsbr {
        Self::with_geometry(QSBR_SHARDS, QSBR_SHARD_CAPACITY)
    }

    /// Creates a domain with an explicit shard count and capacity.
    ///
    /// `shards` must be a power of two.
    pub(crate) fn with_geometry(shards: usize, capacity: usize) -> Qsbr {
        debug_assert!(shards.is_power_of_two());
        Qsbr {
            inner: Arc::new(QsbrInner {
                shards: (0..shards).map(|_| Shard::new(capacity)).collect(),
            }),
        }
    }

    /// Registers a new reader, starting at version 0.
    pub fn register(&self) -> Result<QsbrHandle, QsbrError> {
        let state = Arc::new(QsbrState {
            qstate: AtomicU64::new(0),
            parked_from: AtomicU64::new(0),
        });

        let shard_idx = self.shard_of(&state);
        let mut slots = lock_slots(&self.inner.shards[shard_idx]);
        let capacity = slots.len();

        let preferred = Self::slot_hash(&state) % capacity;
        for probe in 0..capacity {
            let idx = (preferred + probe) % capacity;
            if slots[idx].is_none() {
                slots[idx] = Some(Arc::clone(&state));
                trace!(shard = shard_idx, slot = idx, "qsbr reader registered");
                return Ok(QsbrHandle {
                    qsbr: self.clone(),
                    state,
                    shard: shard_idx,
                });
            }
        }

        Err(QsbrError::CapacityExceeded(capacity))
    }

    /// Blocks until every registered reader has announced `qstate >=
    /// target`, parked, or unregistered.
    pub fn wait(&self, target: u64) {
        for (shard_idx, shard) in self.inner.shards.iter().enumerate() {
            loop {
                let pending = {
                    let slots = lock_slots(shard);
                    slots.iter().flatten().any(|state| {
                        let q = state.qstate.load(Ordering::Acquire);
                        q < target
                    })
                };
                if !pending {
                    break;
                }
                trace!(shard = shard_idx, target, "qsbr wait spinning");
                std::thread::sleep(WAIT_BACKOFF);
            }
        }
    }

    fn unregister_state(&self, shard_idx: usize, state: &Arc<QsbrState>) {
        let mut slots = lock_slots(&self.inner.shards[shard_idx]);
        for slot in slots.iter_mut() {
            if let Some(existing) = slot
                && Arc::ptr_eq(existing, state)
            {
                *slot = None;
                return;
            }
        }
        // A handle always occupies the slot it registered into.
        unreachable!("unregistering a qsbr handle that is not registered");
    }

    /// Shard index for a registration, by address hash.
    fn shard_of(&self, state: &Arc<QsbrState>) -> usize {
        Self::slot_hash(state) & (self.inner.shards.len() - 1)
    }

    /// Fibonacci-mixed address hash; the low bits of an allocator address
    /// are too regular to use directly.
    fn slot_hash(state: &Arc<QsbrState>) -> usize {
        let addr = Arc::as_ptr(state) as usize;
        addr.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 16
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a shard's slot table, recovering from a poisoned mutex.
///
/// A panic inside the lock can only leave the table with a stale
/// registration, which wait treats conservatively, so continuing is safe.
fn lock_slots(shard: &Shard) -> std::sync::MutexGuard<'_, Vec<Option<Arc<QsbrState>>>> {
    shard.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
