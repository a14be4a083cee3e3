//! # Store Core
//!
//! The top-level object tying the components together: the two
//! memtables and their view ring, the write-ahead log, the quiescence
//! domain, the zone tier, and the compaction worker.
//!
//! ## Data flow
//!
//! - *Writes* append the encoded record to the WAL and merge it into the
//!   writable memtable. Both effects commit inside the memtable's merge
//!   callback while holding the store's write mutex — only the log copy
//!   and the byte accounting happen under it; disk I/O is queued
//!   asynchronously.
//! - *Reads* consult the writable memtable, then the immutable memtable
//!   if the view has one, then the zone snapshot. Each layer answers
//!   authoritatively when it holds the key, tombstones included.
//! - *Iteration* merges all layers of the view seen at seek time,
//!   hiding tombstones.
//! - *Compaction* fires when the memtable or WAL hits its cap: the view
//!   advances, the sealed memtable flows into the zone, rejected keys
//!   re-enter the write path, and the old log is truncated.
//!
//! ## View ring
//!
//! ```text
//!   V0 = { w: A }          V1 = { w: B, i: A }
//!   V3 = { w: A, i: B }    V2 = { w: B }
//! ```
//!
//! `cur_view` cycles V0→V1→V2→V3→V0, advanced only by the compaction
//! worker under the write mutex; the store version increments with every
//! advance. Every reference re-reads the version at the top of each
//! operation and swaps its memtable references and zone snapshot when it
//! moved (the version, unlike the ring pointer, cannot repeat). Two
//! quiescence waits per rotation bracket the sealed table's lifetime:
//! one before compaction reads it, one before it is cleaned for reuse.

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::index::{IndexError, IndexRef, MergeUpdate, TrieIndex};
use crate::kv::{KeyRef, Record, decode_wire};
use crate::merge::{MergeIter, OrderedIter, TombstoneFilter};
use crate::qsbr::{Qsbr, QsbrError, QsbrHandle};
use crate::wal::{WAL_HEADER_SIZE, Wal, WalError};
use crate::zone::tier::{RunTier, TierConfig};
use crate::zone::{Anchor, ZoneError, ZoneManager, ZoneSnapshot};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Rejected bytes threshold is the memtable cap shifted by this.
const REJECT_SIZE_SHIFT: u32 = 4;

/// Compaction trigger poll interval; also the writer stall interval.
const FULL_POLL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error from the zone tier.
    #[error("zone error: {0}")]
    Zone(#[from] ZoneError),

    /// Error from the memtable index.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Too many concurrent references.
    #[error("qsbr error: {0}")]
    Qsbr(#[from] QsbrError),

    /// On-disk state failed validation during recovery.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Store configuration. Field names follow the open parameters of the
/// public API.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Block cache budget in MiB. The built-in tier reads through the
    /// OS page cache, so this is advisory.
    pub cache_mb: usize,

    /// Memtable byte cap in MiB; reaching it triggers compaction.
    pub memtable_mb: usize,

    /// WAL byte cap in MiB; reaching it also triggers compaction.
    pub wal_mb: usize,

    /// Derive short partition anchors in the tier.
    pub compact_keys: bool,

    /// Build per-run bloom filters ("tags") for fast negative point
    /// lookups.
    pub tags: bool,

    /// Compaction worker threads. The built-in tier compacts on the
    /// single orchestrator thread; kept for interface compatibility.
    pub workers: u32,

    /// Target size of one rewritten run file.
    pub run_target_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_mb: 256,
            memtable_mb: 64,
            wal_mb: 128,
            compact_keys: true,
            tags: true,
            workers: 4,
            run_target_bytes: crate::zone::tier::DEFAULT_RUN_TARGET_BYTES,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Views
// ------------------------------------------------------------------------------------------------

/// One state of the memtable pair: which instance is writable, which (if
/// any) is sealed.
struct View {
    wmt: usize,
    imt: Option<usize>,
    next: usize,
}

/// The four-state ring. Only the compaction worker advances it.
const VIEWS: [View; 4] = [
    View {
        wmt: 0,
        imt: None,
        next: 1,
    },
    View {
        wmt: 1,
        imt: Some(0),
        next: 2,
    },
    View {
        wmt: 1,
        imt: None,
        next: 3,
    },
    View {
        wmt: 0,
        imt: Some(1),
        next: 0,
    },
];

// ------------------------------------------------------------------------------------------------
// Inner state
// ------------------------------------------------------------------------------------------------

/// State mutated under the store's write mutex.
struct WriteState {
    wal: Wal,
    /// Bytes of live records in the current writable memtable.
    mtsz: u64,
}

struct StoreInner {
    /// Index into [`VIEWS`] of the active view.
    cur_view: AtomicUsize,

    /// Store version: the quiescence epoch, bumped on every view
    /// advance.
    version: AtomicU64,

    write: Mutex<WriteState>,

    /// The two memtable instances; views name them by index.
    mts: [TrieIndex; 2],

    qsbr: Qsbr,
    zone: Arc<dyn ZoneManager>,
    running: AtomicBool,

    max_mtsz: u64,
    max_rejsz: u64,
}

impl StoreInner {
    fn wstate(&self) -> MutexGuard<'_, WriteState> {
        self.write
            .lock()
            .unwrap_or_else(|_| panic!("store write mutex poisoned"))
    }

    /// Whether writers must stall and the compactor must run.
    fn mt_wal_full(&self) -> bool {
        let ws = self.wstate();
        ws.mtsz >= self.max_mtsz || ws.wal.is_full()
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

/// An open store. Obtain per-thread [`StoreRef`]s for all data access.
pub struct Store {
    inner: Arc<StoreInner>,
    worker: Option<JoinHandle<()>>,
}

impl Store {
    /// Opens (creating as needed) a store under `dir`.
    ///
    /// Replays whatever the write-ahead logs hold from the previous run
    /// and starts the compaction worker.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Store, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let zone: Arc<dyn ZoneManager> = RunTier::open(
            dir,
            TierConfig {
                run_target_bytes: config.run_target_bytes,
                compact_keys: config.compact_keys,
                tags: config.tags,
            },
        )?;

        let max_mtsz = (config.memtable_mb as u64) << 20;
        let max_walsz = (config.wal_mb as u64) << 20;
        if max_mtsz * 2 > max_walsz {
            warn!(
                memtable_mb = config.memtable_mb,
                wal_mb = config.wal_mb,
                "wal cap below twice the memtable cap; rotations will be wal-driven"
            );
        }

        let mts = [TrieIndex::new(), TrieIndex::new()];
        let wal = Wal::open(dir, max_walsz)?;
        let mut ws = WriteState { wal, mtsz: 0 };

        recover(&mut ws, &mts[0], zone.as_ref())?;

        let inner = Arc::new(StoreInner {
            cur_view: AtomicUsize::new(0),
            version: AtomicU64::new(1),
            write: Mutex::new(ws),
            mts,
            qsbr: Qsbr::new(),
            zone,
            running: AtomicBool::new(true),
            max_mtsz,
            max_rejsz: max_mtsz >> REJECT_SIZE_SHIFT,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("trellis-comp".into())
            .spawn(move || compaction_worker(worker_inner))
            .map_err(|e| StoreError::Internal(format!("spawning compaction worker: {e}")))?;

        info!(dir = %dir.display(), "store opened");
        Ok(Store {
            inner,
            worker: Some(worker),
        })
    }

    /// Opens a store with the space-lean preset: short partition
    /// anchors, no bloom filters.
    pub fn open_compact(
        dir: impl AsRef<Path>,
        cache_mb: usize,
        memtable_mb: usize,
    ) -> Result<Store, StoreError> {
        Store::open(
            dir,
            StoreConfig {
                cache_mb,
                memtable_mb,
                wal_mb: memtable_mb * 2,
                compact_keys: true,
                tags: false,
                ..StoreConfig::default()
            },
        )
    }

    /// Registers a reference for the calling thread.
    ///
    /// Every data operation goes through a reference; it carries the
    /// thread's quiescence registration and its view of the memtables
    /// and zone snapshot.
    pub fn make_ref(&self) -> Result<StoreRef, StoreError> {
        StoreRef::new(Arc::clone(&self.inner))
    }

    /// Stops the compaction worker and flushes the log.
    ///
    /// Not safe to call with live references still operating; quiesce
    /// them first.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.shutdown()
            .map_err(|_| StoreError::Internal("compaction worker panicked".into()))?;
        let mut ws = self.inner.wstate();
        ws.wal.flush_sync_wait()?;
        Ok(())
    }

    fn shutdown(&mut self) -> std::thread::Result<()> {
        self.inner.running.store(false, Ordering::Release);
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ------------------------------------------------------------------------------------------------
// StoreRef
// ------------------------------------------------------------------------------------------------

/// A per-thread reference to an open store.
///
/// Holds the thread's quiescence registration plus references to the
/// memtables and the zone snapshot of the view it last observed.
/// Operations refresh those when the store's view pointer has moved.
pub struct StoreRef {
    inner: Arc<StoreInner>,
    qref: QsbrHandle,
    /// Store version at which the references below were acquired. The
    /// view pointer alone cannot detect staleness: after a full ring
    /// cycle it holds its old value again while the zone snapshot has
    /// moved on.
    seen_version: u64,
    wmt_ref: IndexRef,
    imt_ref: Option<IndexRef>,
    snap: Arc<dyn ZoneSnapshot>,
}

impl StoreRef {
    fn new(inner: Arc<StoreInner>) -> Result<StoreRef, StoreError> {
        let qref = inner.qsbr.register()?;
        let seen_version = inner.version.load(Ordering::Acquire);
        let (wmt_ref, imt_ref, snap) = Self::acquire(&inner)?;
        qref.park();
        Ok(StoreRef {
            inner,
            qref,
            seen_version,
            wmt_ref,
            imt_ref,
            snap,
        })
    }

    /// Acquires all per-view resources for the current view.
    fn acquire(
        inner: &Arc<StoreInner>,
    ) -> Result<(IndexRef, Option<IndexRef>, Arc<dyn ZoneSnapshot>), StoreError> {
        let view = &VIEWS[inner.cur_view.load(Ordering::Acquire)];
        let wmt_ref = inner.mts[view.wmt].make_ref()?;
        let imt_ref = match view.imt {
            Some(imt) => Some(inner.mts[imt].make_ref()?),
            None => None,
        };
        let snap = inner.zone.snapshot();
        Ok((wmt_ref, imt_ref, snap))
    }

    /// Announces this thread's epoch and refreshes the view references
    /// if the store rotated. Called at the top of every operation.
    fn enter(&mut self) -> Result<(), StoreError> {
        // Announce before reading the view state: the compactor advances
        // the pointer first and bumps the version second, so reading an
        // unchanged version implies an unchanged view.
        let version = self.inner.version.load(Ordering::Acquire);
        self.qref.update(version);

        if version != self.seen_version {
            self.imt_ref = None;
            let (wmt_ref, imt_ref, snap) = Self::acquire(&self.inner)?;
            self.seen_version = version;
            self.wmt_ref = wmt_ref;
            self.imt_ref = imt_ref;
            self.snap = snap;
        }
        Ok(())
    }

    /// Parks the reference until its next operation.
    fn leave(&self) {
        self.qref.park();
    }

    /// Stalls while the memtable or WAL is at capacity.
    fn write_enter(&mut self) -> Result<(), StoreError> {
        while self.inner.mt_wal_full() {
            // Refresh so this reference is not the one holding the
            // rotation back, then sleep parked.
            self.enter()?;
            self.leave();
            std::thread::sleep(FULL_POLL);
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Point reads
    // --------------------------------------------------------------------------------------------

    /// Looks up `key`, returning its value if live.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.enter()?;
        let kref = KeyRef::new(key);

        let (present, value) = self.wmt_ref.inpr(&kref, copy_live_value);
        if present {
            self.leave();
            return Ok(value);
        }

        if let Some(imt_ref) = &self.imt_ref {
            let (present, value) = imt_ref.inpr(&kref, copy_live_value);
            if present {
                self.leave();
                return Ok(value);
            }
        }

        let result = self.snap.get(&kref);
        self.leave();
        Ok(result?.map(|rec| rec.value().to_vec()))
    }

    /// Whether `key` is present and live.
    pub fn probe(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.enter()?;
        let kref = KeyRef::new(key);

        let (present, live) = self
            .wmt_ref
            .inpr(&kref, |rec| rec.is_some_and(|r| !r.is_tombstone()));
        if present {
            self.leave();
            return Ok(live);
        }

        if let Some(imt_ref) = &self.imt_ref {
            let (present, live) = imt_ref.inpr(&kref, |rec| rec.is_some_and(|r| !r.is_tombstone()));
            if present {
                self.leave();
                return Ok(live);
            }
        }

        let result = self.snap.probe(&kref);
        self.leave();
        Ok(result?)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or replaces `key`. Returns `Ok(false)` when the pair
    /// exceeds the size limits.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let Some(rec) = Record::new(key, value) else {
            return Ok(false);
        };
        self.update(rec)?;
        Ok(true)
    }

    /// Records a deletion marker for `key`. Returns `Ok(false)` only
    /// when the key itself exceeds the size limit; the marker is written
    /// whether or not the key currently exists.
    pub fn del(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        let kref = KeyRef::new(key);
        let Some(rec) = Record::tombstone(&kref) else {
            return Ok(false);
        };
        self.update(rec)?;
        Ok(true)
    }

    /// Commits one record into the WAL and the writable memtable,
    /// retrying transparently when a rotation lands mid-flight.
    fn update(&mut self, rec: Box<Record>) -> Result<(), StoreError> {
        self.write_enter()?;
        let key = rec.key().to_vec();
        let hash = rec.hash32();

        loop {
            self.enter()?;
            let version_tag = self.inner.version.load(Ordering::Acquire);
            let kref = KeyRef::from_hash(&key, hash);
            let inner = Arc::clone(&self.inner);
            let mut committed = false;

            self.wmt_ref.merge(&kref, |old| {
                let mut ws = inner.wstate();
                if inner.version.load(Ordering::Acquire) != version_tag {
                    // The view rotated under us; this memtable may be
                    // sealed. Commit nothing and retry on the new view.
                    return MergeUpdate::Keep;
                }

                let new = rec.clone();
                let old_sz = old.map_or(0, |o| o.footprint() as u64);
                ws.mtsz = ws.mtsz + new.footprint() as u64 - old_sz;
                ws.wal.append(&new);
                drop(ws);

                committed = true;
                MergeUpdate::Put(new)
            });

            self.leave();
            if committed {
                return Ok(());
            }
        }
    }

    /// Flushes the WAL and waits until everything appended so far is
    /// durable.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.enter()?;
        let result = {
            let mut ws = self.inner.wstate();
            ws.wal.flush_sync_wait()
        };
        self.leave();
        result?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read-modify-write
    // --------------------------------------------------------------------------------------------

    /// Atomically transforms the value under `key`.
    ///
    /// `f` receives the current live value (`None` when absent or
    /// deleted) and returns the replacement value, or `None` to leave
    /// the key untouched. `f` may run more than once when the operation
    /// races a rotation; only the final invocation takes effect, so it
    /// must be pure with respect to everything but its return value.
    ///
    /// Returns `Ok(false)` when the replacement exceeded the size
    /// limits.
    pub fn merge<F>(&mut self, key: &[u8], mut f: F) -> Result<bool, StoreError>
    where
        F: FnMut(Option<&[u8]>) -> Option<Vec<u8>>,
    {
        self.write_enter()?;
        let kref_owned = key.to_vec();

        // Phase 1: resolve entirely inside the writable memtable when it
        // already holds the key.
        loop {
            self.enter()?;
            let version_tag = self.inner.version.load(Ordering::Acquire);
            let kref = KeyRef::new(&kref_owned);
            let inner = Arc::clone(&self.inner);
            let mut decided = false;
            let mut merged = false;
            let mut oversized = false;

            self.wmt_ref.merge(&kref, |cur| {
                let Some(cur) = cur else {
                    // Not in the writable memtable; phase 2 consults the
                    // older layers.
                    decided = true;
                    return MergeUpdate::Keep;
                };
                let cur_value = (!cur.is_tombstone()).then(|| cur.value());
                commit_merge_decision(
                    &inner,
                    version_tag,
                    key,
                    f(cur_value),
                    Some(cur),
                    &mut decided,
                    &mut merged,
                    &mut oversized,
                )
            });

            self.leave();
            if !decided {
                continue; // rotation raced us
            }
            if merged {
                return Ok(!oversized);
            }
            break;
        }

        // Phase 2: fetch the previous version from the immutable
        // memtable or the zone, then commit against the writable
        // memtable (which may have gained the key in the meantime).
        loop {
            self.enter()?;
            let version_tag = self.inner.version.load(Ordering::Acquire);
            let kref = KeyRef::new(&kref_owned);

            let old: Option<Box<Record>> = match &self.imt_ref {
                Some(imt_ref) => {
                    let (present, rec) =
                        imt_ref.inpr(&kref, |rec| rec.map(|r| Box::new(r.clone())));
                    if present {
                        rec.filter(|r| !r.is_tombstone())
                    } else {
                        self.snap.get(&kref)?.map(Box::new)
                    }
                }
                None => self.snap.get(&kref)?.map(Box::new),
            };

            let inner = Arc::clone(&self.inner);
            let mut merged = false;
            let mut oversized = false;

            self.wmt_ref.merge(&kref, |cur| {
                let cur_value = match cur {
                    Some(c) => (!c.is_tombstone()).then(|| c.value()),
                    None => old.as_deref().map(|r| r.value()),
                };
                let mut decided = false;
                commit_merge_decision(
                    &inner,
                    version_tag,
                    key,
                    f(cur_value),
                    cur,
                    &mut decided,
                    &mut merged,
                    &mut oversized,
                )
            });

            self.leave();
            if merged {
                return Ok(!oversized);
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Iteration
    // --------------------------------------------------------------------------------------------

    /// Creates an ordered cursor over the live records of the store.
    pub fn iter(&mut self) -> Result<StoreIter, StoreError> {
        let qref = self.inner.qsbr.register()?;
        qref.park();
        Ok(StoreIter {
            inner: Arc::clone(&self.inner),
            qref,
            seen_version: 0,
            filter: None,
        })
    }
}

/// `inpr` callback copying a live value out under the leaf guard.
fn copy_live_value(rec: Option<&Record>) -> Option<Vec<u8>> {
    match rec {
        Some(r) if !r.is_tombstone() => Some(r.value().to_vec()),
        _ => None,
    }
}

/// Commits a merge callback's decision: size-checks the replacement,
/// validates the view under the write mutex, accounts the byte delta,
/// and appends to the WAL. Shared by both merge phases.
#[allow(clippy::too_many_arguments)]
fn commit_merge_decision(
    inner: &Arc<StoreInner>,
    version_tag: u64,
    key: &[u8],
    decision: Option<Vec<u8>>,
    cur: Option<&Record>,
    decided: &mut bool,
    merged: &mut bool,
    oversized: &mut bool,
) -> MergeUpdate {
    match decision {
        None => {
            *decided = true;
            *merged = true;
            MergeUpdate::Keep
        }
        Some(new_value) => {
            let Some(new) = Record::new(key, &new_value) else {
                *decided = true;
                *merged = true;
                *oversized = true;
                return MergeUpdate::Keep;
            };
            let mut ws = inner.wstate();
            if inner.version.load(Ordering::Acquire) != version_tag {
                return MergeUpdate::Keep; // rotation raced us; retry
            }
            let old_sz = cur.map_or(0, |c| c.footprint() as u64);
            ws.mtsz = ws.mtsz + new.footprint() as u64 - old_sz;
            ws.wal.append(&new);
            drop(ws);

            *decided = true;
            *merged = true;
            MergeUpdate::Put(new)
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StoreIter
// ------------------------------------------------------------------------------------------------

/// An ordered cursor over the live records of the store.
///
/// The cursor spans every layer of the view observed at seek time and
/// hides tombstones. While positioned (between a seek and a
/// [`StoreIter::park`]), it holds its epoch, which delays memtable
/// retirement — long-lived cursors should park when idle. After a park,
/// reposition with seek before continuing.
pub struct StoreIter {
    inner: Arc<StoreInner>,
    qref: QsbrHandle,
    /// Store version the source stack was built at; zero forces the
    /// first seek to build it.
    seen_version: u64,
    filter: Option<TombstoneFilter>,
}

impl StoreIter {
    /// Positions the cursor at the first live record with key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let version = self.inner.version.load(Ordering::Acquire);
        self.qref.update(version);

        if version != self.seen_version || self.filter.is_none() {
            self.filter = Some(self.build_sources()?);
            self.seen_version = version;
        }
        self.filter_mut().seek(key);
        Ok(())
    }

    /// Builds the merged source stack for the current view: zone
    /// snapshot first, then the immutable memtable, then the writable
    /// one, so freshness follows rank.
    fn build_sources(&self) -> Result<TombstoneFilter, StoreError> {
        let view = &VIEWS[self.inner.cur_view.load(Ordering::Acquire)];
        let mut merged = MergeIter::new();
        merged.add(self.inner.zone.snapshot().iter());
        if let Some(imt) = view.imt {
            merged.add(Box::new(self.inner.mts[imt].iter()?));
        }
        merged.add(Box::new(self.inner.mts[view.wmt].iter()?));
        Ok(TombstoneFilter::new(merged))
    }

    /// Whether the cursor is on a record.
    pub fn valid(&self) -> bool {
        self.filter.as_ref().is_some_and(|f| f.valid())
    }

    /// The current key and value.
    pub fn peek(&self) -> Option<(&[u8], &[u8])> {
        self.filter
            .as_ref()
            .and_then(|f| f.peek())
            .map(|rec| (rec.key(), rec.value()))
    }

    /// Advances to the next live key.
    pub fn skip1(&mut self) {
        if let Some(filter) = &mut self.filter {
            filter.skip1();
        }
    }

    /// Advances `n` live keys, stopping early at the end.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            if !self.valid() {
                break;
            }
            self.skip1();
        }
    }

    /// Returns the current pair and advances.
    pub fn next_pair(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let pair = self.peek().map(|(k, v)| (k.to_vec(), v.to_vec()));
        if pair.is_some() {
            self.skip1();
        }
        pair
    }

    /// Releases the cursor's epoch and transient resources. The cursor
    /// must be re-seeked before further use.
    pub fn park(&mut self) {
        if let Some(filter) = &mut self.filter {
            filter.park();
        }
        self.qref.park();
    }

    fn filter_mut(&mut self) -> &mut TombstoneFilter {
        self.filter
            .as_mut()
            .unwrap_or_else(|| unreachable!("seek builds the source stack first"))
    }
}

impl Iterator for StoreIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_pair()
    }
}

impl Drop for StoreIter {
    fn drop(&mut self) {
        self.park();
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction orchestrator
// ------------------------------------------------------------------------------------------------

fn compaction_worker(inner: Arc<StoreInner>) {
    info!("compaction worker started");
    loop {
        let idle_from = Instant::now();
        while inner.running.load(Ordering::Acquire) && !inner.mt_wal_full() {
            std::thread::sleep(FULL_POLL);
        }
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        debug!(
            idle_ms = idle_from.elapsed().as_millis() as u64,
            "compaction triggered"
        );
        do_comp(&inner);
    }
    info!("compaction worker stopped");
}

/// One compaction iteration. See the module docs for the phase
/// breakdown; failures in the rotation phase or the zone are fatal —
/// there is no rolled-back state to return to once the view advanced.
fn do_comp(inner: &StoreInner) {
    let t0 = Instant::now();

    // Seal the writable memtable: advance the view, switch the log,
    // reset the byte budget. All under the write mutex, all cheap.
    let (comp_view_idx, epoch_seal, walsz0, mtsz0) = {
        let mut ws = inner.wstate();
        let comp_view_idx = VIEWS[inner.cur_view.load(Ordering::Acquire)].next;
        inner.cur_view.store(comp_view_idx, Ordering::Release);
        let epoch_seal = inner.version.fetch_add(1, Ordering::AcqRel) + 1;

        let walsz0 = ws
            .wal
            .switch(inner.zone.version() + 1)
            .unwrap_or_else(|e| panic!("wal switch failed: {e}"));
        let mtsz0 = ws.mtsz;
        ws.mtsz = 0;
        (comp_view_idx, epoch_seal, walsz0, mtsz0)
    };

    // Wait out every reference that predates the seal; afterwards the
    // sealed table has no writer and every reader sees it as immutable.
    inner.qsbr.wait(epoch_seal);
    let t_prep = Instant::now();

    let view = &VIEWS[comp_view_idx];
    let imt_idx = view
        .imt
        .unwrap_or_else(|| unreachable!("compaction views carry a sealed memtable"));
    let wmt = &inner.mts[view.wmt];
    let imt = &inner.mts[imt_idx];

    // Keep the pre-compaction snapshot alive for the reinsert walk.
    let oldv = inner.zone.snapshot();

    let mut imt_iter = imt
        .iter()
        .unwrap_or_else(|e| panic!("sealed memtable iterator: {e}"));
    inner
        .zone
        .compact(&mut imt_iter, inner.max_rejsz)
        .unwrap_or_else(|e| panic!("zone compaction failed: {e}"));
    let t_comp = Instant::now();

    let anchors = oldv.anchors();
    reinsert_rejected(inner, wmt, imt, &anchors);
    let t_reinsert = Instant::now();

    // Make the reinserted records durable before the sealed log dies.
    {
        let mut ws = inner.wstate();
        ws.wal.flush_sync();
    }
    drop(oldv);

    // Retire the sealed memtable: advance to the steady view and wait
    // out everyone who could still be reading it.
    let epoch_retire = {
        let _ws = inner.wstate();
        let next = VIEWS[comp_view_idx].next;
        inner.cur_view.store(next, Ordering::Release);
        inner.version.fetch_add(1, Ordering::AcqRel) + 1
    };
    inner.qsbr.wait(epoch_retire);
    let t_wait2 = Instant::now();

    // Dominant cost of this tail: dropping every record of the retired
    // table so it can serve as the next writable memtable.
    imt.clean();
    let t_clean = Instant::now();

    {
        let ws = inner.wstate();
        ws.wal
            .io_complete()
            .unwrap_or_else(|e| panic!("wal io completion failed: {e}"));
    }

    // The sealed log's contents now live in the snapshot or the current
    // log. Truncation failure is tolerable; recovery handles a stale
    // file.
    {
        let ws = inner.wstate();
        if let Err(e) = ws.wal.truncate_sealed() {
            warn!(error = %e, "truncating sealed wal failed");
        }
    }
    let t_sync = Instant::now();

    // Amplification accounting.
    let (usr, wal_bytes) = {
        let ws = inner.wstate();
        (ws.wal.write_user(), ws.wal.write_nbytes())
    };
    let sst_writes = inner.zone.stat_writes();
    let sst_reads = inner.zone.stat_reads();
    let write_amp = (wal_bytes + sst_writes) as f64 / usr.max(1) as f64;
    let read_amp = sst_reads as f64 / usr.max(1) as f64;

    const MB: u64 = 1 << 20;
    info!(
        mtsz0,
        walsz0,
        usr_mb = usr / MB,
        wal_mb = wal_bytes / MB,
        sst_mb = sst_writes / MB,
        write_amp,
        comp_read_mb = sst_reads / MB,
        read_amp,
        "compaction finished"
    );
    info!(
        total_ms = t_sync.duration_since(t0).as_millis() as u64,
        prep_ms = t_prep.duration_since(t0).as_millis() as u64,
        comp_ms = t_comp.duration_since(t_prep).as_millis() as u64,
        reinsert_ms = t_reinsert.duration_since(t_comp).as_millis() as u64,
        wait2_ms = t_wait2.duration_since(t_reinsert).as_millis() as u64,
        clean_ms = t_clean.duration_since(t_wait2).as_millis() as u64,
        sync_ms = t_sync.duration_since(t_clean).as_millis() as u64,
        "compaction phase times"
    );
}

/// Walks the rejected partitions of the pre-compaction snapshot and
/// feeds their sealed-memtable records back through the write path.
///
/// A reinserted record only lands when the writable memtable does not
/// already hold its key — a fresh write always wins over a reinsert.
/// Each landed record incurs a WAL append so it is recoverable again.
fn reinsert_rejected(
    inner: &StoreInner,
    wmt: &TrieIndex,
    imt: &TrieIndex,
    anchors: &[Anchor],
) {
    if !anchors.iter().any(|a| a.rejected) {
        return;
    }

    let wmt_ref = wmt
        .make_ref()
        .unwrap_or_else(|e| panic!("reinsert reference: {e}"));
    let mut imt_iter = imt
        .iter()
        .unwrap_or_else(|e| panic!("reinsert iterator: {e}"));

    let mut reinserted = 0u64;
    for (idx, anchor) in anchors.iter().enumerate() {
        if !anchor.rejected {
            continue;
        }
        let upper = anchors.get(idx + 1).map(|a| a.key.as_slice());

        imt_iter.seek(&anchor.key);
        while let Some(rec) = imt_iter.peek() {
            if upper.is_some_and(|u| rec.key() >= u) {
                break;
            }
            let rec = Box::new(rec.clone());
            let kref = rec.key_ref();

            wmt_ref.merge(&kref, |cur| {
                if cur.is_some() {
                    return MergeUpdate::Keep;
                }
                // No view check needed: only this thread rotates views.
                let mut ws = inner.wstate();
                ws.mtsz += rec.footprint() as u64;
                ws.wal.append(&rec);
                drop(ws);
                MergeUpdate::Put(rec.clone())
            });

            reinserted += 1;
            imt_iter.skip1();
        }
    }
    debug!(reinserted, "rejected partitions reinserted");
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Replays the write-ahead logs into the first memtable.
///
/// One live log resumes in place. Two live logs mean the previous run
/// crashed mid-rotation: both are replayed (older first, newer wins by
/// replay order) and immediately compacted into the zone with rejection
/// disabled, after which both files are truncated and a fresh log
/// starts at the zone's new version.
fn recover(
    ws: &mut WriteState,
    mt: &TrieIndex,
    zone: &dyn ZoneManager,
) -> Result<(), StoreError> {
    let v_cur = read_wal_version(ws.wal.current_file())?;
    let v_sealed = read_wal_version(ws.wal.sealed_file())?;
    let zone_version = zone.version();
    debug_assert!(zone_version > 0);

    // Make the newer log current.
    if v_cur < v_sealed {
        ws.wal.swap_files();
    }
    let (v_newer, v_older) = if v_cur < v_sealed {
        (v_sealed, v_cur)
    } else {
        (v_cur, v_sealed)
    };
    info!(
        wal_newer = v_newer,
        wal_older = v_older,
        zone_version,
        "wal recovery"
    );

    if v_newer > 0 && v_older > 0 {
        if v_newer == v_older {
            return Err(StoreError::Corruption(
                "both wal files carry the same version".into(),
            ));
        }

        // Crashed during rotation: replay older then newer, compact
        // everything out with rejection disabled so nothing comes back,
        // then start over with empty logs.
        let r_older = replay_file(ws.wal.sealed_file(), mt, &mut ws.mtsz)?;
        let r_newer = replay_file(ws.wal.current_file(), mt, &mut ws.mtsz)?;

        let mut replayed = mt.iter()?;
        zone.compact(&mut replayed, 0)?;
        drop(replayed);

        for file in [ws.wal.current_file(), ws.wal.sealed_file()] {
            file.set_len(0)?;
            file.sync_data()?;
        }
        mt.clean();
        ws.mtsz = 0;

        let fresh_version = zone.version();
        ws.wal.begin(fresh_version);
        info!(
            replayed_older = r_older,
            replayed_newer = r_newer,
            fresh_version,
            "dual-wal recovery compacted"
        );
    } else if v_newer > 0 {
        if v_newer > zone_version {
            return Err(StoreError::Corruption(format!(
                "wal version {v_newer} ahead of zone version {zone_version}"
            )));
        }

        let rsize = replay_file(ws.wal.current_file(), mt, &mut ws.mtsz)?;
        if rsize == 0 {
            ws.wal.begin(zone_version);
        } else {
            ws.wal.resume(v_newer, rsize)?;
        }
        ws.wal.sealed_file().set_len(0)?;
        ws.wal.sealed_file().sync_data()?;
        info!(rsize, mtsz = ws.mtsz, "single-wal recovery");
    } else {
        // Fresh store (or clean shutdown with empty logs).
        ws.wal.begin(zone_version);
        ws.wal.sealed_file().set_len(0)?;
        ws.wal.sealed_file().sync_data()?;
    }

    Ok(())
}

/// Reads a WAL file's version header; zero means "not a live log".
fn read_wal_version(file: &Arc<std::fs::File>) -> Result<u64, StoreError> {
    use std::os::unix::fs::FileExt;

    if file.metadata()?.len() <= WAL_HEADER_SIZE as u64 {
        return Ok(0);
    }
    let mut buf = [0u8; WAL_HEADER_SIZE];
    file.read_exact_at(&mut buf, 0)?;
    Ok(u64::from_le_bytes(buf))
}

/// Replays one log file into `mt`, returning the number of bytes
/// consumed.
///
/// Scans records after the version header, skipping zero padding;
/// replay stops at the first record that fails decoding, bounds, the
/// key checksum, or the nonzero-record rule. Each record replaces any
/// earlier version of its key, so replay order makes the last write
/// win.
fn replay_file(
    file: &Arc<std::fs::File>,
    mt: &TrieIndex,
    mtsz: &mut u64,
) -> Result<u64, StoreError> {
    let len = file.metadata()?.len() as usize;
    if len <= WAL_HEADER_SIZE {
        return Ok(0);
    }

    // SAFETY: recovery runs single-threaded before the store goes live;
    // nobody writes the file while it is mapped.
    let mmap = unsafe { Mmap::map(file.as_ref())? };

    let mt_ref = mt.make_ref()?;
    let mut off = WAL_HEADER_SIZE;
    let mut nkeys = 0u64;

    while off < len {
        // Decode first, then treat a zero byte as inter-record padding:
        // an empty-key record legitimately starts with a zero byte, and
        // only its checksum separates it from padding.
        match decode_wire(&mmap[off..]) {
            Ok(Some((wire, consumed))) => {
                let kref = KeyRef::from_hash(wire.key, wire.hash32);
                mt_ref.merge(&kref, |old| {
                    let new = wire.to_record();
                    *mtsz =
                        *mtsz + new.footprint() as u64 - old.map_or(0, |o| o.footprint() as u64);
                    MergeUpdate::Put(new)
                });
                off += consumed;
                nkeys += 1;
            }
            Ok(None) | Err(_) if mmap[off] == 0 => off += 1,
            Ok(None) | Err(_) => break,
        }
    }

    debug!(
        fsize = len,
        rsize = off,
        nkeys,
        "wal file replayed"
    );
    Ok(off as u64)
}
