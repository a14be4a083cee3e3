//! # Ordered In-Memory Index
//!
//! A concurrent ordered map from byte-string keys to records: a trie of
//! hashed prefix nodes over sorted, fixed-fan-out leaves. Point lookups
//! descend the prefix trie by hashing — cost independent of the key
//! population — while ordered traversal walks the doubly linked leaf list.
//!
//! ## Structure
//!
//! - [`leaf`] — leaves of up to 128 records with a partial-key hash array
//!   for point access and an incrementally sorted permutation for ordered
//!   access.
//! - [`meta`] — the prefix-to-metadata cuckoo maps driving the descent.
//!
//! ## Concurrency model
//!
//! Reads never lock the metadata: two meta maps are kept, an atomic index
//! names the active one, and readers take an uncontended read lock on it
//! (structural writers only ever write-lock the *inactive* map before
//! publishing). After the descent, a reader takes the target leaf's read
//! lock and validates that the leaf still covers the key; a concurrent
//! split or merge fails that check and the reader retries.
//!
//! Structural changes serialise on a single metadata mutex and commit in
//! two phases: mutate the inactive map, publish it with a release store,
//! wait for quiescence ([`crate::qsbr`]), then replay the mutation on the
//! now-inactive map so both stay equivalent.
//!
//! Every operation runs between a quiescence announcement and a park, so
//! a writer's wait only ever spans in-flight operations, never idle
//! references.

pub(crate) mod leaf;
pub(crate) mod meta;

mod iter;

#[cfg(test)]
mod tests;

pub use iter::IndexIter;

use std::sync::{
    Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use thiserror::Error;
use tracing::trace;

use crate::kv::{KeyRef, Record};
use crate::qsbr::{Qsbr, QsbrError, QsbrHandle};

use leaf::{KPN_MERGE, Leaf, LeafCore};
use meta::MetaMap;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Too many concurrent references.
    #[error("qsbr error: {0}")]
    Qsbr(#[from] QsbrError),
}

// ------------------------------------------------------------------------------------------------
// Merge decisions
// ------------------------------------------------------------------------------------------------

/// Outcome of a [`IndexRef::merge`] callback.
pub enum MergeUpdate {
    /// Leave the current record (or absence) untouched.
    Keep,
    /// Insert or replace with this record.
    Put(Box<Record>),
}

// ------------------------------------------------------------------------------------------------
// Lock helpers
// ------------------------------------------------------------------------------------------------

// A poisoned lock means a writer panicked mid-structure; the index cannot
// vouch for its invariants afterwards, so propagating the panic is the
// contract.

#[inline]
fn rlock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read()
        .unwrap_or_else(|_| panic!("index rwlock poisoned"))
}

#[inline]
fn wlock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(|_| panic!("index rwlock poisoned"))
}

#[inline]
fn mlock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock()
        .unwrap_or_else(|_| panic!("index mutex poisoned"))
}

// ------------------------------------------------------------------------------------------------
// TrieIndex
// ------------------------------------------------------------------------------------------------

/// The concurrent ordered index.
///
/// A cheap handle — clone to share across threads. Data operations go
/// through an [`IndexRef`] from [`TrieIndex::make_ref`], which carries
/// the caller's quiescence registration.
#[derive(Debug, Clone)]
pub struct TrieIndex {
    inner: Arc<TrieInner>,
}

#[derive(Debug)]
struct TrieInner {
    /// The double-buffered meta maps.
    maps: [RwLock<MetaMap>; 2],

    /// Index of the active map.
    active: AtomicUsize,

    /// Structural version; bumped on every publication.
    version: AtomicU64,

    /// Serialises structural changes (split, merge, clean).
    meta_lock: Mutex<()>,

    /// Quiescence domain gating map republication.
    qsbr: Qsbr,
}

impl TrieIndex {
    /// Creates an empty index: one leaf anchored at the empty key.
    pub fn new() -> TrieIndex {
        let initial = Leaf::new(Box::from(&b""[..]));
        TrieIndex {
            inner: Arc::new(TrieInner {
                maps: [
                    RwLock::new(MetaMap::new(&initial)),
                    RwLock::new(MetaMap::new(&initial)),
                ],
                active: AtomicUsize::new(0),
                version: AtomicU64::new(1),
                meta_lock: Mutex::new(()),
                qsbr: Qsbr::new(),
            }),
        }
    }

    /// Registers a new reference.
    pub fn make_ref(&self) -> Result<IndexRef, IndexError> {
        let handle = self.inner.qsbr.register()?;
        handle.park();
        Ok(IndexRef {
            index: self.clone(),
            handle,
        })
    }

    /// Creates an ordered cursor over the index.
    pub fn iter(&self) -> Result<IndexIter, IndexError> {
        let handle = self.inner.qsbr.register()?;
        handle.park();
        Ok(IndexIter::new(self.clone(), handle))
    }

    /// Current structural version.
    #[inline]
    pub(crate) fn structural_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Drops every record and resets the index to a single empty leaf.
    ///
    /// Used on the retired immutable memtable after rotation; callers
    /// guarantee no reader still expects the old contents (stragglers
    /// retry through the fresh meta maps and observe an empty index).
    pub fn clean(&self) {
        self.inner.clean();
    }
}

impl Default for TrieIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TrieInner {
    fn active_map(&self) -> RwLockReadGuard<'_, MetaMap> {
        rlock(&self.maps[self.active.load(Ordering::Acquire)])
    }

    fn clean(&self) {
        let _structural = mlock(&self.meta_lock);

        // Break the strong next chain iteratively; letting Arc recursion
        // unwind a long leaf list would overflow the stack.
        let mut cursor = Some(self.active_map().first_leaf());
        while let Some(leaf) = cursor {
            let mut core = wlock(&leaf.core);
            core.retired = true;
            core.hs.clear();
            core.ss.clear();
            core.nr_sorted = 0;
            cursor = core.next.take();
            drop(core);
            leaf.touch();
        }

        let initial = Leaf::new(Box::from(&b""[..]));
        *wlock(&self.maps[0]) = MetaMap::new(&initial);
        *wlock(&self.maps[1]) = MetaMap::new(&initial);
        self.version.fetch_add(1, Ordering::AcqRel);
        trace!("index cleaned");
    }

    // --------------------------------------------------------------------------------------------
    // Leaf location
    // --------------------------------------------------------------------------------------------

    /// Runs `f` with the read-locked leaf responsible for `key`.
    ///
    /// The meta-map guard is dropped before the leaf lock is taken, so a
    /// reader never waits on a leaf while holding map state (the writer's
    /// republication path would deadlock otherwise).
    fn with_leaf_read<R>(&self, key: &[u8], f: impl FnOnce(&Leaf, &LeafCore) -> R) -> R {
        let mut f = Some(f);
        loop {
            let leaf = self.active_map().lookup_leaf(key);
            let core = rlock(&leaf.core);
            if core.contains(&leaf.anchor, key) {
                let f = f.take().unwrap_or_else(|| unreachable!());
                return f(&leaf, &core);
            }
            // The leaf moved under us (split, merge, or clean); retry
            // through the current meta map.
        }
    }

    /// Runs `f` with the write-locked leaf responsible for `key`.
    fn with_leaf_write<R>(&self, key: &[u8], f: impl FnOnce(&Leaf, &mut LeafCore) -> R) -> R {
        let mut f = Some(f);
        loop {
            let leaf = self.active_map().lookup_leaf(key);
            let mut core = wlock(&leaf.core);
            if core.contains(&leaf.anchor, key) {
                let f = f.take().unwrap_or_else(|| unreachable!());
                return f(&leaf, &mut core);
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Structural changes
    // --------------------------------------------------------------------------------------------

    /// Splits the full leaf responsible for `key`.
    ///
    /// Callers arrive with no leaf lock held and a parked reference. The
    /// two-phase publication: mutate the inactive map, flip the active
    /// pointer, wait for quiescence, then replay on the other map.
    fn split(&self, key: &[u8]) {
        let _structural = mlock(&self.meta_lock);

        loop {
            let leaf = self.active_map().lookup_leaf(key);
            let mut core = wlock(&leaf.core);
            if !core.contains(&leaf.anchor, key) {
                continue;
            }
            if !core.is_full() {
                // A concurrent remove made room; nothing to do.
                return;
            }

            core.sync_sorted();
            let (cut, anchor2) = core.split_cut();
            let all = core.drain_sorted();
            let mut lower = all;
            let upper = lower.split_off(cut);
            core.rebuild_from_sorted(lower);

            let leaf2 = Leaf::new(anchor2);
            let old_next = core.next.clone();
            {
                let mut core2 = wlock(&leaf2.core);
                core2.rebuild_from_sorted(upper);
                core2.prev = Arc::downgrade(&leaf);
                core2.next = old_next.clone();
            }
            if let Some(next) = &old_next {
                wlock(&next.core).prev = Arc::downgrade(&leaf2);
            }
            core.next = Some(Arc::clone(&leaf2));
            leaf.touch();
            leaf2.touch();

            let next_anchor = old_next.as_ref().map(|n| &n.anchor[..]);
            let inactive = 1 - self.active.load(Ordering::Acquire);
            wlock(&self.maps[inactive]).register_anchor(&leaf, &leaf2, next_anchor);

            // Publish, then wait out every reader that could still be
            // descending through the old map. Leaf locks must be free
            // during the wait so those readers can finish.
            drop(core);
            self.active.store(inactive, Ordering::Release);
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            self.qsbr.wait(version);

            wlock(&self.maps[1 - inactive]).register_anchor(&leaf, &leaf2, next_anchor);
            trace!(anchor_len = leaf2.anchor.len(), "leaf split published");
            return;
        }
    }

    /// Merges the leaf responsible for `key` with its right neighbour if
    /// their combined population fits. Returns whether a merge happened.
    fn try_merge(&self, key: &[u8]) -> bool {
        let _structural = mlock(&self.meta_lock);

        loop {
            let leaf = self.active_map().lookup_leaf(key);
            let mut core = wlock(&leaf.core);
            if !core.contains(&leaf.anchor, key) {
                continue;
            }
            let Some(right) = core.next.clone() else {
                return false;
            };
            let mut rcore = wlock(&right.core);
            if core.nr_keys() + rcore.nr_keys() > KPN_MERGE {
                return false;
            }

            core.sync_sorted();
            rcore.sync_sorted();
            let mut merged = core.drain_sorted();
            merged.extend(rcore.drain_sorted());
            core.rebuild_from_sorted(merged);

            let old_next = rcore.next.clone();
            rcore.retired = true;
            // Keep the retired leaf's next pointer so in-flight cursors
            // can walk off it; they revalidate via the version bump.
            core.next = old_next.clone();
            if let Some(next) = &old_next {
                wlock(&next.core).prev = Arc::downgrade(&leaf);
            }
            leaf.touch();
            right.touch();

            let next_anchor_owned = old_next.as_ref().map(|n| n.anchor.clone());
            let next_anchor = next_anchor_owned.as_deref();
            let inactive = 1 - self.active.load(Ordering::Acquire);
            wlock(&self.maps[inactive]).unregister_anchor(
                &leaf,
                &right,
                old_next.as_ref(),
                next_anchor,
            );

            drop(rcore);
            drop(core);
            self.active.store(inactive, Ordering::Release);
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            self.qsbr.wait(version);

            wlock(&self.maps[1 - inactive]).unregister_anchor(
                &leaf,
                &right,
                old_next.as_ref(),
                next_anchor,
            );
            trace!("leaf merge published");
            return true;
        }
    }
}

impl Drop for TrieInner {
    fn drop(&mut self) {
        // Break the strong next chain iteratively (see clean()).
        let mut cursor = Some(self.active_map().first_leaf());
        while let Some(leaf) = cursor {
            cursor = wlock(&leaf.core).next.take();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// IndexRef — per-caller reference
// ------------------------------------------------------------------------------------------------

/// A caller's registered reference to a [`TrieIndex`].
///
/// Each operation announces quiescence on entry and parks on exit, so the
/// reference never blocks structural writers while idle.
#[derive(Debug)]
pub struct IndexRef {
    index: TrieIndex,
    handle: QsbrHandle,
}

impl IndexRef {
    /// The index this reference belongs to.
    #[inline]
    pub fn index(&self) -> &TrieIndex {
        &self.index
    }

    #[inline]
    fn begin(&self) {
        self.handle.update(self.index.structural_version());
    }

    #[inline]
    fn end(&self) {
        self.handle.park();
    }

    /// Marks this reference quiescent until the next operation.
    pub fn park(&self) {
        self.handle.park();
    }

    /// Reinstates a parked reference.
    pub fn resume(&self) {
        self.handle.resume();
    }

    // --------------------------------------------------------------------------------------------
    // Point reads
    // --------------------------------------------------------------------------------------------

    /// Invokes `f` with the record for `kref` (or `None`) while holding a
    /// read guard on the key's leaf. Returns whether the key was present
    /// alongside `f`'s result.
    pub fn inpr<R>(&self, kref: &KeyRef<'_>, f: impl FnOnce(Option<&Record>) -> R) -> (bool, R) {
        self.begin();
        let result = self
            .index
            .inner
            .with_leaf_read(kref.bytes(), |_, core| match core.find(kref) {
                Some(idx) => (true, f(Some(core.record(idx)))),
                None => (false, f(None)),
            });
        self.end();
        result
    }

    /// Invokes `f` with a mutable borrow of the record for `kref` (or
    /// `None`) while holding a write guard on the key's leaf. The
    /// callback must not change the record's key.
    pub fn inpw<R>(
        &self,
        kref: &KeyRef<'_>,
        f: impl FnOnce(Option<&mut Record>) -> R,
    ) -> (bool, R) {
        self.begin();
        let result = self
            .index
            .inner
            .with_leaf_write(kref.bytes(), |_, core| match core.find(kref) {
                Some(idx) => (true, f(Some(core.record_mut(idx)))),
                None => (false, f(None)),
            });
        self.end();
        result
    }

    /// Copies out the record stored under `kref`, tombstones included.
    pub fn get(&self, kref: &KeyRef<'_>) -> Option<Box<Record>> {
        self.inpr(kref, |rec| rec.map(|r| Box::new(r.clone()))).1
    }

    /// Whether `kref` is present, tombstones included.
    pub fn probe(&self, kref: &KeyRef<'_>) -> bool {
        self.inpr(kref, |_| ()).0
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts or replaces `rec`, returning the replaced record if any.
    pub fn put(&self, rec: Box<Record>) -> Option<Box<Record>> {
        self.begin();
        let key: Vec<u8> = rec.key().to_vec();
        let mut pending = Some(rec);

        loop {
            enum Outcome {
                Done(Option<Box<Record>>),
                Full,
            }
            let outcome = self.index.inner.with_leaf_write(&key, |_, core| {
                let rec = pending.take().unwrap_or_else(|| unreachable!());
                if let Some(idx) = core.find(&rec.key_ref()) {
                    return Outcome::Done(Some(core.replace(idx, rec)));
                }
                match core.insert(rec) {
                    Ok(()) => Outcome::Done(None),
                    Err(rec) => {
                        pending = Some(rec);
                        Outcome::Full
                    }
                }
            });
            match outcome {
                Outcome::Done(old) => {
                    self.end();
                    return old;
                }
                Outcome::Full => {
                    // Park across the split so its quiescence wait does
                    // not stall on this reference.
                    self.handle.park();
                    self.index.inner.split(&key);
                    self.begin();
                }
            }
        }
    }

    /// Removes the record under `kref`. Returns whether one was removed.
    pub fn del(&self, kref: &KeyRef<'_>) -> bool {
        self.begin();
        let (removed, underfull, rightmost_prev) = self.index.inner.with_leaf_write(
            kref.bytes(),
            |leaf, core| match core.find(kref) {
                Some(idx) => {
                    core.remove(idx);
                    leaf.touch();
                    let prev = if core.next.is_none() {
                        core.prev.upgrade()
                    } else {
                        None
                    };
                    (true, core.nr_keys() < KPN_MERGE / 2, prev)
                }
                None => (false, false, None),
            },
        );

        if removed && underfull {
            self.handle.park();
            if !self.index.inner.try_merge(kref.bytes())
                && let Some(prev) = rightmost_prev
            {
                // The rightmost leaf can only shrink by merging into its
                // left neighbour.
                self.index.inner.try_merge(&prev.anchor);
            }
            self.begin();
        }
        self.end();
        removed
    }

    /// Atomic read-modify-write for a single key.
    ///
    /// `f` observes the current record (or `None`) and decides; see
    /// [`MergeUpdate`]. `f` runs exactly once, under the leaf's write
    /// guard: any room the decision might need is made *before* the
    /// invocation, so a committed side effect inside `f` (the store
    /// appends to its log there) is never followed by a retry.
    pub fn merge(&self, kref: &KeyRef<'_>, f: impl FnOnce(Option<&Record>) -> MergeUpdate) {
        self.begin();
        let mut f = Some(f);
        loop {
            enum Outcome {
                Done,
                Full,
            }
            let outcome = self.index.inner.with_leaf_write(kref.bytes(), |_, core| {
                let found = core.find(kref);
                if found.is_none() && core.is_full() {
                    // A Keep decision would not need the room, but
                    // splitting ahead of time is only ever wasted work,
                    // never wrong.
                    return Outcome::Full;
                }
                let f = f.take().unwrap_or_else(|| unreachable!());
                let current = found.map(|idx| core.record(idx));
                match f(current) {
                    MergeUpdate::Keep => {}
                    MergeUpdate::Put(rec) => {
                        debug_assert_eq!(rec.key(), kref.bytes());
                        match found {
                            Some(idx) => {
                                core.replace(idx, rec);
                            }
                            None => {
                                core.insert(rec)
                                    .unwrap_or_else(|_| unreachable!("capacity checked above"));
                            }
                        }
                    }
                }
                Outcome::Done
            });
            match outcome {
                Outcome::Done => {
                    self.end();
                    return;
                }
                Outcome::Full => {
                    self.handle.park();
                    self.index.inner.split(kref.bytes());
                    self.begin();
                }
            }
        }
    }

    /// Deletes every record with key in `[start, end)`. Returns the
    /// number of records removed.
    pub fn delr(&self, start: &[u8], end: &[u8]) -> usize {
        if start >= end {
            return 0;
        }
        self.begin();

        let mut total = 0usize;
        let mut visited: Vec<Vec<u8>> = Vec::new();
        let mut cursor: Vec<u8> = start.to_vec();

        loop {
            let mut next_anchor: Option<Vec<u8>> = None;
            let removed = self.index.inner.with_leaf_write(&cursor, |leaf, core| {
                core.sync_sorted();
                let all = core.drain_sorted();
                let before = all.len();
                let keep: Vec<_> = all
                    .into_iter()
                    .filter(|rec| {
                        let key = rec.key();
                        !(key >= start && key < end)
                    })
                    .collect();
                let removed = before - keep.len();
                core.rebuild_from_sorted(keep);
                if removed > 0 {
                    leaf.touch();
                }
                next_anchor = core.next.as_ref().map(|n| n.anchor.to_vec());
                removed
            });
            total += removed;
            visited.push(std::mem::take(&mut cursor));

            match next_anchor {
                Some(anchor) if anchor.as_slice() < end => cursor = anchor,
                _ => break,
            }
        }

        // Shrink pass: fold emptied or underfull leaves into neighbours.
        self.handle.park();
        for key in visited {
            while self.index.inner.try_merge(&key) {}
        }
        self.begin();

        self.end();
        total
    }
}
