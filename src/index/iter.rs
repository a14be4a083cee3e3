//! Ordered cursor over the trie index.
//!
//! The cursor holds a position — a leaf handle, a slot in its sorted
//! permutation, and the leaf version it observed — plus a copy of the
//! current record. No lock is held between calls: each step re-locks the
//! leaf, and if the observed version has moved (a removal, sort, split,
//! or merge happened) the cursor re-seeks past its cached key instead of
//! trusting the stale slot.
//!
//! Crossing a leaf boundary follows the `next` link while the current
//! leaf's read guard is still held, so the list cannot be relinked
//! between the two.

use std::sync::Arc;

use crate::kv::Record;
use crate::merge::OrderedIter;
use crate::qsbr::QsbrHandle;

use super::TrieIndex;
use super::leaf::Leaf;
use super::{rlock, wlock};

/// Seek bound: at-or-after vs strictly-after the target key.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Bound {
    Ge,
    Gt,
}

/// An ordered forward cursor over a [`TrieIndex`].
pub struct IndexIter {
    index: TrieIndex,
    handle: QsbrHandle,

    /// Leaf holding the current record.
    leaf: Option<Arc<Leaf>>,

    /// Position within the leaf's sorted permutation.
    ss_pos: usize,

    /// Leaf version observed when the position was taken.
    lv_seen: u64,

    /// Copy of the current record; the borrow handed out by `peek`.
    current: Option<Box<Record>>,
}

impl IndexIter {
    pub(super) fn new(index: TrieIndex, handle: QsbrHandle) -> Self {
        Self {
            index,
            handle,
            leaf: None,
            ss_pos: 0,
            lv_seen: 0,
            current: None,
        }
    }

    #[inline]
    fn begin(&self) {
        self.handle.update(self.index.structural_version());
    }

    /// Positions the cursor at the first record `>= key` (or `> key`).
    fn position(&mut self, key: &[u8], bound: Bound) {
        self.leaf = None;
        self.current = None;

        let mut leaf = self.index.inner.active_map().lookup_leaf(key);

        // Walk forward from the target leaf until a record at or past the
        // bound appears; empty leaves and boundary positions fall through
        // to the next leaf.
        let mut in_target_leaf = true;
        loop {
            if !self.ensure_sorted(&leaf) {
                // Retired or moved; restart the descent.
                leaf = self.index.inner.active_map().lookup_leaf(key);
                in_target_leaf = true;
                continue;
            }

            let core = rlock(&leaf.core);
            if core.retired || (in_target_leaf && !core.contains(&leaf.anchor, key)) {
                drop(core);
                leaf = self.index.inner.active_map().lookup_leaf(key);
                in_target_leaf = true;
                continue;
            }
            if !core.is_sorted() {
                // A racing insert extended the tail after our sort pass.
                drop(core);
                continue;
            }

            let pos = if in_target_leaf {
                match bound {
                    Bound::Ge => core.search_ge(key),
                    Bound::Gt => core.search_gt(key),
                }
            } else {
                0
            };

            if pos < core.nr_keys() {
                self.current = Some(Box::new(core.record_at_sorted(pos).clone()));
                self.ss_pos = pos;
                self.lv_seen = leaf.version();
                drop(core);
                self.leaf = Some(leaf);
                return;
            }

            // Move to the next leaf while still holding this one's guard.
            match core.next.clone() {
                Some(next) => {
                    drop(core);
                    leaf = next;
                    in_target_leaf = false;
                }
                None => return, // cursor becomes invalid
            }
        }
    }

    /// Advances `n` records, stopping early at the end.
    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            if !self.valid() {
                break;
            }
            self.skip1();
        }
    }

    /// Returns the current record and advances.
    pub fn next_record(&mut self) -> Option<Box<Record>> {
        let rec = self.current.clone();
        if rec.is_some() {
            self.skip1();
        }
        rec
    }

    /// Sorts the leaf's unsorted tail if needed. Returns false when the
    /// leaf turned out to be retired.
    fn ensure_sorted(&self, leaf: &Arc<Leaf>) -> bool {
        {
            let core = rlock(&leaf.core);
            if core.retired {
                return false;
            }
            if core.is_sorted() {
                return true;
            }
        }
        let _sort = leaf
            .sortlock
            .lock()
            .unwrap_or_else(|_| panic!("index mutex poisoned"));
        let mut core = wlock(&leaf.core);
        if core.retired {
            return false;
        }
        core.sync_sorted();
        leaf.touch();
        true
    }
}

impl OrderedIter for IndexIter {
    fn seek(&mut self, key: &[u8]) {
        self.begin();
        self.position(key, Bound::Ge);
        self.handle.park();
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn peek(&self) -> Option<&Record> {
        self.current.as_deref()
    }

    fn skip1(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        self.begin();

        // Fast path: the leaf is unchanged, step to the adjacent slot.
        let mut advanced = false;
        if let Some(leaf) = &self.leaf {
            let core = rlock(&leaf.core);
            if !core.retired
                && leaf.version() == self.lv_seen
                && core.is_sorted()
                && self.ss_pos + 1 < core.nr_keys()
            {
                self.ss_pos += 1;
                self.current = Some(Box::new(core.record_at_sorted(self.ss_pos).clone()));
                advanced = true;
            }
        }

        if !advanced {
            // Slow path covers everything else: version moved, tail grew,
            // or the position was the last in its leaf.
            self.position(current.key(), Bound::Gt);
        }
        self.handle.park();
    }

    fn park(&mut self) {
        self.handle.park();
    }
}
