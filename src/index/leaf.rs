//! Leaf nodes of the ordered index.
//!
//! A leaf owns up to [`KPN`] records covering the key range
//! `[anchor, next.anchor)`. Records live in two parallel views:
//!
//! - `hs` — packed array ordered by 16-bit partial key, giving constant
//!   average-cost point lookups via position estimation plus a short
//!   bidirectional probe.
//! - `ss` — a permutation of `hs` indices in key order. The prefix
//!   `ss[..nr_sorted]` is sorted; later insertions append to the unsorted
//!   tail and are folded in by [`LeafCore::sync_sorted`] before ordered
//!   access.
//!
//! The anchor is immutable for the life of the leaf. `lv` is bumped on
//! every change that can invalidate a cursor position (removal, sort,
//! split, merge, retirement) so optimistic readers can detect stale
//! traversals and re-seek.

use std::sync::{
    Arc, Mutex, RwLock, Weak,
    atomic::{AtomicU64, Ordering},
};

use crate::kv::{KeyRef, Record, pkey};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Maximum records per leaf. Must be a power of two and fit in `u8`
/// indices.
pub(crate) const KPN: usize = 128;

/// Ideal split point.
pub(crate) const MID: usize = KPN / 2;

/// Two adjacent leaves merge when their combined population fits here.
pub(crate) const KPN_MERGE: usize = (KPN + MID) / 2;

// ------------------------------------------------------------------------------------------------
// Leaf
// ------------------------------------------------------------------------------------------------

/// One slot of the partial-key-ordered record array.
#[derive(Debug)]
pub(crate) struct HSlot {
    pub(crate) pkey: u16,
    pub(crate) rec: Box<Record>,
}

/// A leaf node. The anchor and locks live outside the guarded core so the
/// lookup path can check them without lock traffic.
#[derive(Debug)]
pub(crate) struct Leaf {
    /// Smallest key this leaf is responsible for; immutable.
    pub(crate) anchor: Box<[u8]>,

    /// Version, bumped on structural changes.
    pub(crate) lv: AtomicU64,

    /// Serialises sorting of the unsorted tail among competing seekers.
    pub(crate) sortlock: Mutex<()>,

    /// All mutable content.
    pub(crate) core: RwLock<LeafCore>,
}

/// Lock-guarded leaf content.
#[derive(Debug)]
pub(crate) struct LeafCore {
    /// Previous leaf in anchor order. Weak to break the list cycle.
    pub(crate) prev: Weak<Leaf>,

    /// Next leaf in anchor order.
    pub(crate) next: Option<Arc<Leaf>>,

    /// Records ordered by partial key, packed in `[0, nr_keys)`.
    pub(crate) hs: Vec<HSlot>,

    /// Key-order permutation of `hs` indices.
    pub(crate) ss: Vec<u8>,

    /// Length of the sorted prefix of `ss`.
    pub(crate) nr_sorted: usize,

    /// Set when this leaf has been merged away; readers that reach a
    /// retired leaf must retry from the meta map.
    pub(crate) retired: bool,
}

impl Leaf {
    /// Creates a leaf with the given anchor and no records.
    pub(crate) fn new(anchor: Box<[u8]>) -> Arc<Leaf> {
        Arc::new(Leaf {
            anchor,
            lv: AtomicU64::new(0),
            sortlock: Mutex::new(()),
            core: RwLock::new(LeafCore {
                prev: Weak::new(),
                next: None,
                hs: Vec::with_capacity(KPN),
                ss: Vec::with_capacity(KPN),
                nr_sorted: 0,
                retired: false,
            }),
        })
    }

    /// Bumps the leaf version.
    #[inline]
    pub(crate) fn touch(&self) {
        self.lv.fetch_add(1, Ordering::AcqRel);
    }

    /// Current leaf version.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.lv.load(Ordering::Acquire)
    }
}

impl LeafCore {
    /// Current population.
    #[inline]
    pub(crate) fn nr_keys(&self) -> usize {
        self.hs.len()
    }

    /// Whether the leaf is at capacity.
    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.hs.len() == KPN
    }

    /// Whether `key` falls inside this leaf's responsibility range given
    /// the leaf's own anchor.
    pub(crate) fn contains(&self, anchor: &[u8], key: &[u8]) -> bool {
        if self.retired || key < anchor {
            return false;
        }
        match &self.next {
            Some(next) => key < &next.anchor[..],
            None => true,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Point access via the partial-key array
    // --------------------------------------------------------------------------------------------

    /// Index of the record matching `kref` in `hs`, if present.
    ///
    /// Starts from the position the partial key predicts and probes the
    /// run of equal partial keys, comparing full hashes before key bytes.
    pub(crate) fn find(&self, kref: &KeyRef<'_>) -> Option<usize> {
        let pk = pkey(kref.hash32());
        let start = self.hs.partition_point(|slot| slot.pkey < pk);
        for (i, slot) in self.hs.iter().enumerate().skip(start) {
            if slot.pkey != pk {
                break;
            }
            if slot.rec.hash32() == kref.hash32() && slot.rec.key() == kref.bytes() {
                return Some(i);
            }
        }
        None
    }

    /// Borrow the record at `hs` index `idx`.
    #[inline]
    pub(crate) fn record(&self, idx: usize) -> &Record {
        &self.hs[idx].rec
    }

    /// Mutably borrow the record at `hs` index `idx`.
    #[inline]
    pub(crate) fn record_mut(&mut self, idx: usize) -> &mut Record {
        &mut self.hs[idx].rec
    }

    /// Replaces the record at `idx` (same key), returning the old one.
    pub(crate) fn replace(&mut self, idx: usize, rec: Box<Record>) -> Box<Record> {
        debug_assert_eq!(self.hs[idx].rec.key(), rec.key());
        std::mem::replace(&mut self.hs[idx].rec, rec)
    }

    /// Inserts a record not currently present.
    ///
    /// Returns the record back when the leaf is full so the caller can
    /// split and retry.
    pub(crate) fn insert(&mut self, rec: Box<Record>) -> Result<(), Box<Record>> {
        if self.is_full() {
            return Err(rec);
        }
        debug_assert!(self.find(&rec.key_ref()).is_none());

        let pk = pkey(rec.hash32());
        // Insert at the end of the equal-pkey run; later entries shift by
        // one, so the key-order permutation is patched to match.
        let pos = self.hs.partition_point(|slot| slot.pkey <= pk);
        self.hs.insert(pos, HSlot { pkey: pk, rec });
        for idx in self.ss.iter_mut() {
            if usize::from(*idx) >= pos {
                *idx += 1;
            }
        }
        self.ss.push(pos as u8);
        Ok(())
    }

    /// Removes and returns the record at `hs` index `idx`.
    pub(crate) fn remove(&mut self, idx: usize) -> Box<Record> {
        let slot = self.hs.remove(idx);
        let ss_pos = self
            .ss
            .iter()
            .position(|&s| usize::from(s) == idx)
            .unwrap_or_else(|| unreachable!("ss entry missing for hs index {idx}"));
        self.ss.remove(ss_pos);
        for s in self.ss.iter_mut() {
            if usize::from(*s) > idx {
                *s -= 1;
            }
        }
        if ss_pos < self.nr_sorted {
            self.nr_sorted -= 1;
        }
        slot.rec
    }

    // --------------------------------------------------------------------------------------------
    // Ordered access via the sorted permutation
    // --------------------------------------------------------------------------------------------

    /// Whether the sorted prefix covers the whole population.
    #[inline]
    pub(crate) fn is_sorted(&self) -> bool {
        self.nr_sorted == self.hs.len()
    }

    /// Folds the unsorted tail into the sorted permutation.
    pub(crate) fn sync_sorted(&mut self) {
        if self.is_sorted() {
            return;
        }
        let hs = &self.hs;
        self.ss
            .sort_unstable_by(|&a, &b| hs[usize::from(a)].rec.key().cmp(hs[usize::from(b)].rec.key()));
        self.nr_sorted = self.hs.len();
    }

    /// First position in the sorted permutation whose key is `>= key`.
    ///
    /// The caller must have synced the sorted prefix.
    pub(crate) fn search_ge(&self, key: &[u8]) -> usize {
        debug_assert!(self.is_sorted());
        self.ss
            .partition_point(|&s| self.hs[usize::from(s)].rec.key() < key)
    }

    /// First position in the sorted permutation whose key is `> key`.
    ///
    /// The caller must have synced the sorted prefix.
    pub(crate) fn search_gt(&self, key: &[u8]) -> usize {
        debug_assert!(self.is_sorted());
        self.ss
            .partition_point(|&s| self.hs[usize::from(s)].rec.key() <= key)
    }

    /// Borrow the record at sorted position `pos`.
    #[inline]
    pub(crate) fn record_at_sorted(&self, pos: usize) -> &Record {
        &self.hs[usize::from(self.ss[pos])].rec
    }

    /// Drains every record in key order. The caller must have synced the
    /// sorted prefix.
    pub(crate) fn drain_sorted(&mut self) -> Vec<Box<Record>> {
        debug_assert!(self.is_sorted());
        let order: Vec<u8> = self.ss.clone();
        let mut slots: Vec<Option<HSlot>> = self.hs.drain(..).map(Some).collect();
        self.ss.clear();
        self.nr_sorted = 0;
        order
            .into_iter()
            .map(|idx| {
                slots[usize::from(idx)]
                    .take()
                    .unwrap_or_else(|| unreachable!("duplicate ss index"))
                    .rec
            })
            .collect()
    }

    /// Rebuilds the leaf content from records already in key order.
    pub(crate) fn rebuild_from_sorted(&mut self, recs: Vec<Box<Record>>) {
        debug_assert!(recs.len() <= KPN);
        debug_assert!(recs.windows(2).all(|w| w[0].key() < w[1].key()));

        // Tag each record with its key-order position, then order by
        // partial key to lay out hs; ss inverts the mapping.
        let mut tagged: Vec<(u16, usize, Box<Record>)> = recs
            .into_iter()
            .enumerate()
            .map(|(key_pos, rec)| (pkey(rec.hash32()), key_pos, rec))
            .collect();
        tagged.sort_by_key(|(pk, key_pos, _)| (*pk, *key_pos));

        self.hs.clear();
        self.ss.clear();
        self.ss.resize(tagged.len(), 0);
        for (hs_idx, (pk, key_pos, rec)) in tagged.into_iter().enumerate() {
            self.hs.push(HSlot { pkey: pk, rec });
            self.ss[key_pos] = hs_idx as u8;
        }
        self.nr_sorted = self.hs.len();
    }

    // --------------------------------------------------------------------------------------------
    // Split support
    // --------------------------------------------------------------------------------------------

    /// Chooses the split position and the new leaf's anchor.
    ///
    /// The cut is taken near the middle, biased toward the candidate whose
    /// boundary keys have the shortest common prefix — the new anchor is
    /// that prefix plus one byte, and short anchors keep the meta trie
    /// shallow. The caller must have synced the sorted prefix.
    pub(crate) fn split_cut(&self) -> (usize, Box<[u8]>) {
        debug_assert!(self.is_sorted());
        debug_assert!(self.nr_keys() >= 2);

        let n = self.nr_keys();
        let lo = n / 4;
        let hi = (n * 3) / 4;
        let mut best_cut = n / 2;
        let mut best_len = usize::MAX;
        for cut in lo.max(1)..=hi.min(n - 1) {
            let left = self.record_at_sorted(cut - 1).key();
            let right = self.record_at_sorted(cut).key();
            let anchor_len = lcp(left, right) + 1;
            let better = anchor_len < best_len
                || (anchor_len == best_len
                    && cut.abs_diff(n / 2) < best_cut.abs_diff(n / 2));
            if better {
                best_len = anchor_len;
                best_cut = cut;
            }
        }

        let boundary = self.record_at_sorted(best_cut).key();
        debug_assert!(best_len <= boundary.len());
        (best_cut, boundary[..best_len].into())
    }
}

/// Length of the longest common prefix of two byte strings.
pub(crate) fn lcp(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
