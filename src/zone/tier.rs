//! The built-in zone implementation: one level of partitioned runs.
//!
//! A committed snapshot is an ordered list of partitions, each backed by
//! one run file; partition ranges are `[anchor_i, anchor_{i+1})` with the
//! first anchor always the empty key, so the partitions jointly cover the
//! whole keyspace.
//!
//! The `CURRENT` file names the committed snapshot: version plus the
//! `(anchor, file)` list, CRC-protected, rewritten atomically via
//! tmp-and-rename with a directory fsync. Run files for the next
//! snapshot are written *before* `CURRENT` flips, so a crash at any
//! point leaves either the old snapshot (plus harmless orphans, swept on
//! open) or the new one.
//!
//! ## Compaction
//!
//! [`RunTier::compact`] walks the incoming record stream once, slicing
//! it along the existing partition boundaries:
//!
//! - no incoming data → the partition is carried forward untouched;
//! - a trickle (incoming bytes far below the partition's size) may be
//!   *rejected*: carried forward untouched and flagged so the caller
//!   reinserts the pending records upstream — rewriting a big partition
//!   for a trickle is the write-amplification worst case. Total
//!   rejected bytes per compaction are capped at `max_reject_bytes`,
//!   so every compaction makes net progress; a zero cap disables
//!   rejection entirely;
//! - otherwise the partition is rewritten. Consecutive rewrites merge as
//!   one group, and the group's output is re-chunked at the run size
//!   target — oversized partitions split and dwarf neighbours coalesce
//!   in the same pass. Tombstones are dropped on rewrite: there is no
//!   older tier left for them to shadow.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crc32fast::Hasher as Crc32;
use tracing::{debug, info, warn};

use crate::encoding;
use crate::kv::{KeyRef, Record};
use crate::merge::{MergeIter, OrderedIter, TombstoneFilter, VecIter};

use super::run::{Run, RunIter, build_run};
use super::{Anchor, ZoneError, ZoneManager, ZoneSnapshot};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const CURRENT_FILE: &str = "CURRENT";
const CURRENT_MAGIC: [u8; 4] = *b"TCUR";
const RUN_PREFIX: &str = "run-";
const RUN_SUFFIX: &str = ".run";

/// Anchors and file names in `CURRENT` are bounded by this.
const CURRENT_MAX_FIELD: u32 = 1 << 20;

/// Default output run size target.
pub const DEFAULT_RUN_TARGET_BYTES: u64 = 8 << 20;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tier tuning knobs.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Target byte size of a rewritten run; group outputs are chunked at
    /// this granularity.
    pub run_target_bytes: u64,

    /// Derive short partition anchors (longest common prefix plus one
    /// byte) instead of storing full boundary keys.
    pub compact_keys: bool,

    /// Build per-run bloom filters. Disabling saves space and build time
    /// but makes negative point lookups scan a block.
    pub tags: bool,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            run_target_bytes: DEFAULT_RUN_TARGET_BYTES,
            compact_keys: true,
            tags: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot
// ------------------------------------------------------------------------------------------------

/// One partition of a snapshot.
#[derive(Debug)]
struct TierPartition {
    /// Range start; the partition covers `[anchor, next.anchor)`.
    anchor: Vec<u8>,

    run: Arc<Run>,

    /// Set by a compaction that rejected this partition.
    rejected: AtomicBool,
}

/// An immutable, committed snapshot of the tier.
#[derive(Debug)]
pub struct TierSnapshot {
    version: u64,
    parts: Vec<TierPartition>,
}

impl TierSnapshot {
    /// Partition responsible for `key`.
    fn part_for(&self, key: &[u8]) -> &TierPartition {
        let pos = self
            .parts
            .partition_point(|p| p.anchor.as_slice() <= key);
        debug_assert!(pos > 0, "first anchor is the empty key");
        &self.parts[pos - 1]
    }
}

impl ZoneSnapshot for TierSnapshot {
    fn version(&self) -> u64 {
        self.version
    }

    fn get(&self, kref: &KeyRef<'_>) -> Result<Option<Record>, ZoneError> {
        match self.part_for(kref.bytes()).run.get(kref)? {
            Some(rec) if rec.is_tombstone() => Ok(None),
            Some(rec) => Ok(Some(*rec)),
            None => Ok(None),
        }
    }

    fn probe(&self, kref: &KeyRef<'_>) -> Result<bool, ZoneError> {
        Ok(matches!(
            self.part_for(kref.bytes()).run.get(kref)?,
            Some(rec) if !rec.is_tombstone()
        ))
    }

    fn iter(self: Arc<Self>) -> Box<dyn OrderedIter> {
        Box::new(SnapshotIter {
            snapshot: self,
            part_idx: 0,
            inner: None,
        })
    }

    fn anchors(&self) -> Vec<Anchor> {
        self.parts
            .iter()
            .map(|p| Anchor {
                key: p.anchor.clone(),
                rejected: p.rejected.load(Ordering::Acquire),
            })
            .collect()
    }
}

/// Ordered cursor chaining the snapshot's partitions.
struct SnapshotIter {
    snapshot: Arc<TierSnapshot>,
    part_idx: usize,
    inner: Option<RunIter>,
}

impl SnapshotIter {
    /// Advance into following partitions until a record appears.
    fn settle(&mut self) {
        loop {
            if self.inner.as_ref().is_some_and(|it| it.valid()) {
                return;
            }
            self.part_idx += 1;
            match self.snapshot.parts.get(self.part_idx) {
                Some(part) => {
                    let mut it = RunIter::new(Arc::clone(&part.run));
                    it.seek(b"");
                    self.inner = Some(it);
                }
                None => {
                    self.inner = None;
                    return;
                }
            }
        }
    }
}

impl OrderedIter for SnapshotIter {
    fn seek(&mut self, key: &[u8]) {
        let pos = self
            .snapshot
            .parts
            .partition_point(|p| p.anchor.as_slice() <= key);
        self.part_idx = pos.saturating_sub(1);
        let part = &self.snapshot.parts[self.part_idx];
        let mut it = RunIter::new(Arc::clone(&part.run));
        it.seek(key);
        self.inner = Some(it);
        self.settle();
    }

    fn valid(&self) -> bool {
        self.inner.as_ref().is_some_and(|it| it.valid())
    }

    fn peek(&self) -> Option<&Record> {
        self.inner.as_ref().and_then(|it| it.peek())
    }

    fn skip1(&mut self) {
        if let Some(inner) = &mut self.inner {
            inner.skip1();
        }
        self.settle();
    }
}

// ------------------------------------------------------------------------------------------------
// RunTier
// ------------------------------------------------------------------------------------------------

/// The file-backed zone manager.
#[derive(Debug)]
pub struct RunTier {
    dir: PathBuf,
    config: TierConfig,
    current: Mutex<Arc<TierSnapshot>>,
    next_seq: AtomicU64,
    stat_writes: AtomicU64,
    stat_reads: AtomicU64,
}

impl RunTier {
    /// Opens (or bootstraps) the tier under `dir`.
    ///
    /// A fresh directory gets snapshot version 1 with a single empty
    /// partition anchored at the empty key. Run files not referenced by
    /// `CURRENT` — leftovers of a crash mid-compaction — are deleted.
    pub fn open(dir: &Path, config: TierConfig) -> Result<Arc<RunTier>, ZoneError> {
        fs::create_dir_all(dir)?;
        let current_path = dir.join(CURRENT_FILE);

        let (snapshot, max_seq) = if current_path.exists() {
            Self::load_current(dir, &current_path)?
        } else {
            let seq = 1u64;
            let name = run_file_name(seq);
            build_run(&dir.join(&name), &[], config.tags)?;
            let snapshot = TierSnapshot {
                version: 1,
                parts: vec![TierPartition {
                    anchor: Vec::new(),
                    run: Arc::new(Run::open(&dir.join(&name))?),
                    rejected: AtomicBool::new(false),
                }],
            };
            write_current(dir, snapshot.version, &snapshot.parts)?;
            info!(dir = %dir.display(), "tier bootstrapped");
            (snapshot, seq)
        };

        let tier = Arc::new(RunTier {
            dir: dir.to_path_buf(),
            config,
            current: Mutex::new(Arc::new(snapshot)),
            next_seq: AtomicU64::new(max_seq + 1),
            stat_writes: AtomicU64::new(0),
            stat_reads: AtomicU64::new(0),
        });
        tier.sweep_orphans()?;
        Ok(tier)
    }

    fn load_current(
        dir: &Path,
        current_path: &Path,
    ) -> Result<(TierSnapshot, u64), ZoneError> {
        let bytes = fs::read(current_path)?;
        if bytes.len() < 4 + 8 + 4 + 4 || bytes[..4] != CURRENT_MAGIC {
            return Err(ZoneError::Corruption("CURRENT: bad magic".into()));
        }
        let body = &bytes[..bytes.len() - 4];
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != encoding::get_u32_le(&bytes[bytes.len() - 4..])? {
            return Err(ZoneError::Corruption("CURRENT: checksum mismatch".into()));
        }

        let version = encoding::get_u64_le(&body[4..])?;
        let count = encoding::get_u32_le(&body[12..])? as usize;
        let mut cursor = 16usize;
        let mut parts = Vec::with_capacity(count);
        let mut max_seq = 0u64;
        for _ in 0..count {
            let (anchor, consumed) =
                encoding::get_len_prefixed(&body[cursor..], CURRENT_MAX_FIELD)?;
            cursor += consumed;
            let (name, consumed) = encoding::get_len_prefixed(&body[cursor..], CURRENT_MAX_FIELD)?;
            cursor += consumed;
            let name = std::str::from_utf8(name)
                .map_err(|_| ZoneError::Corruption("CURRENT: non-utf8 file name".into()))?;
            if let Some(seq) = parse_run_seq(name) {
                max_seq = max_seq.max(seq);
            }
            parts.push(TierPartition {
                anchor: anchor.to_vec(),
                run: Arc::new(Run::open(&dir.join(name))?),
                rejected: AtomicBool::new(false),
            });
        }
        if parts.is_empty() || !parts[0].anchor.is_empty() {
            return Err(ZoneError::Corruption(
                "CURRENT: first anchor must be empty".into(),
            ));
        }

        debug!(version, parts = parts.len(), "tier snapshot loaded");
        Ok((TierSnapshot { version, parts }, max_seq))
    }

    /// Deletes run files not referenced by the committed snapshot.
    fn sweep_orphans(&self) -> Result<(), ZoneError> {
        let current = self.current_snapshot();
        let referenced: Vec<PathBuf> = current.parts.iter().map(|p| p.run.path().to_path_buf()).collect();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_run = name.starts_with(RUN_PREFIX)
                && (name.ends_with(RUN_SUFFIX) || name.ends_with(".tmp"));
            let is_stale_current = name == "CURRENT.tmp";
            if (is_run || is_stale_current) && !referenced.iter().any(|r| r == &path) {
                warn!(path = %path.display(), "sweeping orphan tier file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn current_snapshot(&self) -> Arc<TierSnapshot> {
        Arc::clone(
            &self
                .current
                .lock()
                .unwrap_or_else(|_| panic!("tier mutex poisoned")),
        )
    }

    fn alloc_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::AcqRel)
    }
}

impl ZoneManager for RunTier {
    fn version(&self) -> u64 {
        self.current_snapshot().version
    }

    fn snapshot(&self) -> Arc<dyn ZoneSnapshot> {
        self.current_snapshot()
    }

    fn compact(
        &self,
        input: &mut dyn OrderedIter,
        max_reject_bytes: u64,
    ) -> Result<(), ZoneError> {
        let old = self.current_snapshot();
        input.seek(b"");

        // Phase 1: slice the input along the old partition boundaries
        // and decide each partition's fate. Rejection defers a rewrite
        // whose incoming data is a small fraction of the partition it
        // would rewrite; the total rejected bytes per compaction are
        // bounded by `max_reject_bytes` so the write path always makes
        // net progress.
        enum Plan {
            Carry,
            Rewrite(Vec<Box<Record>>),
        }
        let mut reject_budget = max_reject_bytes;
        let mut plans = Vec::with_capacity(old.parts.len());
        for (idx, part) in old.parts.iter().enumerate() {
            let upper = old.parts.get(idx + 1).map(|p| p.anchor.as_slice());
            let mut pending: Vec<Box<Record>> = Vec::new();
            let mut pending_bytes = 0u64;
            while let Some(rec) = input.peek() {
                if upper.is_some_and(|up| rec.key() >= up) {
                    break;
                }
                pending_bytes += rec.footprint() as u64;
                pending.push(Box::new(rec.clone()));
                input.skip1();
            }

            let disproportionate = pending_bytes * 4 < part.run.props().data_bytes;
            if pending.is_empty() {
                plans.push(Plan::Carry);
            } else if disproportionate && pending_bytes <= reject_budget {
                reject_budget -= pending_bytes;
                part.rejected.store(true, Ordering::Release);
                plans.push(Plan::Carry);
            } else {
                plans.push(Plan::Rewrite(pending));
            }
        }

        // Phase 2: build the new partition list, merging consecutive
        // rewrites as one group.
        let mut new_parts: Vec<TierPartition> = Vec::with_capacity(old.parts.len());
        let mut written = 0u64;
        let mut read_back = 0u64;
        let mut rewritten_old: Vec<PathBuf> = Vec::new();

        let mut idx = 0usize;
        while idx < old.parts.len() {
            if matches!(plans[idx], Plan::Carry) {
                let part = &old.parts[idx];
                new_parts.push(TierPartition {
                    anchor: part.anchor.clone(),
                    run: Arc::clone(&part.run),
                    rejected: AtomicBool::new(false),
                });
                idx += 1;
                continue;
            }

            let group_start = idx;
            let mut group_pending: Vec<Box<Record>> = Vec::new();
            while idx < old.parts.len() {
                match &mut plans[idx] {
                    Plan::Rewrite(pending) => {
                        group_pending.append(pending);
                        idx += 1;
                    }
                    Plan::Carry => break,
                }
            }

            let mut merged = MergeIter::new();
            for part in &old.parts[group_start..idx] {
                read_back += part.run.props().data_bytes;
                rewritten_old.push(part.run.path().to_path_buf());
                merged.add(Box::new(RunIter::new(Arc::clone(&part.run))));
            }
            merged.add(Box::new(VecIter::new(group_pending)));

            // Rewrites see the complete state of their range, so
            // surviving tombstones have nothing left to shadow.
            let mut live = TombstoneFilter::new(merged);
            live.seek(b"");

            let group_anchor = old.parts[group_start].anchor.clone();
            written += self.build_group(group_anchor, &mut live, &mut new_parts)?;
        }

        // Phase 3: commit.
        let version = old.version + 1;
        write_current(&self.dir, version, &new_parts)?;
        {
            let mut current = self
                .current
                .lock()
                .unwrap_or_else(|_| panic!("tier mutex poisoned"));
            *current = Arc::new(TierSnapshot {
                version,
                parts: new_parts,
            });
        }
        self.stat_writes.fetch_add(written, Ordering::AcqRel);
        self.stat_reads.fetch_add(read_back, Ordering::AcqRel);

        // Unlinking is safe while older snapshots still hold the runs
        // open; the mappings keep the bytes readable.
        for path in rewritten_old {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "removing rewritten run failed");
            }
        }

        info!(
            version,
            written_bytes = written,
            read_bytes = read_back,
            "tier compaction committed"
        );
        Ok(())
    }

    fn stat_writes(&self) -> u64 {
        self.stat_writes.load(Ordering::Acquire)
    }

    fn stat_reads(&self) -> u64 {
        self.stat_reads.load(Ordering::Acquire)
    }
}

impl RunTier {
    /// Streams a rewrite group's live records into run-target-sized
    /// partitions. Returns bytes written.
    fn build_group(
        &self,
        group_anchor: Vec<u8>,
        live: &mut TombstoneFilter,
        new_parts: &mut Vec<TierPartition>,
    ) -> Result<u64, ZoneError> {
        let mut written = 0u64;
        let mut anchor = Some(group_anchor);
        let mut prev_last_key: Option<Vec<u8>> = None;
        let mut emitted_any = false;

        loop {
            let mut chunk: Vec<Box<Record>> = Vec::new();
            let mut chunk_bytes = 0u64;
            while let Some(rec) = live.peek() {
                chunk_bytes += rec.footprint() as u64;
                chunk.push(Box::new(rec.clone()));
                live.skip1();
                if chunk_bytes >= self.config.run_target_bytes {
                    break;
                }
            }
            if chunk.is_empty() && emitted_any {
                break;
            }

            // The first chunk keeps the group's range start; later
            // chunks anchor at their own first key, shortened to the
            // separating prefix when compact keys are on. An
            // all-tombstone group still emits one empty run so the
            // partition list keeps covering the range.
            let part_anchor = match anchor.take() {
                Some(a) => a,
                None => {
                    let first = chunk
                        .first()
                        .map(|rec| rec.key())
                        .unwrap_or_else(|| unreachable!("later chunks are never empty"));
                    match (&prev_last_key, self.config.compact_keys) {
                        (Some(prev), true) => {
                            let cut = crate::index::leaf::lcp(prev, first) + 1;
                            first[..cut.min(first.len())].to_vec()
                        }
                        _ => first.to_vec(),
                    }
                }
            };

            let name = run_file_name(self.alloc_seq());
            let path = self.dir.join(&name);
            written += build_run(&path, &chunk, self.config.tags)?;
            new_parts.push(TierPartition {
                anchor: part_anchor,
                run: Arc::new(Run::open(&path)?),
                rejected: AtomicBool::new(false),
            });
            emitted_any = true;

            if !live.valid() {
                break;
            }
            prev_last_key = chunk.last().map(|rec| rec.key().to_vec());
        }
        Ok(written)
    }
}

// ------------------------------------------------------------------------------------------------
// CURRENT file
// ------------------------------------------------------------------------------------------------

fn write_current(dir: &Path, version: u64, parts: &[TierPartition]) -> Result<(), ZoneError> {
    let mut body = Vec::new();
    body.extend_from_slice(&CURRENT_MAGIC);
    body.extend_from_slice(&version.to_le_bytes());
    body.extend_from_slice(&(parts.len() as u32).to_le_bytes());
    for part in parts {
        encoding::put_len_prefixed(&mut body, &part.anchor)?;
        let name = part
            .run
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_else(|| unreachable!("run paths carry utf8 file names"));
        encoding::put_len_prefixed(&mut body, name.as_bytes())?;
    }
    let mut hasher = Crc32::new();
    hasher.update(&body);
    body.extend_from_slice(&hasher.finalize().to_le_bytes());

    let tmp = dir.join("CURRENT.tmp");
    fs::write(&tmp, &body)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dir.join(CURRENT_FILE))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn run_file_name(seq: u64) -> String {
    format!("{RUN_PREFIX}{seq:06}{RUN_SUFFIX}")
}

fn parse_run_seq(name: &str) -> Option<u64> {
    name.strip_prefix(RUN_PREFIX)?
        .strip_suffix(RUN_SUFFIX)?
        .parse()
        .ok()
}
