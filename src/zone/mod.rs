//! # Zone Manager — the on-disk sorted-run tier
//!
//! The store core consumes the on-disk tier through an opaque contract:
//! versioned, reference-counted snapshots with point reads, ordered
//! iteration, a compaction entry point, and anchor enumeration. This
//! module defines that contract ([`ZoneManager`] / [`ZoneSnapshot`]) and
//! provides the built-in implementation ([`tier::RunTier`]): a single
//! level of non-overlapping, partitioned sorted-run files.
//!
//! ## Contract
//!
//! - [`ZoneManager::snapshot`] hands out the current committed snapshot;
//!   holding the `Arc` keeps every file it references readable even
//!   across later compactions.
//! - [`ZoneManager::compact`] absorbs an ordered record stream (the
//!   sealed memtable) into a new snapshot. Partitions whose incoming
//!   bytes are positive but no larger than `max_reject_bytes` may be
//!   *rejected*: they are carried forward unchanged and flagged in the
//!   previous snapshot's anchor list, and the caller must reinsert their
//!   pending records into the write path. `max_reject_bytes == 0`
//!   disables rejection entirely.
//! - [`ZoneSnapshot::anchors`] enumerates the snapshot's partition
//!   anchors with their reject marks, in key order.
//! - Point reads honor tombstones: a key whose freshest version in the
//!   snapshot is a deletion marker reads as absent.

pub mod run;
pub mod tier;

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::kv::{KeyRef, Record};
use crate::merge::OrderedIter;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the zone tier.
#[derive(Debug, Error)]
pub enum ZoneError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decoding error in a run or snapshot file.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A checksum or structural validation failed.
    #[error("corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// Anchors
// ------------------------------------------------------------------------------------------------

/// One partition boundary of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Smallest key the partition is responsible for. The first anchor
    /// of a snapshot is always the empty key.
    pub key: Vec<u8>,

    /// Whether the partition was rejected by the latest compaction
    /// against this snapshot.
    pub rejected: bool,
}

// ------------------------------------------------------------------------------------------------
// Contract traits
// ------------------------------------------------------------------------------------------------

/// The on-disk tier consumed by the store core.
pub trait ZoneManager: Send + Sync {
    /// Version of the committed snapshot. Starts at 1 and increases by
    /// one per compaction.
    fn version(&self) -> u64;

    /// The current committed snapshot.
    fn snapshot(&self) -> Arc<dyn ZoneSnapshot>;

    /// Builds and commits a new snapshot by merging `input` (an ordered,
    /// unique-key record stream, tombstones included) into the current
    /// one. See the module docs for the rejection rule.
    fn compact(&self, input: &mut dyn OrderedIter, max_reject_bytes: u64)
    -> Result<(), ZoneError>;

    /// Total bytes written into run files.
    fn stat_writes(&self) -> u64;

    /// Total bytes read back from run files during compactions.
    fn stat_reads(&self) -> u64;
}

/// An immutable snapshot of the tier.
pub trait ZoneSnapshot: Send + Sync {
    /// The version this snapshot was committed at.
    fn version(&self) -> u64;

    /// Point lookup honoring tombstones: `Ok(None)` for both absent and
    /// deleted keys.
    fn get(&self, kref: &KeyRef<'_>) -> Result<Option<Record>, ZoneError>;

    /// Presence probe honoring tombstones.
    fn probe(&self, kref: &KeyRef<'_>) -> Result<bool, ZoneError>;

    /// Ordered cursor over every record in the snapshot, tombstones
    /// included. The cursor owns a snapshot reference, so it stays valid
    /// across later compactions.
    fn iter(self: Arc<Self>) -> Box<dyn OrderedIter>;

    /// Partition anchors in key order, with current reject marks.
    fn anchors(&self) -> Vec<Anchor>;
}
