//! # TrellisDB
//!
//! An embeddable, ordered key-value store optimized for point lookups,
//! range scans, and high-throughput writes on a single host. Writes are
//! made durable through a write-ahead log and a tier of immutable
//! sorted-run files; an in-memory trie-indexed memtable absorbs writes
//! and is periodically compacted into the on-disk tier.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │                                                             │
//! │   writes ──► WAL ──► writable memtable (trie index)         │
//! │                          │ seal (view rotation)             │
//! │                          ▼                                  │
//! │                  immutable memtable                         │
//! │                          │ compaction                       │
//! │                          ▼                                  │
//! │              zone tier (partitioned sorted runs)            │
//! │                                                             │
//! │   reads: writable ─► immutable ─► zone snapshot             │
//! │   scans: rank-merged view of all three layers               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Top-level store — open, read, write, merge, scan, recovery |
//! | [`index`] | Concurrent ordered memtable: a trie of hashed prefixes over sorted leaves |
//! | [`wal`] | Two-file rotating write-ahead log with asynchronous page writes |
//! | [`zone`] | The sorted-run tier: versioned snapshots, partitioned compaction |
//! | [`merge`] | Rank-ordered multi-way merging over the layers |
//! | [`qsbr`] | Quiescent-state reclamation gating view and index republication |
//! | [`kv`] | Record model, key references, hashing, wire codec |
//! | [`encoding`] | Varint and fixed-width binary primitives |
//!
//! ## Key properties
//!
//! - **Durable prefix** — every mutation is in the WAL before it becomes
//!   visible; `sync` makes everything appended so far crash-safe.
//! - **Lock-free read descent** — point lookups reach their leaf without
//!   taking any shared lock, then hold one leaf read lock briefly.
//! - **Non-blocking rotation** — sealing a memtable is a pointer swap
//!   plus a log switch under a short critical section; readers and
//!   writers chase the new view at their next operation.
//! - **Bounded write amplification** — compaction rewrites only the
//!   partitions with enough new data; trickles are rejected and fed back
//!   through the write path instead of forcing a rewrite.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use trellisdb::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/trellis-demo", StoreConfig::default()).unwrap();
//! let mut db = store.make_ref().unwrap();
//!
//! db.put(b"remix", b"easy").unwrap();
//! assert_eq!(db.get(b"remix").unwrap(), Some(b"easy".to_vec()));
//!
//! db.del(b"remix").unwrap();
//! assert!(!db.probe(b"remix").unwrap());
//!
//! db.put(b"00", b"zero").unwrap();
//! db.put(b"11", b"one").unwrap();
//! db.sync().unwrap();
//!
//! let mut iter = db.iter().unwrap();
//! iter.seek(b"").unwrap();
//! while let Some((key, value)) = iter.peek() {
//!     println!("{key:?} = {value:?}");
//!     iter.skip1();
//! }
//! drop(iter);
//!
//! drop(db);
//! store.close().unwrap();
//! ```

pub mod encoding;
pub mod index;
pub mod kv;
pub mod merge;
pub mod qsbr;
pub mod store;
pub mod wal;
pub mod zone;

pub use store::{Store, StoreConfig, StoreError, StoreIter, StoreRef};
