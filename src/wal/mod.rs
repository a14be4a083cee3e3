//! # Write-Ahead Log
//!
//! An append-only durability log over **two rotating files**. At any
//! moment one file is the *current* log being appended to; the other is
//! empty, or holds the previous sealed log until compaction subsumes it.
//!
//! ## On-disk layout
//!
//! ```text
//! [store version, 8 bytes LE]
//! [record][record]...[zero padding to page]
//! [record][record]...
//! ```
//!
//! Records use the wire codec of [`crate::kv`]:
//! `klen varint | vlen varint | key | value | key-crc32 LE`. Records are
//! packed back-to-back in a 256 KiB staging buffer; on flush the tail of
//! the last page is zeroed, so recovery detects end-of-records at the
//! first bytes that fail to decode (zero padding decodes to the rejected
//! empty record).
//!
//! ## Durability model
//!
//! Appends only copy into the staging buffer; flushed pages are queued to
//! the async [`ring`] thread, and an fsync is queued automatically every
//! [`WAL_SYNC_INTERVAL`] bytes. Explicit durability points
//! ([`Wal::flush_sync_wait`]) flush, queue an fsync, and drain the ring.
//!
//! The caller serialises every mutating call (the store holds its write
//! lock around them); this module adds no locking of its own.

pub(crate) mod ring;

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::kv::Record;

use ring::WriteRing;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Staging buffer size.
pub(crate) const WAL_BLKSZ: usize = 256 * 1024;

/// Flush granularity; trailing slack in a flushed page is zeroed.
pub(crate) const PGSZ: usize = 4096;

/// An fsync is queued automatically once this many unsynced bytes
/// accumulate.
const WAL_SYNC_INTERVAL: u64 = 64 << 20;

/// Size of the per-file version header.
pub(crate) const WAL_HEADER_SIZE: usize = 8;

/// In-flight staging buffers.
const RING_DEPTH: usize = 32;

/// File names of the two rotating logs.
pub(crate) const WAL_FILE_NAMES: [&str; 2] = ["wal1", "wal2"];

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// The write-ahead log.
///
/// `files[0]` is always the current log; [`Wal::switch`] swaps the pair.
#[derive(Debug)]
pub struct Wal {
    /// Current staging buffer, owned between flushes. `None` only
    /// transiently inside `flush`.
    buf: Option<Box<[u8]>>,

    /// Bytes used in the staging buffer.
    bufoff: usize,

    /// Page-aligned file offset of the next flush.
    woff: u64,

    /// Last `woff` for which an fsync has been queued.
    soff: u64,

    /// Store version written at the head of the current file.
    version: u64,

    /// Rollover threshold for the current file.
    maxsz: u64,

    /// Payload bytes accepted from callers.
    write_user: u64,

    /// Bytes actually flushed to the file, padding included.
    write_nbytes: u64,

    files: [Arc<File>; 2],
    ring: WriteRing,
}

impl Wal {
    /// Opens (creating as needed) the two log files under `dir`.
    ///
    /// No header is written yet: recovery decides which file is current
    /// and calls [`Wal::begin`] or [`Wal::resume`].
    pub fn open(dir: &Path, maxsz: u64) -> Result<Self, WalError> {
        let mut files = Vec::with_capacity(2);
        for name in WAL_FILE_NAMES {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(dir.join(name))?;
            files.push(Arc::new(file));
        }
        let files: [Arc<File>; 2] = match files.try_into() {
            Ok(pair) => pair,
            Err(_) => unreachable!("two file names produce two files"),
        };

        let ring = WriteRing::new(RING_DEPTH);
        let buf = ring.acquire();

        info!(dir = %dir.display(), maxsz, "wal opened");
        Ok(Self {
            buf: Some(buf),
            bufoff: 0,
            woff: 0,
            soff: 0,
            version: 0,
            maxsz,
            write_user: 0,
            write_nbytes: 0,
            files,
            ring,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    /// Aligned offset of the next flush — the current log's size.
    #[inline]
    pub fn woff(&self) -> u64 {
        self.woff
    }

    /// Whether the current log has reached its rollover threshold.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.woff >= self.maxsz
    }

    /// Store version of the current log.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Payload bytes accepted so far.
    #[inline]
    pub fn write_user(&self) -> u64 {
        self.write_user
    }

    /// File bytes flushed so far.
    #[inline]
    pub fn write_nbytes(&self) -> u64 {
        self.write_nbytes
    }

    /// The current log file.
    #[inline]
    pub(crate) fn current_file(&self) -> &Arc<File> {
        &self.files[0]
    }

    /// The sealed (previous) log file.
    #[inline]
    pub(crate) fn sealed_file(&self) -> &Arc<File> {
        &self.files[1]
    }

    /// Swaps which file is current. Recovery uses this to make the newer
    /// log `files[0]` before resuming.
    pub(crate) fn swap_files(&mut self) {
        self.files.swap(0, 1);
    }

    // --------------------------------------------------------------------------------------------
    // Append path
    // --------------------------------------------------------------------------------------------

    /// Appends one record to the staging buffer, flushing first if it
    /// would not fit. Called under the store's write lock.
    pub fn append(&mut self, rec: &Record) {
        let size = rec.wire_len();
        debug_assert!(WAL_HEADER_SIZE + size <= WAL_BLKSZ);
        if self.bufoff + size > WAL_BLKSZ {
            self.flush();
        }

        let bufoff = self.bufoff;
        let buf = self.buf_mut();
        let written = rec.encode_wire(&mut buf[bufoff..bufoff + size]);
        debug_assert_eq!(written, size);
        self.bufoff += size;
        self.write_user += rec.footprint() as u64;
    }

    /// Flushes the staging buffer: pads to a page boundary, queues the
    /// write, and swaps in a fresh buffer.
    pub fn flush(&mut self) {
        if self.bufoff == 0 {
            return;
        }

        let wsize = self.bufoff.div_ceil(PGSZ) * PGSZ;
        debug_assert!(wsize <= WAL_BLKSZ);
        {
            let bufoff = self.bufoff;
            let buf = self.buf_mut();
            buf[bufoff..wsize].fill(0);
        }

        let full = self
            .buf
            .take()
            .unwrap_or_else(|| unreachable!("staging buffer missing"));
        self.ring
            .submit_write(Arc::clone(&self.files[0]), self.woff, full, wsize);
        self.buf = Some(self.ring.acquire());
        self.bufoff = 0;
        self.woff += wsize as u64;
        self.write_nbytes += wsize as u64;

        if self.woff - self.soff >= WAL_SYNC_INTERVAL {
            self.ring.submit_fsync(Arc::clone(&self.files[0]));
            self.soff = self.woff;
        }
    }

    /// Flushes and queues an fsync covering everything written so far.
    pub fn flush_sync(&mut self) {
        self.flush();
        if self.woff != self.soff {
            self.ring.submit_fsync(Arc::clone(&self.files[0]));
            self.soff = self.woff;
        }
    }

    /// Waits for all queued ring operations to complete.
    pub fn io_complete(&self) -> Result<(), WalError> {
        self.ring.drain()
    }

    /// Flushes, fsyncs, and waits for completion — the explicit
    /// durability point.
    pub fn flush_sync_wait(&mut self) -> Result<(), WalError> {
        self.flush_sync();
        self.io_complete()
    }

    // --------------------------------------------------------------------------------------------
    // Rotation
    // --------------------------------------------------------------------------------------------

    /// Seals the current log and starts a fresh one at `version`.
    ///
    /// Returns the sealed log's byte length. The new `files[0]` is the
    /// one now being appended to.
    pub fn switch(&mut self, version: u64) -> Result<u64, WalError> {
        self.flush_sync_wait()?;
        let sealed_len = self.woff;

        self.files.swap(0, 1);
        self.woff = 0;
        self.soff = 0;
        self.begin(version);

        debug!(version, sealed_len, "wal switched");
        Ok(sealed_len)
    }

    /// Starts a fresh log: writes the version header into the staging
    /// buffer. The file itself is assumed empty.
    pub(crate) fn begin(&mut self, version: u64) {
        debug_assert_eq!(self.bufoff, 0);
        let buf = self.buf_mut();
        buf[..WAL_HEADER_SIZE].copy_from_slice(&version.to_le_bytes());
        self.bufoff = WAL_HEADER_SIZE;
        self.version = version;
    }

    /// Resumes appending to an existing log whose valid prefix is
    /// `rsize` bytes: rounds the write offset up to a page and zero-fills
    /// the gap so stale bytes can never decode as records.
    pub(crate) fn resume(&mut self, version: u64, rsize: u64) -> Result<(), WalError> {
        debug_assert_eq!(self.bufoff, 0);
        self.woff = rsize.div_ceil(PGSZ as u64) * PGSZ as u64;
        if self.woff > rsize {
            let zeroes = vec![0u8; (self.woff - rsize) as usize];
            self.files[0].write_all_at(&zeroes, rsize)?;
            self.files[0].sync_data()?;
        }
        self.soff = self.woff;
        self.version = version;
        Ok(())
    }

    /// Truncates the sealed log to zero and makes the truncation
    /// durable. Its contents are subsumed by a snapshot or the current
    /// log by the time this is called.
    pub fn truncate_sealed(&self) -> Result<(), WalError> {
        self.files[1].set_len(0)?;
        self.files[1].sync_data()?;
        Ok(())
    }

    /// Flushes and shuts the ring down.
    pub fn close(mut self) -> Result<(), WalError> {
        self.flush_sync_wait()
    }

    #[inline]
    fn buf_mut(&mut self) -> &mut [u8] {
        self.buf
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("staging buffer missing"))
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // Push out whatever is still staged; errors surface through the
        // explicit close path, not here.
        self.flush_sync();
        let _ = self.ring.drain();
    }
}
