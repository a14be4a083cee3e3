//! Immutable sorted-run files.
//!
//! A run holds one partition's records — live values and tombstones — in
//! key order, with a bloom filter for negative point lookups and a block
//! index for seeks.
//!
//! # On-disk layout
//!
//! ```text
//! [HDR_MAGIC]
//! [DATA_BLOCK_LEN_LE][record stream][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][bloom bytes][BLOOM_CRC32_LE]
//! [INDEX_LEN_LE][index entries][INDEX_CRC32_LE]
//! [PROPS_LEN_LE][properties][PROPS_CRC32_LE]
//! [FOOTER: bloom_off u64 | index_off u64 | props_off u64 | crc32 | FTR_MAGIC]
//! ```
//!
//! Records inside data blocks use the wire codec of [`crate::kv`]. Each
//! block is CRC-protected; the footer checksum covers the three offsets.
//! Files are written to a `.tmp` path and renamed into place, so a
//! half-written run never carries the final name.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use tracing::{debug, trace};

use crate::encoding;
use crate::kv::{KeyRef, Record, decode_wire};
use crate::merge::OrderedIter;

use super::ZoneError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const RUN_HDR_MAGIC: [u8; 4] = *b"TRN1";
const RUN_FTR_MAGIC: [u8; 4] = *b"TRNF";
const RUN_FOOTER_SIZE: usize = 8 + 8 + 8 + 4 + 4;
const RUN_BLOCK_TARGET: usize = 4096;
const RUN_BLOOM_FP_RATE: f64 = 0.01;

/// Upper bound for decoded variable-length fields in a run (a key plus
/// slack; blocks themselves are small).
const RUN_MAX_FIELD: u32 = 1 << 20;

// ------------------------------------------------------------------------------------------------
// Properties
// ------------------------------------------------------------------------------------------------

/// Table-level statistics stored in the properties block.
#[derive(Debug, Clone, Default)]
pub struct RunProps {
    /// Number of records, tombstones included.
    pub record_count: u64,

    /// Number of tombstones among them.
    pub tombstone_count: u64,

    /// Sum of record footprints; the compaction read-amplification
    /// accounting uses this without re-scanning the file.
    pub data_bytes: u64,

    /// Smallest key present (empty for an empty run).
    pub min_key: Vec<u8>,

    /// Largest key present (empty for an empty run).
    pub max_key: Vec<u8>,
}

/// One entry of the block index.
#[derive(Debug, Clone)]
struct IndexEntry {
    first_key: Vec<u8>,
    off: u64,
    len: u32,
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Builds a run file from records already in key order.
///
/// Returns the total file size written. The records slice may be empty;
/// an empty run is a valid placeholder partition. `with_bloom` disables
/// the filter for space-lean deployments at the cost of point-lookup
/// speed.
pub fn build_run(path: &Path, records: &[Box<Record>], with_bloom: bool) -> Result<u64, ZoneError> {
    debug_assert!(records.windows(2).all(|w| w[0].key() < w[1].key()));

    let tmp_path = tmp_path(path);
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&RUN_HDR_MAGIC)?;
    let mut offset = RUN_HDR_MAGIC.len() as u64;

    // Bloom over every key, tombstones included: a tombstone is a
    // definitive answer for its key.
    let mut bloom = if records.is_empty() || !with_bloom {
        None
    } else {
        Some(
            Bloom::<[u8]>::new_for_fp_rate(records.len(), RUN_BLOOM_FP_RATE)
                .map_err(|e| ZoneError::Corruption(format!("bloom sizing: {e}")))?,
        )
    };

    // Data blocks.
    let mut index: Vec<IndexEntry> = Vec::new();
    let mut block = Vec::<u8>::with_capacity(RUN_BLOCK_TARGET * 2);
    let mut block_first_key: Option<Vec<u8>> = None;
    let mut props = RunProps::default();

    let mut flush_block = |writer: &mut BufWriter<File>,
                           offset: &mut u64,
                           block: &mut Vec<u8>,
                           first_key: &mut Option<Vec<u8>>|
     -> Result<(), ZoneError> {
        if block.is_empty() {
            return Ok(());
        }
        let first_key = first_key
            .take()
            .unwrap_or_else(|| unreachable!("non-empty block without a first key"));
        let (off, len) = write_checksummed(writer, offset, block)?;
        index.push(IndexEntry {
            first_key,
            off,
            len,
        });
        block.clear();
        Ok(())
    };

    for rec in records {
        if let Some(bloom) = &mut bloom {
            bloom.set(rec.key());
        }
        props.record_count += 1;
        if rec.is_tombstone() {
            props.tombstone_count += 1;
        }
        props.data_bytes += rec.footprint() as u64;
        if props.record_count == 1 {
            props.min_key = rec.key().to_vec();
        }
        props.max_key = rec.key().to_vec();

        if block_first_key.is_none() {
            block_first_key = Some(rec.key().to_vec());
        }
        let start = block.len();
        block.resize(start + rec.wire_len(), 0);
        rec.encode_wire(&mut block[start..]);

        if block.len() >= RUN_BLOCK_TARGET {
            flush_block(&mut writer, &mut offset, &mut block, &mut block_first_key)?;
        }
    }
    flush_block(&mut writer, &mut offset, &mut block, &mut block_first_key)?;

    // Bloom block.
    let bloom_bytes = bloom.map(|b| b.as_slice().to_vec()).unwrap_or_default();
    let (bloom_off, _) = write_checksummed(&mut writer, &mut offset, &bloom_bytes)?;

    // Index block.
    let mut index_bytes = Vec::new();
    index_bytes.extend_from_slice(&(index.len() as u32).to_le_bytes());
    for entry in &index {
        encoding::put_len_prefixed(&mut index_bytes, &entry.first_key)?;
        index_bytes.extend_from_slice(&entry.off.to_le_bytes());
        index_bytes.extend_from_slice(&entry.len.to_le_bytes());
    }
    let (index_off, _) = write_checksummed(&mut writer, &mut offset, &index_bytes)?;

    // Properties block.
    let mut props_bytes = Vec::new();
    props_bytes.extend_from_slice(&props.record_count.to_le_bytes());
    props_bytes.extend_from_slice(&props.tombstone_count.to_le_bytes());
    props_bytes.extend_from_slice(&props.data_bytes.to_le_bytes());
    encoding::put_len_prefixed(&mut props_bytes, &props.min_key)?;
    encoding::put_len_prefixed(&mut props_bytes, &props.max_key)?;
    let (props_off, _) = write_checksummed(&mut writer, &mut offset, &props_bytes)?;

    // Footer.
    let mut footer = Vec::with_capacity(RUN_FOOTER_SIZE);
    footer.extend_from_slice(&bloom_off.to_le_bytes());
    footer.extend_from_slice(&index_off.to_le_bytes());
    footer.extend_from_slice(&props_off.to_le_bytes());
    let mut hasher = Crc32::new();
    hasher.update(&footer);
    footer.extend_from_slice(&hasher.finalize().to_le_bytes());
    footer.extend_from_slice(&RUN_FTR_MAGIC);
    writer.write_all(&footer)?;
    offset += footer.len() as u64;

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| ZoneError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), records = records.len(), bytes = offset, "run built");
    Ok(offset)
}

/// Writes `[len][payload][crc]`, returning the payload's offset and
/// length.
fn write_checksummed(
    writer: &mut BufWriter<File>,
    offset: &mut u64,
    payload: &[u8],
) -> Result<(u64, u32), ZoneError> {
    let len = payload.len() as u32;
    let mut hasher = Crc32::new();
    hasher.update(payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(&hasher.finalize().to_le_bytes())?;

    let payload_off = *offset + 4;
    *offset += 4 + u64::from(len) + 4;
    Ok((payload_off, len))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// An open, memory-mapped run file.
///
/// Immutable after open; reads are lock-free and thread-safe. Unlinking
/// the file while a `Run` holds it open is fine — the mapping keeps the
/// data reachable until the last reference drops.
pub struct Run {
    path: PathBuf,
    mmap: Mmap,
    bloom: Option<Bloom<[u8]>>,
    index: Vec<IndexEntry>,
    props: RunProps,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("path", &self.path)
            .field("records", &self.props.record_count)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Opens and validates a run file.
    pub fn open(path: &Path) -> Result<Run, ZoneError> {
        let file = File::open(path)?;
        // SAFETY: run files are immutable once renamed into place; the
        // store never writes to a published run.
        let mmap = unsafe { Mmap::map(&file)? };

        let len = mmap.len();
        if len < RUN_HDR_MAGIC.len() + RUN_FOOTER_SIZE || mmap[..4] != RUN_HDR_MAGIC {
            return Err(ZoneError::Corruption(format!(
                "{}: not a run file",
                path.display()
            )));
        }

        let footer = &mmap[len - RUN_FOOTER_SIZE..];
        if footer[RUN_FOOTER_SIZE - 4..] != RUN_FTR_MAGIC {
            return Err(ZoneError::Corruption(format!(
                "{}: bad footer magic",
                path.display()
            )));
        }
        let mut hasher = Crc32::new();
        hasher.update(&footer[..24]);
        if hasher.finalize() != encoding::get_u32_le(&footer[24..])? {
            return Err(ZoneError::Corruption(format!(
                "{}: footer checksum mismatch",
                path.display()
            )));
        }
        let bloom_off = encoding::get_u64_le(footer)?;
        let index_off = encoding::get_u64_le(&footer[8..])?;
        let props_off = encoding::get_u64_le(&footer[16..])?;

        // Bloom.
        let bloom_bytes = read_checksummed(&mmap, bloom_off, path)?;
        let bloom = if bloom_bytes.is_empty() {
            None
        } else {
            Some(
                Bloom::from_slice(bloom_bytes)
                    .map_err(|e| ZoneError::Corruption(format!("{}: bloom: {e}", path.display())))?,
            )
        };

        // Index.
        let index_bytes = read_checksummed(&mmap, index_off, path)?;
        let count = encoding::get_u32_le(index_bytes)? as usize;
        let mut cursor = 4usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let (first_key, consumed) =
                encoding::get_len_prefixed(&index_bytes[cursor..], RUN_MAX_FIELD)?;
            cursor += consumed;
            let off = encoding::get_u64_le(&index_bytes[cursor..])?;
            cursor += 8;
            let len = encoding::get_u32_le(&index_bytes[cursor..])?;
            cursor += 4;
            index.push(IndexEntry {
                first_key: first_key.to_vec(),
                off,
                len,
            });
        }

        // Properties.
        let props_bytes = read_checksummed(&mmap, props_off, path)?;
        let record_count = encoding::get_u64_le(props_bytes)?;
        let tombstone_count = encoding::get_u64_le(&props_bytes[8..])?;
        let data_bytes = encoding::get_u64_le(&props_bytes[16..])?;
        let (min_key, consumed) = encoding::get_len_prefixed(&props_bytes[24..], RUN_MAX_FIELD)?;
        let (max_key, _) =
            encoding::get_len_prefixed(&props_bytes[24 + consumed..], RUN_MAX_FIELD)?;
        let props = RunProps {
            record_count,
            tombstone_count,
            data_bytes,
            min_key: min_key.to_vec(),
            max_key: max_key.to_vec(),
        };

        trace!(path = %path.display(), records = props.record_count, "run opened");
        Ok(Run {
            path: path.to_path_buf(),
            mmap,
            bloom,
            index,
            props,
        })
    }

    /// The run's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Table properties.
    pub fn props(&self) -> &RunProps {
        &self.props
    }

    /// Point lookup. Returns the stored record, tombstones included.
    pub fn get(&self, kref: &KeyRef<'_>) -> Result<Option<Box<Record>>, ZoneError> {
        if self.props.record_count == 0 {
            return Ok(None);
        }
        if let Some(bloom) = &self.bloom
            && !bloom.check(kref.bytes())
        {
            return Ok(None);
        }

        // Last block whose first key is <= the target.
        let pos = self
            .index
            .partition_point(|e| e.first_key.as_slice() <= kref.bytes());
        if pos == 0 {
            return Ok(None);
        }
        let entry = &self.index[pos - 1];
        let block = self.block_payload(entry)?;

        let mut cursor = 0usize;
        while cursor < block.len() {
            let (wire, consumed) = match decode_wire(&block[cursor..])? {
                Some(decoded) => decoded,
                None => {
                    return Err(ZoneError::Corruption(format!(
                        "{}: undecodable record in block",
                        self.path.display()
                    )));
                }
            };
            match wire.key.cmp(kref.bytes()) {
                std::cmp::Ordering::Equal => return Ok(Some(wire.to_record())),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => cursor += consumed,
            }
        }
        Ok(None)
    }

    /// Verified payload of one data block.
    fn block_payload(&self, entry: &IndexEntry) -> Result<&[u8], ZoneError> {
        let start = entry.off as usize;
        let end = start + entry.len as usize;
        if end + 4 > self.mmap.len() {
            return Err(ZoneError::Corruption(format!(
                "{}: block out of bounds",
                self.path.display()
            )));
        }
        let payload = &self.mmap[start..end];
        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != encoding::get_u32_le(&self.mmap[end..])? {
            return Err(ZoneError::Corruption(format!(
                "{}: block checksum mismatch",
                self.path.display()
            )));
        }
        Ok(payload)
    }

    fn read_block_records(&self, block_idx: usize) -> Result<Vec<Box<Record>>, ZoneError> {
        let entry = &self.index[block_idx];
        let block = self.block_payload(entry)?;
        let mut records = Vec::new();
        let mut cursor = 0usize;
        while cursor < block.len() {
            match decode_wire(&block[cursor..])? {
                Some((wire, consumed)) => {
                    records.push(wire.to_record());
                    cursor += consumed;
                }
                None => {
                    return Err(ZoneError::Corruption(format!(
                        "{}: undecodable record in block",
                        self.path.display()
                    )));
                }
            }
        }
        Ok(records)
    }
}

fn read_checksummed<'a>(mmap: &'a Mmap, off: u64, path: &Path) -> Result<&'a [u8], ZoneError> {
    let off = off as usize;
    if off < 4 || off > mmap.len() {
        return Err(ZoneError::Corruption(format!(
            "{}: block offset out of bounds",
            path.display()
        )));
    }
    let len = encoding::get_u32_le(&mmap[off - 4..])? as usize;
    if off + len + 4 > mmap.len() {
        return Err(ZoneError::Corruption(format!(
            "{}: block out of bounds",
            path.display()
        )));
    }
    let payload = &mmap[off..off + len];
    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != encoding::get_u32_le(&mmap[off + len..])? {
        return Err(ZoneError::Corruption(format!(
            "{}: block checksum mismatch",
            path.display()
        )));
    }
    Ok(payload)
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Ordered cursor over one run.
///
/// Decodes one block at a time; corruption discovered mid-iteration ends
/// the cursor (the compaction path re-reads through checked interfaces
/// before trusting data).
pub struct RunIter {
    run: Arc<Run>,
    block_idx: usize,
    records: Vec<Box<Record>>,
    pos: usize,
}

impl RunIter {
    /// Creates an unpositioned cursor; call `seek` before use.
    pub fn new(run: Arc<Run>) -> RunIter {
        RunIter {
            run,
            block_idx: 0,
            records: Vec::new(),
            pos: 0,
        }
    }

    fn load_block(&mut self, block_idx: usize) -> bool {
        self.block_idx = block_idx;
        self.pos = 0;
        if block_idx >= self.run.index.len() {
            self.records = Vec::new();
            return false;
        }
        match self.run.read_block_records(block_idx) {
            Ok(records) => {
                self.records = records;
                true
            }
            Err(_) => {
                self.records = Vec::new();
                false
            }
        }
    }
}

impl OrderedIter for RunIter {
    fn seek(&mut self, key: &[u8]) {
        if self.run.index.is_empty() {
            self.records = Vec::new();
            self.pos = 0;
            return;
        }
        let block_idx = self
            .run
            .index
            .partition_point(|e| e.first_key.as_slice() <= key)
            .saturating_sub(1);
        if !self.load_block(block_idx) {
            return;
        }
        self.pos = self.records.partition_point(|rec| rec.key() < key);
        if self.pos == self.records.len() {
            // Target is past this block; the next block starts at or
            // after it.
            self.load_block(block_idx + 1);
        }
    }

    fn valid(&self) -> bool {
        self.pos < self.records.len()
    }

    fn peek(&self) -> Option<&Record> {
        self.records.get(self.pos).map(|rec| rec.as_ref())
    }

    fn skip1(&mut self) {
        if self.pos + 1 < self.records.len() {
            self.pos += 1;
        } else {
            let next = self.block_idx + 1;
            self.load_block(next);
        }
    }
}
