//! # Key-Value Record Model
//!
//! Core data types shared by every layer of the store: the owned
//! [`Record`], the borrowed [`KeyRef`], key hashing, size accounting, and
//! the wire codec used by both the write-ahead log and the sorted-run
//! files.
//!
//! ## Design Invariants
//!
//! - Every record carries a precomputed 32-bit key hash:
//!   `record.hash32() == hash32(record.key())` for any record in any
//!   component.
//! - The tombstone flag lives in the high half of the stored value-length
//!   field ([`TOMBSTONE_FLAG`]); readers mask with [`VLEN_MASK`] for the
//!   payload length. A tombstone's payload length is zero, but encoders
//!   preserve the full raw field so it round-trips.
//! - `klen < 65536`, `vlen < 65536`, and `klen + vlen <=` [`MAX_KV_SIZE`].
//!
//! # Wire format
//!
//! ```text
//! [klen varint][vlen_raw varint][key bytes][value bytes][key crc32 LE]
//! ```
//!
//! The trailing checksum covers only the key; it doubles as the record's
//! 32-bit key hash, so replay never recomputes it on the happy path.


use crate::encoding::{self, EncodingError};
use crc32fast::Hasher as Crc32;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Seed for the 32-bit key hash.
pub const HASH_SEED: u32 = 0xdead_beef;

/// Tombstone flag stored in the high half of the raw value-length field.
pub const TOMBSTONE_FLAG: u32 = 1 << 16;

/// Mask extracting the payload length from a raw value-length field.
pub const VLEN_MASK: u32 = 0xffff;

/// Combined key+value byte limit for a single record.
pub const MAX_KV_SIZE: usize = 65500;

/// Accounting overhead charged per record in addition to its payload.
pub const RECORD_HEADER_SIZE: usize = 16;

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

/// Returns a CRC hasher seeded for key hashing.
///
/// Exposed so the trie index can hash key prefixes incrementally: clone the
/// hasher at a known prefix length and feed only the added bytes.
#[inline]
pub fn key_hasher() -> Crc32 {
    Crc32::new_with_initial(HASH_SEED)
}

/// Computes the seeded 32-bit hash of `key`.
#[inline]
pub fn hash32(key: &[u8]) -> u32 {
    let mut hasher = key_hasher();
    hasher.update(key);
    hasher.finalize()
}

/// Extends a 32-bit key hash to 64 bits: `hi = !lo; (hi << 32) | lo`.
#[inline]
pub fn hash64(hash32: u32) -> u64 {
    (u64::from(!hash32) << 32) | u64::from(hash32)
}

/// Derives the nonzero 16-bit partial key the leaf hash slots store.
///
/// Empty slots read as zero, so a live partial key must never be zero.
#[inline]
pub fn pkey(hash32: u32) -> u16 {
    let p = ((hash32 >> 16) ^ hash32) as u16;
    if p != 0 { p } else { 1 }
}

// ------------------------------------------------------------------------------------------------
// KeyRef — a borrowed key with its hash
// ------------------------------------------------------------------------------------------------

/// A lightweight borrow of a key, carrying its precomputed hash so lookup
/// paths never copy or rehash.
///
/// The null key reference has `len == 0` and the hash of the empty string.
#[derive(Debug, Clone, Copy)]
pub struct KeyRef<'a> {
    bytes: &'a [u8],
    hash32: u32,
}

impl<'a> KeyRef<'a> {
    /// Builds a key reference, hashing `bytes`.
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            hash32: hash32(bytes),
        }
    }

    /// Builds a key reference from a key whose hash is already known.
    #[inline]
    pub fn from_hash(bytes: &'a [u8], hash32: u32) -> Self {
        debug_assert_eq!(hash32, self::hash32(bytes));
        Self { bytes, hash32 }
    }

    /// The key bytes.
    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The key length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether this is the null (empty) key.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The seeded 32-bit key hash.
    #[inline]
    pub fn hash32(&self) -> u32 {
        self.hash32
    }
}

// ------------------------------------------------------------------------------------------------
// Record — an owned key-value pair (or tombstone)
// ------------------------------------------------------------------------------------------------

/// An owned key-value record.
///
/// Key and value bytes live in a single allocation (`[key][value]`). A
/// record with the tombstone flag set represents a deletion marker: its
/// logical value is empty, and readers treat the key as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    hash32: u32,
    klen: u16,
    vlen_raw: u32,
    data: Box<[u8]>,
}

impl Record {
    /// Creates a record from key and value bytes.
    ///
    /// Returns `None` when the key or value exceeds the per-field limit or
    /// the combined [`MAX_KV_SIZE`] budget — the caller surfaces that as a
    /// `false` result, not an error.
    pub fn new(key: &[u8], value: &[u8]) -> Option<Box<Record>> {
        if key.len() >= 1 << 16 || value.len() >= 1 << 16 {
            return None;
        }
        if key.len() + value.len() > MAX_KV_SIZE {
            return None;
        }

        let mut data = Vec::with_capacity(key.len() + value.len());
        data.extend_from_slice(key);
        data.extend_from_slice(value);

        Some(Box::new(Record {
            hash32: hash32(key),
            klen: key.len() as u16,
            vlen_raw: value.len() as u32,
            data: data.into_boxed_slice(),
        }))
    }

    /// Creates a tombstone (deletion marker) for `key`.
    pub fn tombstone(key: &KeyRef<'_>) -> Option<Box<Record>> {
        if key.len() >= 1 << 16 {
            return None;
        }
        Some(Box::new(Record {
            hash32: key.hash32(),
            klen: key.len() as u16,
            vlen_raw: TOMBSTONE_FLAG,
            data: key.bytes().to_vec().into_boxed_slice(),
        }))
    }

    /// Rebuilds a record from decoded wire parts, trusting the caller's
    /// checksum validation.
    pub(crate) fn from_wire(key: &[u8], value: &[u8], vlen_raw: u32, hash32: u32) -> Box<Record> {
        debug_assert_eq!((vlen_raw & VLEN_MASK) as usize, value.len());
        let mut data = Vec::with_capacity(key.len() + value.len());
        data.extend_from_slice(key);
        data.extend_from_slice(value);
        Box::new(Record {
            hash32,
            klen: key.len() as u16,
            vlen_raw,
            data: data.into_boxed_slice(),
        })
    }

    /// The key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.data[..self.klen as usize]
    }

    /// The value payload. Empty for tombstones.
    #[inline]
    pub fn value(&self) -> &[u8] {
        let vlen = (self.vlen_raw & VLEN_MASK) as usize;
        &self.data[self.klen as usize..self.klen as usize + vlen]
    }

    /// Mutable borrow of the value payload for in-place updates. The
    /// payload length cannot change through this.
    #[inline]
    pub fn value_mut(&mut self) -> &mut [u8] {
        let klen = self.klen as usize;
        let vlen = (self.vlen_raw & VLEN_MASK) as usize;
        &mut self.data[klen..klen + vlen]
    }

    /// A [`KeyRef`] borrowing this record's key.
    #[inline]
    pub fn key_ref(&self) -> KeyRef<'_> {
        KeyRef {
            bytes: self.key(),
            hash32: self.hash32,
        }
    }

    /// The seeded 32-bit key hash.
    #[inline]
    pub fn hash32(&self) -> u32 {
        self.hash32
    }

    /// The 64-bit hash extension.
    #[inline]
    pub fn hash64(&self) -> u64 {
        hash64(self.hash32)
    }

    /// The raw value-length field, tombstone flag included.
    #[inline]
    pub fn vlen_raw(&self) -> u32 {
        self.vlen_raw
    }

    /// Whether this record is a deletion marker.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.vlen_raw & TOMBSTONE_FLAG != 0
    }

    /// Bytes charged against the memtable budget for this record.
    #[inline]
    pub fn footprint(&self) -> usize {
        RECORD_HEADER_SIZE + self.data.len()
    }

    // --------------------------------------------------------------------------------------------
    // Wire codec
    // --------------------------------------------------------------------------------------------

    /// Encoded size of this record on the wire.
    #[inline]
    pub fn wire_len(&self) -> usize {
        encoding::varint_len(u32::from(self.klen))
            + encoding::varint_len(self.vlen_raw)
            + self.data.len()
            + 4
    }

    /// Encodes this record into `buf`, returning the bytes written.
    ///
    /// `buf` must hold at least [`Record::wire_len`] bytes.
    pub fn encode_wire(&self, buf: &mut [u8]) -> usize {
        let mut off = encoding::put_varint(buf, u32::from(self.klen));
        off += encoding::put_varint(&mut buf[off..], self.vlen_raw);
        buf[off..off + self.data.len()].copy_from_slice(&self.data);
        off += self.data.len();
        buf[off..off + 4].copy_from_slice(&self.hash32.to_le_bytes());
        off + 4
    }
}

// ------------------------------------------------------------------------------------------------
// Wire decoding
// ------------------------------------------------------------------------------------------------

/// A record decoded from the wire, borrowing the underlying buffer.
#[derive(Debug)]
pub struct WireRecord<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Value payload bytes (tombstones decode to an empty slice).
    pub value: &'a [u8],
    /// Raw value-length field, flag included.
    pub vlen_raw: u32,
    /// The stored key checksum, verified against the key bytes.
    pub hash32: u32,
}

impl<'a> WireRecord<'a> {
    /// Whether the decoded record is a deletion marker.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.vlen_raw & TOMBSTONE_FLAG != 0
    }

    /// Converts the borrowed record into an owned [`Record`].
    pub fn to_record(&self) -> Box<Record> {
        Record::from_wire(self.key, self.value, self.vlen_raw, self.hash32)
    }

    /// Bytes the owned form of this record charges against the memtable.
    #[inline]
    pub fn footprint(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.value.len()
    }
}

/// Decodes one wire record from the beginning of `buf`.
///
/// Returns `Ok(None)` when the bytes at `buf` are not a valid record — a
/// record is valid iff the varints decode, the payload and checksum fit
/// in the buffer, the stored key checksum matches, and the length fields
/// are not both zero (rejecting the zero record that pure padding would
/// otherwise decode to; an empty-key tombstone has a nonzero raw value
/// length and stays decodable). Replay treats the first invalid record
/// as end-of-log, so invalidity is a clean stop, not an error.
pub fn decode_wire(buf: &[u8]) -> Result<Option<(WireRecord<'_>, usize)>, EncodingError> {
    let (klen, n1) = match encoding::get_varint(buf) {
        Ok(v) => v,
        Err(EncodingError::UnexpectedEof { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    let (vlen_raw, n2) = match encoding::get_varint(&buf[n1..]) {
        Ok(v) => v,
        Err(EncodingError::UnexpectedEof { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let klen = klen as usize;
    let vlen = (vlen_raw & VLEN_MASK) as usize;
    if klen == 0 && vlen_raw == 0 {
        return Ok(None);
    }

    let payload_off = n1 + n2;
    let total = payload_off + klen + vlen + 4;
    if buf.len() < total {
        return Ok(None);
    }

    let key = &buf[payload_off..payload_off + klen];
    let value = &buf[payload_off + klen..payload_off + klen + vlen];
    let stored = match encoding::get_u32_le(&buf[payload_off + klen + vlen..]) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if stored != hash32(key) {
        return Ok(None);
    }

    Ok(Some((
        WireRecord {
            key,
            value,
            vlen_raw,
            hash32: stored,
        },
        total,
    )))
}
