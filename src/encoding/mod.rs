//! Deterministic binary encoding primitives for on-disk persistence.
//!
//! This module provides the variable-length integer codec and the bounded
//! little-endian readers shared by the write-ahead log and the sorted-run
//! files. The crate owns this format, so the on-disk representation never
//! changes due to a dependency upgrade.
//!
//! # Wire format
//!
//! | Item               | Encoding                                      |
//! |--------------------|-----------------------------------------------|
//! | `u32` varint       | 1–5 bytes, 7-bit groups, high bit = continue  |
//! | `u32` fixed        | 4 bytes, little-endian                        |
//! | `u64` fixed        | 8 bytes, little-endian                        |
//! | byte string        | raw bytes, length carried out of band         |
//!
//! Varints encode length fields where small values dominate; fixed-width
//! integers are used for offsets, versions, and checksums where alignment
//! and in-place patching matter.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or indexing that
//! can go out of bounds. All errors are propagated via [`EncodingError`].

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding wire data.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A varint used more than the maximum number of bytes for its width.
    #[error("varint overflow (more than {0} bytes)")]
    VarintOverflow(usize),

    /// A length or count field exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Varint codec (u32, 7-bit groups)
// ------------------------------------------------------------------------------------------------

/// Maximum encoded size of a `u32` varint.
pub const VARINT32_MAX_LEN: usize = 5;

/// Returns the number of bytes `v` occupies as a varint.
#[inline]
pub fn varint_len(v: u32) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x001f_ffff => 3,
        0x0020_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Encodes `v` into `buf`, returning the number of bytes written.
///
/// `buf` must have at least [`varint_len`]`(v)` bytes of space; callers
/// size their staging buffers up front, so a short buffer is a logic error
/// and debug-asserted rather than reported.
#[inline]
pub fn put_varint(buf: &mut [u8], v: u32) -> usize {
    debug_assert!(buf.len() >= varint_len(v));
    let mut v = v;
    let mut n = 0usize;
    while v >= 0x80 {
        buf[n] = (v as u8) | 0x80;
        v >>= 7;
        n += 1;
    }
    buf[n] = v as u8;
    n + 1
}

/// Decodes a `u32` varint from the beginning of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn get_varint(buf: &[u8]) -> Result<(u32, usize), EncodingError> {
    let mut v: u32 = 0;
    for (i, &b) in buf.iter().enumerate().take(VARINT32_MAX_LEN) {
        v |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((v, i + 1));
        }
    }
    if buf.len() < VARINT32_MAX_LEN {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(EncodingError::VarintOverflow(VARINT32_MAX_LEN))
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-width little-endian helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Reads a little-endian `u32` from the beginning of `buf`.
#[inline]
pub fn get_u32_le(buf: &[u8]) -> Result<u32, EncodingError> {
    require(buf, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    Ok(u32::from_le_bytes(bytes))
}

/// Reads a little-endian `u64` from the beginning of `buf`.
#[inline]
pub fn get_u64_le(buf: &[u8]) -> Result<u64, EncodingError> {
    require(buf, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok(u64::from_le_bytes(bytes))
}

/// Reads a `[u32 len][bytes]` sequence from `buf`, bounded by `max_len`.
///
/// Returns `(bytes, consumed)`.
#[inline]
pub fn get_len_prefixed(buf: &[u8], max_len: u32) -> Result<(&[u8], usize), EncodingError> {
    let len = get_u32_le(buf)?;
    if len > max_len {
        return Err(EncodingError::LengthOverflow(format!(
            "length {len} exceeds limit {max_len}"
        )));
    }
    let len = len as usize;
    require(&buf[4..], len)?;
    Ok((&buf[4..4 + len], 4 + len))
}

/// Appends a `[u32 len][bytes]` sequence to `buf`.
#[inline]
pub fn put_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodingError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| EncodingError::LengthOverflow(format!("{} exceeds u32::MAX", bytes.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}
