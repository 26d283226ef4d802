//! Layout of the parsed-header cache file.
//!
//! The file starts with four bytes mirroring the index header's
//! generation number. After that it is a sequence of per-message blobs,
//! each blob exactly [NUM_CACHE_FIELDS] fields. A field is a 4-byte
//! big-endian length followed by the data, padded to a 4-byte boundary.

use super::index_file::get_u32;
use crate::store::StoreError;

/// Bytes of the generation-number prefix.
pub const CACHE_GENERATION_LEN: usize = 4;

/// Fields in an individual message's cache blob.
pub const NUM_CACHE_FIELDS: usize = 10;

/// Generation number stored at the start of a mapped cache file.
pub fn cache_generation(buf: &[u8]) -> Result<u32, StoreError> {
    if buf.len() < CACHE_GENERATION_LEN {
        return Err(StoreError::BadFormat);
    }
    Ok(get_u32(buf, 0))
}

fn padded(len: u64) -> u64 {
    (len + 3) & !3
}

/// Append one field to an in-memory blob.
pub fn append_field(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    for _ in data.len()..padded(data.len() as u64) as usize {
        out.push(0);
    }
}

/// Read the field at `offset`; returns the data and the offset of the
/// next field.
pub fn field_at(buf: &[u8], offset: usize) -> Result<(&[u8], usize), StoreError> {
    let total = buf.len() as u64;
    let offset64 = offset as u64;
    if offset64 + 4 > total {
        return Err(StoreError::BadFormat);
    }
    let len = get_u32(buf, offset) as u64;
    let next = offset64 + 4 + padded(len);
    if next > total {
        return Err(StoreError::BadFormat);
    }
    let data = &buf[offset + 4..offset + 4 + len as usize];
    Ok((data, next as usize))
}

/// Total byte length of the blob starting at `offset`.
pub fn record_len(buf: &[u8], offset: usize) -> Result<usize, StoreError> {
    let mut pos = offset;
    for _ in 0..NUM_CACHE_FIELDS {
        let (_, next) = field_at(buf, pos)?;
        pos = next;
    }
    Ok(pos - offset)
}

/// All fields of the blob starting at `offset`, in order.
pub fn record_fields(buf: &[u8], offset: usize) -> Result<Vec<&[u8]>, StoreError> {
    let mut fields = Vec::with_capacity(NUM_CACHE_FIELDS);
    let mut pos = offset;
    for _ in 0..NUM_CACHE_FIELDS {
        let (data, next) = field_at(buf, pos)?;
        fields.push(data);
        pos = next;
    }
    Ok(fields)
}
