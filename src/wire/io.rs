//! Validated primitive readers and writers.
//!
//! Readers consume from a shrinking `&[u8]` cursor and fail with
//! [`WireError::UnexpectedEof`] on short input instead of panicking.
//! Variable-length fields carry a 16-bit or 32-bit big-endian length prefix.

use crate::types::{Address, Color, TxId, ID_LENGTH};
use crate::wire::{WireError, WireResult};
use bytes::BufMut;

/// Upper bound for 32-bit length-prefixed blobs (transaction payloads).
pub const MAX_BYTES32_LENGTH: usize = 16 * 1024 * 1024;

pub fn read_u8(r: &mut &[u8]) -> WireResult<u8> {
    let (&b, rest) = r.split_first().ok_or(WireError::UnexpectedEof)?;
    *r = rest;
    Ok(b)
}

pub fn read_u16(r: &mut &[u8]) -> WireResult<u16> {
    Ok(u16::from_be_bytes(read_array::<2>(r)?))
}

pub fn read_u32(r: &mut &[u8]) -> WireResult<u32> {
    Ok(u32::from_be_bytes(read_array::<4>(r)?))
}

pub fn read_u64(r: &mut &[u8]) -> WireResult<u64> {
    Ok(u64::from_be_bytes(read_array::<8>(r)?))
}

pub fn read_array<const N: usize>(r: &mut &[u8]) -> WireResult<[u8; N]> {
    if r.len() < N {
        return Err(WireError::UnexpectedEof);
    }
    let (head, rest) = r.split_at(N);
    *r = rest;
    Ok(head.try_into().unwrap())
}

/// Read a blob with a 16-bit length prefix.
pub fn read_bytes16(r: &mut &[u8]) -> WireResult<Vec<u8>> {
    let len = read_u16(r)? as usize;
    if r.len() < len {
        return Err(WireError::UnexpectedEof);
    }
    let (head, rest) = r.split_at(len);
    *r = rest;
    Ok(head.to_vec())
}

/// Read a blob with a 32-bit length prefix, bounded by
/// [`MAX_BYTES32_LENGTH`].
pub fn read_bytes32(r: &mut &[u8]) -> WireResult<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len > MAX_BYTES32_LENGTH {
        return Err(WireError::Oversize {
            got: len,
            max: MAX_BYTES32_LENGTH,
        });
    }
    if r.len() < len {
        return Err(WireError::UnexpectedEof);
    }
    let (head, rest) = r.split_at(len);
    *r = rest;
    Ok(head.to_vec())
}

pub fn read_string16(r: &mut &[u8]) -> WireResult<String> {
    let bytes = read_bytes16(r)?;
    String::from_utf8(bytes).map_err(|_| WireError::BadString)
}

pub fn read_address(r: &mut &[u8]) -> WireResult<Address> {
    Ok(Address(read_array::<ID_LENGTH>(r)?))
}

pub fn read_txid(r: &mut &[u8]) -> WireResult<TxId> {
    Ok(TxId(read_array::<ID_LENGTH>(r)?))
}

pub fn read_color(r: &mut &[u8]) -> WireResult<Color> {
    Ok(Color(read_array::<ID_LENGTH>(r)?))
}

/// Fail unless the cursor is fully consumed.
pub fn expect_end(r: &[u8]) -> WireResult<()> {
    if r.is_empty() {
        Ok(())
    } else {
        Err(WireError::TrailingBytes(r.len()))
    }
}

pub fn write_u8(w: &mut Vec<u8>, v: u8) {
    w.put_u8(v);
}

pub fn write_u16(w: &mut Vec<u8>, v: u16) {
    w.put_u16(v);
}

pub fn write_u32(w: &mut Vec<u8>, v: u32) {
    w.put_u32(v);
}

pub fn write_u64(w: &mut Vec<u8>, v: u64) {
    w.put_u64(v);
}

/// Write a blob with a 16-bit length prefix. Panics if the blob does not
/// fit the prefix; callers bound their payloads first.
pub fn write_bytes16(w: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() <= u16::MAX as usize, "bytes16 payload too long");
    write_u16(w, data.len() as u16);
    w.put_slice(data);
}

pub fn write_bytes32(w: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() <= MAX_BYTES32_LENGTH, "bytes32 payload too long");
    write_u32(w, data.len() as u32);
    w.put_slice(data);
}

pub fn write_string16(w: &mut Vec<u8>, s: &str) {
    write_bytes16(w, s.as_bytes());
}

pub fn write_address(w: &mut Vec<u8>, addr: &Address) {
    w.put_slice(&addr.0);
}

pub fn write_txid(w: &mut Vec<u8>, id: &TxId) {
    w.put_slice(&id.0);
}

pub fn write_color(w: &mut Vec<u8>, color: &Color) {
    w.put_slice(&color.0);
}
