//! Fixed-layout binary codec for wire messages and durable records.
//!
//! All integers are fixed-width little-endian unsigned. Variable-length byte
//! strings are length-prefixed with a u64. Packing appends to a `BytesMut`;
//! unpacking consumes from a `Cursor` and fails with `Error::Parse` on
//! truncated input rather than panicking.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};
use crate::vclock::VectorClock;

/// A value with a fixed wire layout: it knows its encoded size, how to
/// append itself to a buffer, and how to decode itself from a cursor.
pub trait Wire: Sized {
    fn wire_size(&self) -> u64;

    fn pack(&self, buf: &mut BytesMut);

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self>;
}

fn eof(what: &str) -> Error {
    Error::Parse(format!("unexpected end of buffer reading {}", what))
}

pub fn read_u8(cur: &mut Cursor<&[u8]>) -> CResult<u8> {
    cur.read_u8().map_err(|_| eof("u8"))
}

pub fn read_u16(cur: &mut Cursor<&[u8]>) -> CResult<u16> {
    cur.read_u16::<LittleEndian>().map_err(|_| eof("u16"))
}

pub fn read_u32(cur: &mut Cursor<&[u8]>) -> CResult<u32> {
    cur.read_u32::<LittleEndian>().map_err(|_| eof("u32"))
}

pub fn read_u64(cur: &mut Cursor<&[u8]>) -> CResult<u64> {
    cur.read_u64::<LittleEndian>().map_err(|_| eof("u64"))
}

/// Reads a u64 length prefix followed by that many raw bytes.
pub fn read_bytes(cur: &mut Cursor<&[u8]>) -> CResult<Vec<u8>> {
    let len = read_u64(cur)? as usize;
    let remaining = cur.get_ref().len().saturating_sub(cur.position() as usize);
    if len > remaining {
        return Err(eof("byte string"));
    }
    let mut out = vec![0u8; len];
    cur.read_exact(&mut out).map_err(|_| eof("byte string"))?;
    Ok(out)
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u64_le(bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn bytes_size(bytes: &[u8]) -> u64 {
    8 + bytes.len() as u64
}

impl Wire for u8 {
    fn wire_size(&self) -> u64 {
        1
    }

    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(*self);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        read_u8(cur)
    }
}

impl Wire for u16 {
    fn wire_size(&self) -> u64 {
        2
    }

    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u16_le(*self);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        read_u16(cur)
    }
}

impl Wire for u32 {
    fn wire_size(&self) -> u64 {
        4
    }

    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u32_le(*self);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        read_u32(cur)
    }
}

impl Wire for u64 {
    fn wire_size(&self) -> u64 {
        8
    }

    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u64_le(*self);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        read_u64(cur)
    }
}

impl Wire for Vec<u8> {
    fn wire_size(&self) -> u64 {
        bytes_size(self)
    }

    fn pack(&self, buf: &mut BytesMut) {
        put_bytes(buf, self);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        read_bytes(cur)
    }
}

/// [u64 owner][u64 count][u64 × count]; an absent owner encodes as MAX_U64.
impl Wire for VectorClock {
    fn wire_size(&self) -> u64 {
        8 + 8 + 8 * self.counters.len() as u64
    }

    fn pack(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.owner);
        buf.put_u64_le(self.counters.len() as u64);
        for c in &self.counters {
            buf.put_u64_le(*c);
        }
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let owner = read_u64(cur)?;
        let count = read_u64(cur)? as usize;
        let mut counters = Vec::with_capacity(count);
        for _ in 0..count {
            counters.push(read_u64(cur)?);
        }
        Ok(VectorClock::from_counters(owner, counters))
    }
}

/// Packs any `Wire` value into a fresh buffer.
pub fn to_bytes<T: Wire>(value: &T) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(value.wire_size() as usize);
    value.pack(&mut buf);
    buf.to_vec()
}

/// Decodes a `Wire` value from a standalone byte slice, requiring the slice
/// to be fully consumed.
pub fn from_bytes<T: Wire>(bytes: &[u8]) -> CResult<T> {
    let mut cur = Cursor::new(bytes);
    let value = T::unpack(&mut cur)?;
    if cur.position() as usize != bytes.len() {
        return Err(Error::Parse("trailing bytes after decode".to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vclock::VectorClock;

    #[test]
    fn ints_are_little_endian() {
        assert_eq!(hex::encode(to_bytes(&0x0102_0304u32)), "04030201");
        assert_eq!(hex::encode(to_bytes(&1u64)), "0100000000000000");
    }

    #[test]
    fn bytes_roundtrip() {
        let v: Vec<u8> = b"handle-a".to_vec();
        let enc = to_bytes(&v);
        assert_eq!(enc.len() as u64, v.wire_size());
        assert_eq!(from_bytes::<Vec<u8>>(&enc).unwrap(), v);
        // empty strings are valid
        assert_eq!(from_bytes::<Vec<u8>>(&to_bytes(&Vec::<u8>::new())).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn clock_roundtrip() {
        let clk = VectorClock::from_counters(1, vec![4, 9, 0]);
        let enc = to_bytes(&clk);
        assert_eq!(enc.len() as u64, clk.wire_size());
        assert_eq!(from_bytes::<VectorClock>(&enc).unwrap(), clk);

        let never = VectorClock::never(2);
        assert_eq!(from_bytes::<VectorClock>(&to_bytes(&never)).unwrap(), never);
    }

    #[test]
    fn truncated_input_is_a_parse_error() {
        let enc = to_bytes(&VectorClock::new(0, 3));
        let err = from_bytes::<VectorClock>(&enc[..enc.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        // length prefix larger than the remaining buffer
        let mut buf = BytesMut::new();
        buf.put_u64_le(1 << 40);
        let err = from_bytes::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
