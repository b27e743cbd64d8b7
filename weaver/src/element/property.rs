use std::io::Cursor;
use std::slice;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::error::CResult;
use crate::order::OrderOracle;
use crate::vclock::VectorClock;

/// A timestamped key/value pair on a node or edge. Overwrites tombstone the
/// old entry and append a new one, so history stays queryable.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub creat_time: VectorClock,
    pub del_time: VectorClock,
}

impl Property {
    pub fn new(key: Vec<u8>, value: Vec<u8>, creat: VectorClock) -> Self {
        let width = creat.counters.len();
        Property { key, value, creat_time: creat, del_time: VectorClock::never(width) }
    }
}

/// [varlen key][varlen value][clock creat][clock del]
impl Wire for Property {
    fn wire_size(&self) -> u64 {
        codec::bytes_size(&self.key)
            + codec::bytes_size(&self.value)
            + self.creat_time.wire_size()
            + self.del_time.wire_size()
    }

    fn pack(&self, buf: &mut BytesMut) {
        codec::put_bytes(buf, &self.key);
        codec::put_bytes(buf, &self.value);
        self.creat_time.pack(buf);
        self.del_time.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let key = codec::read_bytes(cur)?;
        let value = codec::read_bytes(cur)?;
        let creat_time = VectorClock::unpack(cur)?;
        let del_time = VectorClock::unpack(cur)?;
        Ok(Property { key, value, creat_time, del_time })
    }
}

/// [u64 count][entries]
impl Wire for Vec<Property> {
    fn wire_size(&self) -> u64 {
        8 + self.iter().map(|p| p.wire_size()).sum::<u64>()
    }

    fn pack(&self, buf: &mut BytesMut) {
        (self.len() as u64).pack(buf);
        for p in self {
            p.pack(buf);
        }
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let count = codec::read_u64(cur)? as usize;
        let mut props = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            props.push(Property::unpack(cur)?);
        }
        Ok(props)
    }
}

/// Lazy pass over the properties visible at one viewer clock. Finite and
/// non-restartable: each traversal step builds a fresh one.
pub struct PropIter<'a> {
    inner: slice::Iter<'a, Property>,
    viewer: &'a VectorClock,
    oracle: &'a OrderOracle,
}

impl<'a> PropIter<'a> {
    pub fn new(inner: slice::Iter<'a, Property>, viewer: &'a VectorClock, oracle: &'a OrderOracle) -> Self {
        PropIter { inner, viewer, oracle }
    }
}

impl<'a> Iterator for PropIter<'a> {
    type Item = &'a Property;

    fn next(&mut self) -> Option<Self::Item> {
        for p in self.inner.by_ref() {
            if self.oracle.visible(self.viewer, &p.creat_time, &p.del_time) {
                return Some(p);
            }
        }
        None
    }
}
