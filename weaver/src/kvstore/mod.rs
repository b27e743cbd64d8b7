//! Durable key-value backend interface and key layout.
//!
//! The store sees flat byte keys; the space layout below keeps the graph
//! records, shard checkpoints, the handle→shard name map, coordinator tx
//! records and VT metadata in disjoint prefixes. Per-key `put_if_absent` is
//! the backend's atomic primitive; admission builds on it.

pub mod memory;

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::Wire;
use crate::error::CResult;
use crate::vclock::VectorClock;

pub use memory::Memory;

/// Value of a name-map record: the handle's home shard plus its lifetime,
/// so admission can tell a live mapping from a tombstone.
#[derive(Clone, Debug, PartialEq)]
pub struct NmapEntry {
    pub shard: u64,
    pub creat: VectorClock,
    pub del: VectorClock,
}

impl NmapEntry {
    pub fn new(shard: u64, creat: VectorClock) -> Self {
        let width = creat.counters.len();
        NmapEntry { shard, creat, del: VectorClock::never(width) }
    }
}

impl Wire for NmapEntry {
    fn wire_size(&self) -> u64 {
        8 + self.creat.wire_size() + self.del.wire_size()
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.shard.pack(buf);
        self.creat.pack(buf);
        self.del.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let shard = crate::codec::read_u64(cur)?;
        let creat = VectorClock::unpack(cur)?;
        let del = VectorClock::unpack(cur)?;
        Ok(NmapEntry { shard, creat, del })
    }
}

pub trait KvBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Installs `value` only when `key` is absent; returns whether it won.
    fn put_if_absent(&self, key: &[u8], value: Vec<u8>) -> CResult<bool>;

    fn delete(&self, key: &[u8]) -> CResult<()>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Batched lookup; one result slot per requested key.
    fn multi_get(&self, keys: &[Vec<u8>]) -> CResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Batched store; the default is sequential puts.
    fn multi_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> CResult<()> {
        for (k, v) in entries {
            self.put(&k, v)?;
        }
        Ok(())
    }
}

/// Key layout shared by the shard and coordinator stubs.
pub mod keys {
    use bytes::{BufMut, BytesMut};

    use crate::element::NodeHandle;

    const SPACE_GRAPH: u8 = b'g';
    const SPACE_SHARD: u8 = b's';
    const SPACE_NMAP: u8 = b'n';
    const SPACE_TX: u8 = b't';
    const SPACE_META: u8 = b'm';

    /// Graph record attributes.
    pub const ATTR_CREAT: u8 = 1;
    pub const ATTR_DEL: u8 = 2;
    pub const ATTR_PROPS: u8 = 3;
    pub const ATTR_TXQ: u8 = 4;
    pub const ATTR_EDGE: u8 = 5;
    pub const ATTR_IN_NBR: u8 = 6;

    fn with_handle(space: u8, handle: &NodeHandle) -> BytesMut {
        let mut k = BytesMut::with_capacity(9 + handle.len() + 10);
        k.put_u8(space);
        k.put_u64_le(handle.len() as u64);
        k.put_slice(handle);
        k
    }

    pub fn nmap(handle: &NodeHandle) -> Vec<u8> {
        with_handle(SPACE_NMAP, handle).to_vec()
    }

    /// All keys of one node's durable graph record.
    pub fn graph_prefix(handle: &NodeHandle) -> Vec<u8> {
        with_handle(SPACE_GRAPH, handle).to_vec()
    }

    pub fn graph_attr(handle: &NodeHandle, attr: u8) -> Vec<u8> {
        let mut k = with_handle(SPACE_GRAPH, handle);
        k.put_u8(attr);
        k.to_vec()
    }

    pub fn graph_edge(handle: &NodeHandle, edge_id: u64) -> Vec<u8> {
        let mut k = with_handle(SPACE_GRAPH, handle);
        k.put_u8(ATTR_EDGE);
        k.put_u64_le(edge_id);
        k.to_vec()
    }

    pub fn graph_edge_prefix(handle: &NodeHandle) -> Vec<u8> {
        let mut k = with_handle(SPACE_GRAPH, handle);
        k.put_u8(ATTR_EDGE);
        k.to_vec()
    }

    pub fn graph_in_nbr(handle: &NodeHandle, nbr: &NodeHandle) -> Vec<u8> {
        let mut k = with_handle(SPACE_GRAPH, handle);
        k.put_u8(ATTR_IN_NBR);
        k.put_slice(nbr);
        k.to_vec()
    }

    pub fn graph_in_nbr_prefix(handle: &NodeHandle) -> Vec<u8> {
        let mut k = with_handle(SPACE_GRAPH, handle);
        k.put_u8(ATTR_IN_NBR);
        k.to_vec()
    }

    /// Suffix of a graph key relative to its node prefix: (attr, rest).
    pub fn split_graph_suffix<'a>(key: &'a [u8], prefix: &[u8]) -> Option<(u8, &'a [u8])> {
        let rest = key.strip_prefix(prefix)?;
        let (&attr, rest) = rest.split_first()?;
        Some((attr, rest))
    }

    pub fn shard_qts(shard_id: u64, vt_id: u64) -> Vec<u8> {
        let mut k = BytesMut::with_capacity(18);
        k.put_u8(SPACE_SHARD);
        k.put_u64_le(shard_id);
        k.put_u8(1);
        k.put_u64_le(vt_id);
        k.to_vec()
    }

    pub fn shard_last_clock(shard_id: u64, vt_id: u64) -> Vec<u8> {
        let mut k = BytesMut::with_capacity(18);
        k.put_u8(SPACE_SHARD);
        k.put_u64_le(shard_id);
        k.put_u8(2);
        k.put_u64_le(vt_id);
        k.to_vec()
    }

    pub fn tx_record(vt_id: u64, tx_id: u64) -> Vec<u8> {
        let mut k = BytesMut::with_capacity(17);
        k.put_u8(SPACE_TX);
        k.put_u64_le(vt_id);
        k.put_u64_le(tx_id);
        k.to_vec()
    }

    pub fn tx_prefix(vt_id: u64) -> Vec<u8> {
        let mut k = BytesMut::with_capacity(9);
        k.put_u8(SPACE_TX);
        k.put_u64_le(vt_id);
        k.to_vec()
    }

    pub fn vt_meta(vt_id: u64) -> Vec<u8> {
        let mut k = BytesMut::with_capacity(9);
        k.put_u8(SPACE_META);
        k.put_u64_le(vt_id);
        k.to_vec()
    }

    pub fn nmap_prefix() -> Vec<u8> {
        vec![SPACE_NMAP]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spaces_do_not_collide() {
        let handle = b"a".to_vec();
        let ks = vec![
            keys::nmap(&handle),
            keys::graph_attr(&handle, keys::ATTR_CREAT),
            keys::graph_edge(&handle, 1),
            keys::shard_qts(1, 0),
            keys::tx_record(0, 1),
            keys::vt_meta(0),
        ];
        for (i, a) in ks.iter().enumerate() {
            for b in ks.iter().skip(i + 1) {
                assert_ne!(a, b);
                assert!(!b.starts_with(a.as_slice()));
            }
        }
    }

    #[test]
    fn handle_length_prefix_prevents_ambiguity() {
        // "ab" + attr must never collide with keys of node "a"
        let a = keys::graph_attr(&b"a".to_vec(), keys::ATTR_PROPS);
        let ab = keys::graph_attr(&b"ab".to_vec(), keys::ATTR_PROPS);
        assert!(!ab.starts_with(keys::graph_prefix(&b"a".to_vec()).as_slice()));
        assert_ne!(a, ab);
    }

    #[test]
    fn graph_suffix_split() {
        let handle = b"node".to_vec();
        let prefix = keys::graph_prefix(&handle);
        let key = keys::graph_edge(&handle, 0x0102);
        let (attr, rest) = keys::split_graph_suffix(&key, &prefix).unwrap();
        assert_eq!(attr, keys::ATTR_EDGE);
        assert_eq!(rest, &0x0102u64.to_le_bytes()[..]);
    }
}
