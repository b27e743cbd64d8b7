use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::error::CResult;
use crate::vclock::VectorClock;

use super::{BaseElement, NodeHandle};

/// Reference to a node that may live on another shard.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RemoteNode {
    pub shard: u64,
    pub handle: NodeHandle,
}

impl RemoteNode {
    pub fn new(shard: u64, handle: NodeHandle) -> Self {
        RemoteNode { shard, handle }
    }
}

/// [u64 shard_id][varlen handle]
impl Wire for RemoteNode {
    fn wire_size(&self) -> u64 {
        8 + codec::bytes_size(&self.handle)
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.shard.pack(buf);
        codec::put_bytes(buf, &self.handle);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let shard = codec::read_u64(cur)?;
        let handle = codec::read_bytes(cur)?;
        Ok(RemoteNode { shard, handle })
    }
}

/// A directed edge, owned by the node it leaves from. The edge id is the key
/// of the owner's out-edge map and is not repeated in the edge's wire form.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub id: u64,
    pub base: BaseElement,
    pub nbr: RemoteNode,
    pub msg_count: u64,
    /// Set when this edge record arrived by migration; its neighbor must
    /// re-ack updates before the counter is trusted again.
    pub migr_edge: bool,
}

impl Edge {
    pub fn new(id: u64, creat: VectorClock, nbr: RemoteNode) -> Self {
        Edge { id, base: BaseElement::new(creat), nbr, msg_count: 0, migr_edge: false }
    }
}

/// [clock creat][clock del][properties][u64 msg_count][remote_node]
impl Wire for Edge {
    fn wire_size(&self) -> u64 {
        self.base.wire_size() + 8 + self.nbr.wire_size()
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.base.pack(buf);
        self.msg_count.pack(buf);
        self.nbr.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let base = BaseElement::unpack(cur)?;
        let msg_count = codec::read_u64(cur)?;
        let nbr = RemoteNode::unpack(cur)?;
        // id comes from the containing map key; migrated edges need a
        // neighbor ack before further updates
        Ok(Edge { id: 0, base, nbr, msg_count, migr_edge: true })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{from_bytes, to_bytes};

    #[test]
    fn wire_roundtrip_marks_migration() {
        let mut e = Edge::new(7, VectorClock::from_counters(0, vec![3]), RemoteNode::new(2, b"n".to_vec()));
        e.msg_count = 4;
        let mut out = from_bytes::<Edge>(&to_bytes(&e)).unwrap();
        assert!(out.migr_edge);
        assert_eq!(out.id, 0);
        out.id = e.id;
        out.migr_edge = false;
        assert_eq!(out, e);
    }
}
