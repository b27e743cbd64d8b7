use std::collections::{btree_map, BTreeMap, HashSet};
use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::error::CResult;
use crate::order::OrderOracle;
use crate::transaction::TxPiece;
use crate::vclock::VectorClock;

use super::edge::Edge;
use super::{BaseElement, NodeHandle};

/// A graph node, exclusively owned by its home shard.
///
/// The wire form ([`Wire`] impl) carries what migrates with the node:
/// element fields, out-edges and the migration counters. In-neighbors and
/// the pending tx queue are durable-only attributes, and the per-node
/// program-state blob is appended by the state store when a node moves.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub handle: NodeHandle,
    pub base: BaseElement,
    pub out_edges: BTreeMap<u64, Edge>,
    pub in_nbrs: HashSet<NodeHandle>,
    pub tx_queue: Vec<TxPiece>,
    pub update_count: u64,
    pub msg_count: u64,
    pub already_migr: bool,
}

impl Node {
    pub fn new(handle: NodeHandle, creat: VectorClock) -> Self {
        Node {
            handle,
            base: BaseElement::new(creat),
            out_edges: BTreeMap::new(),
            in_nbrs: HashSet::new(),
            tx_queue: Vec::new(),
            update_count: 0,
            msg_count: 0,
            already_migr: false,
        }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.out_edges.insert(edge.id, edge);
    }

    /// Lazy pass over the out-edges visible at `viewer`.
    pub fn visible_edges<'a>(&'a self, viewer: &'a VectorClock, oracle: &'a OrderOracle) -> EdgeIter<'a> {
        EdgeIter { inner: self.out_edges.values(), viewer, oracle }
    }
}

impl Wire for Node {
    fn wire_size(&self) -> u64 {
        codec::bytes_size(&self.handle)
            + self.base.wire_size()
            + 8
            + self.out_edges.values().map(|e| 8 + e.wire_size()).sum::<u64>()
            + 8 // update_count
            + 8 // msg_count
            + 1 // already_migr
    }

    fn pack(&self, buf: &mut BytesMut) {
        codec::put_bytes(buf, &self.handle);
        self.base.pack(buf);
        (self.out_edges.len() as u64).pack(buf);
        for (id, edge) in &self.out_edges {
            id.pack(buf);
            edge.pack(buf);
        }
        self.update_count.pack(buf);
        self.msg_count.pack(buf);
        (self.already_migr as u8).pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let handle = codec::read_bytes(cur)?;
        let base = BaseElement::unpack(cur)?;
        let count = codec::read_u64(cur)?;
        let mut out_edges = BTreeMap::new();
        for _ in 0..count {
            let id = codec::read_u64(cur)?;
            let mut edge = Edge::unpack(cur)?;
            edge.id = id;
            out_edges.insert(id, edge);
        }
        let update_count = codec::read_u64(cur)?;
        let msg_count = codec::read_u64(cur)?;
        let already_migr = codec::read_u8(cur)? != 0;
        Ok(Node {
            handle,
            base,
            out_edges,
            in_nbrs: HashSet::new(),
            tx_queue: Vec::new(),
            update_count,
            msg_count,
            already_migr,
        })
    }
}

/// Visibility-filtering iterator over a node's out-edges. Finite and
/// non-restartable per traversal pass.
pub struct EdgeIter<'a> {
    inner: btree_map::Values<'a, u64, Edge>,
    viewer: &'a VectorClock,
    oracle: &'a OrderOracle,
}

impl<'a> Iterator for EdgeIter<'a> {
    type Item = &'a Edge;

    fn next(&mut self) -> Option<Self::Item> {
        for e in self.inner.by_ref() {
            if self.oracle.visible(self.viewer, e.base.creat_time(), e.base.del_time()) {
                return Some(e);
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{from_bytes, to_bytes};
    use crate::element::edge::RemoteNode;

    fn clk(c: Vec<u64>) -> VectorClock {
        VectorClock::from_counters(0, c)
    }

    #[test]
    fn visible_edges_filters_deleted_and_future() {
        let oracle = OrderOracle::new();
        let mut n = Node::new(b"a".to_vec(), clk(vec![1]));
        n.add_edge(Edge::new(1, clk(vec![2]), RemoteNode::new(1, b"b".to_vec())));
        let mut dead = Edge::new(2, clk(vec![2]), RemoteNode::new(1, b"c".to_vec()));
        dead.base.update_del_time(clk(vec![3]));
        n.add_edge(dead);
        n.add_edge(Edge::new(3, clk(vec![9]), RemoteNode::new(1, b"d".to_vec())));

        let viewer = clk(vec![4]);
        let ids: Vec<u64> = n.visible_edges(&viewer, &oracle).map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn wire_roundtrip() {
        let mut n = Node::new(b"a".to_vec(), clk(vec![1, 0]));
        n.base.set_property(b"p".to_vec(), b"q".to_vec(), clk(vec![2, 0]));
        n.add_edge(Edge::new(5, clk(vec![2, 1]), RemoteNode::new(2, b"b".to_vec())));
        n.update_count = 3;
        n.msg_count = 1;

        let enc = to_bytes(&n);
        assert_eq!(enc.len() as u64, n.wire_size());
        let out = from_bytes::<Node>(&enc).unwrap();
        assert_eq!(out.handle, n.handle);
        assert_eq!(out.base, n.base);
        assert_eq!(out.update_count, 3);
        assert_eq!(out.out_edges[&5].nbr, n.out_edges[&5].nbr);
        assert_eq!(out.out_edges[&5].id, 5);
        // in-neighbors and the tx queue travel through the durable layout,
        // not the migration form
        assert!(out.in_nbrs.is_empty());
        assert!(out.tx_queue.is_empty());
    }
}
