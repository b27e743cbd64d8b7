//! Shard-side components: per-request program state, the result cache, and
//! the durable stub. The traversal engine that drives them is an external
//! collaborator reached through [`ShardTxApplier`].

pub mod hyper_stub;
pub mod program_cache;
pub mod program_state;

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::Wire;
use crate::element::node::Node;
use crate::error::CResult;
use crate::transaction::TxPiece;

pub use program_cache::ProgramCache;
pub use program_state::ProgramStateStore;

/// Applies one queued tx piece to the local partition. Implemented by the
/// traversal/apply engine, outside this crate's scope.
pub trait ShardTxApplier: Send + Sync {
    fn apply(&self, piece: &TxPiece) -> CResult<()>;
}

/// Serializes a node for migration: the node's own wire form followed by
/// its program-state blob, so traversal state moves with the node.
pub fn pack_node_with_state(
    node: &Node,
    state: &ProgramStateStore,
    buf: &mut BytesMut,
) -> CResult<()> {
    node.pack(buf);
    state.pack(&node.handle, buf)
}

/// Inverse of [`pack_node_with_state`]; the decoded program state lands in
/// the receiving shard's store.
pub fn unpack_node_with_state(
    cur: &mut Cursor<&[u8]>,
    state: &ProgramStateStore,
) -> CResult<Node> {
    let node = Node::unpack(cur)?;
    state.unpack(&node.handle, cur)?;
    Ok(node)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prog::{ProgKind, ProgState};
    use crate::vclock::VectorClock;

    #[test]
    fn migration_carries_state_with_the_node() {
        let state = ProgramStateStore::new();
        let node = Node::new(b"m".to_vec(), VectorClock::from_counters(0, vec![1]));
        state
            .put_state(
                ProgKind::Dijkstra,
                4,
                b"m".to_vec(),
                ProgState::Dijkstra { visited: true, dist: 2 },
            )
            .unwrap();

        let mut buf = BytesMut::new();
        pack_node_with_state(&node, &state, &mut buf).unwrap();

        let receiving = ProgramStateStore::new();
        let mut cur = Cursor::new(&buf[..]);
        let out = unpack_node_with_state(&mut cur, &receiving).unwrap();
        assert_eq!(out.handle, node.handle);
        assert_eq!(
            receiving.get_state(ProgKind::Dijkstra, 4, &b"m".to_vec()).unwrap(),
            Some(ProgState::Dijkstra { visited: true, dist: 2 }),
        );
    }
}
