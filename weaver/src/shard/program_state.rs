//! Per-node, per-request traversal state.
//!
//! One monitor lock guards every structure; [`ProgramStateStore::done_requests`]
//! is the only operation that may block, waiting until every traversal that
//! pinned a request with [`check_done_request`](ProgramStateStore::check_done_request)
//! has released it. State blobs serialize per kind so they migrate with
//! their node.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Condvar, Mutex};

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::element::NodeHandle;
use crate::error::{CResult, Error};
use crate::prog::{ProgKind, ProgState, REGISTRY};
use crate::transaction::DoneReq;

type ReqMap = BTreeMap<u64, ProgState>;
type NodeMap = HashMap<NodeHandle, ReqMap>;

/// in-use counter plus the nodes a request has touched here.
#[derive(Default)]
struct ReqEntry {
    in_use: u32,
    nodes: HashSet<NodeHandle>,
}

struct Inner {
    state: HashMap<ProgKind, NodeMap>,
    node_list: HashMap<u64, ReqEntry>,
    done_ids: HashSet<u64>,
    /// High-water mark of max_done_id seen in nops. Diagnostic only.
    completed_id: u64,
}

pub struct ProgramStateStore {
    inner: Mutex<Inner>,
    in_use_cond: Condvar,
}

impl Default for ProgramStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramStateStore {
    pub fn new() -> Self {
        let mut state = HashMap::new();
        for kind in REGISTRY {
            state.insert(kind, NodeMap::new());
        }
        ProgramStateStore {
            inner: Mutex::new(Inner {
                state,
                node_list: HashMap::new(),
                done_ids: HashSet::new(),
                completed_id: 0,
            }),
            in_use_cond: Condvar::new(),
        }
    }

    pub fn state_exists(&self, kind: ProgKind, req_id: u64, node: &NodeHandle) -> CResult<bool> {
        let inner = self.inner.lock()?;
        Ok(Self::exists_nolock(&inner, kind, req_id, node))
    }

    fn exists_nolock(inner: &Inner, kind: ProgKind, req_id: u64, node: &NodeHandle) -> bool {
        inner
            .state
            .get(&kind)
            .and_then(|nmap| nmap.get(node))
            .map(|rmap| rmap.contains_key(&req_id))
            .unwrap_or(false)
    }

    pub fn get_state(
        &self,
        kind: ProgKind,
        req_id: u64,
        node: &NodeHandle,
    ) -> CResult<Option<ProgState>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .state
            .get(&kind)
            .and_then(|nmap| nmap.get(node))
            .and_then(|rmap| rmap.get(&req_id))
            .cloned())
    }

    /// Stores `state`, destroying any previous blob under the same key and
    /// recording the node against the request for later reclamation.
    pub fn put_state(
        &self,
        kind: ProgKind,
        req_id: u64,
        node: NodeHandle,
        state: ProgState,
    ) -> CResult<()> {
        debug_assert_eq!(kind, state.kind());
        let mut inner = self.inner.lock()?;
        if !Self::exists_nolock(&inner, kind, req_id, &node) {
            inner.node_list.entry(req_id).or_default().nodes.insert(node.clone());
        }
        inner
            .state
            .get_mut(&kind)
            .ok_or_else(|| Error::Internal(format!("kind {:?} missing from registry map", kind)))?
            .entry(node)
            .or_default()
            .insert(req_id, state);
        Ok(())
    }

    /// Encoded size of one node's state blob across all kinds.
    pub fn size(&self, node: &NodeHandle) -> CResult<u64> {
        let inner = self.inner.lock()?;
        let mut sz = 0;
        for kind in REGISTRY {
            sz += 2 + 8;
            if let Some(rmap) = inner.state.get(&kind).and_then(|nmap| nmap.get(node)) {
                for state in rmap.values() {
                    sz += 8 + state.wire_size();
                }
            }
        }
        Ok(sz)
    }

    /// Serializes all program-state for one node: per registry kind,
    /// [u16 tag][u64 n][(u64 req_id, payload) × n].
    pub fn pack(&self, node: &NodeHandle, buf: &mut BytesMut) -> CResult<()> {
        let inner = self.inner.lock()?;
        for kind in REGISTRY {
            kind.tag().pack(buf);
            match inner.state.get(&kind).and_then(|nmap| nmap.get(node)) {
                Some(rmap) => {
                    (rmap.len() as u64).pack(buf);
                    for (req_id, state) in rmap {
                        req_id.pack(buf);
                        state.pack(buf);
                    }
                }
                None => 0u64.pack(buf),
            }
        }
        Ok(())
    }

    /// Decodes a node's state blob into this store. A duplicate key means
    /// the node already has state here and the migration went wrong.
    pub fn unpack(&self, node: &NodeHandle, cur: &mut Cursor<&[u8]>) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        for kind in REGISTRY {
            let tag = codec::read_u16(cur)?;
            if tag != kind.tag() {
                return Err(Error::Parse(format!(
                    "program state blob out of registry order: tag {} where {} expected",
                    tag,
                    kind.tag()
                )));
            }
            let count = codec::read_u64(cur)?;
            if count == 0 {
                continue;
            }
            let mut rmap = ReqMap::new();
            for _ in 0..count {
                let req_id = codec::read_u64(cur)?;
                let state = ProgState::unpack(kind, cur)?;
                if rmap.insert(req_id, state).is_some() {
                    return Err(Error::Internal(format!(
                        "duplicate req {} in incoming state blob",
                        req_id
                    )));
                }
                inner.node_list.entry(req_id).or_default().nodes.insert(node.clone());
            }
            let nmap = inner
                .state
                .get_mut(&kind)
                .ok_or_else(|| Error::Internal(format!("kind {:?} missing from registry map", kind)))?;
            if nmap.insert(node.clone(), rmap).is_some() {
                return Err(Error::Internal(format!(
                    "node already had {:?} state on unpack",
                    kind
                )));
            }
        }
        Ok(())
    }

    /// Removes every blob a deleted node holds, across all kinds.
    pub fn delete_node_state(&self, node: &NodeHandle) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        let mut touched = Vec::new();
        for kind in REGISTRY {
            if let Some(nmap) = inner.state.get_mut(&kind) {
                if let Some(rmap) = nmap.remove(node) {
                    touched.extend(rmap.into_keys());
                }
            }
        }
        for req_id in touched {
            if let Some(entry) = inner.node_list.get_mut(&req_id) {
                entry.nodes.remove(node);
            }
        }
        Ok(())
    }

    /// Marks requests done and reclaims their state. Blocks per request
    /// until concurrent traversals drop their in-use pins.
    pub fn done_requests(&self, reqs: &[DoneReq], max_done_id: u64) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        if max_done_id > inner.completed_id {
            inner.completed_id = max_done_id;
        }
        for &(req_id, kind) in reqs {
            inner.done_ids.insert(req_id);
            if !inner.node_list.contains_key(&req_id) {
                continue;
            }
            while inner.node_list.get(&req_id).map_or(0, |e| e.in_use) > 0 {
                inner = self.in_use_cond.wait(inner)?;
            }
            if let Some(entry) = inner.node_list.remove(&req_id) {
                if let Some(nmap) = inner.state.get_mut(&kind) {
                    for node in entry.nodes {
                        if let Some(rmap) = nmap.get_mut(&node) {
                            rmap.remove(&req_id);
                            if rmap.is_empty() {
                                nmap.remove(&node);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns whether the request is already done. If not, pins it so a
    /// concurrent [`done_requests`](Self::done_requests) cannot reclaim its
    /// state mid-traversal; pair with [`clear_in_use`](Self::clear_in_use).
    pub fn check_done_request(&self, req_id: u64) -> CResult<bool> {
        let mut inner = self.inner.lock()?;
        if inner.done_ids.contains(&req_id) {
            return Ok(true);
        }
        inner.node_list.entry(req_id).or_default().in_use += 1;
        Ok(false)
    }

    pub fn clear_in_use(&self, req_id: u64) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        let entry = inner
            .node_list
            .get_mut(&req_id)
            .ok_or_else(|| Error::Internal(format!("clear_in_use for untracked req {}", req_id)))?;
        debug_assert!(entry.in_use > 0);
        entry.in_use = entry.in_use.saturating_sub(1);
        self.in_use_cond.notify_all();
        Ok(())
    }

    pub fn is_done(&self, req_id: u64) -> CResult<bool> {
        Ok(self.inner.lock()?.done_ids.contains(&req_id))
    }

    pub fn completed_id(&self) -> CResult<u64> {
        Ok(self.inner.lock()?.completed_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn reach(visited: bool) -> ProgState {
        ProgState::Reachability { visited, out_count: 0, reachable: false }
    }

    #[test]
    fn put_get_and_replace() -> CResult<()> {
        let store = ProgramStateStore::new();
        let node = b"a".to_vec();
        assert!(!store.state_exists(ProgKind::Reachability, 7, &node)?);

        store.put_state(ProgKind::Reachability, 7, node.clone(), reach(false))?;
        assert!(store.state_exists(ProgKind::Reachability, 7, &node)?);
        assert_eq!(store.get_state(ProgKind::Reachability, 7, &node)?, Some(reach(false)));

        // a second put destroys the previous blob
        store.put_state(ProgKind::Reachability, 7, node.clone(), reach(true))?;
        assert_eq!(store.get_state(ProgKind::Reachability, 7, &node)?, Some(reach(true)));

        // other kinds on the same node stay independent
        assert!(!store.state_exists(ProgKind::Dijkstra, 7, &node)?);
        Ok(())
    }

    #[test]
    fn done_requests_without_traversal_reclaims_immediately() -> CResult<()> {
        let store = ProgramStateStore::new();
        let node = b"a".to_vec();
        store.put_state(ProgKind::Reachability, 7, node.clone(), reach(true))?;

        store.done_requests(&[(7, ProgKind::Reachability)], 7)?;
        assert!(store.is_done(7)?);
        assert!(!store.state_exists(ProgKind::Reachability, 7, &node)?);
        assert_eq!(store.get_state(ProgKind::Reachability, 7, &node)?, None);
        Ok(())
    }

    #[test]
    fn done_requests_blocks_until_in_use_clears() {
        let store = Arc::new(ProgramStateStore::new());
        let node = b"a".to_vec();
        store.put_state(ProgKind::Reachability, 7, node.clone(), reach(true)).unwrap();

        // a traversal observes the request as live and pins it
        assert!(!store.check_done_request(7).unwrap());

        let (tx, rx) = mpsc::channel();
        let gc_store = store.clone();
        let gc = thread::spawn(move || {
            gc_store.done_requests(&[(7, ProgKind::Reachability)], 7).unwrap();
            tx.send(()).unwrap();
        });

        // the reclaim must not finish while the pin is held
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(store.state_exists(ProgKind::Reachability, 7, &node).unwrap());

        store.clear_in_use(7).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gc.join().unwrap();
        assert!(store.is_done(7).unwrap());
        assert!(!store.state_exists(ProgKind::Reachability, 7, &node).unwrap());
    }

    #[test]
    fn late_traversal_sees_done() -> CResult<()> {
        let store = ProgramStateStore::new();
        store.done_requests(&[(9, ProgKind::Clustering)], 9)?;
        // no pin is taken for a done request
        assert!(store.check_done_request(9)?);
        Ok(())
    }

    #[test]
    fn pack_unpack_roundtrip() -> CResult<()> {
        let store = ProgramStateStore::new();
        let node = b"a".to_vec();
        store.put_state(ProgKind::Reachability, 1, node.clone(), reach(true))?;
        store.put_state(
            ProgKind::Reachability,
            3,
            node.clone(),
            ProgState::Reachability { visited: false, out_count: 2, reachable: true },
        )?;
        store.put_state(
            ProgKind::Clustering,
            2,
            node.clone(),
            ProgState::Clustering { nbr_count: 4, edge_count: 2 },
        )?;
        // state of other nodes must not travel
        store.put_state(ProgKind::Dijkstra, 1, b"b".to_vec(), ProgState::Dijkstra { visited: true, dist: 1 })?;

        let mut buf = BytesMut::new();
        store.pack(&node, &mut buf)?;
        assert_eq!(buf.len() as u64, store.size(&node)?);

        let other = ProgramStateStore::new();
        let mut cur = Cursor::new(&buf[..]);
        other.unpack(&node, &mut cur)?;
        assert_eq!(cur.position() as usize, buf.len());

        for req in [1u64, 3] {
            assert_eq!(
                other.get_state(ProgKind::Reachability, req, &node)?,
                store.get_state(ProgKind::Reachability, req, &node)?,
            );
        }
        assert_eq!(
            other.get_state(ProgKind::Clustering, 2, &node)?,
            store.get_state(ProgKind::Clustering, 2, &node)?,
        );
        assert!(!other.state_exists(ProgKind::Dijkstra, 1, &b"b".to_vec())?);

        // unpacking the same node again collides
        let mut cur = Cursor::new(&buf[..]);
        assert!(other.unpack(&node, &mut cur).is_err());
        Ok(())
    }

    #[test]
    fn delete_node_state_updates_request_index() -> CResult<()> {
        let store = ProgramStateStore::new();
        store.put_state(ProgKind::Reachability, 5, b"a".to_vec(), reach(true))?;
        store.put_state(ProgKind::Reachability, 5, b"b".to_vec(), reach(true))?;

        store.delete_node_state(&b"a".to_vec())?;
        assert!(!store.state_exists(ProgKind::Reachability, 5, &b"a".to_vec())?);
        assert!(store.state_exists(ProgKind::Reachability, 5, &b"b".to_vec())?);

        // reclaim of the request only touches what is left
        store.done_requests(&[(5, ProgKind::Reachability)], 5)?;
        assert!(!store.state_exists(ProgKind::Reachability, 5, &b"b".to_vec())?);
        Ok(())
    }
}
