//! Shard-local cache of node-program results.
//!
//! Results land in a transient staging area and the committed side at the
//! same time; a tx that invalidates them rolls the committed side back with
//! [`ProgramCache::delete_cache`], while [`ProgramCache::commit`] retires
//! the transient bookkeeping. Payloads are shared `Arc`s, so an entry
//! reachable from both sides is still freed exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::element::NodeHandle;
use crate::error::CResult;
use crate::prog::{CachePayload, ProgKind, REGISTRY};

/// Invalidation ids collected by a traversal for deferred cleanup.
pub type DirtyList = Arc<Mutex<Vec<u64>>>;

/// One cached result, bound to the request that produced it.
pub struct CacheValue {
    pub req_id: u64,
    pub kind: ProgKind,
    pub payload: CachePayload,
    dirty_list: Mutex<Option<DirtyList>>,
}

impl CacheValue {
    fn new(req_id: u64, kind: ProgKind, payload: CachePayload) -> Self {
        CacheValue { req_id, kind, payload, dirty_list: Mutex::new(None) }
    }

    /// Binds the value to a traversal's dirty list; an invalidating
    /// traversal pushes this entry's req_id there instead of deleting
    /// mid-pass.
    fn set_dirty_list(&self, list: &DirtyList) {
        if let Ok(mut slot) = self.dirty_list.lock() {
            *slot = Some(list.clone());
        }
    }

    /// Marks this entry invalid on the traversal's dirty list.
    pub fn mark_dirty(&self) -> CResult<()> {
        let slot = self.dirty_list.lock()?;
        if let Some(list) = slot.as_ref() {
            list.lock()?.push(self.req_id);
        }
        Ok(())
    }
}

type ReqMap = BTreeMap<u64, Arc<CacheValue>>;
type NodeMap = HashMap<NodeHandle, ReqMap>;

/// One cache side: payloads plus the req_id → (kind, nodes) invalidation
/// index.
struct Side {
    cache: HashMap<ProgKind, NodeMap>,
    itable: HashMap<u64, (ProgKind, Vec<NodeHandle>)>,
}

impl Side {
    fn new() -> Self {
        let mut cache = HashMap::new();
        for kind in REGISTRY {
            cache.insert(kind, NodeMap::new());
        }
        Side { cache, itable: HashMap::new() }
    }

    fn insert(&mut self, req_id: u64, kind: ProgKind, node: NodeHandle, value: Arc<CacheValue>) {
        let rmap = self.cache.entry(kind).or_default().entry(node.clone()).or_default();
        // repeat inserts (commit after put) must not duplicate index rows
        if rmap.insert(req_id, value).is_none() {
            self.itable.entry(req_id).or_insert_with(|| (kind, Vec::new())).1.push(node);
        }
    }

    /// Drops every entry indexed under `req_id`. The index row goes with
    /// them, so a second call is a no-op.
    fn remove_req(&mut self, req_id: u64) {
        if let Some((kind, nodes)) = self.itable.remove(&req_id) {
            if let Some(nmap) = self.cache.get_mut(&kind) {
                for node in nodes {
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
}

struct Inner {
    committed: Side,
    transient: Side,
}

pub struct ProgramCache {
    inner: Mutex<Inner>,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCache {
    pub fn new() -> Self {
        ProgramCache { inner: Mutex::new(Inner { committed: Side::new(), transient: Side::new() }) }
    }

    /// Stages a result under (kind, node, req). Both sides receive the
    /// entry; the committed copy is rolled back via `delete_cache` if the
    /// producing request aborts.
    pub fn put_cache(
        &self,
        req_id: u64,
        kind: ProgKind,
        node: NodeHandle,
        payload: CachePayload,
    ) -> CResult<()> {
        debug_assert_eq!(kind, payload.kind());
        let value = Arc::new(CacheValue::new(req_id, kind, payload));
        let mut inner = self.inner.lock()?;
        inner.transient.insert(req_id, kind, node.clone(), value.clone());
        inner.committed.insert(req_id, kind, node, value);
        Ok(())
    }

    pub fn cache_exists(&self, kind: ProgKind, node: &NodeHandle, req_id: u64) -> CResult<bool> {
        let inner = self.inner.lock()?;
        Ok(inner
            .committed
            .cache
            .get(&kind)
            .and_then(|nmap| nmap.get(node))
            .map(|rmap| rmap.contains_key(&req_id))
            .unwrap_or(false))
    }

    /// Committed results at (kind, node) usable by the viewer request: only
    /// entries produced by strictly earlier requests, minus the ignore set.
    /// Each returned value is bound to the viewer's dirty list.
    pub fn get_cache(
        &self,
        kind: ProgKind,
        node: &NodeHandle,
        viewer_req_id: u64,
        dirty_list: &DirtyList,
        ignore_set: &HashSet<u64>,
    ) -> CResult<Vec<Arc<CacheValue>>> {
        let inner = self.inner.lock()?;
        let mut out = Vec::new();
        if let Some(rmap) = inner.committed.cache.get(&kind).and_then(|nmap| nmap.get(node)) {
            for (req_id, value) in rmap.range(..viewer_req_id) {
                if ignore_set.contains(req_id) {
                    continue;
                }
                value.set_dirty_list(dirty_list);
                out.push(value.clone());
            }
        }
        Ok(out)
    }

    /// Invalidates every committed entry the request produced.
    pub fn delete_cache(&self, req_id: u64) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        inner.committed.remove_req(req_id);
        Ok(())
    }

    /// Retires the transient bookkeeping for `id`, making its entries
    /// permanent on the committed side. Idempotent.
    pub fn commit(&self, id: u64) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        if let Some((kind, nodes)) = inner.transient.itable.get(&id).cloned() {
            for node in nodes {
                let staged = inner
                    .transient
                    .cache
                    .get(&kind)
                    .and_then(|nmap| nmap.get(&node))
                    .and_then(|rmap| rmap.get(&id))
                    .cloned();
                if let Some(value) = staged {
                    inner.committed.insert(id, kind, node, value);
                }
            }
            inner.transient.remove_req(id);
        }
        Ok(())
    }

    #[cfg(test)]
    fn transient_indexed(&self, id: u64) -> bool {
        self.inner.lock().map(|inner| inner.transient.itable.contains_key(&id)).unwrap_or(false)
    }
}
