//! Durable shard state over the key-value backend.
//!
//! Two spaces back a shard: `graph` holds one record per node (timestamps,
//! properties, out-edges as a map, in-neighbors as a set, the pending tx
//! queue), `shard` holds the per-VT queue timestamps and last seen clocks.
//! Every attribute carries its own binary codec and its own key, so
//! incremental updates touch exactly one entry.

use std::collections::HashMap;

use crate::codec;
use crate::element::edge::Edge;
use crate::element::node::Node;
use crate::element::property::Property;
use crate::element::NodeHandle;
use crate::error::{CResult, Error};
use crate::kvstore::{keys, KvBackend, NmapEntry};
use crate::transaction::TxPiece;
use crate::vclock::VectorClock;

/// Everything `restore_backup` reconstructs for a shard.
pub struct RestoredShard {
    pub qts: HashMap<u64, u64>,
    pub last_clocks: HashMap<u64, VectorClock>,
    pub nodes: HashMap<NodeHandle, Node>,
}

pub struct ShardHyperStub<K: KvBackend> {
    shard_id: u64,
    num_vts: usize,
    kv: K,
}

impl<K: KvBackend> ShardHyperStub<K> {
    pub fn new(shard_id: u64, num_vts: usize, kv: K) -> Self {
        ShardHyperStub { shard_id, num_vts, kv }
    }

    /// Seeds the shard record with zero queue timestamps and zero clocks.
    pub fn init(&self) -> CResult<()> {
        let zero_clk = VectorClock::new(crate::vclock::NO_OWNER, self.num_vts);
        for vt_id in 0..self.num_vts as u64 {
            self.kv.put(&keys::shard_qts(self.shard_id, vt_id), codec::to_bytes(&0u64))?;
            self.kv.put(&keys::shard_last_clock(self.shard_id, vt_id), codec::to_bytes(&zero_clk))?;
        }
        Ok(())
    }

    fn node_attr_entries(node: &Node) -> Vec<(Vec<u8>, Vec<u8>)> {
        let h = &node.handle;
        let mut entries = vec![
            (keys::graph_attr(h, keys::ATTR_CREAT), codec::to_bytes(node.base.creat_time())),
            (keys::graph_attr(h, keys::ATTR_DEL), codec::to_bytes(node.base.del_time())),
            (keys::graph_attr(h, keys::ATTR_PROPS), codec::to_bytes(&node.base.properties().to_vec())),
            (keys::graph_attr(h, keys::ATTR_TXQ), codec::to_bytes(&node.tx_queue)),
        ];
        for (id, edge) in &node.out_edges {
            entries.push((keys::graph_edge(h, *id), codec::to_bytes(edge)));
        }
        for nbr in &node.in_nbrs {
            entries.push((keys::graph_in_nbr(h, nbr), Vec::new()));
        }
        entries
    }

    /// Writes a node's full record in one batch.
    pub fn put_node(&self, node: &Node) -> CResult<()> {
        self.kv.multi_put(Self::node_attr_entries(node))
    }

    /// Writes many freshly built nodes in a single batched put.
    pub fn bulk_load(&self, nodes: &[Node]) -> CResult<()> {
        let mut entries = Vec::new();
        for node in nodes {
            entries.extend(Self::node_attr_entries(node));
        }
        self.kv.multi_put(entries)
    }

    pub fn update_creat_time(&self, handle: &NodeHandle, clk: &VectorClock) -> CResult<()> {
        self.kv.put(&keys::graph_attr(handle, keys::ATTR_CREAT), codec::to_bytes(clk))
    }

    pub fn update_del_time(&self, handle: &NodeHandle, clk: &VectorClock) -> CResult<()> {
        self.kv.put(&keys::graph_attr(handle, keys::ATTR_DEL), codec::to_bytes(clk))
    }

    pub fn update_properties(&self, handle: &NodeHandle, props: &[Property]) -> CResult<()> {
        self.kv.put(&keys::graph_attr(handle, keys::ATTR_PROPS), codec::to_bytes(&props.to_vec()))
    }

    pub fn update_tx_queue(&self, handle: &NodeHandle, queue: &[TxPiece]) -> CResult<()> {
        self.kv.put(&keys::graph_attr(handle, keys::ATTR_TXQ), codec::to_bytes(&queue.to_vec()))
    }

    pub fn add_out_edge(&self, handle: &NodeHandle, edge: &Edge) -> CResult<()> {
        self.kv.put(&keys::graph_edge(handle, edge.id), codec::to_bytes(edge))
    }

    pub fn remove_out_edge(&self, handle: &NodeHandle, edge_id: u64) -> CResult<()> {
        self.kv.delete(&keys::graph_edge(handle, edge_id))
    }

    pub fn add_in_nbr(&self, handle: &NodeHandle, nbr: &NodeHandle) -> CResult<()> {
        self.kv.put(&keys::graph_in_nbr(handle, nbr), Vec::new())
    }

    pub fn remove_in_nbr(&self, handle: &NodeHandle, nbr: &NodeHandle) -> CResult<()> {
        self.kv.delete(&keys::graph_in_nbr(handle, nbr))
    }

    /// Advances this shard's queue timestamp for one VT. The shard is the
    /// single writer of its own record.
    pub fn increment_qts(&self, vt_id: u64, incr: u64) -> CResult<()> {
        let key = keys::shard_qts(self.shard_id, vt_id);
        let cur = match self.kv.get(&key)? {
            Some(raw) => codec::from_bytes::<u64>(&raw)?,
            None => 0,
        };
        self.kv.put(&key, codec::to_bytes(&(cur + incr)))
    }

    pub fn update_last_clocks(&self, vt_id: u64, clk: &VectorClock) -> CResult<()> {
        self.kv.put(&keys::shard_last_clock(self.shard_id, vt_id), codec::to_bytes(clk))
    }

    fn load_checkpoint(&self) -> CResult<(HashMap<u64, u64>, HashMap<u64, VectorClock>)> {
        let mut qts = HashMap::new();
        let mut last_clocks = HashMap::new();
        for vt_id in 0..self.num_vts as u64 {
            let q = self
                .kv
                .get(&keys::shard_qts(self.shard_id, vt_id))?
                .ok_or_else(|| Error::Internal(format!("shard {} missing qts for vt {}", self.shard_id, vt_id)))?;
            qts.insert(vt_id, codec::from_bytes::<u64>(&q)?);
            let c = self
                .kv
                .get(&keys::shard_last_clock(self.shard_id, vt_id))?
                .ok_or_else(|| Error::Internal(format!("shard {} missing clock for vt {}", self.shard_id, vt_id)))?;
            last_clocks.insert(vt_id, codec::from_bytes::<VectorClock>(&c)?);
        }
        Ok((qts, last_clocks))
    }

    /// Reassembles one node from its attribute entries.
    fn load_node(&self, handle: &NodeHandle) -> CResult<Node> {
        let prefix = keys::graph_prefix(handle);
        let entries = self.kv.scan_prefix(&prefix)?;
        if entries.is_empty() {
            return Err(Error::BadHandle(format!("no graph record for {:?}", handle)));
        }

        let mut node = Node::new(handle.clone(), VectorClock::new(crate::vclock::NO_OWNER, self.num_vts));
        for (key, value) in entries {
            let (attr, rest) = keys::split_graph_suffix(&key, &prefix)
                .ok_or_else(|| Error::Internal("graph key outside its node prefix".to_string()))?;
            match attr {
                keys::ATTR_CREAT => node.base.update_creat_time(codec::from_bytes(&value)?),
                keys::ATTR_DEL => node.base.update_del_time(codec::from_bytes(&value)?),
                keys::ATTR_PROPS => node.base.set_properties(codec::from_bytes::<Vec<Property>>(&value)?),
                keys::ATTR_TXQ => node.tx_queue = codec::from_bytes::<Vec<TxPiece>>(&value)?,
                keys::ATTR_EDGE => {
                    // out-edge entry; the id is the key suffix
                    let id = u64::from_le_bytes(
                        rest.try_into()
                            .map_err(|_| Error::Parse("bad edge id suffix".to_string()))?,
                    );
                    let mut edge = codec::from_bytes::<Edge>(&value)?;
                    edge.id = id;
                    edge.migr_edge = false;
                    node.out_edges.insert(id, edge);
                }
                keys::ATTR_IN_NBR => {
                    node.in_nbrs.insert(rest.to_vec());
                }
                a => return Err(Error::Parse(format!("unknown graph attribute {}", a))),
            }
        }
        Ok(node)
    }

    /// Rebuilds the whole shard: checkpoint clocks, then every node mapped
    /// here by the name map, loaded with one batched lookup per node
    /// record.
    pub fn restore_backup(&self) -> CResult<RestoredShard> {
        let (qts, last_clocks) = self.load_checkpoint()?;

        let mut handles = Vec::new();
        for (key, value) in self.kv.scan_prefix(&keys::nmap_prefix())? {
            let entry = codec::from_bytes::<NmapEntry>(&value)?;
            if entry.shard != self.shard_id {
                continue;
            }
            // the nmap key is [space][u64 len][handle]
            let handle = key
                .get(9..)
                .ok_or_else(|| Error::Parse("short nmap key".to_string()))?
                .to_vec();
            handles.push(handle);
        }
        log::info!("restoring {} nodes for shard {}", handles.len(), self.shard_id);

        let mut nodes = HashMap::new();
        for handle in handles {
            let node = self.load_node(&handle)?;
            nodes.insert(handle, node);
        }
        Ok(RestoredShard { qts, last_clocks, nodes })
    }
}
