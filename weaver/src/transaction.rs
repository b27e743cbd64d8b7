//! Client transactions and the per-shard pieces fanned out by a VT.

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::element::NodeHandle;
use crate::error::{CResult, Error};
use crate::prog::ProgKind;
use crate::vclock::VectorClock;

/// Shard location not yet resolved by admission.
pub const UNKNOWN_LOC: u64 = u64::MAX;

/// A done request announced to shards: (request id, program kind).
pub type DoneReq = (u64, ProgKind);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TxType {
    /// A client-authored batch of graph writes.
    Update = 0,
    /// A synthesized no-op carrying clock and GC metadata.
    Nop = 1,
    /// Placeholder for an aborted tx; shards skip it but advance their
    /// per-VT queue past its vt_seq.
    Fail = 2,
}

impl TxType {
    fn from_u8(v: u8) -> CResult<Self> {
        match v {
            0 => Ok(TxType::Update),
            1 => Ok(TxType::Nop),
            2 => Ok(TxType::Fail),
            v => Err(Error::Parse(format!("bad tx type {}", v))),
        }
    }
}

/// One graph mutation. Each op names one or two node handles.
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOp {
    CreateNode { handle: NodeHandle },
    CreateEdge { id: u64, node1: NodeHandle, node2: NodeHandle },
    DeleteNode { handle: NodeHandle },
    DeleteEdge { id: u64, node: NodeHandle },
    SetNodeProperty { handle: NodeHandle, key: Vec<u8>, value: Vec<u8> },
    SetEdgeProperty { id: u64, node: NodeHandle, key: Vec<u8>, value: Vec<u8> },
    Nop,
}

/// A write plus the shard locations admission resolved for its handles.
/// `loc2` is only meaningful for edge creation.
#[derive(Clone, Debug, PartialEq)]
pub struct TxWrite {
    pub op: WriteOp,
    pub loc1: u64,
    pub loc2: u64,
}

impl TxWrite {
    pub fn new(op: WriteOp) -> Self {
        TxWrite { op, loc1: UNKNOWN_LOC, loc2: UNKNOWN_LOC }
    }

    /// The handle whose shard decides where this write executes.
    pub fn handle1(&self) -> Option<&NodeHandle> {
        match &self.op {
            WriteOp::CreateNode { handle } => Some(handle),
            WriteOp::CreateEdge { node1, .. } => Some(node1),
            WriteOp::DeleteNode { handle } => Some(handle),
            WriteOp::DeleteEdge { node, .. } => Some(node),
            WriteOp::SetNodeProperty { handle, .. } => Some(handle),
            WriteOp::SetEdgeProperty { node, .. } => Some(node),
            WriteOp::Nop => None,
        }
    }

    /// The secondary handle, present only for edge creation.
    pub fn handle2(&self) -> Option<&NodeHandle> {
        match &self.op {
            WriteOp::CreateEdge { node2, .. } => Some(node2),
            _ => None,
        }
    }

    /// True iff this write executes at the shard with index `shard`.
    pub fn touches(&self, shard: u64) -> bool {
        self.loc1 == shard || (matches!(self.op, WriteOp::CreateEdge { .. }) && self.loc2 == shard)
    }
}

impl Wire for TxWrite {
    fn wire_size(&self) -> u64 {
        let op_sz = match &self.op {
            WriteOp::CreateNode { handle } | WriteOp::DeleteNode { handle } => {
                codec::bytes_size(handle)
            }
            WriteOp::CreateEdge { node1, node2, .. } => {
                8 + codec::bytes_size(node1) + codec::bytes_size(node2)
            }
            WriteOp::DeleteEdge { node, .. } => 8 + codec::bytes_size(node),
            WriteOp::SetNodeProperty { handle, key, value } => {
                codec::bytes_size(handle) + codec::bytes_size(key) + codec::bytes_size(value)
            }
            WriteOp::SetEdgeProperty { node, key, value, .. } => {
                8 + codec::bytes_size(node) + codec::bytes_size(key) + codec::bytes_size(value)
            }
            WriteOp::Nop => 0,
        };
        1 + op_sz + 8 + 8
    }

    fn pack(&self, buf: &mut BytesMut) {
        match &self.op {
            WriteOp::CreateNode { handle } => {
                0u8.pack(buf);
                codec::put_bytes(buf, handle);
            }
            WriteOp::CreateEdge { id, node1, node2 } => {
                1u8.pack(buf);
                id.pack(buf);
                codec::put_bytes(buf, node1);
                codec::put_bytes(buf, node2);
            }
            WriteOp::DeleteNode { handle } => {
                2u8.pack(buf);
                codec::put_bytes(buf, handle);
            }
            WriteOp::DeleteEdge { id, node } => {
                3u8.pack(buf);
                id.pack(buf);
                codec::put_bytes(buf, node);
            }
            WriteOp::SetNodeProperty { handle, key, value } => {
                4u8.pack(buf);
                codec::put_bytes(buf, handle);
                codec::put_bytes(buf, key);
                codec::put_bytes(buf, value);
            }
            WriteOp::SetEdgeProperty { id, node, key, value } => {
                5u8.pack(buf);
                id.pack(buf);
                codec::put_bytes(buf, node);
                codec::put_bytes(buf, key);
                codec::put_bytes(buf, value);
            }
            WriteOp::Nop => 6u8.pack(buf),
        }
        self.loc1.pack(buf);
        self.loc2.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let tag = codec::read_u8(cur)?;
        let op = match tag {
            0 => WriteOp::CreateNode { handle: codec::read_bytes(cur)? },
            1 => WriteOp::CreateEdge {
                id: codec::read_u64(cur)?,
                node1: codec::read_bytes(cur)?,
                node2: codec::read_bytes(cur)?,
            },
            2 => WriteOp::DeleteNode { handle: codec::read_bytes(cur)? },
            3 => WriteOp::DeleteEdge { id: codec::read_u64(cur)?, node: codec::read_bytes(cur)? },
            4 => WriteOp::SetNodeProperty {
                handle: codec::read_bytes(cur)?,
                key: codec::read_bytes(cur)?,
                value: codec::read_bytes(cur)?,
            },
            5 => WriteOp::SetEdgeProperty {
                id: codec::read_u64(cur)?,
                node: codec::read_bytes(cur)?,
                key: codec::read_bytes(cur)?,
                value: codec::read_bytes(cur)?,
            },
            6 => WriteOp::Nop,
            t => return Err(Error::Parse(format!("bad write op tag {}", t))),
        };
        let loc1 = codec::read_u64(cur)?;
        let loc2 = codec::read_u64(cur)?;
        Ok(TxWrite { op, loc1, loc2 })
    }
}

/// Metadata a nop carries to shards for program-state GC.
#[derive(Clone, Debug, PartialEq)]
pub struct NopData {
    pub max_done_id: u64,
    pub max_done_clk: VectorClock,
    pub outstanding_progs: u64,
    pub shard_node_count: Vec<u64>,
    /// Per shard index: done requests not yet confirmed at that shard.
    pub done_reqs: Vec<Vec<DoneReq>>,
}

/// A transaction at the coordinator: writes, stamp, and the bitmap of
/// shards that have not yet acknowledged their piece.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTx {
    pub id: u64,
    pub client: u64,
    pub tx_type: TxType,
    pub timestamp: VectorClock,
    pub vt_seq: u64,
    pub writes: Vec<TxWrite>,
    pub shard_write: Vec<bool>,
    pub nop: Option<NopData>,
}

impl PendingTx {
    pub fn new_update(id: u64, client: u64, writes: Vec<WriteOp>, clk_width: usize) -> Self {
        PendingTx {
            id,
            client,
            tx_type: TxType::Update,
            timestamp: VectorClock::new(crate::vclock::NO_OWNER, clk_width),
            vt_seq: 0,
            writes: writes.into_iter().map(TxWrite::new).collect(),
            shard_write: Vec::new(),
            nop: None,
        }
    }

    pub fn new_nop(id: u64, shard_write: Vec<bool>, nop: NopData, clk_width: usize) -> Self {
        PendingTx {
            id,
            client: u64::MAX,
            tx_type: TxType::Nop,
            timestamp: VectorClock::new(crate::vclock::NO_OWNER, clk_width),
            vt_seq: 0,
            writes: Vec::new(),
            shard_write,
            nop: Some(nop),
        }
    }

    /// The placeholder enqueued instead of an aborted tx. It keeps the
    /// consumed (timestamp, vt_seq) and is broadcast so every per-VT shard
    /// queue advances past it.
    pub fn copy_fail(&self, num_shards: usize) -> Self {
        PendingTx {
            id: self.id,
            client: self.client,
            tx_type: TxType::Fail,
            timestamp: self.timestamp.clone(),
            vt_seq: self.vt_seq,
            writes: Vec::new(),
            shard_write: vec![true; num_shards],
            nop: None,
        }
    }

    /// True when every shard has acknowledged its piece.
    pub fn all_done(&self) -> bool {
        self.shard_write.iter().all(|b| !b)
    }

    /// Shard indexes with the write bit set, ascending.
    pub fn shards_hit(&self) -> Vec<u64> {
        self.shard_write
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| i as u64)
            .collect()
    }

    /// The piece of this tx destined for one shard: same stamp, only the
    /// writes that execute there, and that shard's slice of nop metadata.
    pub fn shard_piece(&self, vt_id: u64, shard: u64) -> TxPiece {
        let writes = self.writes.iter().filter(|w| w.touches(shard)).cloned().collect();
        let nop = self.nop.as_ref().map(|n| NopPiece {
            max_done_id: n.max_done_id,
            max_done_clk: n.max_done_clk.clone(),
            outstanding_progs: n.outstanding_progs,
            shard_node_count: n.shard_node_count.clone(),
            done_reqs: n.done_reqs.get(shard as usize).cloned().unwrap_or_default(),
        });
        TxPiece {
            tx_id: self.id,
            vt_id,
            tx_type: self.tx_type,
            timestamp: self.timestamp.clone(),
            vt_seq: self.vt_seq,
            writes,
            nop,
        }
    }
}

/// Nop metadata as seen by a single shard.
#[derive(Clone, Debug, PartialEq)]
pub struct NopPiece {
    pub max_done_id: u64,
    pub max_done_clk: VectorClock,
    pub outstanding_progs: u64,
    pub shard_node_count: Vec<u64>,
    pub done_reqs: Vec<DoneReq>,
}

impl Wire for NopPiece {
    fn wire_size(&self) -> u64 {
        8 + self.max_done_clk.wire_size()
            + 8
            + 8
            + 8 * self.shard_node_count.len() as u64
            + 8
            + 10 * self.done_reqs.len() as u64
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.max_done_id.pack(buf);
        self.max_done_clk.pack(buf);
        self.outstanding_progs.pack(buf);
        (self.shard_node_count.len() as u64).pack(buf);
        for c in &self.shard_node_count {
            c.pack(buf);
        }
        (self.done_reqs.len() as u64).pack(buf);
        for (req_id, kind) in &self.done_reqs {
            req_id.pack(buf);
            kind.tag().pack(buf);
        }
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let max_done_id = codec::read_u64(cur)?;
        let max_done_clk = VectorClock::unpack(cur)?;
        let outstanding_progs = codec::read_u64(cur)?;
        let n = codec::read_u64(cur)? as usize;
        let mut shard_node_count = Vec::with_capacity(n);
        for _ in 0..n {
            shard_node_count.push(codec::read_u64(cur)?);
        }
        let n = codec::read_u64(cur)? as usize;
        let mut done_reqs = Vec::with_capacity(n);
        for _ in 0..n {
            let req_id = codec::read_u64(cur)?;
            let kind = ProgKind::from_tag(codec::read_u16(cur)?)?;
            done_reqs.push((req_id, kind));
        }
        Ok(NopPiece {
            max_done_id,
            max_done_clk,
            outstanding_progs,
            shard_node_count,
            done_reqs,
        })
    }
}

/// What a shard receives and queues: one tx piece from one VT.
#[derive(Clone, Debug, PartialEq)]
pub struct TxPiece {
    pub tx_id: u64,
    pub vt_id: u64,
    pub tx_type: TxType,
    pub timestamp: VectorClock,
    pub vt_seq: u64,
    pub writes: Vec<TxWrite>,
    pub nop: Option<NopPiece>,
}

impl Wire for TxPiece {
    fn wire_size(&self) -> u64 {
        8 + 8
            + 1
            + self.timestamp.wire_size()
            + 8
            + 8
            + self.writes.iter().map(|w| w.wire_size()).sum::<u64>()
            + 1
            + self.nop.as_ref().map_or(0, |n| n.wire_size())
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.tx_id.pack(buf);
        self.vt_id.pack(buf);
        (self.tx_type as u8).pack(buf);
        self.timestamp.pack(buf);
        self.vt_seq.pack(buf);
        (self.writes.len() as u64).pack(buf);
        for w in &self.writes {
            w.pack(buf);
        }
        (self.nop.is_some() as u8).pack(buf);
        if let Some(nop) = &self.nop {
            nop.pack(buf);
        }
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let tx_id = codec::read_u64(cur)?;
        let vt_id = codec::read_u64(cur)?;
        let tx_type = TxType::from_u8(codec::read_u8(cur)?)?;
        let timestamp = VectorClock::unpack(cur)?;
        let vt_seq = codec::read_u64(cur)?;
        let n = codec::read_u64(cur)? as usize;
        let mut writes = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            writes.push(TxWrite::unpack(cur)?);
        }
        let nop = if codec::read_u8(cur)? != 0 { Some(NopPiece::unpack(cur)?) } else { None };
        Ok(TxPiece { tx_id, vt_id, tx_type, timestamp, vt_seq, writes, nop })
    }
}

/// [u64 n][pieces]; the durable form of a node's pending queue.
impl Wire for Vec<TxPiece> {
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
        let n = codec::read_u64(cur)? as usize;
        let mut pieces = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            pieces.push(TxPiece::unpack(cur)?);
        }
        Ok(pieces)
    }
}

/// Durable coordinator record of an admitted tx, reloaded on backup
/// promotion. Nop payloads are not persisted; a nop is never outstanding.
impl Wire for PendingTx {
    fn wire_size(&self) -> u64 {
        8 + 8
            + 1
            + self.timestamp.wire_size()
            + 8
            + 8
            + self.writes.iter().map(|w| w.wire_size()).sum::<u64>()
            + 8
            + self.shard_write.len() as u64
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.id.pack(buf);
        self.client.pack(buf);
        (self.tx_type as u8).pack(buf);
        self.timestamp.pack(buf);
        self.vt_seq.pack(buf);
        (self.writes.len() as u64).pack(buf);
        for w in &self.writes {
            w.pack(buf);
        }
        (self.shard_write.len() as u64).pack(buf);
        for b in &self.shard_write {
            (*b as u8).pack(buf);
        }
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let id = codec::read_u64(cur)?;
        let client = codec::read_u64(cur)?;
        let tx_type = TxType::from_u8(codec::read_u8(cur)?)?;
        let timestamp = VectorClock::unpack(cur)?;
        let vt_seq = codec::read_u64(cur)?;
        let n = codec::read_u64(cur)? as usize;
        let mut writes = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            writes.push(TxWrite::unpack(cur)?);
        }
        let n = codec::read_u64(cur)? as usize;
        let mut shard_write = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            shard_write.push(codec::read_u8(cur)? != 0);
        }
        Ok(PendingTx { id, client, tx_type, timestamp, vt_seq, writes, shard_write, nop: None })
    }
}

/// Outcome of durable admission: ready to fan out, aborted, or neither
/// (transient backend fault, retry with a fresh stamp).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxAdmit {
    Ready,
    Error,
    Retry,
}
