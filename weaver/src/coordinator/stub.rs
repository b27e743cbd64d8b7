//! Coordinator-side durable stub: handle→shard mappings, atomic tx
//! admission, and the VT metadata a promoted backup reloads.
//!
//! Admission builds on the backend's per-key `put_if_absent`: new mappings
//! are installed first-writer-wins and rolled back if any later step of the
//! same transaction fails, so a mapping never silently re-points.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::element::NodeHandle;
use crate::error::{CResult, Error};
use crate::kvstore::{keys, KvBackend, NmapEntry};
use crate::order::OrderOracle;
use crate::transaction::{PendingTx, TxAdmit, WriteOp};
use crate::vclock::VectorClock;

/// Durable VT state reloaded on backup promotion.
#[derive(Clone, Debug, PartialEq)]
pub struct VtMeta {
    pub vclk: VectorClock,
    pub out_queue_counter: u64,
    pub next_req_id: u64,
}

impl Wire for VtMeta {
    fn wire_size(&self) -> u64 {
        self.vclk.wire_size() + 8 + 8
    }

    fn pack(&self, buf: &mut BytesMut) {
        self.vclk.pack(buf);
        self.out_queue_counter.pack(buf);
        self.next_req_id.pack(buf);
    }

    fn unpack(cur: &mut Cursor<&[u8]>) -> CResult<Self> {
        let vclk = VectorClock::unpack(cur)?;
        let out_queue_counter = codec::read_u64(cur)?;
        let next_req_id = codec::read_u64(cur)?;
        Ok(VtMeta { vclk, out_queue_counter, next_req_id })
    }
}

pub struct CoordStub<K: KvBackend> {
    vt_id: u64,
    num_shards: u64,
    kv: K,
}

impl<K: KvBackend> CoordStub<K> {
    pub fn new(vt_id: u64, num_shards: u64, kv: K) -> Self {
        CoordStub { vt_id, num_shards, kv }
    }

    /// Resolves handles to their home shards, skipping tombstoned entries.
    /// Callers detect missing handles by comparing result and input sizes.
    pub fn get_mappings(&self, handles: &HashSet<NodeHandle>) -> CResult<HashMap<NodeHandle, u64>> {
        let keys: Vec<Vec<u8>> = handles.iter().map(keys::nmap).collect();
        let values = self.kv.multi_get(&keys)?;
        let mut out = HashMap::with_capacity(handles.len());
        for (handle, value) in handles.iter().zip(values) {
            if let Some(raw) = value {
                let entry = codec::from_bytes::<NmapEntry>(&raw)?;
                if entry.del.is_never() {
                    out.insert(handle.clone(), entry.shard);
                }
            }
        }
        Ok(out)
    }

    /// Durable admission of a stamped tx. Resolves `get_set`, installs
    /// `put_map` mappings, tombstones `del_set`, fills write locations,
    /// computes the shard-write bitmap and persists the tx record.
    pub fn do_tx(
        &self,
        get_set: &HashSet<NodeHandle>,
        del_set: &HashSet<NodeHandle>,
        put_map: &HashMap<NodeHandle, u64>,
        tx: &mut PendingTx,
        oracle: &OrderOracle,
    ) -> CResult<TxAdmit> {
        // resolve existing handles at the tx timestamp
        let mut resolved: HashMap<NodeHandle, u64> = HashMap::with_capacity(get_set.len());
        for handle in get_set {
            let raw = match self.kv.get(&keys::nmap(handle))? {
                Some(raw) => raw,
                None => {
                    log::info!("tx {}: unknown handle {:?}", tx.id, handle);
                    return Ok(TxAdmit::Error);
                }
            };
            let entry = codec::from_bytes::<NmapEntry>(&raw)?;
            if !oracle.visible(&tx.timestamp, &entry.creat, &entry.del) {
                log::info!("tx {}: handle {:?} not visible at tx timestamp", tx.id, handle);
                return Ok(TxAdmit::Error);
            }
            resolved.insert(handle.clone(), entry.shard);
        }

        // install new mappings, first writer wins; roll back on conflict
        let mut installed: Vec<NodeHandle> = Vec::new();
        for (handle, shard) in put_map {
            let entry = NmapEntry::new(*shard, tx.timestamp.clone());
            if self.kv.put_if_absent(&keys::nmap(handle), codec::to_bytes(&entry))? {
                installed.push(handle.clone());
            } else {
                log::info!("tx {}: mapping conflict on {:?}", tx.id, handle);
                for h in installed {
                    self.kv.delete(&keys::nmap(&h))?;
                }
                return Ok(TxAdmit::Error);
            }
        }

        // tombstone deleted handles at the tx timestamp
        for handle in del_set {
            let key = keys::nmap(handle);
            let raw = self
                .kv
                .get(&key)?
                .ok_or_else(|| Error::Internal(format!("del handle {:?} vanished mid-admission", handle)))?;
            let mut entry = codec::from_bytes::<NmapEntry>(&raw)?;
            entry.del = tx.timestamp.clone();
            self.kv.put(&key, codec::to_bytes(&entry))?;
        }

        // fill per-write locations from put_map and the resolved set
        for write in tx.writes.iter_mut() {
            if write.loc1 == crate::transaction::UNKNOWN_LOC {
                if let Some(handle) = write.handle1() {
                    if let Some(loc) = put_map.get(handle).or_else(|| resolved.get(handle)) {
                        write.loc1 = *loc;
                    }
                }
            }
            if matches!(write.op, WriteOp::CreateEdge { .. })
                && write.loc2 == crate::transaction::UNKNOWN_LOC
            {
                if let Some(handle) = write.handle2() {
                    if let Some(loc) = put_map.get(handle).or_else(|| resolved.get(handle)) {
                        write.loc2 = *loc;
                    }
                }
            }
        }

        // shard_write: bit i iff some write targets shard i
        let mut shard_write = vec![false; self.num_shards as usize];
        for write in &tx.writes {
            for loc in [write.loc1, write.loc2] {
                if loc != crate::transaction::UNKNOWN_LOC {
                    let idx = loc as usize;
                    if idx >= shard_write.len() {
                        return Err(Error::Internal(format!("write resolved to bad shard {}", loc)));
                    }
                    shard_write[idx] = true;
                }
            }
        }
        tx.shard_write = shard_write;

        self.kv.put(&keys::tx_record(self.vt_id, tx.id), codec::to_bytes(tx))?;
        Ok(TxAdmit::Ready)
    }

    /// Drops the durable record of a fully acknowledged tx.
    pub fn clean_tx(&self, tx_id: u64) -> CResult<()> {
        self.kv.delete(&keys::tx_record(self.vt_id, tx_id))
    }

    pub fn save_meta(&self, meta: &VtMeta) -> CResult<()> {
        self.kv.put(&keys::vt_meta(self.vt_id), codec::to_bytes(meta))
    }

    /// Loads the VT's durable state: the last checkpointed meta record and
    /// every still-outstanding tx.
    pub fn restore_backup(&self, clk_width: usize) -> CResult<(VtMeta, Vec<PendingTx>)> {
        let meta = match self.kv.get(&keys::vt_meta(self.vt_id))? {
            Some(raw) => codec::from_bytes::<VtMeta>(&raw)?,
            None => VtMeta {
                vclk: VectorClock::new(self.vt_id, clk_width),
                out_queue_counter: 0,
                next_req_id: 0,
            },
        };
        let mut outstanding = Vec::new();
        for (_, value) in self.kv.scan_prefix(&keys::tx_prefix(self.vt_id))? {
            outstanding.push(codec::from_bytes::<PendingTx>(&value)?);
        }
        Ok((meta, outstanding))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kvstore::Memory;
    use crate::transaction::TxWrite;

    fn stamped(writes: Vec<WriteOp>, counter: u64) -> PendingTx {
        let mut tx = PendingTx::new_update(1, 7, writes, 1);
        tx.timestamp = VectorClock::from_counters(0, vec![counter]);
        tx.vt_seq = counter;
        tx
    }

    #[test]
    fn do_tx_installs_mappings_and_computes_bitmap() -> CResult<()> {
        let kv = Memory::new();
        let stub = CoordStub::new(0, 2, kv);
        let oracle = OrderOracle::new();

        // pre-existing node "a" on shard 0
        let mut seed = stamped(vec![WriteOp::CreateNode { handle: b"a".to_vec() }], 1);
        seed.writes[0].loc1 = 0;
        let put_map: HashMap<_, _> = [(b"a".to_vec(), 0u64)].into_iter().collect();
        assert_eq!(
            stub.do_tx(&HashSet::new(), &HashSet::new(), &put_map, &mut seed, &oracle)?,
            TxAdmit::Ready,
        );

        // edge from "a" to fresh "b" placed on shard 1
        let mut tx = stamped(
            vec![
                WriteOp::CreateNode { handle: b"b".to_vec() },
                WriteOp::CreateEdge { id: 1, node1: b"a".to_vec(), node2: b"b".to_vec() },
            ],
            2,
        );
        tx.id = 2;
        tx.writes[0].loc1 = 1;
        tx.writes[1].loc2 = 1;
        let put_map: HashMap<_, _> = [(b"b".to_vec(), 1u64)].into_iter().collect();
        let get_set: HashSet<_> = [b"a".to_vec()].into_iter().collect();
        assert_eq!(
            stub.do_tx(&get_set, &HashSet::new(), &put_map, &mut tx, &oracle)?,
            TxAdmit::Ready,
        );
        assert_eq!(tx.writes[1].loc1, 0);
        assert_eq!(tx.shard_write, vec![true, true]);
        Ok(())
    }

    #[test]
    fn unknown_handle_aborts() -> CResult<()> {
        let stub = CoordStub::new(0, 1, Memory::new());
        let oracle = OrderOracle::new();
        let mut tx = stamped(
            vec![WriteOp::CreateEdge { id: 1, node1: b"missing".to_vec(), node2: b"missing".to_vec() }],
            1,
        );
        let get_set: HashSet<_> = [b"missing".to_vec()].into_iter().collect();
        assert_eq!(
            stub.do_tx(&get_set, &HashSet::new(), &HashMap::new(), &mut tx, &oracle)?,
            TxAdmit::Error,
        );
        Ok(())
    }

    #[test]
    fn mapping_conflict_rolls_back_installed_handles() -> CResult<()> {
        let kv = Memory::new();
        let stub = CoordStub::new(0, 2, kv.clone());
        let oracle = OrderOracle::new();

        let mut seed = stamped(vec![WriteOp::CreateNode { handle: b"x".to_vec() }], 1);
        let put_map: HashMap<_, _> = [(b"x".to_vec(), 0u64)].into_iter().collect();
        stub.do_tx(&HashSet::new(), &HashSet::new(), &put_map, &mut seed, &oracle)?;

        // second tx creates both "w" and the already-taken "x"
        let mut tx = stamped(
            vec![
                WriteOp::CreateNode { handle: b"w".to_vec() },
                WriteOp::CreateNode { handle: b"x".to_vec() },
            ],
            2,
        );
        tx.id = 2;
        let put_map: HashMap<_, _> =
            [(b"w".to_vec(), 1u64), (b"x".to_vec(), 1u64)].into_iter().collect();
        assert_eq!(
            stub.do_tx(&HashSet::new(), &HashSet::new(), &put_map, &mut tx, &oracle)?,
            TxAdmit::Error,
        );
        // "w" must have been rolled back, "x" keeps its original shard
        assert_eq!(kv.get(&keys::nmap(&b"w".to_vec()))?, None);
        let entry = codec::from_bytes::<NmapEntry>(&kv.get(&keys::nmap(&b"x".to_vec()))?.unwrap())?;
        assert_eq!(entry.shard, 0);
        Ok(())
    }

    #[test]
    fn tombstoned_handle_is_invisible_to_later_tx() -> CResult<()> {
        let stub = CoordStub::new(0, 1, Memory::new());
        let oracle = OrderOracle::new();

        let mut create = stamped(vec![WriteOp::CreateNode { handle: b"a".to_vec() }], 1);
        let put_map: HashMap<_, _> = [(b"a".to_vec(), 0u64)].into_iter().collect();
        stub.do_tx(&HashSet::new(), &HashSet::new(), &put_map, &mut create, &oracle)?;

        let mut del = stamped(vec![WriteOp::DeleteNode { handle: b"a".to_vec() }], 2);
        del.id = 2;
        let get_set: HashSet<_> = [b"a".to_vec()].into_iter().collect();
        let del_set = get_set.clone();
        assert_eq!(stub.do_tx(&get_set, &del_set, &HashMap::new(), &mut del, &oracle)?, TxAdmit::Ready);

        let mut touch = stamped(
            vec![WriteOp::SetNodeProperty { handle: b"a".to_vec(), key: b"k".to_vec(), value: b"v".to_vec() }],
            3,
        );
        touch.id = 3;
        assert_eq!(
            stub.do_tx(&get_set, &HashSet::new(), &HashMap::new(), &mut touch, &oracle)?,
            TxAdmit::Error,
        );
        Ok(())
    }

    #[test]
    fn tx_records_survive_until_cleaned() -> CResult<()> {
        let kv = Memory::new();
        let stub = CoordStub::new(0, 1, kv);
        let oracle = OrderOracle::new();
        let mut tx = stamped(vec![WriteOp::CreateNode { handle: b"a".to_vec() }], 1);
        let put_map: HashMap<_, _> = [(b"a".to_vec(), 0u64)].into_iter().collect();
        stub.do_tx(&HashSet::new(), &HashSet::new(), &put_map, &mut tx, &oracle)?;

        let (_, outstanding) = stub.restore_backup(1)?;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].id, tx.id);
        assert_eq!(outstanding[0].vt_seq, tx.vt_seq);
        let ops: Vec<_> = outstanding[0].writes.iter().map(|w: &TxWrite| w.op.clone()).collect();
        assert_eq!(ops, vec![WriteOp::CreateNode { handle: b"a".to_vec() }]);

        stub.clean_tx(tx.id)?;
        let (_, outstanding) = stub.restore_backup(1)?;
        assert!(outstanding.is_empty());
        Ok(())
    }

    #[test]
    fn meta_roundtrip() -> CResult<()> {
        let stub = CoordStub::new(3, 1, Memory::new());
        let meta = VtMeta {
            vclk: VectorClock::from_counters(3, vec![1, 2, 3, 9]),
            out_queue_counter: 9,
            next_req_id: 12,
        };
        stub.save_meta(&meta)?;
        let (out, _) = stub.restore_backup(4)?;
        assert_eq!(out, meta);
        Ok(())
    }
}
