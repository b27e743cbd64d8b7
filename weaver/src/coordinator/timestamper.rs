//! The vector timestamper server.
//!
//! A fixed pool of worker threads feeds [`Timestamper::handle_message`],
//! each worker with its own [`CoordStub`] and [`OrderOracle`]. Two
//! dedicated threads drive [`Timestamper::nop_tick`] and
//! [`Timestamper::gossip_tick`]. Lock order, where more than one is held:
//! clk before tx/prog state; the periodic lock alone or before clk; the
//! restore lock before either.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::config::WeaverConfig;
use crate::error::{CResult, Error};
use crate::kvstore::KvBackend;
use crate::membership::{ClusterConfig, Membership, ServerState};
use crate::message::{Message, MsgType};
use crate::order::OrderOracle;
use crate::prog::ProgKind;
use crate::transaction::{NopData, PendingTx, TxAdmit, TxType, WriteOp};
use crate::transport::Transport;
use crate::vclock::VectorClock;

use super::current::{BlockedProg, CurrentProg};
use super::stub::{CoordStub, VtMeta};

/// Batch size of the done-program GC; completions between batches only
/// append to the done table.
const PROG_GC_PERIOD: u32 = 100;

/// Logical clock plus the per-VT admission counter, under one RW lock.
struct ClockState {
    vclk: VectorClock,
    out_queue_counter: u64,
    /// Merges applied from peer gossip. Reported at shutdown.
    clk_updates: u64,
}

struct TxProgState {
    outstanding_tx: HashMap<u64, PendingTx>,
    pend_progs: BTreeMap<u64, CurrentProg>,
    done_progs: BTreeMap<u64, CurrentProg>,
    /// kind → req_id → per-shard "GC announced" bits, always NumShards wide.
    done_reqs: HashMap<ProgKind, HashMap<u64, Vec<bool>>>,
    max_done_id: u64,
    max_done_clk: VectorClock,
    prog_done_cnt: u32,
}

struct PeriodicState {
    to_nop: Vec<bool>,
    nop_ack_qts: Vec<u64>,
    shard_node_count: Vec<u64>,
}

struct RestoreState {
    status: u32,
    prog_queue: Vec<BlockedProg>,
}

struct OutQueue {
    queue: BTreeMap<u64, PendingTx>,
    /// Last vt_seq handed to shards; dispatch never skips a gap.
    dispatched_seq: u64,
}

struct ConfigState {
    config: ClusterConfig,
    prev_config: ClusterConfig,
    first_config: bool,
}

#[derive(Default)]
struct TestCounters {
    outstanding: u64,
    max_outstanding: u64,
}

type PlacementFn = dyn Fn(u64) -> u64 + Send + Sync;

pub struct Timestamper {
    vt_id: u64,
    config: WeaverConfig,
    clk: RwLock<ClockState>,
    req_id: Mutex<u64>,
    txprog: Mutex<TxProgState>,
    periodic: Mutex<PeriodicState>,
    restore: RwLock<RestoreState>,
    outq: Mutex<OutQueue>,
    cfg_state: Mutex<ConfigState>,
    migr_client: Mutex<Option<u64>>,
    to_exit: Mutex<bool>,
    test: Mutex<TestCounters>,
    placement: Box<PlacementFn>,
    comm: Arc<dyn Transport>,
    membership: Arc<dyn Membership>,
}

impl Timestamper {
    pub fn new(
        vt_id: u64,
        config: WeaverConfig,
        comm: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        let num_shards = config.num_shards;
        Self::with_placement(
            vt_id,
            config,
            comm,
            membership,
            Box::new(move |shards| {
                debug_assert_eq!(shards, num_shards);
                rand::thread_rng().gen_range(0..shards)
            }),
        )
    }

    /// Constructor with an explicit node-placement policy; the default is
    /// uniform random over shards.
    pub fn with_placement(
        vt_id: u64,
        config: WeaverConfig,
        comm: Arc<dyn Transport>,
        membership: Arc<dyn Membership>,
        placement: Box<PlacementFn>,
    ) -> Self {
        let clk_sz = config.clk_sz();
        let num_shards = config.num_shards as usize;
        Timestamper {
            vt_id,
            config,
            clk: RwLock::new(ClockState {
                vclk: VectorClock::new(vt_id, clk_sz),
                out_queue_counter: 0,
                clk_updates: 0,
            }),
            req_id: Mutex::new(0),
            txprog: Mutex::new(TxProgState {
                outstanding_tx: HashMap::new(),
                pend_progs: BTreeMap::new(),
                done_progs: BTreeMap::new(),
                done_reqs: HashMap::new(),
                max_done_id: 0,
                max_done_clk: VectorClock::new(vt_id, clk_sz),
                prog_done_cnt: 0,
            }),
            periodic: Mutex::new(PeriodicState {
                to_nop: vec![false; num_shards],
                nop_ack_qts: vec![0; num_shards],
                shard_node_count: vec![0; num_shards],
            }),
            restore: RwLock::new(RestoreState { status: 0, prog_queue: Vec::new() }),
            outq: Mutex::new(OutQueue { queue: BTreeMap::new(), dispatched_seq: 0 }),
            cfg_state: Mutex::new(ConfigState {
                config: ClusterConfig::default(),
                prev_config: ClusterConfig::default(),
                first_config: false,
            }),
            migr_client: Mutex::new(None),
            to_exit: Mutex::new(false),
            test: Mutex::new(TestCounters::default()),
            placement,
            comm,
            membership,
        }
    }

    pub fn vt_id(&self) -> u64 {
        self.vt_id
    }

    pub fn weaver_config(&self) -> &WeaverConfig {
        &self.config
    }

    fn generate_req_id(&self) -> CResult<u64> {
        let mut next = self.req_id.lock()?;
        *next += 1;
        Ok(*next)
    }

    fn generate_loc(&self) -> u64 {
        (self.placement)(self.config.num_shards)
    }

    /// Stamps an outgoing tx: bump the local counter, take the next
    /// admission sequence number. (timestamp, vt_seq) pairs are strictly
    /// increasing for this VT.
    fn stamp(&self) -> CResult<(VectorClock, u64)> {
        let mut clk = self.clk.write()?;
        clk.vclk.increment_local();
        clk.out_queue_counter += 1;
        Ok((clk.vclk.clone(), clk.out_queue_counter))
    }

    /// Stamps a program dispatch: the clock advances but no admission
    /// sequence number is consumed, programs bypass the shard tx queues.
    fn stamp_prog(&self) -> CResult<VectorClock> {
        let mut clk = self.clk.write()?;
        clk.vclk.increment_local();
        Ok(clk.vclk.clone())
    }

    /// Snapshot of (vclk, out_queue_counter, clk_updates).
    pub fn clock_snapshot(&self) -> CResult<(VectorClock, u64, u64)> {
        let clk = self.clk.read()?;
        Ok((clk.vclk.clone(), clk.out_queue_counter, clk.clk_updates))
    }

    // --- transaction pipeline ---

    /// Admits a client tx end to end: placement, durable admission with
    /// retry, queueing for fan-out and the client terminator.
    pub fn prepare_tx<K: KvBackend>(
        &self,
        stub: &CoordStub<K>,
        oracle: &OrderOracle,
        mut tx: PendingTx,
    ) -> CResult<()> {
        let mut get_set: HashSet<Vec<u8>> = HashSet::new();
        let mut del_set: HashSet<Vec<u8>> = HashSet::new();
        let mut put_map: HashMap<Vec<u8>, u64> = HashMap::new();

        for write in tx.writes.iter_mut() {
            match &write.op {
                WriteOp::CreateNode { handle } => {
                    write.loc1 = self.generate_loc();
                    put_map.insert(handle.clone(), write.loc1);
                }
                WriteOp::CreateEdge { node1, node2, .. } => {
                    match put_map.get(node1) {
                        Some(loc) => write.loc1 = *loc,
                        None => {
                            get_set.insert(node1.clone());
                        }
                    }
                    match put_map.get(node2) {
                        Some(loc) => write.loc2 = *loc,
                        None => {
                            get_set.insert(node2.clone());
                        }
                    }
                }
                WriteOp::DeleteNode { handle } => {
                    match put_map.get(handle) {
                        Some(loc) => write.loc1 = *loc,
                        None => {
                            get_set.insert(handle.clone());
                        }
                    }
                    del_set.insert(handle.clone());
                }
                WriteOp::DeleteEdge { node, .. }
                | WriteOp::SetNodeProperty { handle: node, .. }
                | WriteOp::SetEdgeProperty { node, .. } => match put_map.get(node) {
                    Some(loc) => write.loc1 = *loc,
                    None => {
                        get_set.insert(node.clone());
                    }
                },
                WriteOp::Nop => {}
            }
        }

        let client = tx.client;
        let admit = loop {
            let (timestamp, vt_seq) = self.stamp()?;
            tx.timestamp = timestamp;
            tx.vt_seq = vt_seq;

            let admit = stub.do_tx(&get_set, &del_set, &put_map, &mut tx, oracle)?;
            match admit {
                TxAdmit::Ready => {
                    self.enqueue_tx(tx.clone())?;
                    break admit;
                }
                TxAdmit::Error => {
                    // shards still consume the burnt vt_seq
                    self.enqueue_tx(tx.copy_fail(self.config.num_shards as usize))?;
                    break admit;
                }
                TxAdmit::Retry => {
                    log::warn!("tx {}: transient admission failure, restamping", tx.id);
                    self.enqueue_tx(tx.copy_fail(self.config.num_shards as usize))?;
                }
            }
        };

        let reply = if admit == TxAdmit::Error {
            Message::client_tx_abort()
        } else {
            Message::client_tx_success()
        };
        self.comm.send_to_client(client, reply)?;
        self.tx_queue_loop()
    }

    fn enqueue_tx(&self, tx: PendingTx) -> CResult<()> {
        let mut outq = self.outq.lock()?;
        outq.queue.insert(tx.vt_seq, tx);
        Ok(())
    }

    /// Drains the out-queue in vt_seq order. Dispatch stops at the first
    /// gap: a stamped-but-not-yet-enqueued tx on another worker.
    pub fn tx_queue_loop(&self) -> CResult<()> {
        let mut guard = self.outq.lock()?;
        let outq = &mut *guard;
        while let Some(entry) = outq.queue.first_entry() {
            if *entry.key() != outq.dispatched_seq + 1 {
                break;
            }
            let tx = entry.remove();
            outq.dispatched_seq = tx.vt_seq;

            if tx.tx_type == TxType::Update {
                let mut state = self.txprog.lock()?;
                state.outstanding_tx.insert(tx.id, tx.clone());
            }
            for shard_idx in tx.shards_hit() {
                let piece = tx.shard_piece(self.vt_id, shard_idx);
                let endpoint = self.config.shard_endpoint(shard_idx);
                self.comm.send(endpoint, Message::tx_piece(&piece))?;
            }
        }
        Ok(())
    }

    /// TX_DONE from a shard: clear its bit; on the last one, free the tx
    /// and its durable record. A duplicate is a protocol violation.
    pub fn end_tx<K: KvBackend>(
        &self,
        stub: &CoordStub<K>,
        tx_id: u64,
        shard_endpoint: u64,
    ) -> CResult<()> {
        let shard_idx = self
            .config
            .shard_index(shard_endpoint)
            .ok_or_else(|| Error::Protocol(format!("TX_DONE from bad shard id {}", shard_endpoint)))?
            as usize;

        let done = {
            let mut state = self.txprog.lock()?;
            let tx = state
                .outstanding_tx
                .get_mut(&tx_id)
                .ok_or_else(|| Error::Protocol(format!("TX_DONE for unknown tx {}", tx_id)))?;
            if !tx.shard_write[shard_idx] {
                return Err(Error::Protocol(format!(
                    "duplicate TX_DONE for tx {} from shard {}",
                    tx_id, shard_endpoint
                )));
            }
            tx.shard_write[shard_idx] = false;
            if tx.all_done() {
                state.outstanding_tx.remove(&tx_id);
                true
            } else {
                false
            }
        };
        if done {
            stub.clean_tx(tx_id)?;
        }
        Ok(())
    }

    pub fn outstanding_tx_count(&self) -> CResult<usize> {
        Ok(self.txprog.lock()?.outstanding_tx.len())
    }

    // --- clock gossip and nops ---

    /// VT_CLOCK_UPDATE from a peer.
    pub fn handle_clock_update(&self, other: &VectorClock) -> CResult<()> {
        let mut clk = self.clk.write()?;
        clk.clk_updates += 1;
        clk.vclk.merge(other);
        Ok(())
    }

    /// VT_NOP_ACK from a shard. Acks whose queue timestamp is not newer
    /// than the last one seen are stale and dropped.
    pub fn handle_nop_ack(&self, shard_endpoint: u64, nop_qts: u64, node_count: u64) -> CResult<()> {
        let shard_idx = self
            .config
            .shard_index(shard_endpoint)
            .ok_or_else(|| Error::Protocol(format!("VT_NOP_ACK from bad shard id {}", shard_endpoint)))?
            as usize;
        let mut periodic = self.periodic.lock()?;
        if nop_qts > periodic.nop_ack_qts[shard_idx] {
            periodic.shard_node_count[shard_idx] = node_count;
            periodic.to_nop[shard_idx] = true;
            periodic.nop_ack_qts[shard_idx] = nop_qts;
        }
        Ok(())
    }

    pub fn node_count_snapshot(&self) -> CResult<Vec<u64>> {
        Ok(self.periodic.lock()?.shard_node_count.clone())
    }

    /// One pass of the periodic no-op worker: if any shard acked since the
    /// last nop, synthesize one nop tx carrying GC metadata for exactly
    /// those shards, then checkpoint the VT meta record.
    pub fn nop_tick<K: KvBackend>(&self, stub: &CoordStub<K>) -> CResult<bool> {
        let num_shards = self.config.num_shards as usize;
        let tx = {
            let mut periodic = self.periodic.lock()?;
            if !periodic.to_nop.iter().any(|b| *b) {
                return Ok(false);
            }
            let shard_write = periodic.to_nop.clone();
            let shard_node_count = periodic.shard_node_count.clone();

            let req_id = self.generate_req_id()?;
            let (timestamp, vt_seq) = self.stamp()?;

            let mut state = self.txprog.lock()?;
            let mut done_reqs: Vec<Vec<(u64, ProgKind)>> = vec![Vec::new(); num_shards];
            for (kind, reqs) in state.done_reqs.iter_mut() {
                let mut fully_acked = Vec::new();
                for (req, acked) in reqs.iter_mut() {
                    debug_assert_eq!(acked.len(), num_shards);
                    for (shard_idx, bit) in acked.iter_mut().enumerate() {
                        if shard_write[shard_idx] && !*bit {
                            *bit = true;
                            done_reqs[shard_idx].push((*req, *kind));
                        }
                    }
                    if acked.iter().all(|b| *b) {
                        fully_acked.push(*req);
                    }
                }
                for req in fully_acked {
                    reqs.remove(&req);
                }
            }
            let nop = NopData {
                max_done_id: state.max_done_id,
                max_done_clk: state.max_done_clk.clone(),
                outstanding_progs: state.pend_progs.len() as u64,
                shard_node_count,
                done_reqs,
            };
            drop(state);

            let mut tx = PendingTx::new_nop(req_id, shard_write, nop, self.config.clk_sz());
            tx.timestamp = timestamp;
            tx.vt_seq = vt_seq;

            for bit in periodic.to_nop.iter_mut() {
                *bit = false;
            }
            tx
        };

        self.enqueue_tx(tx)?;
        self.tx_queue_loop()?;

        let (vclk, out_queue_counter, _) = self.clock_snapshot()?;
        let next_req_id = *self.req_id.lock()?;
        stub.save_meta(&VtMeta { vclk, out_queue_counter, next_req_id })?;
        Ok(true)
    }

    /// One pass of the clock-gossip worker: push the current clock to every
    /// other VT the membership snapshot reports available. The snapshot is
    /// refreshed only on a version bump.
    pub fn gossip_tick(
        &self,
        snapshot_version: &mut u64,
        vts_state: &mut Vec<ServerState>,
    ) -> CResult<()> {
        let num_vts = self.config.num_vts as usize;
        let cfg = self.membership.config()?;
        if cfg.version > *snapshot_version {
            *snapshot_version = cfg.version;
            *vts_state = cfg.vt_states(num_vts);
        }

        let vclk = {
            let clk = self.clk.read()?;
            clk.vclk.clone()
        };
        for (vt, state) in vts_state.iter().enumerate() {
            if vt as u64 == self.vt_id || *state != ServerState::Available {
                continue;
            }
            self.comm.send(vt as u64, Message::vt_clock_update(&vclk))?;
        }
        Ok(())
    }

    // --- node programs ---

    /// CLIENT_NODE_PROG_REQ: resolve start handles, group per shard, stamp
    /// and dispatch. During a restore the request is parked instead.
    pub fn start_node_prog<K: KvBackend>(
        &self,
        stub: &CoordStub<K>,
        client: u64,
        msg: &Message,
    ) -> CResult<()> {
        {
            let restore = self.restore.read()?;
            if restore.status > 0 {
                drop(restore);
                let mut restore = self.restore.write()?;
                restore.prog_queue.push(BlockedProg::new(client, msg.clone()));
                return Ok(());
            }
        }

        let (kind, args) = msg.unpack_client_node_prog_req()?;

        let mut get_set: HashSet<Vec<u8>> = HashSet::new();
        for (handle, _) in &args {
            get_set.insert(handle.clone());
        }
        let loc_map = stub.get_mappings(&get_set)?;
        if args.is_empty() || loc_map.len() != get_set.len() {
            log::info!("bad node handles in node prog request from client {}", client);
            self.comm.send_to_client(client, Message::node_prog_return(kind, 0, &[]))?;
            return Ok(());
        }

        let mut batches: HashMap<u64, Vec<_>> = HashMap::new();
        for (handle, params) in args {
            let shard = loc_map[&handle];
            batches.entry(shard).or_default().push((handle, params));
        }

        let req_timestamp = self.stamp_prog()?;
        debug_assert_eq!(req_timestamp.counters.len(), self.config.clk_sz());
        let req_id = self.generate_req_id()?;
        {
            let mut state = self.txprog.lock()?;
            state
                .pend_progs
                .insert(req_id, CurrentProg::new(req_id, client, req_timestamp.clone()));
        }

        for (shard_idx, batch) in batches {
            let endpoint = self.config.shard_endpoint(shard_idx);
            self.comm.send(
                endpoint,
                Message::node_prog(kind, self.vt_id, &req_timestamp, req_id, &batch),
            )?;
        }

        let mut test = self.test.lock()?;
        test.outstanding += 1;
        if test.outstanding > test.max_outstanding {
            test.max_outstanding = test.outstanding;
        }
        Ok(())
    }

    /// NODE_PROG_RETURN from a shard: forward the result to the requesting
    /// client, then retire the program.
    pub fn handle_prog_return(&self, kind: ProgKind, req_id: u64, msg: &Message) -> CResult<()> {
        let num_shards = self.config.num_shards as usize;
        let client = {
            let mut state = self.txprog.lock()?;
            let cp = state.pend_progs.remove(&req_id).ok_or_else(|| {
                Error::Protocol(format!("NODE_PROG_RETURN for unknown req {}", req_id))
            })?;
            let client = cp.client;
            // shards GC this request's state once every one acks the nop
            state
                .done_reqs
                .entry(kind)
                .or_default()
                .insert(req_id, vec![false; num_shards]);
            Self::node_prog_done(&mut state, cp);
            client
        };
        self.comm.send_to_client(client, msg.clone())?;

        let mut test = self.test.lock()?;
        test.outstanding = test.outstanding.saturating_sub(1);
        Ok(())
    }

    /// Retires a completed program and, every [`PROG_GC_PERIOD`]th call,
    /// advances (max_done_id, max_done_clk) over every done id below the
    /// smallest still-pending one, freeing the walked entries.
    fn node_prog_done(state: &mut TxProgState, cp: CurrentProg) {
        state.done_progs.insert(cp.req_id, cp);

        state.prog_done_cnt += 1;
        if state.prog_done_cnt % PROG_GC_PERIOD != 0 {
            return;
        }
        state.prog_done_cnt = 0;

        loop {
            let min_done = match state.done_progs.keys().next() {
                Some(id) => *id,
                None => break,
            };
            let blocked = state.pend_progs.keys().next().map_or(false, |pend| *pend < min_done);
            if blocked {
                break;
            }
            if let Some(cp) = state.done_progs.remove(&min_done) {
                debug_assert!(state.max_done_id < min_done);
                state.max_done_id = min_done;
                state.max_done_clk = cp.clock;
            }
        }
    }

    /// (max_done_id, max_done_clk) snapshot.
    pub fn max_done(&self) -> CResult<(u64, VectorClock)> {
        let state = self.txprog.lock()?;
        Ok((state.max_done_id, state.max_done_clk.clone()))
    }

    pub fn pending_prog_ids(&self) -> CResult<Vec<u64>> {
        Ok(self.txprog.lock()?.pend_progs.keys().copied().collect())
    }

    // --- migration relay ---

    pub fn handle_one_stream_migr(&self, client: u64) -> CResult<()> {
        let hops = self.config.num_shards;
        *self.migr_client.lock()? = Some(client);
        self.comm.send(self.config.shard_endpoint(0), Message::migration_token(hops, hops, self.vt_id))
    }

    pub fn handle_migration_token(&self) -> CResult<()> {
        let client = self.migr_client.lock()?.take();
        if let Some(client) = client {
            self.comm.send_to_client(client, Message::done_migr())?;
        }
        log::info!("shard node counts after migration: {:?}", self.node_count_snapshot()?);
        Ok(())
    }

    // --- membership and backup restore ---

    /// Installs a new configuration snapshot. A different cluster identity
    /// is fatal; an older version is dropped.
    pub fn reconfigure(&self, new_config: ClusterConfig) -> CResult<()> {
        let mut cfg = self.cfg_state.lock()?;
        if cfg.config.cluster != 0 && cfg.config.cluster != new_config.cluster {
            return Err(Error::MembershipChanged(format!(
                "cluster changed from {} to {}",
                cfg.config.cluster, new_config.cluster
            )));
        }
        if cfg.first_config && new_config.version < cfg.config.version {
            log::warn!(
                "ignoring configuration version {} older than current {}",
                new_config.version,
                cfg.config.version
            );
            return Ok(());
        }
        cfg.prev_config = std::mem::replace(&mut cfg.config, new_config);
        cfg.first_config = true;
        log::info!(
            "moved to configuration version {}, {} VTs available",
            cfg.config.version,
            cfg.config.available_vts(self.config.num_vts as usize)
        );
        Ok(())
    }

    /// Marks a backup restore in progress; program requests are buffered
    /// until [`handle_restore_done`](Self::handle_restore_done).
    pub fn begin_restore(&self) -> CResult<()> {
        self.restore.write()?.status += 1;
        Ok(())
    }

    /// Reloads durable VT state on backup promotion: clock, admission
    /// counter, request-id base and the still-outstanding transactions.
    pub fn restore_backup<K: KvBackend>(&self, stub: &CoordStub<K>) -> CResult<()> {
        let (meta, outstanding) = stub.restore_backup(self.config.clk_sz())?;
        {
            let mut clk = self.clk.write()?;
            clk.vclk.merge(&meta.vclk);
            clk.vclk.owner = self.vt_id;
            if clk.out_queue_counter < meta.out_queue_counter {
                clk.out_queue_counter = meta.out_queue_counter;
            }
            // admitted txs may postdate the last checkpoint
            for tx in &outstanding {
                clk.vclk.merge(&tx.timestamp);
                if clk.out_queue_counter < tx.vt_seq {
                    clk.out_queue_counter = tx.vt_seq;
                }
            }
        }
        {
            let mut next = self.req_id.lock()?;
            if *next < meta.next_req_id {
                *next = meta.next_req_id;
            }
        }
        {
            let counter = self.clk.read()?.out_queue_counter;
            let mut outq = self.outq.lock()?;
            // everything stamped before the crash was already dispatched
            outq.dispatched_seq = counter;
        }
        let mut state = self.txprog.lock()?;
        log::info!("restored {} outstanding txs for vt {}", outstanding.len(), self.vt_id);
        for tx in outstanding {
            state.outstanding_tx.insert(tx.id, tx);
        }
        Ok(())
    }

    /// RESTORE_DONE: leave the restoring state and hand back the parked
    /// program requests for re-dispatch.
    pub fn handle_restore_done(&self) -> CResult<Vec<BlockedProg>> {
        let mut restore = self.restore.write()?;
        if restore.status == 0 {
            return Err(Error::Protocol("RESTORE_DONE without a restore in progress".to_string()));
        }
        restore.status -= 1;
        Ok(std::mem::take(&mut restore.prog_queue))
    }

    // --- shutdown ---

    pub fn request_exit(&self) -> CResult<()> {
        *self.to_exit.lock()? = true;
        self.membership.request_shutdown()
    }

    pub fn should_exit(&self) -> bool {
        self.to_exit.lock().map(|e| *e).unwrap_or(true)
    }

    // --- server loop dispatch ---

    /// Handles one received message. Callers log-and-drop protocol errors
    /// in release builds and assert in debug builds.
    pub fn handle_message<K: KvBackend>(
        &self,
        stub: &CoordStub<K>,
        oracle: &OrderOracle,
        sender: u64,
        msg: &Message,
    ) -> CResult<()> {
        match msg.msg_type()? {
            MsgType::ClientTxInit => {
                let (tx_id, writes) = msg.unpack_client_tx_init()?;
                let mut tx = PendingTx::new_update(tx_id, sender, Vec::new(), self.config.clk_sz());
                tx.writes = writes;
                self.prepare_tx(stub, oracle, tx)
            }
            MsgType::VtClockUpdate => {
                let clk = msg.unpack_vt_clock_update()?;
                self.handle_clock_update(&clk)
            }
            MsgType::VtNopAck => {
                let (shard_sender, nop_qts, node_count) = msg.unpack_vt_nop_ack()?;
                self.handle_nop_ack(shard_sender, nop_qts, node_count)
            }
            MsgType::ClientNodeCount => {
                let counts = self.node_count_snapshot()?;
                self.comm.send_to_client(sender, Message::node_count_reply(&counts))
            }
            MsgType::TxDone => {
                let (tx_id, shard_id) = msg.unpack_tx_done()?;
                self.end_tx(stub, tx_id, shard_id)
            }
            MsgType::ClientNodeProgReq => self.start_node_prog(stub, sender, msg),
            MsgType::NodeProgReturn => {
                let (kind, req_id, _) = msg.unpack_node_prog_return()?;
                self.handle_prog_return(kind, req_id, msg)
            }
            MsgType::OneStreamMigr => self.handle_one_stream_migr(sender),
            MsgType::MigrationToken => self.handle_migration_token(),
            MsgType::RestoreDone => {
                let blocked = self.handle_restore_done()?;
                self.tx_queue_loop()?;
                for bp in blocked {
                    self.start_node_prog(stub, bp.client, &bp.msg)?;
                }
                Ok(())
            }
            other => Err(Error::Protocol(format!("unexpected message kind {:?}", other))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kvstore::Memory;
    use crate::membership::{local_roster, StaticMembership};
    use crate::prog::ProgParams;
    use crate::transport::Loopback;

    struct Harness {
        ts: Timestamper,
        stub: CoordStub<Memory>,
        oracle: OrderOracle,
        comm: Arc<Loopback>,
        membership: Arc<StaticMembership>,
    }

    /// Harness with deterministic placement: every fresh node lands on
    /// shard 0 unless a test builds its own timestamper.
    fn harness(num_vts: u64, num_shards: u64) -> Harness {
        let config = WeaverConfig::for_cluster(num_vts, num_shards, num_vts);
        let comm = Arc::new(Loopback::new());
        let membership = Arc::new(StaticMembership::new(local_roster(1, num_vts, num_shards)));
        let kv = Memory::new();
        let ts = Timestamper::with_placement(
            0,
            config,
            comm.clone(),
            membership.clone(),
            Box::new(|_| 0),
        );
        let stub = CoordStub::new(0, num_shards, kv);
        Harness { ts, stub, oracle: OrderOracle::new(), comm, membership }
    }

    fn client_tx(h: &Harness, tx_id: u64, client: u64, writes: Vec<WriteOp>) -> CResult<()> {
        let msg = Message::client_tx_init(tx_id, &writes);
        h.ts.handle_message(&h.stub, &h.oracle, client, &msg)
    }

    #[test]
    fn single_node_tx_on_single_shard() -> CResult<()> {
        // NumVts=1, NumShards=1, ShardIdIncr=1
        let h = harness(1, 1);
        client_tx(&h, 1, 100, vec![WriteOp::CreateNode { handle: b"A".to_vec() }])?;

        // the tx was stamped [1] and shard 1 received exactly its piece
        let sent = h.comm.take(1);
        assert_eq!(sent.len(), 1);
        let piece = sent[0].unpack_tx_piece()?;
        assert_eq!(piece.timestamp.counters, vec![1]);
        assert_eq!(piece.vt_seq, 1);
        assert_eq!(piece.writes.len(), 1);

        // client already has its success terminator
        let replies = h.comm.take_client(100);
        assert_eq!(replies, vec![Message::client_tx_success()]);

        // TX_DONE frees the tx
        assert_eq!(h.ts.outstanding_tx_count()?, 1);
        h.ts.handle_message(&h.stub, &h.oracle, 1, &Message::tx_done(1, 1))?;
        assert_eq!(h.ts.outstanding_tx_count()?, 0);
        Ok(())
    }

    #[test]
    fn edge_tx_fans_out_to_both_shards() -> CResult<()> {
        let h = harness(1, 2);
        // pre-state: "A" lives on shard 0 (endpoint 1)
        client_tx(&h, 1, 100, vec![WriteOp::CreateNode { handle: b"A".to_vec() }])?;
        h.ts.handle_message(&h.stub, &h.oracle, 1, &Message::tx_done(1, 1))?;
        h.comm.take(1);
        h.comm.take_client(100);

        // fresh "B" placed on shard 1 (endpoint 2)
        let ts2 = Timestamper::with_placement(
            0,
            h.ts.weaver_config().clone(),
            h.comm.clone(),
            h.membership.clone(),
            Box::new(|_| 1),
        );
        // continue from the first timestamper's clock
        let (clk, _, _) = h.ts.clock_snapshot()?;
        ts2.handle_clock_update(&clk)?;

        let writes = vec![
            WriteOp::CreateNode { handle: b"B".to_vec() },
            WriteOp::CreateEdge { id: 5, node1: b"A".to_vec(), node2: b"B".to_vec() },
        ];
        ts2.handle_message(&h.stub, &h.oracle, 101, &Message::client_tx_init(2, &writes))?;

        let to_shard1 = h.comm.take(1);
        let to_shard2 = h.comm.take(2);
        assert_eq!(to_shard1.len(), 1);
        assert_eq!(to_shard2.len(), 1);
        // shard 0 executes the edge write, shard 1 the node create + edge target
        let p1 = to_shard1[0].unpack_tx_piece()?;
        assert_eq!(p1.writes.len(), 1);
        let p2 = to_shard2[0].unpack_tx_piece()?;
        assert_eq!(p2.writes.len(), 2);
        assert_eq!(p1.timestamp, p2.timestamp);

        assert_eq!(h.comm.take_client(101), vec![Message::client_tx_success()]);

        ts2.end_tx(&h.stub, 2, 1)?;
        assert_eq!(ts2.outstanding_tx_count()?, 1);
        ts2.end_tx(&h.stub, 2, 2)?;
        assert_eq!(ts2.outstanding_tx_count()?, 0);
        Ok(())
    }

    #[test]
    fn bad_handle_aborts_but_burns_a_sequence_number() -> CResult<()> {
        let h = harness(1, 1);
        client_tx(
            &h,
            1,
            100,
            vec![WriteOp::CreateEdge { id: 1, node1: b"missing".to_vec(), node2: b"missing".to_vec() }],
        )?;

        assert_eq!(h.comm.take_client(100), vec![Message::client_tx_abort()]);
        assert_eq!(h.ts.outstanding_tx_count()?, 0);

        // the failed tx consumed vt_seq 1 and the shard saw a fail piece
        let (_, counter, _) = h.ts.clock_snapshot()?;
        assert_eq!(counter, 1);
        let sent = h.comm.take(1);
        assert_eq!(sent.len(), 1);
        let piece = sent[0].unpack_tx_piece()?;
        assert_eq!(piece.tx_type, TxType::Fail);
        assert_eq!(piece.vt_seq, 1);
        Ok(())
    }

    #[test]
    fn admission_order_means_increasing_stamps() -> CResult<()> {
        let h = harness(1, 1);
        let mut last_seq = 0;
        let mut last_counter = 0;
        for i in 1..=5u64 {
            client_tx(&h, i, 100, vec![WriteOp::CreateNode { handle: vec![i as u8] }])?;
        }
        for msg in h.comm.take(1) {
            let piece = msg.unpack_tx_piece()?;
            assert!(piece.vt_seq > last_seq);
            assert!(piece.timestamp.counters[0] > last_counter);
            last_seq = piece.vt_seq;
            last_counter = piece.timestamp.counters[0];
        }
        assert_eq!(last_seq, 5);
        Ok(())
    }

    #[test]
    fn duplicate_tx_done_is_a_protocol_violation() -> CResult<()> {
        let h = harness(1, 2);
        client_tx(&h, 1, 100, vec![WriteOp::CreateNode { handle: b"A".to_vec() }])?;
        h.ts.end_tx(&h.stub, 1, 1)?;
        let err = h.ts.end_tx(&h.stub, 1, 1).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        Ok(())
    }

    #[test]
    fn nop_tick_covers_exactly_the_acked_shards() -> CResult<()> {
        let h = harness(1, 3);
        // shards at endpoints 1,2,3; only 1 and 2 acked
        h.ts.handle_nop_ack(1, 1, 10)?;
        h.ts.handle_nop_ack(2, 1, 20)?;
        // a stale ack must not set the bit again
        h.ts.handle_nop_ack(1, 0, 99)?;

        assert!(h.ts.nop_tick(&h.stub)?);
        let s1 = h.comm.take(1);
        let s2 = h.comm.take(2);
        let s3 = h.comm.take(3);
        assert_eq!((s1.len(), s2.len(), s3.len()), (1, 1, 0));

        let piece = s1[0].unpack_tx_piece()?;
        assert_eq!(piece.tx_type, TxType::Nop);
        let nop = piece.nop.unwrap();
        assert_eq!(nop.shard_node_count, vec![10, 20, 0]);
        assert_eq!(nop.max_done_id, 0);

        // to_nop got cleared: a second tick is a no-op
        assert!(!h.ts.nop_tick(&h.stub)?);
        Ok(())
    }

    #[test]
    fn gossip_sends_to_available_peers_only() -> CResult<()> {
        let h = harness(3, 1);
        // vt 2 goes away
        h.membership.set_state(2, ServerState::NotAvailable)?;

        let mut version = 0;
        let mut vts_state = vec![ServerState::NotAvailable; 3];
        h.ts.gossip_tick(&mut version, &mut vts_state)?;

        assert!(h.comm.take(0).is_empty()); // never to self
        assert_eq!(h.comm.take(1).len(), 1);
        assert!(h.comm.take(2).is_empty());
        Ok(())
    }

    #[test]
    fn clock_update_merges_and_counts() -> CResult<()> {
        let h = harness(2, 1);
        h.ts.handle_clock_update(&VectorClock::from_counters(1, vec![0, 7]))?;
        let (clk, _, updates) = h.ts.clock_snapshot()?;
        assert_eq!(clk.counters, vec![0, 7]);
        assert_eq!(updates, 1);
        Ok(())
    }

    fn seed_node(h: &Harness, handle: &[u8]) -> CResult<()> {
        client_tx(h, 900, 1, vec![WriteOp::CreateNode { handle: handle.to_vec() }])?;
        h.ts.handle_message(&h.stub, &h.oracle, 1, &Message::tx_done(900, 1))?;
        h.comm.take(1);
        h.comm.take_client(1);
        Ok(())
    }

    #[test]
    fn node_prog_dispatch_and_return() -> CResult<()> {
        let h = harness(1, 1);
        seed_node(&h, b"A")?;

        let req = Message::client_node_prog_req(
            ProgKind::Reachability,
            &[(b"A".to_vec(), ProgParams::Reachability { dest: b"A".to_vec(), max_hops: 2 })],
        );
        h.ts.handle_message(&h.stub, &h.oracle, 55, &req)?;

        let sent = h.comm.take(1);
        assert_eq!(sent.len(), 1);
        let (kind, vt_id, ts, req_id, batch) = sent[0].unpack_node_prog()?;
        assert_eq!(kind, ProgKind::Reachability);
        assert_eq!(vt_id, 0);
        assert_eq!(batch.len(), 1);
        assert_eq!(h.ts.pending_prog_ids()?, vec![req_id]);
        // program stamping advanced the clock past the seeding tx
        assert!(ts.counters[0] > 1);

        let reply = Message::node_prog_return(kind, req_id, b"result");
        h.ts.handle_message(&h.stub, &h.oracle, 1, &reply)?;
        assert_eq!(h.comm.take_client(55), vec![reply]);
        assert!(h.ts.pending_prog_ids()?.is_empty());

        // completion registered the request for shard-side GC
        assert!(h.ts.nop_tick(&h.stub).is_ok());
        Ok(())
    }

    #[test]
    fn unknown_prog_handle_gets_an_empty_reply() -> CResult<()> {
        let h = harness(1, 1);
        let req = Message::client_node_prog_req(
            ProgKind::Dijkstra,
            &[(b"ghost".to_vec(), ProgParams::Dijkstra { dest: b"x".to_vec(), weight_key: b"w".to_vec() })],
        );
        h.ts.handle_message(&h.stub, &h.oracle, 55, &req)?;

        let replies = h.comm.take_client(55);
        assert_eq!(replies.len(), 1);
        let (kind, req_id, payload) = replies[0].unpack_node_prog_return()?;
        assert_eq!(kind, ProgKind::Dijkstra);
        assert_eq!(req_id, 0);
        assert!(payload.is_empty());
        // nothing was dispatched or registered
        assert!(h.comm.take(1).is_empty());
        assert!(h.ts.pending_prog_ids()?.is_empty());
        Ok(())
    }

    #[test]
    fn done_prog_gc_advances_over_the_shared_prefix() -> CResult<()> {
        let h = harness(1, 1);
        seed_node(&h, b"A")?;

        // dispatch enough programs to cross one GC batch
        let mut req_ids = Vec::new();
        for _ in 0..(PROG_GC_PERIOD + 10) {
            let req = Message::client_node_prog_req(
                ProgKind::Reachability,
                &[(b"A".to_vec(), ProgParams::Reachability { dest: b"A".to_vec(), max_hops: 1 })],
            );
            h.ts.start_node_prog(&h.stub, 9, &req)?;
            let sent = h.comm.take(1);
            let (_, _, _, req_id, _) = sent[0].unpack_node_prog()?;
            req_ids.push(req_id);
        }

        // completing the first PROG_GC_PERIOD in order advances max_done_id
        for req_id in req_ids.iter().take(PROG_GC_PERIOD as usize) {
            let reply = Message::node_prog_return(ProgKind::Reachability, *req_id, b"r");
            h.ts.handle_prog_return(ProgKind::Reachability, *req_id, &reply)?;
        }
        let (max_done, _) = h.ts.max_done()?;
        assert_eq!(max_done, req_ids[PROG_GC_PERIOD as usize - 1]);
        // everything at or below max_done left the pending table
        assert!(h.ts.pending_prog_ids()?.iter().all(|id| *id > max_done));
        Ok(())
    }

    #[test]
    fn max_done_does_not_skip_pending_gaps() -> CResult<()> {
        let h = harness(1, 1);
        seed_node(&h, b"A")?;

        let mut req_ids = Vec::new();
        for _ in 0..PROG_GC_PERIOD {
            let req = Message::client_node_prog_req(
                ProgKind::Clustering,
                &[(b"A".to_vec(), ProgParams::Clustering { outgoing: true })],
            );
            h.ts.start_node_prog(&h.stub, 9, &req)?;
            let (_, _, _, req_id, _) = h.comm.take(1)[0].unpack_node_prog()?;
            req_ids.push(req_id);
        }

        // complete all but the very first program
        for req_id in req_ids.iter().skip(1) {
            let reply = Message::node_prog_return(ProgKind::Clustering, *req_id, b"r");
            h.ts.handle_prog_return(ProgKind::Clustering, *req_id, &reply)?;
        }
        // the uninterrupted shared prefix is empty: req_ids[0] is pending
        let (max_done, _) = h.ts.max_done()?;
        assert_eq!(max_done, 0);

        // completing the gap is the PROG_GC_PERIOD-th call: GC sweeps all
        let reply = Message::node_prog_return(ProgKind::Clustering, req_ids[0], b"r");
        h.ts.handle_prog_return(ProgKind::Clustering, req_ids[0], &reply)?;
        let (max_done, _) = h.ts.max_done()?;
        assert_eq!(max_done, *req_ids.last().unwrap());
        assert!(h.ts.pending_prog_ids()?.is_empty());
        Ok(())
    }

    #[test]
    fn restore_buffers_programs_until_done() -> CResult<()> {
        let h = harness(1, 1);
        seed_node(&h, b"A")?;

        h.ts.begin_restore()?;
        let req = Message::client_node_prog_req(
            ProgKind::Reachability,
            &[(b"A".to_vec(), ProgParams::Reachability { dest: b"A".to_vec(), max_hops: 1 })],
        );
        h.ts.handle_message(&h.stub, &h.oracle, 55, &req)?;
        // parked, not dispatched
        assert!(h.comm.take(1).is_empty());

        h.ts.restore_backup(&h.stub)?;
        h.ts.handle_message(&h.stub, &h.oracle, 0, &Message::restore_done())?;
        // the parked request went out after the drain
        assert_eq!(h.comm.take(1).len(), 1);
        Ok(())
    }

    #[test]
    fn promoted_backup_resumes_with_gap_free_sequence_numbers() -> CResult<()> {
        let h = harness(1, 1);
        client_tx(&h, 1, 100, vec![WriteOp::CreateNode { handle: b"A".to_vec() }])?;
        // checkpoint happens on the nop path
        h.ts.handle_nop_ack(1, 1, 1)?;
        h.ts.nop_tick(&h.stub)?;
        let (clk_before, counter_before, _) = h.ts.clock_snapshot()?;

        // a fresh timestamper over the same backend plays the backup
        let backup = Timestamper::with_placement(
            0,
            h.ts.weaver_config().clone(),
            h.comm.clone(),
            h.membership.clone(),
            Box::new(|_| 0),
        );
        backup.begin_restore()?;
        backup.restore_backup(&h.stub)?;
        let _ = backup.handle_restore_done()?;

        let (clk, counter, _) = backup.clock_snapshot()?;
        assert_eq!(clk.counters, clk_before.counters);
        assert_eq!(counter, counter_before);
        // tx 1 is outstanding again, waiting for its TX_DONE
        assert_eq!(backup.outstanding_tx_count()?, 1);

        // the next admission continues the sequence without a gap
        h.comm.take(1);
        backup.handle_message(&h.stub, &h.oracle, 100, &Message::client_tx_init(2, &[WriteOp::CreateNode { handle: b"B".to_vec() }]))?;
        let sent = h.comm.take(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].unpack_tx_piece()?.vt_seq, counter_before + 1);
        Ok(())
    }

    #[test]
    fn node_count_reply_uses_the_latest_snapshot() -> CResult<()> {
        let h = harness(1, 2);
        h.ts.handle_nop_ack(1, 1, 11)?;
        h.ts.handle_nop_ack(2, 1, 22)?;
        h.ts.handle_message(&h.stub, &h.oracle, 77, &Message::client_node_count())?;
        let replies = h.comm.take_client(77);
        assert_eq!(replies[0].unpack_node_count_reply()?, vec![11, 22]);
        Ok(())
    }

    #[test]
    fn migration_token_roundtrip() -> CResult<()> {
        let h = harness(1, 2);
        h.ts.handle_message(&h.stub, &h.oracle, 42, &Message::one_stream_migr())?;
        let sent = h.comm.take(1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].unpack_migration_token()?, (2, 2, 0));

        h.ts.handle_message(&h.stub, &h.oracle, 1, &Message::migration_token(0, 2, 0))?;
        assert_eq!(h.comm.take_client(42), vec![Message::done_migr()]);
        Ok(())
    }

    #[test]
    fn cluster_change_is_fatal() -> CResult<()> {
        let h = harness(1, 1);
        h.ts.reconfigure(local_roster(1, 1, 1))?;
        let err = h.ts.reconfigure(local_roster(2, 1, 1)).unwrap_err();
        assert!(matches!(err, Error::MembershipChanged(_)));
        Ok(())
    }
}
