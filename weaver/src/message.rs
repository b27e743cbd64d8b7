//! Message kinds and wire framing: every message is [u32 type][payload].

use std::io::Cursor;

use bytes::BytesMut;

use crate::codec::{self, Wire};
use crate::element::NodeHandle;
use crate::error::{CResult, Error};
use crate::prog::{ProgKind, ProgParams};
use crate::transaction::{TxPiece, TxWrite, WriteOp};
use crate::vclock::VectorClock;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum MsgType {
    ClientTxInit = 1,
    ClientTxSuccess = 2,
    ClientTxAbort = 3,
    ClientNodeProgReq = 4,
    NodeProg = 5,
    NodeProgReturn = 6,
    NodeCountReply = 7,
    ClientNodeCount = 8,
    TxInit = 9,
    TxDone = 10,
    VtClockUpdate = 11,
    VtNopAck = 12,
    MigrationToken = 13,
    DoneMigr = 14,
    OneStreamMigr = 15,
    RestoreDone = 16,
}

impl MsgType {
    pub fn from_u32(v: u32) -> CResult<Self> {
        Ok(match v {
            1 => MsgType::ClientTxInit,
            2 => MsgType::ClientTxSuccess,
            3 => MsgType::ClientTxAbort,
            4 => MsgType::ClientNodeProgReq,
            5 => MsgType::NodeProg,
            6 => MsgType::NodeProgReturn,
            7 => MsgType::NodeCountReply,
            8 => MsgType::ClientNodeCount,
            9 => MsgType::TxInit,
            10 => MsgType::TxDone,
            11 => MsgType::VtClockUpdate,
            12 => MsgType::VtNopAck,
            13 => MsgType::MigrationToken,
            14 => MsgType::DoneMigr,
            15 => MsgType::OneStreamMigr,
            16 => MsgType::RestoreDone,
            v => return Err(Error::Protocol(format!("unknown message kind {}", v))),
        })
    }
}

/// A framed message. The buffer always starts with the u32 kind.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub buf: Vec<u8>,
}

impl Message {
    fn with_type(mtype: MsgType) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        (mtype as u32).pack(&mut buf);
        buf
    }

    fn finish(buf: BytesMut) -> Message {
        Message { buf: buf.to_vec() }
    }

    pub fn from_bytes(buf: Vec<u8>) -> Message {
        Message { buf }
    }

    pub fn msg_type(&self) -> CResult<MsgType> {
        let mut cur = Cursor::new(&self.buf[..]);
        MsgType::from_u32(codec::read_u32(&mut cur)?)
    }

    /// Cursor positioned past the type word.
    fn payload(&self) -> CResult<Cursor<&[u8]>> {
        if self.buf.len() < 4 {
            return Err(Error::Parse("message shorter than its type word".to_string()));
        }
        let mut cur = Cursor::new(&self.buf[..]);
        cur.set_position(4);
        Ok(cur)
    }

    // --- client transaction traffic ---

    pub fn client_tx_init(tx_id: u64, writes: &[WriteOp]) -> Message {
        let mut buf = Self::with_type(MsgType::ClientTxInit);
        tx_id.pack(&mut buf);
        (writes.len() as u64).pack(&mut buf);
        for op in writes {
            TxWrite::new(op.clone()).pack(&mut buf);
        }
        Self::finish(buf)
    }

    pub fn unpack_client_tx_init(&self) -> CResult<(u64, Vec<TxWrite>)> {
        let mut cur = self.payload()?;
        let tx_id = codec::read_u64(&mut cur)?;
        let n = codec::read_u64(&mut cur)? as usize;
        let mut writes = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            writes.push(TxWrite::unpack(&mut cur)?);
        }
        Ok((tx_id, writes))
    }

    pub fn client_tx_success() -> Message {
        Self::finish(Self::with_type(MsgType::ClientTxSuccess))
    }

    pub fn client_tx_abort() -> Message {
        Self::finish(Self::with_type(MsgType::ClientTxAbort))
    }

    // --- shard fan-out ---

    pub fn tx_piece(piece: &TxPiece) -> Message {
        let mut buf = Self::with_type(MsgType::TxInit);
        piece.pack(&mut buf);
        Self::finish(buf)
    }

    pub fn unpack_tx_piece(&self) -> CResult<TxPiece> {
        TxPiece::unpack(&mut self.payload()?)
    }

    pub fn tx_done(tx_id: u64, shard_sender: u64) -> Message {
        let mut buf = Self::with_type(MsgType::TxDone);
        tx_id.pack(&mut buf);
        shard_sender.pack(&mut buf);
        Self::finish(buf)
    }

    pub fn unpack_tx_done(&self) -> CResult<(u64, u64)> {
        let mut cur = self.payload()?;
        Ok((codec::read_u64(&mut cur)?, codec::read_u64(&mut cur)?))
    }

    // --- VT to VT ---

    pub fn vt_clock_update(clk: &VectorClock) -> Message {
        let mut buf = Self::with_type(MsgType::VtClockUpdate);
        clk.pack(&mut buf);
        Self::finish(buf)
    }

    pub fn unpack_vt_clock_update(&self) -> CResult<VectorClock> {
        VectorClock::unpack(&mut self.payload()?)
    }

    // --- shard to VT ---

    pub fn vt_nop_ack(shard_sender: u64, nop_qts: u64, node_count: u64) -> Message {
        let mut buf = Self::with_type(MsgType::VtNopAck);
        shard_sender.pack(&mut buf);
        nop_qts.pack(&mut buf);
        node_count.pack(&mut buf);
        Self::finish(buf)
    }

    pub fn unpack_vt_nop_ack(&self) -> CResult<(u64, u64, u64)> {
        let mut cur = self.payload()?;
        Ok((
            codec::read_u64(&mut cur)?,
            codec::read_u64(&mut cur)?,
            codec::read_u64(&mut cur)?,
        ))
    }

    // --- node counts ---

    pub fn client_node_count() -> Message {
        Self::finish(Self::with_type(MsgType::ClientNodeCount))
    }

    pub fn node_count_reply(counts: &[u64]) -> Message {
        let mut buf = Self::with_type(MsgType::NodeCountReply);
        (counts.len() as u64).pack(&mut buf);
        for c in counts {
            c.pack(&mut buf);
        }
        Self::finish(buf)
    }

    pub fn unpack_node_count_reply(&self) -> CResult<Vec<u64>> {
        let mut cur = self.payload()?;
        let n = codec::read_u64(&mut cur)? as usize;
        let mut counts = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            counts.push(codec::read_u64(&mut cur)?);
        }
        Ok(counts)
    }

    // --- node programs ---

    pub fn client_node_prog_req(kind: ProgKind, args: &[(NodeHandle, ProgParams)]) -> Message {
        let mut buf = Self::with_type(MsgType::ClientNodeProgReq);
        kind.tag().pack(&mut buf);
        (args.len() as u64).pack(&mut buf);
        for (handle, params) in args {
            codec::put_bytes(&mut buf, handle);
            params.pack(&mut buf);
        }
        Self::finish(buf)
    }

    pub fn unpack_client_node_prog_req(&self) -> CResult<(ProgKind, Vec<(NodeHandle, ProgParams)>)> {
        let mut cur = self.payload()?;
        let kind = ProgKind::from_tag(codec::read_u16(&mut cur)?)?;
        let n = codec::read_u64(&mut cur)? as usize;
        let mut args = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            let handle = codec::read_bytes(&mut cur)?;
            let params = ProgParams::unpack(kind, &mut cur)?;
            args.push((handle, params));
        }
        Ok((kind, args))
    }

    pub fn node_prog(
        kind: ProgKind,
        vt_id: u64,
        timestamp: &VectorClock,
        req_id: u64,
        batch: &[(NodeHandle, ProgParams)],
    ) -> Message {
        let mut buf = Self::with_type(MsgType::NodeProg);
        kind.tag().pack(&mut buf);
        vt_id.pack(&mut buf);
        timestamp.pack(&mut buf);
        req_id.pack(&mut buf);
        (batch.len() as u64).pack(&mut buf);
        for (handle, params) in batch {
            codec::put_bytes(&mut buf, handle);
            params.pack(&mut buf);
        }
        Self::finish(buf)
    }

    #[allow(clippy::type_complexity)]
    pub fn unpack_node_prog(
        &self,
    ) -> CResult<(ProgKind, u64, VectorClock, u64, Vec<(NodeHandle, ProgParams)>)> {
        let mut cur = self.payload()?;
        let kind = ProgKind::from_tag(codec::read_u16(&mut cur)?)?;
        let vt_id = codec::read_u64(&mut cur)?;
        let timestamp = VectorClock::unpack(&mut cur)?;
        let req_id = codec::read_u64(&mut cur)?;
        let n = codec::read_u64(&mut cur)? as usize;
        let mut batch = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            let handle = codec::read_bytes(&mut cur)?;
            let params = ProgParams::unpack(kind, &mut cur)?;
            batch.push((handle, params));
        }
        Ok((kind, vt_id, timestamp, req_id, batch))
    }

    /// A program reply. The result body is kind-specific and opaque to the
    /// coordinator, which only routes it to the requesting client.
    pub fn node_prog_return(kind: ProgKind, req_id: u64, result: &[u8]) -> Message {
        let mut buf = Self::with_type(MsgType::NodeProgReturn);
        kind.tag().pack(&mut buf);
        req_id.pack(&mut buf);
        codec::put_bytes(&mut buf, result);
        Self::finish(buf)
    }

    pub fn unpack_node_prog_return(&self) -> CResult<(ProgKind, u64, Vec<u8>)> {
        let mut cur = self.payload()?;
        let kind = ProgKind::from_tag(codec::read_u16(&mut cur)?)?;
        let req_id = codec::read_u64(&mut cur)?;
        let result = codec::read_bytes(&mut cur)?;
        Ok((kind, req_id, result))
    }

    // --- migration and restore ---

    pub fn one_stream_migr() -> Message {
        Self::finish(Self::with_type(MsgType::OneStreamMigr))
    }

    pub fn migration_token(remaining_hops: u64, total_hops: u64, vt_id: u64) -> Message {
        let mut buf = Self::with_type(MsgType::MigrationToken);
        remaining_hops.pack(&mut buf);
        total_hops.pack(&mut buf);
        vt_id.pack(&mut buf);
        Self::finish(buf)
    }

    pub fn unpack_migration_token(&self) -> CResult<(u64, u64, u64)> {
        let mut cur = self.payload()?;
        Ok((
            codec::read_u64(&mut cur)?,
            codec::read_u64(&mut cur)?,
            codec::read_u64(&mut cur)?,
        ))
    }

    pub fn done_migr() -> Message {
        Self::finish(Self::with_type(MsgType::DoneMigr))
    }

    pub fn restore_done() -> Message {
        Self::finish(Self::with_type(MsgType::RestoreDone))
    }
}
