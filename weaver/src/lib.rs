//! `weaver` is a distributed, transactional property-graph store.
//!
//! Client transactions mutate nodes, directed edges and their properties;
//! node programs traverse the graph with a point-in-time, read-consistent
//! view. A small set of vector timestampers (VTs) orders all operations
//! with vector clocks, graph shards apply tx pieces in per-VT sequence
//! order, and a key-value backend keeps node records and checkpoints
//! durable.
//!
//! ## Getting started
//!
//! A single-process timestamper over the in-memory backend:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use weaver::config::WeaverConfig;
//! use weaver::coordinator::{CoordStub, Timestamper};
//! use weaver::error::CResult;
//! use weaver::kvstore::Memory;
//! use weaver::membership::{local_roster, StaticMembership};
//! use weaver::message::Message;
//! use weaver::order::OrderOracle;
//! use weaver::transaction::WriteOp;
//! use weaver::transport::Loopback;
//!
//! fn main() -> CResult<()> {
//!     let config = WeaverConfig::default();
//!     let comm = Arc::new(Loopback::new());
//!     let membership = Arc::new(StaticMembership::new(local_roster(1, 1, 1)));
//!     let vt = Timestamper::new(0, config, comm.clone(), membership);
//!     let stub = CoordStub::new(0, 1, Memory::new());
//!     let oracle = OrderOracle::new();
//!
//!     let tx = Message::client_tx_init(1, &[WriteOp::CreateNode { handle: b"a".to_vec() }]);
//!     vt.handle_message(&stub, &oracle, 100, &tx)?;
//!
//!     // the shard at endpoint 1 now holds the tx piece
//!     assert_eq!(comm.take(1).len(), 1);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod element;
pub mod error;
pub mod kvstore;
pub mod membership;
pub mod message;
pub mod order;
pub mod prog;
pub mod shard;
pub mod transaction;
pub mod transport;
pub mod vclock;
