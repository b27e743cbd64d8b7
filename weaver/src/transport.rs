//! Message delivery interface.
//!
//! Delivery is ordered per (sender, receiver) pair and best-effort; the
//! coordinator never blocks on acknowledgement. Servers (VTs and shards)
//! are addressed by endpoint id, clients by the id the listener assigned to
//! their connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::CResult;
use crate::message::Message;

pub trait Transport: Send + Sync {
    /// Sends to a server endpoint (VT or shard).
    fn send(&self, to: u64, msg: Message) -> CResult<()>;

    /// Sends to a client connection.
    fn send_to_client(&self, client: u64, msg: Message) -> CResult<()>;
}

/// In-process transport that parks every message in per-endpoint queues.
/// Tests drain the queues to observe what a component sent.
#[derive(Default)]
pub struct Loopback {
    servers: Mutex<HashMap<u64, VecDeque<Message>>>,
    clients: Mutex<HashMap<u64, VecDeque<Message>>>,
}

impl Loopback {
    pub fn new() -> Self {
        Loopback::default()
    }

    /// Drains everything queued for a server endpoint.
    pub fn take(&self, endpoint: u64) -> Vec<Message> {
        let mut servers = self.servers.lock().unwrap_or_else(|e| e.into_inner());
        servers.get_mut(&endpoint).map(|q| q.drain(..).collect()).unwrap_or_default()
    }

    /// Drains everything queued for a client.
    pub fn take_client(&self, client: u64) -> Vec<Message> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.get_mut(&client).map(|q| q.drain(..).collect()).unwrap_or_default()
    }
}

impl Transport for Loopback {
    fn send(&self, to: u64, msg: Message) -> CResult<()> {
        self.servers.lock()?.entry(to).or_default().push_back(msg);
        Ok(())
    }

    fn send_to_client(&self, client: u64, msg: Message) -> CResult<()> {
        self.clients.lock()?.entry(client).or_default().push_back(msg);
        Ok(())
    }
}
