//! Network plumbing for the timestamper daemon.
//!
//! A tokio listener frames inbound connections with a length-delimited
//! codec and feeds (sender, frame) pairs to a fixed pool of worker threads;
//! replies travel back through per-connection writer tasks. Server peers
//! (other VTs and shards) are dialed lazily at `host:port_base + endpoint`,
//! the port scheme the cluster is deployed with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc as tokio_mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use weaver::error::{CResult, Error};
use weaver::message::Message;
use weaver::transport::Transport;

/// Inbound connections get ids far above any server endpoint id.
pub const CLIENT_ID_BASE: u64 = 1 << 32;

type FrameSender = tokio_mpsc::UnboundedSender<Bytes>;

/// Transport over TCP with one writer task per destination.
pub struct NetTransport {
    host: String,
    port_base: u16,
    runtime: Handle,
    writers: Mutex<HashMap<u64, FrameSender>>,
}

impl NetTransport {
    pub fn new(host: String, port_base: u16, runtime: Handle) -> Self {
        NetTransport { host, port_base, runtime, writers: Mutex::new(HashMap::new()) }
    }

    /// Registers the writer side of an accepted connection.
    pub fn register(&self, id: u64, sender: FrameSender) {
        if let Ok(mut writers) = self.writers.lock() {
            writers.insert(id, sender);
        }
    }

    pub fn deregister(&self, id: u64) {
        if let Ok(mut writers) = self.writers.lock() {
            writers.remove(&id);
        }
    }

    fn spawn_writer(&self, stream: TcpStream) -> FrameSender {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        self.runtime.spawn(write_loop(stream.into_split().1, rx));
        tx
    }

    /// The channel to a server endpoint, dialing on first use. Delivery is
    /// best effort: an unreachable peer costs a warning, not an error.
    fn server_sender(&self, endpoint: u64) -> CResult<Option<FrameSender>> {
        if let Some(sender) = self.writers.lock()?.get(&endpoint) {
            return Ok(Some(sender.clone()));
        }
        let addr = format!("{}:{}", self.host, self.port_base as u64 + endpoint);
        let stream = match self.runtime.block_on(TcpStream::connect(&addr)) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("endpoint {} unreachable at {}: {}", endpoint, addr, err);
                return Ok(None);
            }
        };
        let sender = self.spawn_writer(stream);
        self.writers.lock()?.insert(endpoint, sender.clone());
        Ok(Some(sender))
    }

    fn push(&self, id: u64, msg: Message) -> CResult<()> {
        let sender = if id < CLIENT_ID_BASE {
            self.server_sender(id)?
        } else {
            self.writers.lock()?.get(&id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(Bytes::from(msg.buf)).is_err() {
                    self.deregister(id);
                    warn!("connection {} went away mid-send", id);
                }
            }
            None => debug!("dropping message for unknown destination {}", id),
        }
        Ok(())
    }
}

impl Transport for NetTransport {
    fn send(&self, to: u64, msg: Message) -> CResult<()> {
        self.push(to, msg)
    }

    fn send_to_client(&self, client: u64, msg: Message) -> CResult<()> {
        self.push(client, msg)
    }
}

async fn write_loop(half: OwnedWriteHalf, mut rx: tokio_mpsc::UnboundedReceiver<Bytes>) {
    let mut framed = FramedWrite::new(half, LengthDelimitedCodec::new());
    while let Some(frame) = rx.recv().await {
        if framed.send(frame).await.is_err() {
            break;
        }
    }
}

/// Accept loop: every connection gets a client id, a writer registration
/// and a read task that forwards frames to the worker pool.
pub async fn accept_loop(
    listener: TcpListener,
    transport: Arc<NetTransport>,
    inbound: mpsc::Sender<(u64, Vec<u8>)>,
) {
    let next_id = Arc::new(AtomicU64::new(CLIENT_ID_BASE));
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("accept failed: {}", err);
                continue;
            }
        };
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        info!("connection {} from {}", id, peer);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        transport.runtime.spawn(write_loop(write_half, rx));
        transport.register(id, tx);

        let inbound = inbound.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let mut framed = FramedRead::new(read_half, LengthDelimitedCodec::new());
            while let Some(frame) = framed.next().await {
                match frame {
                    Ok(frame) => {
                        if inbound.send((id, frame.to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("connection {} read error: {}", id, err);
                        break;
                    }
                }
            }
            transport.deregister(id);
        });
    }
}

/// Blocking worker body: drain inbound frames and hand each message to the
/// dispatch closure. Protocol violations are fatal in debug builds and
/// logged in release builds; other errors are logged and the loop goes on.
pub fn worker_loop<F>(rx: Arc<Mutex<mpsc::Receiver<(u64, Vec<u8>)>>>, mut dispatch: F)
where
    F: FnMut(u64, Message) -> CResult<()>,
{
    loop {
        let next = {
            let rx = match rx.lock() {
                Ok(rx) => rx,
                Err(_) => return,
            };
            rx.recv()
        };
        let (sender, frame) = match next {
            Ok(pair) => pair,
            Err(_) => return, // listener gone, shutting down
        };
        match dispatch(sender, Message::from_bytes(frame)) {
            Ok(()) => {}
            Err(Error::Protocol(violation)) => {
                debug_assert!(false, "protocol violation: {}", violation);
                error!("protocol violation from {}: {}", sender, violation);
            }
            Err(err) => error!("error handling message from {}: {}", sender, err),
        }
    }
}
