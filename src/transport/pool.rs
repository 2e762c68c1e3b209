//! Connection pool and per-connection read/write tasks.

use crate::identity::{LocalNode, NodeId};
use crate::message::{ChunkEnvelope, Envelope};
use crate::transport::codec::WireCodec;
use crate::transport::multipart::{split_into_chunks, Reassembler, SuppressionCache};
use crate::transport::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Byte stream a pooled connection runs the frame codec over.
/// Blanket-implemented, so any `AsyncRead + AsyncWrite` stream qualifies.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Outbound connection factory.
///
/// The default [`TcpDialer`] opens plain TCP; embedding applications
/// substitute their own (a TLS dialer, an in-memory pipe in tests)
/// without touching the pool.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<Box<dyn PeerStream>>;
}

/// Plain TCP [`Dialer`].
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<Box<dyn PeerStream>> {
        Ok(Box::new(TcpStream::connect(addr).await?))
    }
}

/// Diagnostic snapshot of one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub addr: SocketAddr,
    /// Claimed id of the peer, filled from the first inbound envelope.
    pub node_id: Option<NodeId>,
    pub inbound: bool,
    pub idle: Duration,
}

/// Transport lifecycle events consumed by the middleware pipeline.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Accepted(ConnectionInfo),
    Dropped(ConnectionInfo),
}

struct Connection {
    addr: SocketAddr,
    inbound: bool,
    node_id: RwLock<Option<NodeId>>,
    last_active: Mutex<Instant>,
    tx: mpsc::Sender<ChunkEnvelope>,
    cancel: CancellationToken,
}

impl Connection {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: self.addr,
            node_id: *self.node_id.read().unwrap_or_else(|e| e.into_inner()),
            inbound: self.inbound,
            idle: self
                .last_active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed(),
        }
    }

    fn touch(&self, node_id: NodeId) {
        *self.node_id.write().unwrap_or_else(|e| e.into_inner()) = Some(node_id);
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Connection-pooled TCP transport with multipart reassembly and
/// self-broadcast suppression.
///
/// Pool entries are keyed by peer address; when a send targets an
/// address with no entry, a linear scan by claimed node id catches the
/// asymmetric-NAT case where a peer's inbound connection arrived from a
/// different address than the one we would dial.
pub struct Transport {
    local: Arc<LocalNode>,
    chunk_size: usize,
    dialer: Box<dyn Dialer>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    reassembler: Reassembler,
    suppression: SuppressionCache,
    inbound_tx: mpsc::Sender<(SocketAddr, ChunkEnvelope)>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl Transport {
    pub fn new(
        local: Arc<LocalNode>,
        chunk_size: usize,
        suppression_window: Duration,
        reassembly_timeout: Duration,
        inbound_tx: mpsc::Sender<(SocketAddr, ChunkEnvelope)>,
        event_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self::with_dialer(
            local,
            chunk_size,
            suppression_window,
            reassembly_timeout,
            inbound_tx,
            event_tx,
            Box::new(TcpDialer),
        )
    }

    /// Build a transport dialing through a custom [`Dialer`].
    pub fn with_dialer(
        local: Arc<LocalNode>,
        chunk_size: usize,
        suppression_window: Duration,
        reassembly_timeout: Duration,
        inbound_tx: mpsc::Sender<(SocketAddr, ChunkEnvelope)>,
        event_tx: mpsc::Sender<ConnectionEvent>,
        dialer: Box<dyn Dialer>,
    ) -> Self {
        Self {
            local,
            chunk_size,
            dialer,
            connections: DashMap::new(),
            reassembler: Reassembler::new(reassembly_timeout),
            suppression: SuppressionCache::new(suppression_window),
            inbound_tx,
            event_tx,
        }
    }

    /// Send a logical message, chunking as needed. A connection is dialed
    /// lazily when none exists for the target.
    pub async fn send(
        self: &Arc<Self>,
        addr: SocketAddr,
        node_id: Option<&NodeId>,
        head: &Envelope,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let conn = match self.find(addr, node_id) {
            Some(conn) => conn,
            None => self.dial(addr).await?,
        };
        for chunk in split_into_chunks(head, payload, self.chunk_size) {
            conn.tx
                .send(chunk)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Feed one inbound chunk through suppression and reassembly.
    ///
    /// `Ok(Some(bytes))` hands back a complete logical message;
    /// `Ok(None)` means more chunks are outstanding ("not yet complete",
    /// not a failure); `Err(SelfBroadcast)` rejects this node's own
    /// looped-back broadcast.
    pub fn accept_chunk(&self, chunk: &ChunkEnvelope) -> Result<Option<Vec<u8>>, TransportError> {
        if self.suppression.contains(&chunk.head.id) {
            return Err(TransportError::SelfBroadcast);
        }
        self.reassembler.accept(chunk)
    }

    /// Record a broadcast id so the loopback of this message is dropped.
    pub fn record_broadcast(&self, id: Uuid) {
        self.suppression.record(id);
    }

    /// Evict abandoned partial reassembly buffers.
    pub fn sweep_partials(&self) -> usize {
        self.reassembler.sweep()
    }

    /// Messages currently awaiting more chunks.
    pub fn pending_partials(&self) -> usize {
        self.reassembler.pending()
    }

    /// Close one connection explicitly.
    pub fn close(&self, addr: SocketAddr) {
        if let Some(conn) = self.connections.get(&addr) {
            conn.cancel.cancel();
        } else {
            log::warn!("no connection to {} to close", addr);
        }
    }

    /// Close every pooled connection. Reader tasks observe the cancel,
    /// drop their sockets, and emit `Dropped` events as usual.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().cancel.cancel();
        }
    }

    /// Snapshot of the pool for diagnostics.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|e| e.value().info()).collect()
    }

    pub fn pool_size(&self) -> usize {
        self.connections.len()
    }

    /// Accept inbound connections until cancelled.
    pub async fn run_listener(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        log::info!(
            "transport listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.connections.contains_key(&addr) {
                            // Already connected, most likely opened by us
                            log::debug!("dropping duplicate inbound connection from {}", addr);
                            continue;
                        }
                        log::info!("inbound connection from {}", addr);
                        let conn = self.register(Box::new(stream), addr, true);
                        let _ = self.event_tx.send(ConnectionEvent::Accepted(conn.info())).await;
                    }
                    Err(e) => log::error!("accept error: {}", e),
                },
            }
        }
    }

    /// Periodically evict abandoned reassembly buffers until cancelled.
    pub async fn run_partial_sweep(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_partials();
                    if evicted > 0 {
                        log::debug!("evicted {} abandoned multipart buffers", evicted);
                    }
                }
            }
        }
    }

    fn find(&self, addr: SocketAddr, node_id: Option<&NodeId>) -> Option<Arc<Connection>> {
        if let Some(conn) = self.connections.get(&addr) {
            return Some(conn.clone());
        }
        // Fallback: the peer may be pooled under the address its inbound
        // connection arrived from
        let wanted = node_id?;
        self.connections.iter().find_map(|entry| {
            let claimed = *entry
                .value()
                .node_id
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if claimed.as_ref() == Some(wanted) {
                log::debug!(
                    "connection to {} found by node id at {}",
                    addr,
                    entry.value().addr
                );
                Some(entry.value().clone())
            } else {
                None
            }
        })
    }

    async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Connection>, TransportError> {
        log::debug!("dialing {}", addr);
        let stream = self.dialer.connect(addr).await?;
        Ok(self.register(stream, addr, false))
    }

    /// Wire up reader and writer tasks for a fresh connection and insert
    /// it into the pool.
    fn register(
        self: &Arc<Self>,
        stream: Box<dyn PeerStream>,
        addr: SocketAddr,
        inbound: bool,
    ) -> Arc<Connection> {
        let framed = Framed::new(stream, WireCodec);
        let (mut writer, mut reader) = framed.split();
        let (tx, mut rx) = mpsc::channel::<ChunkEnvelope>(64);
        let cancel = CancellationToken::new();

        let conn = Arc::new(Connection {
            addr,
            inbound,
            node_id: RwLock::new(None),
            last_active: Mutex::new(Instant::now()),
            tx,
            cancel: cancel.clone(),
        });
        self.connections.insert(addr, conn.clone());

        // Writer: drains the outbound queue into the framed sink
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(chunk) => {
                            if let Err(e) = writer.send(chunk).await {
                                log::warn!("write to {} failed: {}", addr, e);
                                write_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: decoded chunks go to the dispatch loop; any error tears
        // the connection down
        let transport = Arc::clone(self);
        let read_conn = conn.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = reader.next() => match frame {
                        Some(Ok(chunk)) => {
                            read_conn.touch(chunk.head.node_id);
                            if transport.inbound_tx.send((addr, chunk)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("error reading from {}: {}", addr, e);
                            break;
                        }
                        None => {
                            log::info!("peer {} disconnected", addr);
                            break;
                        }
                    },
                }
            }
            cancel.cancel();
            transport.connections.remove(&addr);
            let _ = transport
                .event_tx
                .send(ConnectionEvent::Dropped(read_conn.info()))
                .await;
        });

        if !inbound {
            log::info!("outbound connection to {} established", addr);
        }
        conn
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }
}
