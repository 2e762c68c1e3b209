//! Overlay node assembly.
//!
//! Wires the discovery service, the TCP transport, and the middleware
//! pipeline into one runnable node: binds the sockets, seeds the routing
//! table from the bootstrap list, spawns every background loop on a
//! child of one shutdown token, and pumps assembled inbound messages
//! into the pipeline. All connections feed one dispatch queue, so a
//! slow middleware delays messages from every peer, not only the one
//! that produced the inbound message.

use crate::config::{BootstrapList, ConfigError, OverlayConfig};
use crate::discovery::DiscoveryService;
use crate::identity::{LocalNode, NodeId};
use crate::message::Envelope;
use crate::middleware::{Middleware, NetContext, P2pContext, Pipeline};
use crate::routing::RoutingTable;
use crate::transport::{ConnectionEvent, Transport, TransportError};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_DEPTH: usize = 256;
const EVENT_QUEUE_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("overlay already started")]
    AlreadyStarted,
    #[error("overlay not started")]
    NotStarted,
}

/// Point-in-time snapshot of a running node.
#[derive(Debug, Clone)]
pub struct OverlayStatus {
    pub node_id: NodeId,
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub external_addr: Option<SocketAddr>,
    pub uptime_secs: u64,
    pub peer_count: usize,
    pub pool_size: usize,
    pub pending_partials: usize,
    pub middlewares: Vec<&'static str>,
}

struct Running {
    local: Arc<LocalNode>,
    routing: Arc<RwLock<RoutingTable>>,
    transport: Arc<Transport>,
    net: NetContext,
}

/// One overlay node.
///
/// Middlewares are registered before [`start`](Self::start); their order
/// of registration is their dispatch order.
pub struct Overlay {
    config: OverlayConfig,
    id: NodeId,
    local_ip: IpAddr,
    bootstrap: BootstrapList,
    middlewares: Vec<Arc<dyn Middleware>>,
    state: Option<Running>,
    shutdown: CancellationToken,
}

impl Overlay {
    /// Build an overlay for the given identity. The bootstrap list is
    /// loaded eagerly so a broken file fails construction, not startup.
    pub fn new(id: NodeId, local_ip: IpAddr, config: OverlayConfig) -> Result<Self, OverlayError> {
        let bootstrap = BootstrapList::load(config.bootstrap_path.as_deref())?;
        Ok(Self {
            config,
            id,
            local_ip,
            bootstrap,
            middlewares: Vec::new(),
            state: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Register a middleware. Dispatch order follows registration order.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Bind sockets, spawn every background loop, and run the
    /// middlewares' boot hooks.
    pub async fn start(&mut self) -> Result<(), OverlayError> {
        if self.state.is_some() {
            return Err(OverlayError::AlreadyStarted);
        }

        let udp_socket = Arc::new(
            UdpSocket::bind(SocketAddr::new(self.local_ip, self.config.udp_port)).await?,
        );
        let tcp_listener =
            TcpListener::bind(SocketAddr::new(self.local_ip, self.config.tcp_port)).await?;
        let udp_addr = udp_socket.local_addr()?;
        let tcp_addr = tcp_listener.local_addr()?;

        let local = Arc::new(LocalNode::new(
            self.id,
            self.local_ip,
            udp_addr.port(),
            tcp_addr.port(),
        ));
        log::info!(
            "overlay {} starting, udp {} tcp {}",
            self.id,
            udp_addr,
            tcp_addr
        );

        let mut table = RoutingTable::new(self.id);
        let seeded = table.seed(&self.bootstrap);
        log::info!("seeded {} bootstrap peers", seeded);
        let routing = Arc::new(RwLock::new(table));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let transport = Arc::new(Transport::new(
            Arc::clone(&local),
            self.config.chunk_size,
            self.config.suppression_window,
            self.config.reassembly_timeout,
            inbound_tx,
            event_tx,
        ));
        let discovery = Arc::new(DiscoveryService::new(
            Arc::clone(&local),
            Arc::clone(&routing),
            udp_socket,
            self.bootstrap.clone(),
            self.config.request_timeout,
            self.config.ping_interval,
            self.config.find_node_interval,
            self.config.find_node_delay,
        ));
        let pipeline = Arc::new(Pipeline::new(self.middlewares.clone()));
        let net = NetContext::new(
            Arc::clone(&local),
            Arc::clone(&routing),
            Arc::clone(&transport),
            pipeline.middlewares(),
        );

        // Every loop runs on a child of the overlay's shutdown token, so
        // one cancel tears the whole node down
        tokio::spawn(
            Arc::clone(&transport).run_listener(tcp_listener, self.shutdown.child_token()),
        );
        tokio::spawn(Arc::clone(&transport).run_partial_sweep(
            self.config.reassembly_timeout,
            self.shutdown.child_token(),
        ));
        tokio::spawn(Arc::clone(&discovery).run_recv_loop(self.shutdown.child_token()));
        tokio::spawn(Arc::clone(&discovery).run_ping_sweep(self.shutdown.child_token()));
        tokio::spawn(Arc::clone(&discovery).run_find_sweep(self.shutdown.child_token()));
        tokio::spawn(Arc::clone(&discovery).run_reaper(self.shutdown.child_token()));
        tokio::spawn(run_dispatch(
            Arc::clone(&transport),
            Arc::clone(&pipeline),
            net.clone(),
            inbound_rx,
            self.shutdown.child_token(),
        ));
        tokio::spawn(run_events(
            Arc::clone(&pipeline),
            event_rx,
            self.shutdown.child_token(),
        ));

        pipeline.start_all(&net).await;

        self.state = Some(Running {
            local,
            routing,
            transport,
            net,
        });
        Ok(())
    }

    /// Stop every background loop and drop the connection pool.
    pub fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            log::info!("overlay {} shutting down", state.local.id());
            self.shutdown.cancel();
            // Per-connection tokens are not children of the root token;
            // pooled sockets are closed explicitly
            state.transport.close_all();
            // Fresh token so a later start() is not born cancelled
            self.shutdown = CancellationToken::new();
        }
    }

    /// Shared services for embedding applications. Available once
    /// started.
    pub fn net(&self) -> Result<&NetContext, OverlayError> {
        self.state
            .as_ref()
            .map(|s| &s.net)
            .ok_or(OverlayError::NotStarted)
    }

    pub async fn status(&self) -> Result<OverlayStatus, OverlayError> {
        let state = self.state.as_ref().ok_or(OverlayError::NotStarted)?;
        let peer_count = state.routing.read().await.len();
        Ok(OverlayStatus {
            node_id: state.local.id(),
            udp_addr: state.local.udp_addr(),
            tcp_addr: state.local.tcp_addr(),
            external_addr: state.local.external_addr(),
            uptime_secs: state.local.uptime().as_secs(),
            peer_count,
            pool_size: state.transport.pool_size(),
            pending_partials: state.transport.pending_partials(),
            middlewares: self.middlewares.iter().map(|m| m.name()).collect(),
        })
    }
}

/// Pump inbound chunks through reassembly and into the pipeline.
async fn run_dispatch(
    transport: Arc<Transport>,
    pipeline: Arc<Pipeline>,
    net: NetContext,
    mut inbound_rx: mpsc::Receiver<(SocketAddr, crate::message::ChunkEnvelope)>,
    cancel: CancellationToken,
) {
    loop {
        let (src, chunk) = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = inbound_rx.recv() => match msg {
                Some(pair) => pair,
                None => return,
            },
        };
        let envelope: Envelope = chunk.head.clone();
        match transport.accept_chunk(&chunk) {
            Ok(Some(payload)) => {
                let ctx = P2pContext::new(net.clone(), envelope, payload, src);
                pipeline.dispatch(&ctx).await;
            }
            // More chunks pending
            Ok(None) => {}
            Err(TransportError::SelfBroadcast) => {
                log::debug!("suppressed own broadcast {} echoed by {}", envelope.id, src);
            }
            Err(e) => {
                log::debug!("rejected chunk of {} from {}: {}", envelope.id, src, e);
            }
        }
    }
}

/// Fan transport lifecycle events out to the middlewares.
async fn run_events(
    pipeline: Arc<Pipeline>,
    mut event_rx: mpsc::Receiver<ConnectionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            ConnectionEvent::Accepted(info) => pipeline.on_accept(&info).await,
            ConnectionEvent::Dropped(info) => pipeline.on_drop(&info).await,
        }
    }
}
