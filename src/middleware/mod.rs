//! Middleware dispatch pipeline
//!
//! Assembled inbound messages are handed to an ordered chain of
//! pluggable handlers. Each handler returns [`Flow::Continue`] to pass
//! the message along or [`Flow::Stop`] to end dispatch; not every
//! message must reach every middleware. The pipeline also fans transport
//! lifecycle events (boot, connection accepted/dropped) out to every
//! registered middleware and provides the outbound send and broadcast
//! primitives.

use crate::identity::{LocalNode, RemoteNode};
use crate::message::Envelope;
use crate::routing::RoutingTable;
use crate::transport::{ConnectionInfo, Transport, TransportError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors surfaced by middleware handlers.
#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Handler(String),
}

/// Explicit continuation decision returned by every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Pass the message to the next middleware in registration order.
    Continue,
    /// End dispatch here.
    Stop,
}

/// A pluggable message handler.
///
/// `dashboard_rows` feeds the (external) terminal dashboard; returning
/// `None` opts out.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one assembled inbound message.
    async fn handle(&self, ctx: &P2pContext) -> Result<Flow, MiddlewareError>;

    /// Invoked once at overlay boot, before any inbound message exists.
    async fn start(&self, _ctx: &NetContext) -> Result<(), MiddlewareError> {
        Ok(())
    }

    /// A new transport connection was accepted.
    async fn accept_connection(&self, _conn: &ConnectionInfo) {}

    /// A transport connection was torn down.
    async fn drop_connection(&self, _conn: &ConnectionInfo) {}

    /// Tabular status for the dashboard collaborator.
    fn dashboard_rows(&self) -> Option<Vec<Vec<String>>> {
        None
    }
}

/// Shared services available to middlewares with or without an inbound
/// message at hand.
#[derive(Clone)]
pub struct NetContext {
    local: Arc<LocalNode>,
    routing: Arc<RwLock<RoutingTable>>,
    transport: Arc<Transport>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl NetContext {
    pub fn new(
        local: Arc<LocalNode>,
        routing: Arc<RwLock<RoutingTable>>,
        transport: Arc<Transport>,
        middlewares: Arc<[Arc<dyn Middleware>]>,
    ) -> Self {
        Self {
            local,
            routing,
            transport,
            middlewares,
        }
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local
    }

    pub fn routing(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Installed middlewares, for sibling introspection (e.g. a
    /// dashboard reading their exposed status).
    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    /// Fresh envelope stamped with the local identity.
    pub fn new_envelope(&self, category: impl Into<String>, kind: impl Into<String>) -> Envelope {
        Envelope::new(self.local.id(), category, kind)
    }

    /// Broadcast to one representative per routing bucket. The message id
    /// is recorded in the suppression cache so the loopback is dropped.
    pub async fn broadcast<T: Serialize>(
        &self,
        head: &Envelope,
        msg: &T,
    ) -> Result<usize, MiddlewareError> {
        let peers = self.routing.read().await.peek();
        self.send_to_peers(peers, head, msg).await
    }

    /// Broadcast to the subset of bucket representatives passing `keep`.
    pub async fn broadcast_with_filter<T, F>(
        &self,
        head: &Envelope,
        msg: &T,
        keep: F,
    ) -> Result<usize, MiddlewareError>
    where
        T: Serialize,
        F: Fn(&RemoteNode) -> bool,
    {
        let peers: Vec<RemoteNode> = self
            .routing
            .read()
            .await
            .peek()
            .into_iter()
            .filter(|n| keep(n))
            .collect();
        self.send_to_peers(peers, head, msg).await
    }

    /// Broadcast to the `max` peers nearest the local id.
    pub async fn broadcast_to_nearby<T: Serialize>(
        &self,
        head: &Envelope,
        msg: &T,
        max: usize,
    ) -> Result<usize, MiddlewareError> {
        let peers = self.routing.read().await.get_nearby(max);
        self.send_to_peers(peers, head, msg).await
    }

    async fn send_to_peers<T: Serialize>(
        &self,
        peers: Vec<RemoteNode>,
        head: &Envelope,
        msg: &T,
    ) -> Result<usize, MiddlewareError> {
        let payload = serde_json::to_vec(msg)?;
        self.transport.record_broadcast(head.id);
        let external = self.local.external_addr();
        let mut sent = 0;
        for peer in peers {
            let addr = peer.reachable_addr(external);
            match self.transport.send(addr, Some(&peer.id), head, &payload).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("failed to send {} to {}: {}", head.id, peer.id, e),
            }
        }
        Ok(sent)
    }
}

/// Per-message context handed to [`Middleware::handle`].
pub struct P2pContext {
    net: NetContext,
    envelope: Envelope,
    payload: Vec<u8>,
    source: SocketAddr,
}

impl P2pContext {
    pub fn new(net: NetContext, envelope: Envelope, payload: Vec<u8>, source: SocketAddr) -> Self {
        Self {
            net,
            envelope,
            payload,
            source,
        }
    }

    /// Decoded base envelope of the inbound message.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Assembled raw bytes of the logical message.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Address the message arrived from.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Shared services (also usable for broadcasts from here).
    pub fn net(&self) -> &NetContext {
        &self.net
    }

    /// Decode the payload as the middleware's concrete message type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MiddlewareError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Send a message back over the connection that produced this one.
    pub async fn reply<T: Serialize>(&self, head: &Envelope, msg: &T) -> Result<(), MiddlewareError> {
        let payload = serde_json::to_vec(msg)?;
        let claimed = self.envelope.node_id;
        self.net
            .transport
            .send(self.source, Some(&claimed), head, &payload)
            .await?;
        Ok(())
    }
}

/// Ordered middleware chain.
pub struct Pipeline {
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: middlewares.into(),
        }
    }

    pub fn middlewares(&self) -> Arc<[Arc<dyn Middleware>]> {
        Arc::clone(&self.middlewares)
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Dispatch one message through the chain in registration order.
    /// Returns how many middlewares ran.
    pub async fn dispatch(&self, ctx: &P2pContext) -> usize {
        let mut ran = 0;
        for mw in self.middlewares.iter() {
            ran += 1;
            match mw.handle(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    log::warn!(
                        "middleware {} failed on {}: {}",
                        mw.name(),
                        ctx.envelope().id,
                        e
                    );
                    break;
                }
            }
        }
        ran
    }

    /// Run every middleware's boot hook.
    pub async fn start_all(&self, net: &NetContext) {
        for mw in self.middlewares.iter() {
            if let Err(e) = mw.start(net).await {
                log::error!("middleware {} failed to start: {}", mw.name(), e);
            }
        }
    }

    pub async fn on_accept(&self, conn: &ConnectionInfo) {
        for mw in self.middlewares.iter() {
            mw.accept_connection(conn).await;
        }
    }

    pub async fn on_drop(&self, conn: &ConnectionInfo) {
        for mw in self.middlewares.iter() {
            mw.drop_connection(conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::transport::ConnectionEvent;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        verdict: Flow,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, _ctx: &P2pContext) -> Result<Flow, MiddlewareError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    fn services() -> NetContext {
        let local = Arc::new(LocalNode::new(
            NodeId::from_public_key(b"pipeline"),
            IpAddr::from([127, 0, 0, 1]),
            0,
            0,
        ));
        let routing = Arc::new(RwLock::new(RoutingTable::new(local.id())));
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let (event_tx, _event_rx) = mpsc::channel::<ConnectionEvent>(8);
        let transport = Arc::new(Transport::new(
            Arc::clone(&local),
            64,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            inbound_tx,
            event_tx,
        ));
        NetContext::new(local, routing, transport, Vec::new().into())
    }

    fn context(net: NetContext) -> P2pContext {
        let envelope = net.new_envelope("test", "/noop");
        let payload = serde_json::to_vec(&envelope).unwrap();
        P2pContext::new(net, envelope, payload, "127.0.0.1:9999".parse().unwrap())
    }

    #[tokio::test]
    async fn test_dispatch_in_order_until_stop() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));

        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder {
                name: "first",
                calls: first.clone(),
                verdict: Flow::Continue,
            }),
            Arc::new(Recorder {
                name: "second",
                calls: second.clone(),
                verdict: Flow::Stop,
            }),
            Arc::new(Recorder {
                name: "third",
                calls: third.clone(),
                verdict: Flow::Continue,
            }),
        ]);

        let ran = pipeline.dispatch(&context(services())).await;
        assert_eq!(ran, 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_runs_all_on_continue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            Arc::new(Recorder {
                name: "a",
                calls: calls.clone(),
                verdict: Flow::Continue,
            }),
            Arc::new(Recorder {
                name: "b",
                calls: calls.clone(),
                verdict: Flow::Continue,
            }),
        ]);
        assert_eq!(pipeline.dispatch(&context(services())).await, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _ctx: &P2pContext) -> Result<Flow, MiddlewareError> {
            Err(MiddlewareError::Handler("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_error_halts_chain() {
        let after = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(vec![
            Arc::new(Failing),
            Arc::new(Recorder {
                name: "after",
                calls: after.clone(),
                verdict: Flow::Continue,
            }),
        ]);
        pipeline.dispatch(&context(services())).await;
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_decode_payload() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct HeightAnnounce {
            #[serde(flatten)]
            head: Envelope,
            height: u64,
        }

        let net = services();
        let head = net.new_envelope("blocks", "/inv");
        let msg = HeightAnnounce {
            head: head.clone(),
            height: 42,
        };
        let payload = serde_json::to_vec(&msg).unwrap();
        let ctx = P2pContext::new(net, head, payload, "127.0.0.1:9999".parse().unwrap());

        let decoded: HeightAnnounce = ctx.decode().unwrap();
        assert_eq!(decoded.height, 42);
        assert_eq!(decoded.head.category, "blocks");
    }

    #[tokio::test]
    async fn test_broadcast_records_suppression() {
        let net = services();
        let head = net.new_envelope("test", "/gossip");
        // Empty table: nothing to send, but the id must be suppressed
        let sent = net.broadcast(&head, &head).await.unwrap();
        assert_eq!(sent, 0);

        let chunks = crate::transport::split_into_chunks(&head, b"x", 64);
        assert!(matches!(
            net.transport().accept_chunk(&chunks[0]),
            Err(TransportError::SelfBroadcast)
        ));
    }
}
