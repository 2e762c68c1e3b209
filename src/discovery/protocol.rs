//! UDP discovery protocol.
//!
//! Peers are found and kept fresh with four datagram types: PING/PONG
//! for liveness (the PONG echoes the sender's address as observed by
//! the responder, which doubles as NAT discovery) and
//! FINDNODE/FINDNODERESP for neighbor harvesting. Outbound requests go
//! through the [`Waitlist`]; replies are correlated by message id before
//! any routing-table refresh happens, so a node answering from an
//! address we associated with someone else evicts the stale entry
//! instead of poisoning the table.

use crate::config::BootstrapList;
use crate::discovery::waitlist::{Reply, Waitlist};
use crate::identity::{LocalNode, RemoteNode};
use crate::message::{DiscoveryPayload, NodeRecord, UdpEnvelope};
use crate::routing::{RoutingTable, BUCKET_SIZE};
use crate::transport::{decode_datagram, encode_datagram, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Fallback reaper poll cadence when no request is pending.
const REAPER_IDLE_POLL: Duration = Duration::from_millis(500);

/// The discovery side of the overlay: one UDP socket, the request
/// waitlist, and the periodic sweeps that keep the routing table alive.
pub struct DiscoveryService {
    local: Arc<LocalNode>,
    routing: Arc<RwLock<RoutingTable>>,
    socket: Arc<UdpSocket>,
    waitlist: Arc<Waitlist>,
    bootstrap: BootstrapList,
    request_timeout: Duration,
    ping_interval: Duration,
    find_node_interval: Duration,
    find_node_delay: Duration,
}

impl DiscoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalNode>,
        routing: Arc<RwLock<RoutingTable>>,
        socket: Arc<UdpSocket>,
        bootstrap: BootstrapList,
        request_timeout: Duration,
        ping_interval: Duration,
        find_node_interval: Duration,
        find_node_delay: Duration,
    ) -> Self {
        Self {
            local,
            routing,
            socket,
            waitlist: Arc::new(Waitlist::new()),
            bootstrap,
            request_timeout,
            ping_interval,
            find_node_interval,
            find_node_delay,
        }
    }

    pub fn waitlist(&self) -> &Arc<Waitlist> {
        &self.waitlist
    }

    /// Receive and dispatch datagrams until cancelled.
    pub async fn run_recv_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("discovery recv loop stopped");
                    return;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let (len, src) = match recv {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("udp recv failed: {}", e);
                            continue;
                        }
                    };
                    let envelope: UdpEnvelope = match decode_datagram(&buf[..len]) {
                        Ok(env) => env,
                        Err(e) => {
                            log::debug!("dropping malformed datagram from {}: {}", src, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_datagram(envelope, src).await {
                        log::debug!("discovery handler failed for {}: {}", src, e);
                    }
                }
            }
        }
    }

    /// Ping one representative per bucket every `ping_interval`. When the
    /// table has gone empty (every peer timed out), reseed it from the
    /// bootstrap list so the node can rejoin.
    pub async fn run_ping_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let targets = {
                let mut table = self.routing.write().await;
                if table.is_empty() {
                    let seeded = table.seed(&self.bootstrap);
                    log::info!("routing table empty, reseeded {} bootstrap peers", seeded);
                }
                table.peek()
            };
            for peer in targets {
                if let Err(e) = self.send_ping(&peer).await {
                    log::warn!("ping to {} failed: {}", peer.id, e);
                }
            }
        }
    }

    /// Query one representative per bucket for their neighbors, on a
    /// slower cadence than the ping sweep and after an initial delay so
    /// the first ping round has populated latencies.
    pub async fn run_find_sweep(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.find_node_delay) => {}
        }
        let mut ticker = tokio::time::interval(self.find_node_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let targets = self.routing.read().await.peek();
            for peer in targets {
                if let Err(e) = self.send_find_node(&peer).await {
                    log::warn!("find-node to {} failed: {}", peer.id, e);
                }
            }
        }
    }

    /// Evict peers whose requests expired unanswered. Sleeps until the
    /// earliest pending deadline rather than polling on a fixed beat.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let until = match self.waitlist.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(std::time::Instant::now()),
                None => REAPER_IDLE_POLL,
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(until) => {}
            }
            let silent = self.waitlist.reap();
            if silent.is_empty() {
                continue;
            }
            let mut table = self.routing.write().await;
            for id in silent {
                if table.remove(&id) {
                    log::info!("peer {} timed out, removed from routing table", id);
                }
            }
        }
    }

    /// Send a PING and register the expected reply.
    pub async fn send_ping(&self, peer: &RemoteNode) -> Result<(), TransportError> {
        self.probe(peer, DiscoveryPayload::Ping).await
    }

    /// Send a FINDNODE and register the expected reply.
    pub async fn send_find_node(&self, peer: &RemoteNode) -> Result<(), TransportError> {
        self.probe(peer, DiscoveryPayload::FindNode).await
    }

    async fn probe(&self, peer: &RemoteNode, payload: DiscoveryPayload) -> Result<(), TransportError> {
        let envelope = UdpEnvelope::new(
            self.local.id(),
            self.local.local_ip(),
            self.local.udp_addr().port(),
            payload,
        );
        self.waitlist
            .register(envelope.id, peer.id, self.request_timeout);
        let addr = peer.reachable_addr(self.local.external_addr());
        self.send_to(&envelope, addr).await
    }

    async fn send_to(&self, envelope: &UdpEnvelope, addr: SocketAddr) -> Result<(), TransportError> {
        let wire = encode_datagram(envelope)?;
        log::trace!("udp {} -> {} ({} bytes)", envelope.payload.type_name(), addr, wire.len());
        self.socket.send_to(&wire, addr).await?;
        Ok(())
    }

    /// Dispatch one datagram. Public for the benefit of tests; the recv
    /// loop is the only production caller.
    pub async fn handle_datagram(
        &self,
        envelope: UdpEnvelope,
        src: SocketAddr,
    ) -> Result<(), TransportError> {
        if envelope.is_expired(chrono::Utc::now().timestamp()) {
            log::debug!(
                "dropping expired {} from {}",
                envelope.payload.type_name(),
                src
            );
            return Ok(());
        }
        if envelope.node_id == self.local.id() {
            return Ok(());
        }

        let sender_local = SocketAddr::new(envelope.local_addr, envelope.local_port);
        match envelope.payload.clone() {
            DiscoveryPayload::Ping => {
                self.routing
                    .write()
                    .await
                    .refresh(envelope.node_id, sender_local, src, None);
                let reply = UdpEnvelope::reply_to(
                    envelope.id,
                    self.local.id(),
                    self.local.local_ip(),
                    self.local.udp_addr().port(),
                    DiscoveryPayload::Pong {
                        remote_addr: src.ip(),
                        remote_port: src.port(),
                    },
                );
                self.send_to(&reply, src).await
            }
            DiscoveryPayload::Pong {
                remote_addr,
                remote_port,
            } => {
                match self.waitlist.observe(&envelope.id, &envelope.node_id) {
                    Reply::Confirmed { latency } => {
                        self.routing.write().await.refresh(
                            envelope.node_id,
                            sender_local,
                            src,
                            Some(latency.as_millis() as u64),
                        );
                        // The responder saw us at this address
                        self.local
                            .set_external_addr(SocketAddr::new(remote_addr, remote_port));
                    }
                    Reply::Mismatch { expected } => {
                        log::warn!(
                            "pong from {} at {} but {} was asked, evicting",
                            envelope.node_id,
                            src,
                            expected
                        );
                        self.routing.write().await.remove(&expected);
                    }
                    Reply::Unknown => {
                        log::debug!("unsolicited pong from {} at {}", envelope.node_id, src);
                    }
                }
                Ok(())
            }
            DiscoveryPayload::FindNode => {
                let nodes: Vec<NodeRecord> = {
                    let mut table = self.routing.write().await;
                    table.refresh(envelope.node_id, sender_local, src, None);
                    table
                        .find_closest(&envelope.node_id, BUCKET_SIZE)
                        .into_iter()
                        .map(|n| NodeRecord {
                            node_id: n.id,
                            local_addr: n.addrs.local_addr.ip(),
                            local_port: n.addrs.local_addr.port(),
                            remote_addr: n.addrs.remote_addr.ip(),
                            remote_port: n.addrs.remote_addr.port(),
                        })
                        .collect()
                };
                let reply = UdpEnvelope::reply_to(
                    envelope.id,
                    self.local.id(),
                    self.local.local_ip(),
                    self.local.udp_addr().port(),
                    DiscoveryPayload::FindNodeResp { nodes },
                );
                self.send_to(&reply, src).await
            }
            DiscoveryPayload::FindNodeResp { nodes } => {
                match self.waitlist.observe(&envelope.id, &envelope.node_id) {
                    Reply::Confirmed { latency } => {
                        let mut table = self.routing.write().await;
                        table.refresh(
                            envelope.node_id,
                            sender_local,
                            src,
                            Some(latency.as_millis() as u64),
                        );
                        for record in nodes {
                            if record.node_id == self.local.id() {
                                continue;
                            }
                            table.refresh(
                                record.node_id,
                                SocketAddr::new(record.local_addr, record.local_port),
                                SocketAddr::new(record.remote_addr, record.remote_port),
                                None,
                            );
                        }
                    }
                    Reply::Mismatch { expected } => {
                        log::warn!(
                            "find-node response from {} at {} but {} was asked, evicting",
                            envelope.node_id,
                            src,
                            expected
                        );
                        self.routing.write().await.remove(&expected);
                    }
                    Reply::Unknown => {
                        log::debug!(
                            "unsolicited find-node response from {} at {}",
                            envelope.node_id,
                            src
                        );
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::message::DEFAULT_EXPIRE_SECS;
    use std::net::IpAddr;
    use uuid::Uuid;

    fn id(tag: &[u8]) -> NodeId {
        NodeId::from_public_key(tag)
    }

    async fn service() -> Arc<DiscoveryService> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = Arc::new(LocalNode::new(
            id(b"local"),
            IpAddr::from([127, 0, 0, 1]),
            socket.local_addr().unwrap().port(),
            0,
        ));
        let routing = Arc::new(RwLock::new(RoutingTable::new(local.id())));
        Arc::new(DiscoveryService::new(
            local,
            routing,
            socket,
            BootstrapList::default(),
            Duration::from_secs(3),
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(10),
        ))
    }

    fn envelope_from(peer: NodeId, addr: SocketAddr, payload: DiscoveryPayload) -> UdpEnvelope {
        UdpEnvelope::new(peer, addr.ip(), addr.port(), payload)
    }

    #[tokio::test]
    async fn test_ping_refreshes_and_answers_pong() {
        let svc = service().await;
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();
        let peer_id = id(b"pinger");

        let ping = envelope_from(peer_id, peer_addr, DiscoveryPayload::Ping);
        let request_id = ping.id;
        svc.handle_datagram(ping, peer_addr).await.unwrap();

        assert!(svc.routing.read().await.contains(&peer_id));

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = peer_socket.recv_from(&mut buf).await.unwrap();
        let pong: UdpEnvelope = decode_datagram(&buf[..len]).unwrap();
        assert_eq!(pong.id, request_id);
        match pong.payload {
            DiscoveryPayload::Pong {
                remote_addr,
                remote_port,
            } => {
                assert_eq!(remote_addr, peer_addr.ip());
                assert_eq!(remote_port, peer_addr.port());
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirmed_pong_sets_latency_and_external_addr() {
        let svc = service().await;
        let peer_id = id(b"responder");
        let peer_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let msg = Uuid::new_v4();
        svc.waitlist.register(msg, peer_id, Duration::from_secs(3));

        let observed: SocketAddr = "203.0.113.9:32768".parse().unwrap();
        let mut pong = envelope_from(
            peer_id,
            peer_addr,
            DiscoveryPayload::Pong {
                remote_addr: observed.ip(),
                remote_port: observed.port(),
            },
        );
        pong.id = msg;
        svc.handle_datagram(pong, peer_addr).await.unwrap();

        let table = svc.routing.read().await;
        assert!(table.contains(&peer_id));
        let entry = table
            .peek()
            .into_iter()
            .find(|n| n.id == peer_id)
            .unwrap();
        assert!(entry.latency_ms.is_some());
        assert_eq!(svc.local.external_addr(), Some(observed));
    }

    #[tokio::test]
    async fn test_mismatched_pong_evicts_expected_peer() {
        let svc = service().await;
        let expected = id(b"expected");
        let imposter = id(b"imposter");
        let addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        svc.routing.write().await.refresh(
            expected,
            "192.168.0.4:32768".parse().unwrap(),
            addr,
            None,
        );
        let msg = Uuid::new_v4();
        svc.waitlist.register(msg, expected, Duration::from_secs(3));

        let mut pong = envelope_from(
            imposter,
            addr,
            DiscoveryPayload::Pong {
                remote_addr: addr.ip(),
                remote_port: addr.port(),
            },
        );
        pong.id = msg;
        svc.handle_datagram(pong, addr).await.unwrap();

        let table = svc.routing.read().await;
        assert!(!table.contains(&expected));
        assert!(!table.contains(&imposter));
    }

    #[tokio::test]
    async fn test_find_node_answers_with_closest_peers() {
        let svc = service().await;
        for i in 0..4u16 {
            let peer = id(format!("peer-{}", i).as_bytes());
            svc.routing.write().await.refresh(
                peer,
                format!("192.168.0.{}:32768", i + 10).parse().unwrap(),
                format!("198.51.100.{}:32768", i + 10).parse().unwrap(),
                None,
            );
        }

        let asker_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let asker_addr = asker_socket.local_addr().unwrap();
        let asker = id(b"asker");
        let request = envelope_from(asker, asker_addr, DiscoveryPayload::FindNode);
        let request_id = request.id;
        svc.handle_datagram(request, asker_addr).await.unwrap();

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = asker_socket.recv_from(&mut buf).await.unwrap();
        let resp: UdpEnvelope = decode_datagram(&buf[..len]).unwrap();
        assert_eq!(resp.id, request_id);
        match resp.payload {
            DiscoveryPayload::FindNodeResp { nodes } => {
                assert_eq!(nodes.len(), 4);
                assert!(nodes.iter().all(|n| n.node_id != asker));
            }
            other => panic!("expected find-node response, got {:?}", other),
        }
        // The asker itself got refreshed passively
        assert!(svc.routing.read().await.contains(&asker));
    }

    #[tokio::test]
    async fn test_find_node_resp_merges_records_skipping_self() {
        let svc = service().await;
        let responder = id(b"responder");
        let addr: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        let msg = Uuid::new_v4();
        svc.waitlist.register(msg, responder, Duration::from_secs(3));

        let advertised = id(b"advertised");
        let mut resp = envelope_from(
            responder,
            addr,
            DiscoveryPayload::FindNodeResp {
                nodes: vec![
                    NodeRecord {
                        node_id: advertised,
                        local_addr: "192.168.0.7".parse().unwrap(),
                        local_port: 32768,
                        remote_addr: "198.51.100.7".parse().unwrap(),
                        remote_port: 32768,
                    },
                    NodeRecord {
                        node_id: svc.local.id(),
                        local_addr: "192.168.0.8".parse().unwrap(),
                        local_port: 32768,
                        remote_addr: "198.51.100.8".parse().unwrap(),
                        remote_port: 32768,
                    },
                ],
            },
        );
        resp.id = msg;
        svc.handle_datagram(resp, addr).await.unwrap();

        let table = svc.routing.read().await;
        assert!(table.contains(&responder));
        assert!(table.contains(&advertised));
        assert!(!table.contains(&svc.local.id()));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_datagram_is_dropped() {
        let svc = service().await;
        let peer = id(b"stale");
        let addr: SocketAddr = "127.0.0.1:40004".parse().unwrap();

        let mut ping = envelope_from(peer, addr, DiscoveryPayload::Ping);
        ping.timestamp -= DEFAULT_EXPIRE_SECS + 10;
        svc.handle_datagram(ping, addr).await.unwrap();
        assert!(!svc.routing.read().await.contains(&peer));
    }

    #[tokio::test]
    async fn test_probe_registers_waitlist_entry() {
        let svc = service().await;
        let target_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_socket.local_addr().unwrap();
        let peer = RemoteNode::new(id(b"target"), target_addr, target_addr);

        svc.send_ping(&peer).await.unwrap();
        assert_eq!(svc.waitlist.len(), 1);

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = target_socket.recv_from(&mut buf).await.unwrap();
        let ping: UdpEnvelope = decode_datagram(&buf[..len]).unwrap();
        assert_eq!(ping.payload, DiscoveryPayload::Ping);
        assert_eq!(ping.node_id, svc.local.id());
    }
}
