//! Local and remote peer records.

use crate::identity::NodeId;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use std::time::Instant;

/// Address pair shared by every peer record.
///
/// `local_addr` is the address a node advertises inside its own NAT
/// domain; `remote_addr` is the externally visible one. Plain value
/// semantics, no ownership beyond the record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl Node {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
        }
    }
}

/// A known peer as stored in the routing table.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub id: NodeId,
    pub addrs: Node,
    /// Distance class from the local id. Computed lazily, then stable
    /// for the lifetime of this record.
    pub distance: Option<u8>,
    /// Last measured round-trip time, if any.
    pub latency_ms: Option<u64>,
}

impl RemoteNode {
    pub fn new(id: NodeId, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            id,
            addrs: Node::new(local_addr, remote_addr),
            distance: None,
            latency_ms: None,
        }
    }

    /// Address to dial for this peer.
    ///
    /// When the peer's externally visible IP equals ours, both sit behind
    /// the same NAT and the intranet address is used instead.
    pub fn reachable_addr(&self, local_external: Option<SocketAddr>) -> SocketAddr {
        match local_external {
            Some(ext) if ext.ip() == self.addrs.remote_addr.ip() => self.addrs.local_addr,
            _ => self.addrs.remote_addr,
        }
    }
}

/// The local node's identity for the lifetime of the process.
///
/// The id and advertised intranet address are fixed at startup; the
/// externally reachable address is filled in later, either by the NAT
/// discovery collaborator or from the observed address echoed in a PONG.
#[derive(Debug)]
pub struct LocalNode {
    id: NodeId,
    local_ip: IpAddr,
    udp_port: u16,
    tcp_port: u16,
    external: RwLock<Option<SocketAddr>>,
    started_at: Instant,
}

impl LocalNode {
    pub fn new(id: NodeId, local_ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            id,
            local_ip,
            udp_port,
            tcp_port,
            external: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.udp_port)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.tcp_port)
    }

    /// Externally visible address, if discovered yet.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        *self.external.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the externally visible address (from NAT discovery or a
    /// PONG's observed-address echo).
    pub fn set_external_addr(&self, addr: SocketAddr) {
        let mut guard = self.external.write().unwrap_or_else(|e| e.into_inner());
        if *guard != Some(addr) {
            log::info!("external address updated to {}", addr);
            *guard = Some(addr);
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
