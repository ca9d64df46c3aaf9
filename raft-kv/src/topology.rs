//! One-shot peer discovery.
//!
//! Membership is fixed for the life of the process: the peer list is read
//! from the command line or resolved from a DNS name once at startup and
//! never refreshed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::net::{UdpSocket, lookup_host};
use tracing::warn;

use crate::rpc::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub id: NodeId,
    pub addr: String,
}

/// The other members of the cluster, as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    peers: Vec<PeerEntry>,
}

impl Topology {
    /// Builds the peer list from `id=addr` entries. A bare `addr` uses the
    /// address as the id. The entry for `own_id` is skipped, so the same
    /// list can be handed to every node.
    pub fn from_entries<I, S>(entries: I, own_id: &str) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut peers: Vec<PeerEntry> = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (id, addr) = match entry.split_once('=') {
                Some((id, addr)) => (id.trim(), addr.trim()),
                None => (entry, entry),
            };
            ensure!(!id.is_empty(), "peer entry `{entry}` has an empty id");
            ensure!(!addr.is_empty(), "peer entry `{entry}` has an empty address");
            ensure!(
                peers.iter().all(|peer| peer.id != id),
                "peer id `{id}` listed twice"
            );
            if id != own_id {
                peers.push(PeerEntry {
                    id: id.to_string(),
                    addr: addr.to_string(),
                });
            }
        }
        Ok(Self::checked(peers))
    }

    /// Resolves `dns_name` once and treats every returned address, at
    /// `port`, as a peer. Addresses whose IP matches `own_addr` are skipped.
    /// Peer ids are the `ip:port` strings.
    pub async fn resolve(dns_name: &str, port: u16, own_addr: &str) -> Result<Self> {
        let resolved = lookup_cluster(dns_name, port).await?;
        Self::from_resolved(resolved, own_addr)
    }

    /// Peer list from already resolved cluster addresses. `own_addr` must
    /// name a concrete IP, otherwise this node could not be told apart from
    /// the others.
    pub fn from_resolved(resolved: Vec<SocketAddr>, own_addr: &str) -> Result<Self> {
        let own_ip = own_addr.parse::<SocketAddr>().ok().map(|addr| addr.ip());
        ensure!(
            !own_ip.is_some_and(|ip| ip.is_unspecified()),
            "own address {own_addr} cannot identify this node among the resolved peers"
        );

        let mut peers: Vec<PeerEntry> = Vec::new();
        for addr in resolved {
            let is_self = match own_ip {
                Some(ip) => ip == addr.ip(),
                None => addr.to_string() == own_addr,
            };
            let addr = addr.to_string();
            if !is_self && peers.iter().all(|peer| peer.addr != addr) {
                peers.push(PeerEntry {
                    id: addr.clone(),
                    addr,
                });
            }
        }
        Ok(Self::checked(peers))
    }

    fn checked(peers: Vec<PeerEntry>) -> Self {
        let topology = Self { peers };
        if topology.cluster_size() % 2 == 0 {
            warn!(
                cluster_size = topology.cluster_size(),
                "even cluster size tolerates no more failures than one node fewer"
            );
        }
        topology
    }

    pub fn peers(&self) -> &[PeerEntry] {
        &self.peers
    }

    /// Number of voting members, this node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

/// Looks up every address behind a cluster DNS name.
pub async fn lookup_cluster(dns_name: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = lookup_host((dns_name, port))
        .await
        .with_context(|| format!("failed to resolve cluster name {dns_name}"))?
        .collect();
    if resolved.is_empty() {
        return Err(anyhow!("cluster name {dns_name} resolved to no addresses"));
    }
    Ok(resolved)
}

/// The local IP the host would use to reach `target`. Nothing is sent: a
/// connected UDP socket only asks the routing table for a source address.
pub async fn local_ip_towards(target: SocketAddr) -> Result<IpAddr> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .context("failed to open a routing socket")?;
    socket
        .connect(target)
        .await
        .with_context(|| format!("no route to {target}"))?;
    let ip = socket.local_addr()?.ip();
    ensure!(!ip.is_unspecified(), "no source address towards {target}");
    Ok(ip)
}
