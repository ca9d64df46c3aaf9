//! Runs one node of a raft-kv cluster.
//!
//! Peers come either from a static list or from a DNS name that resolves to
//! every member (a headless service, a docker network alias).
//!
//! # Example usage
//!
//! Start a 3-node cluster on one machine:
//! ```bash
//! # Terminal 1
//! cargo run --bin raft-kv-node -- --listen 127.0.0.1:7601 \
//!   --peer 127.0.0.1:7601,127.0.0.1:7602,127.0.0.1:7603
//!
//! # Terminal 2
//! cargo run --bin raft-kv-node -- --listen 127.0.0.1:7602 \
//!   --peer 127.0.0.1:7601,127.0.0.1:7602,127.0.0.1:7603
//!
//! # Terminal 3
//! cargo run --bin raft-kv-node -- --listen 127.0.0.1:7603 \
//!   --peer 127.0.0.1:7601,127.0.0.1:7602,127.0.0.1:7603
//! ```
//!
//! In a container, `--dns raft` lets every replica find the others through
//! one name. Without `--advertise`, a node listening on a wildcard address
//! advertises the local IP it uses to reach the cluster.
//!
//! Pass `--otlp-endpoint http://collector:4317` to export spans.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use tokio::net::lookup_host;
use tracing::{info, warn};

use raft_kv::config::RaftConfig;
use raft_kv::observer::TracingObserver;
use raft_kv::server::{Server, ServerConfig};
use raft_kv::storage::MapStorage;
use raft_kv::telemetry;
use raft_kv::topology::{Topology, local_ip_towards, lookup_cluster};

const CONNECT_ATTEMPTS: u64 = 4;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft-kv node")]
struct Args {
    /// Node id. Defaults to the advertised address.
    #[arg(long)]
    id: Option<String>,

    /// Address to bind for peer and client RPCs. Defaults to 0.0.0.0:<port>.
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: Option<String>,

    /// Address other nodes use to reach this one. Defaults to the listen
    /// address, or to the local IP towards the cluster when listening on a
    /// wildcard address.
    #[arg(long, value_hint = ValueHint::Hostname)]
    advertise: Option<String>,

    /// Comma-separated peers: id=addr or addr, may include this node.
    #[arg(long, value_delimiter = ',', conflicts_with = "dns")]
    peer: Vec<String>,

    /// DNS name resolving to every cluster member, looked up once.
    #[arg(long)]
    dns: Option<String>,

    /// Port used with --dns and for the default listen address.
    #[arg(long, default_value_t = 7600)]
    port: u16,

    #[arg(long, default_value_t = 150)]
    election_timeout_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_timeout_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 300)]
    rpc_timeout_ms: u64,

    /// OTLP gRPC collector to export spans to.
    #[arg(long, value_hint = ValueHint::Url)]
    otlp_endpoint: Option<String>,
}

impl Args {
    fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", args.port));
    let resolved = match &args.dns {
        Some(name) => lookup_cluster(name, args.port).await?,
        None => Vec::new(),
    };
    let advertise = match &args.advertise {
        Some(advertise) => Some(advertise.clone()),
        None => derive_advertise(&listen, &resolved, &args.peer).await?,
    };

    let service_name = format!(
        "raft-kv-node-{}",
        args.id.as_deref().or(advertise.as_deref()).unwrap_or(&listen)
    );
    let telemetry = telemetry::init(&service_name, args.otlp_endpoint.as_deref())?;
    if let (None, Some(advertise)) = (&args.advertise, &advertise) {
        info!(advertise = %advertise, "derived advertise address");
    }

    let config = ServerConfig {
        id: args.id.clone(),
        listen,
        advertise,
        raft: args.raft_config(),
    };
    let server = Server::bind(config, Arc::new(MapStorage::new()), Arc::new(TracingObserver))
        .await
        .context("failed to start server")?;
    info!(id = server.id(), "node ready");

    let topology = match &args.dns {
        Some(_) => Topology::from_resolved(resolved, server.advertise_addr())?,
        None => Topology::from_entries(&args.peer, server.id())?,
    };

    for peer in topology.peers() {
        connect_with_retry(&server, &peer.id, &peer.addr).await?;
    }
    server.start();
    info!(cluster_size = topology.cluster_size(), "all peers registered, elections enabled");

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    info!("shutting down");
    let result = server.shutdown().await;
    telemetry.shutdown().await;
    result
}

/// A wildcard listen address cannot be handed to peers. Advertise the IP
/// this host routes through towards the cluster instead, or loopback for a
/// node with no peers.
async fn derive_advertise(
    listen: &str,
    resolved: &[SocketAddr],
    peers: &[String],
) -> Result<Option<String>> {
    let Ok(listen_addr) = listen.parse::<SocketAddr>() else {
        return Ok(None);
    };
    if !listen_addr.ip().is_unspecified() {
        return Ok(None);
    }

    let mut target = resolved.first().copied();
    if target.is_none() {
        if let Some(entry) = peers.iter().map(|entry| entry.trim()).find(|entry| !entry.is_empty()) {
            let addr = entry.split_once('=').map_or(entry, |(_, addr)| addr.trim());
            target = lookup_host(addr)
                .await
                .with_context(|| format!("failed to resolve peer {addr}"))?
                .next();
        }
    }
    let ip = match target {
        Some(target) => local_ip_towards(target).await?,
        None => Ipv4Addr::LOCALHOST.into(),
    };
    Ok(Some(SocketAddr::new(ip, listen_addr.port()).to_string()))
}

/// Peers are often still starting; give each one a few tries with a
/// growing pause before giving up on the whole node.
async fn connect_with_retry(server: &Server, id: &str, addr: &str) -> Result<()> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match server.connect_to_peer(id, addr).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(peer = id, attempt, error = %err, "failed to connect to peer");
                tokio::time::sleep(Duration::from_secs(attempt)).await;
            }
        }
    }
    bail!("exhausted retries connecting to peer {id} at {addr}")
}
