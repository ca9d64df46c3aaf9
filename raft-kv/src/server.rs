//! A cluster node: listener, RPC dispatch and peer lifecycle.
//!
//! One TCP port serves both the peer service (RequestVote, AppendEntries)
//! and the key-value service (Set, Get, Cas). Writes are accepted only on
//! the leader; other nodes answer with the leader's address and no data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::task::JoinHandle;
use tracing::{Span, debug, debug_span, info, info_span, warn};

use crate::command::Command;
use crate::commit::commit_channel;
use crate::config::RaftConfig;
use crate::consensus::{ConsensusError, ConsensusModule, PeerTransport, Role, Status};
use crate::observer::Observer;
use crate::rpc::{
    CasResponse, Envelope, GetResponse, MAX_COMMAND_BYTES, NodeId, Request, Response, RpcStatus,
    SetResponse, StatusCode, read_frame, write_frame,
};
use crate::signal::{Signal, fired};
use crate::storage::Storage;
use crate::store::{KvStore, spawn_applier};
use crate::telemetry::adopt_remote_parent;
use crate::transport::PeerClients;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Node id. Defaults to the advertised address.
    pub id: Option<NodeId>,
    pub listen: String,
    /// Address other nodes and clients should use to reach this node.
    /// Defaults to the bound listen address.
    pub advertise: Option<String>,
    pub raft: RaftConfig,
}

impl ServerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            id: None,
            listen: listen.into(),
            advertise: None,
            raft: RaftConfig::default(),
        }
    }
}

/// Where a client request should be served.
enum Route {
    Local,
    Redirect(String),
    Unknown,
}

/// State shared with the accept loop and every connection task.
struct Shared {
    id: NodeId,
    advertise: String,
    consensus: ConsensusModule,
    kv: Arc<KvStore>,
    addresses: Mutex<HashMap<NodeId, String>>,
    observer: Arc<dyn Observer>,
    shutdown: Signal,
}

pub struct Server {
    shared: Arc<Shared>,
    listen_addr: SocketAddr,
    peers: Arc<PeerClients>,
    accept_task: JoinHandle<TcpListener>,
    applier: JoinHandle<()>,
}

impl Server {
    /// Binds the listener, restores consensus state from `storage` and
    /// starts serving RPCs. Elections stay off until [`start`](Self::start).
    pub async fn bind(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        config.raft.validate()?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let listen_addr = listener.local_addr()?;
        let advertise = config
            .advertise
            .unwrap_or_else(|| listen_addr.to_string());
        ensure_dialable(&advertise)?;
        let id = config.id.unwrap_or_else(|| advertise.clone());

        let peers = Arc::new(PeerClients::new(config.raft.rpc_timeout));
        let transport: Arc<dyn PeerTransport> = peers.clone();
        let (commit_tx, commit_rx) = commit_channel();
        let kv = Arc::new(KvStore::new(id.clone(), Arc::clone(&observer)));
        let applier = spawn_applier(Arc::clone(&kv), commit_rx);
        let consensus = ConsensusModule::new(
            id.clone(),
            config.raft,
            storage,
            transport,
            Arc::clone(&observer),
            commit_tx,
        )?;

        let shared = Arc::new(Shared {
            id,
            advertise,
            consensus,
            kv,
            addresses: Mutex::new(HashMap::new()),
            observer,
            shutdown: Signal::new(),
        });
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        info!(node = %shared.id, listen = %listen_addr, advertise = %shared.advertise, "server listening");

        Ok(Self {
            shared,
            listen_addr,
            peers,
            accept_task,
            applier,
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn advertise_addr(&self) -> &str {
        &self.shared.advertise
    }

    pub fn consensus(&self) -> &ConsensusModule {
        &self.shared.consensus
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.shared.kv
    }

    pub fn status(&self) -> Status {
        self.shared.consensus.report()
    }

    /// Lets the election timer run.
    pub fn start(&self) {
        self.shared.consensus.start();
    }

    /// Registers a peer at `addr`, resolving it once. Calling this again for
    /// a known id is a no-op. The connection itself is dialed on first use.
    pub async fn connect_to_peer(&self, id: &str, addr: &str) -> Result<()> {
        if id == self.shared.id {
            return Ok(());
        }
        let resolved = lookup_host(addr)
            .await
            .with_context(|| format!("failed to resolve peer {id} at {addr}"))?
            .next()
            .ok_or_else(|| anyhow!("peer {id} at {addr} resolved to no addresses"))?;

        if self.peers.connect(id, &resolved.to_string()) {
            self.shared
                .addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.to_string(), addr.to_string());
            self.shared.consensus.add_peer_id(id);
            info!(node = %self.shared.id, peer = id, addr = %resolved, "connected to peer");
        }
        Ok(())
    }

    /// Drops the client for `id`. The peer still counts towards the
    /// quorum; calls to it fail until it is connected again.
    pub fn disconnect_peer(&self, id: &str) {
        if self.peers.disconnect(id) {
            info!(node = %self.shared.id, peer = id, "disconnected from peer");
        }
    }

    pub fn disconnect_all(&self) {
        self.peers.disconnect_all();
    }

    /// Stops accepting RPCs, stops consensus, closes peer connections and
    /// finally releases the listener.
    pub async fn shutdown(self) -> Result<()> {
        let Server {
            shared,
            peers,
            accept_task,
            applier,
            ..
        } = self;

        shared.shutdown.fire();
        let listener = accept_task.await.context("accept loop panicked")?;

        shared.consensus.stop();
        shared.consensus.join().await;
        peers.disconnect_all();
        drop(listener);

        applier.await.context("applier task panicked")?;
        info!(node = %shared.id, "server stopped");
        Ok(())
    }
}

impl Shared {
    fn route(&self) -> Route {
        let status = self.consensus.report();
        if status.role == Role::Leader {
            return Route::Local;
        }
        match status.leader_id {
            Some(leader) => {
                let address = self
                    .addresses
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&leader)
                    .cloned()
                    .unwrap_or(leader);
                self.observer.client_redirected(&self.id, &address);
                Route::Redirect(address)
            }
            None => Route::Unknown,
        }
    }

    fn write(&self, command: Command) -> Result<Option<String>, RpcStatus> {
        let size = bincode::serialized_size(&command)
            .map_err(|err| RpcStatus::new(StatusCode::Internal, err.to_string()))?;
        if size > MAX_COMMAND_BYTES as u64 {
            debug!(node = %self.id, key = command.key(), size, "rejected oversized write");
            return Err(RpcStatus::new(
                StatusCode::InvalidArgument,
                format!("command of {size} bytes exceeds the {MAX_COMMAND_BYTES} byte limit"),
            ));
        }
        match self.route() {
            Route::Local => {
                if self.consensus.submit(command) {
                    Ok(None)
                } else {
                    Err(RpcStatus::new(
                        StatusCode::Unavailable,
                        "leadership lost before the write was accepted",
                    ))
                }
            }
            Route::Redirect(address) => Ok(Some(address)),
            Route::Unknown => Err(no_leader()),
        }
    }

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::RequestVote(args) => match self.consensus.request_vote(args) {
                Ok(reply) => Response::RequestVote(reply),
                Err(err) => Response::Error(consensus_status(err)),
            },
            Request::AppendEntries(args) => match self.consensus.append_entries(args) {
                Ok(reply) => Response::AppendEntries(reply),
                Err(err) => Response::Error(consensus_status(err)),
            },
            Request::Set(req) => match self.write(Command::set(req.key, req.value)) {
                Ok(leader_address) => Response::Set(SetResponse { leader_address }),
                Err(status) => Response::Error(status),
            },
            Request::Cas(req) => match self.write(Command::cas(req.key, req.expected, req.new)) {
                Ok(leader_address) => Response::Cas(CasResponse { leader_address }),
                Err(status) => Response::Error(status),
            },
            Request::Get(req) => match self.route() {
                Route::Local => Response::Get(GetResponse {
                    value: self.kv.get(&req.key),
                    leader_address: None,
                }),
                Route::Redirect(address) => Response::Get(GetResponse {
                    value: None,
                    leader_address: Some(address),
                }),
                Route::Unknown => Response::Error(no_leader()),
            },
        }
    }
}

/// Peers and clients are sent to the advertised address, and by default it
/// is also the node id, so a wildcard IP there would be shared by every node.
fn ensure_dialable(advertise: &str) -> Result<()> {
    if let Ok(addr) = advertise.parse::<SocketAddr>() {
        ensure!(
            !addr.ip().is_unspecified(),
            "advertise address {advertise} is not dialable; set one explicitly"
        );
    }
    Ok(())
}

fn no_leader() -> RpcStatus {
    RpcStatus::new(StatusCode::Unavailable, "no leader known")
}

fn consensus_status(err: ConsensusError) -> RpcStatus {
    match err {
        ConsensusError::Stopped => RpcStatus::new(StatusCode::ShuttingDown, err.to_string()),
        ConsensusError::Storage(_) => RpcStatus::new(StatusCode::Internal, err.to_string()),
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) -> TcpListener {
    let mut shutdown = shared.shutdown.listener();
    loop {
        tokio::select! {
            _ = fired(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => spawn_connection(stream, remote, &shared),
                Err(err) => warn!(node = %shared.id, error = ?err, "failed to accept connection"),
            },
        }
    }
    debug!(node = %shared.id, "accept loop stopped");
    listener
}

fn spawn_connection(stream: TcpStream, remote: SocketAddr, shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &shared).await {
            debug!(node = %shared.id, remote = %remote, error = %err, "connection closed with error");
        }
    });
}

async fn serve_connection(stream: TcpStream, shared: &Shared) -> std::io::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut shutdown = shared.shutdown.listener();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let envelope: Envelope = tokio::select! {
            _ = fired(&mut shutdown) => return Ok(()),
            frame = read_frame(&mut reader) => match frame? {
                Some(envelope) => envelope,
                None => return Ok(()),
            },
        };

        let span = handler_span(&envelope.request);
        adopt_remote_parent(&span, &envelope.trace);
        let response = if shared.shutdown.is_fired() {
            Response::Error(RpcStatus::new(StatusCode::ShuttingDown, "server shutting down"))
        } else {
            span.in_scope(|| shared.handle(envelope.request))
        };
        write_frame(&mut writer, &response).await?;
    }
}

/// Heartbeats would drown client traffic at `info`, so peer RPCs get
/// `debug` spans.
fn handler_span(request: &Request) -> Span {
    match request {
        Request::RequestVote(_) | Request::AppendEntries(_) => {
            debug_span!("peer_rpc", rpc = request.name())
        }
        _ => info_span!("kv_rpc", rpc = request.name()),
    }
}
