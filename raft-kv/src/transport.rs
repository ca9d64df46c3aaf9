//! Outbound TCP connections.
//!
//! [`Connection`] is one framed request/response stream, shared by the peer
//! transport and the client library. [`PeerClients`] keeps one lazily dialed
//! connection per peer and implements [`PeerTransport`] on top of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::debug;

use crate::consensus::PeerTransport;
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, Envelope, NodeId, Request, RequestVoteArgs,
    RequestVoteReply, Response, RpcError, read_frame, write_frame,
};
use crate::telemetry::current_trace_headers;

pub struct Connection {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await.map_err(|source| RpcError::Io {
            addr: addr.to_string(),
            source,
        })?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one request and waits for its response. A
    /// [`Response::Error`] comes back as [`RpcError::Status`].
    pub async fn call(&mut self, request: &Request) -> Result<Response, RpcError> {
        let envelope = Envelope {
            trace: current_trace_headers(),
            request,
        };
        write_frame(&mut self.writer, &envelope)
            .await
            .map_err(|source| self.io_error(source))?;
        let response = read_frame(&mut self.reader)
            .await
            .map_err(|source| self.io_error(source))?
            .ok_or_else(|| RpcError::Closed {
                addr: self.addr.clone(),
            })?;
        match response {
            Response::Error(status) => Err(RpcError::Status(status)),
            response => Ok(response),
        }
    }

    fn io_error(&self, source: std::io::Error) -> RpcError {
        RpcError::Io {
            addr: self.addr.clone(),
            source,
        }
    }
}

/// Client end of one peer. Dials on first use and again after any
/// transport failure.
pub struct PeerClient {
    addr: String,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Performs one call bounded by `deadline`, covering the wait behind
    /// earlier calls, dial, write and read.
    ///
    /// The connection is out of the slot while the call runs and goes back
    /// only after a complete reply was read. A call that fails or is
    /// cancelled midway leaves the slot empty, so an unread reply can never
    /// be taken for the answer to a later request.
    pub async fn call(&self, request: &Request, deadline: Duration) -> Result<Response, RpcError> {
        let attempt = async {
            let mut slot = self.conn.lock().await;
            let (result, conn) = call_on(slot.take(), &self.addr, request).await;
            *slot = conn;
            result
        };
        timeout(deadline, attempt).await.unwrap_or_else(|_| {
            Err(RpcError::Timeout {
                addr: self.addr.clone(),
            })
        })
    }
}

/// Runs one call and hands the connection back if it is still in step with
/// the remote.
async fn call_on(
    cached: Option<Connection>,
    addr: &str,
    request: &Request,
) -> (Result<Response, RpcError>, Option<Connection>) {
    let mut conn = match cached {
        Some(conn) => conn,
        None => {
            debug!(peer = addr, "dialing");
            match Connection::connect(addr).await {
                Ok(conn) => conn,
                Err(err) => return (Err(err), None),
            }
        }
    };
    let result = conn.call(request).await;
    match &result {
        Ok(_) | Err(RpcError::Status(_)) => (result, Some(conn)),
        Err(_) => (result, None),
    }
}

/// The set of peers this node talks to, keyed by id.
pub struct PeerClients {
    peers: Mutex<HashMap<NodeId, Arc<PeerClient>>>,
    call_timeout: Duration,
}

impl PeerClients {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            call_timeout,
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<NodeId, Arc<PeerClient>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` at `addr`. Returns false if the peer was already
    /// known, in which case nothing changes.
    pub fn connect(&self, id: &str, addr: &str) -> bool {
        let mut peers = self.peers();
        if peers.contains_key(id) {
            return false;
        }
        peers.insert(id.to_string(), Arc::new(PeerClient::new(addr)));
        true
    }

    /// Forgets `id`. In-flight calls finish on their own copy.
    pub fn disconnect(&self, id: &str) -> bool {
        self.peers().remove(id).is_some()
    }

    pub fn disconnect_all(&self) {
        self.peers().clear();
    }

    pub fn address(&self, id: &str) -> Option<String> {
        self.peers().get(id).map(|peer| peer.addr().to_string())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn call(&self, id: &str, request: Request) -> Result<Response, RpcError> {
        let peer = self
            .peers()
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::NotConnected(id.to_string()))?;
        peer.call(&request, self.call_timeout).await
    }
}

#[async_trait]
impl PeerTransport for PeerClients {
    async fn request_vote(
        &self,
        peer: &str,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RpcError> {
        match self.call(peer, Request::RequestVote(args)).await? {
            Response::RequestVote(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedResponse("RequestVote")),
        }
    }

    async fn append_entries(
        &self,
        peer: &str,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RpcError> {
        match self.call(peer, Request::AppendEntries(args)).await? {
            Response::AppendEntries(reply) => Ok(reply),
            _ => Err(RpcError::UnexpectedResponse("AppendEntries")),
        }
    }
}
