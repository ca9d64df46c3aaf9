//! Wire protocol shared by the peer service and the client-facing KV
//! service.
//!
//! Both services listen on the same port. A connection carries a sequence of
//! request/response pairs; every message is a frame:
//!
//! - 4 bytes: body length (big-endian u32)
//! - N bytes: `bincode`-encoded [`Envelope`] (requests) or [`Response`]
//!
//! The envelope carries the caller's trace context next to the request so
//! spans on both ends join one trace.

use std::collections::HashMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;

/// Identifier of a cluster member. The node binary uses the advertised
/// `host:port`, which lets a leader id double as a redirect address.
pub type NodeId = String;

/// Frames above this size are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Budget for the entries of one AppendEntries call. The rest of the frame
/// stays well under [`MAX_FRAME_LEN`].
pub const MAX_APPEND_BYTES: usize = MAX_FRAME_LEN / 2;

/// Largest encoded command a node accepts for replication. Keeps every
/// single entry below [`MAX_APPEND_BYTES`].
pub const MAX_COMMAND_BYTES: usize = 4 * 1024 * 1024;

/// W3C trace context headers (`traceparent`, `baggage`, ...).
pub type TraceHeaders = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// On rejection `conflict_index`/`conflict_term` let the leader jump back a
/// whole term at a time instead of probing one entry per round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_index: u64,
    pub conflict_term: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
}

/// `leader_address` set means "not the leader, retry there"; nothing was
/// written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetResponse {
    pub leader_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<String>,
    pub leader_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasRequest {
    pub key: String,
    pub expected: String,
    pub new: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasResponse {
    pub leader_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    Set(SetRequest),
    Get(GetRequest),
    Cas(CasRequest),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::RequestVote(_) => "RequestVote",
            Request::AppendEntries(_) => "AppendEntries",
            Request::Set(_) => "Set",
            Request::Get(_) => "Get",
            Request::Cas(_) => "Cas",
        }
    }
}

/// A request as it travels on the wire. Written as `Envelope<&Request>`,
/// read as `Envelope<Request>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<R = Request> {
    pub trace: TraceHeaders,
    pub request: R,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    Set(SetResponse),
    Get(GetResponse),
    Cas(CasResponse),
    Error(RpcStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// The node cannot serve the request right now; another node might.
    Unavailable,
    /// The node is shutting down and accepts no new work.
    ShuttingDown,
    /// The request can never succeed as sent, on any node.
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}

/// Failure of a single outbound call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error talking to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("call to {addr} timed out")]
    Timeout { addr: String },
    #[error("connection to {addr} closed by remote")]
    Closed { addr: String },
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("remote returned {0}")]
    Status(#[from] RpcStatus),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

/// Reads one frame. Returns `Ok(None)` when the stream ends cleanly before
/// a new frame starts.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let message = bincode::deserialize(&buf).map_err(to_io_error)?;
    Ok(Some(message))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message).map_err(to_io_error)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
