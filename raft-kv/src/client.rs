//! Client library for the key-value service.
//!
//! A [`Client`] talks to one node at a time. When that node is not the
//! leader it answers with the leader's address and the client follows it.
//! When the node is unreachable or has no leader to point at, the client
//! moves on to the next seed after a short back-off. Either way a single
//! call makes at most [`MAX_ATTEMPTS`] tries.

use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::rpc::{
    CasRequest, GetRequest, Request, Response, RpcError, RpcStatus, SetRequest, StatusCode,
};
use crate::transport::Connection;

pub const MAX_ATTEMPTS: usize = 3;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no seed addresses given")]
    NoSeeds,
    #[error("gave up after {attempts} attempts, last failure: {last}")]
    RetriesExhausted { attempts: usize, last: String },
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("request rejected: {0}")]
    Rejected(RpcStatus),
}

enum Outcome {
    Done(Response),
    Redirect(String),
}

pub struct Client {
    seeds: Vec<String>,
    next_seed: usize,
    target: String,
    conn: Option<Connection>,
    call_timeout: Duration,
    backoff: Duration,
}

impl Client {
    pub fn new<I, S>(seeds: I) -> Result<Self, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seeds: Vec<String> = seeds.into_iter().map(Into::into).collect();
        let target = seeds.first().cloned().ok_or(ClientError::NoSeeds)?;
        Ok(Self {
            seeds,
            next_seed: 1,
            target,
            conn: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        })
    }

    /// Deadline for a single try, including the dial.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Base pause before retrying against another seed. Grows linearly with
    /// the attempt number.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Address the next call will go to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Submits a write. Success means the leader appended it to its log,
    /// not that it has committed.
    pub async fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), ClientError> {
        let request = Request::Set(SetRequest {
            key: key.into(),
            value: value.into(),
        });
        match self.call(request).await? {
            Response::Set(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse("Set")),
        }
    }

    /// Reads the leader's current value for `key`.
    pub async fn get(&mut self, key: impl Into<String>) -> Result<Option<String>, ClientError> {
        let request = Request::Get(GetRequest { key: key.into() });
        match self.call(request).await? {
            Response::Get(response) => Ok(response.value),
            _ => Err(ClientError::UnexpectedResponse("Get")),
        }
    }

    /// Submits a compare-and-swap. Whether it took effect is only visible
    /// through a later read.
    pub async fn cas(
        &mut self,
        key: impl Into<String>,
        expected: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<(), ClientError> {
        let request = Request::Cas(CasRequest {
            key: key.into(),
            expected: expected.into(),
            new: new.into(),
        });
        match self.call(request).await? {
            Response::Cas(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse("Cas")),
        }
    }

    #[instrument(name = "kv_call", skip_all, fields(rpc = request.name()))]
    async fn call(&mut self, request: Request) -> Result<Response, ClientError> {
        let mut last = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_once(&request).await {
                Ok(Outcome::Done(response)) => return Ok(response),
                Err(RpcError::Status(status)) if status.code == StatusCode::InvalidArgument => {
                    return Err(ClientError::Rejected(status));
                }
                Ok(Outcome::Redirect(leader)) => {
                    debug!(from = %self.target, to = %leader, rpc = request.name(), "following redirect");
                    last = format!("redirected from {} to {leader}", self.target);
                    self.retarget(leader);
                }
                Err(err) => {
                    debug!(target_addr = %self.target, attempt, error = %err, "call failed");
                    last = err.to_string();
                    self.rotate_seed();
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(self.backoff * attempt as u32).await;
                    }
                }
            }
        }
        Err(ClientError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last,
        })
    }

    async fn try_once(&mut self, request: &Request) -> Result<Outcome, RpcError> {
        let target = self.target.clone();
        let cached = self.conn.take();
        let attempt = async {
            let mut conn = match cached {
                Some(conn) => conn,
                None => Connection::connect(&target).await?,
            };
            let response = conn.call(request).await?;
            Ok::<_, RpcError>((response, conn))
        };
        let response = match timeout(self.call_timeout, attempt).await {
            Ok(Ok((response, conn))) => {
                self.conn = Some(conn);
                response
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(RpcError::Timeout {
                    addr: self.target.clone(),
                });
            }
        };

        let redirect = match &response {
            Response::Set(response) => response.leader_address.clone(),
            Response::Get(response) => response.leader_address.clone(),
            Response::Cas(response) => response.leader_address.clone(),
            _ => None,
        };
        Ok(match redirect {
            Some(leader) => Outcome::Redirect(leader),
            None => Outcome::Done(response),
        })
    }

    fn retarget(&mut self, addr: String) {
        if addr != self.target {
            self.conn = None;
            self.target = addr;
        }
    }

    fn rotate_seed(&mut self) {
        let seed = self.seeds[self.next_seed % self.seeds.len()].clone();
        self.next_seed = (self.next_seed + 1) % self.seeds.len();
        self.conn = None;
        self.target = seed;
    }
}
