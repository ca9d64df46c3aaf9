//! Raft-replicated key-value store.
//!
//! Each node runs a [`consensus::ConsensusModule`] that elects a leader and
//! replicates a log of [`command::Command`]s. Committed entries flow through
//! the [`commit`] stream into a [`store::KvStore`]. A [`server::Server`]
//! exposes the peer and key-value services on one TCP port, and
//! [`client::Client`] finds the leader by following redirects.
//!
//! # Architecture
//!
//! Everything runs on tokio. The consensus module keeps its state behind a
//! single mutex that is never held across an `.await`; background tasks
//! drive elections, heartbeats and commit delivery, and every outbound RPC
//! runs in its own task under a deadline.
//!
//! ```text
//! Client ──Set/Get/Cas──▶ Server ──submit──▶ ConsensusModule ──AppendEntries──▶ peers
//!                                                  │
//!                                            commit stream
//!                                                  ▼
//!                                               KvStore
//! ```
//!
//! # Modules
//!
//! - [`consensus`]: election, replication and commit rules
//! - [`server`]: listener, RPC dispatch, peer lifecycle, shutdown
//! - [`transport`]: framed TCP connections and the peer client map
//! - [`client`]: client library with redirect following
//! - [`store`]: the replicated map and its applier task
//! - [`commit`]: ordered hand-off from consensus to the store
//! - [`storage`]: persistence contract for term, vote and log
//! - [`rpc`]: wire messages and framing
//! - [`observer`]: event hooks for logging and tests
//! - [`telemetry`]: log subscriber, OTLP export and trace propagation
//! - [`config`]: timing knobs
//! - [`topology`]: peer discovery at startup
//! - [`protocol`]: client shell parsing
//! - [`command`]: commands replicated through the log

pub mod client;
pub mod command;
pub mod commit;
pub mod config;
pub mod consensus;
pub mod observer;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod signal;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod topology;
pub mod transport;
