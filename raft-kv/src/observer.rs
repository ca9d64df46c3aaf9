//! Observation hooks for consensus and state machine events.
//!
//! Components take an `Arc<dyn Observer>` in their constructor instead of
//! writing to process-wide counters. The binaries plug in
//! [`TracingObserver`]; tests use [`CountingObserver`] to assert on what
//! happened.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::consensus::Role;

/// Receives notifications from the consensus module, the key-value store
/// and the server. Every method has a no-op default.
pub trait Observer: Send + Sync {
    fn role_changed(&self, _node: &str, _term: u64, _from: Role, _to: Role) {}

    fn entry_committed(&self, _node: &str, _index: u64, _term: u64) {}

    /// Called only when applying an entry actually changed the map.
    fn key_changed(&self, _node: &str, _index: u64, _key: &str, _value: &str) {}

    fn peer_rpc_failed(&self, _node: &str, _peer: &str, _rpc: &'static str, _error: &str) {}

    fn client_redirected(&self, _node: &str, _leader_address: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn role_changed(&self, node: &str, term: u64, from: Role, to: Role) {
        info!(node, term, ?from, ?to, "role changed");
    }

    fn entry_committed(&self, node: &str, index: u64, term: u64) {
        debug!(node, index, term, "entry committed");
    }

    fn key_changed(&self, node: &str, index: u64, key: &str, value: &str) {
        info!(node, index, key, value, "applied");
    }

    fn peer_rpc_failed(&self, node: &str, peer: &str, rpc: &'static str, error: &str) {
        debug!(node, peer, rpc, error, "peer rpc failed");
    }

    fn client_redirected(&self, node: &str, leader_address: &str) {
        debug!(node, leader_address, "redirecting client to leader");
    }
}

/// Point-in-time copy of a [`CountingObserver`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObservedCounts {
    pub elections_won: u64,
    pub step_downs: u64,
    pub commits: u64,
    pub key_changes: u64,
    pub rpc_failures: u64,
    pub redirects: u64,
}

/// Lock-free event counters.
#[derive(Debug, Default)]
pub struct CountingObserver {
    elections_won: AtomicU64,
    step_downs: AtomicU64,
    commits: AtomicU64,
    key_changes: AtomicU64,
    rpc_failures: AtomicU64,
    redirects: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> ObservedCounts {
        ObservedCounts {
            elections_won: self.elections_won.load(Ordering::Relaxed),
            step_downs: self.step_downs.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            key_changes: self.key_changes.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
        }
    }
}

impl Observer for CountingObserver {
    fn role_changed(&self, _node: &str, _term: u64, from: Role, to: Role) {
        if to == Role::Leader {
            self.elections_won.fetch_add(1, Ordering::Relaxed);
        } else if from == Role::Leader {
            self.step_downs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn entry_committed(&self, _node: &str, _index: u64, _term: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn key_changed(&self, _node: &str, _index: u64, _key: &str, _value: &str) {
        self.key_changes.fetch_add(1, Ordering::Relaxed);
    }

    fn peer_rpc_failed(&self, _node: &str, _peer: &str, _rpc: &'static str, _error: &str) {
        self.rpc_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn client_redirected(&self, _node: &str, _leader_address: &str) {
        self.redirects.fetch_add(1, Ordering::Relaxed);
    }
}
