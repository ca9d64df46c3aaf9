//! In-memory key-value state machine.
//!
//! Committed entries arrive from the commit stream and are applied here by a
//! single task, so every node sees the same mutations in the same order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::Command;
use crate::commit::{CommitEntry, CommitReceiver};
use crate::observer::Observer;
use crate::rpc::NodeId;

/// The replicated map. `BTreeMap` keeps snapshots in a stable order.
pub struct KvStore {
    node: NodeId,
    data: Mutex<BTreeMap<String, String>>,
    applied_index: AtomicU64,
    observer: Arc<dyn Observer>,
}

impl KvStore {
    pub fn new(node: impl Into<NodeId>, observer: Arc<dyn Observer>) -> Self {
        Self {
            node: node.into(),
            data: Mutex::new(BTreeMap::new()),
            applied_index: AtomicU64::new(0),
            observer,
        }
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one committed entry. Returns whether the map changed.
    ///
    /// A compare-and-swap against a missing key compares with `""`.
    pub fn apply(&self, entry: &CommitEntry) -> bool {
        let changed = {
            let mut data = self.data();
            match &entry.command {
                Command::Set { key, value } => {
                    data.insert(key.clone(), value.clone());
                    Some((key, value))
                }
                Command::CompareAndSwap { key, expected, new } => {
                    let current = data.get(key).map(String::as_str).unwrap_or("");
                    if current == expected.as_str() {
                        data.insert(key.clone(), new.clone());
                        Some((key, new))
                    } else {
                        debug!(node = %self.node, index = entry.index, key = %key, "cas precondition failed");
                        None
                    }
                }
            }
        };
        self.applied_index.store(entry.index, Ordering::Release);

        match changed {
            Some((key, value)) => {
                self.observer
                    .key_changed(&self.node, entry.index, key, value);
                true
            }
            None => false,
        }
    }

    /// Local read; whatever this node has applied so far.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data().clone()
    }

    /// Index of the last applied entry, 0 before the first.
    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }
}

/// Spawns the task that drains `commits` into `store`. The task ends when
/// the consensus module drops its end of the stream.
pub fn spawn_applier(store: Arc<KvStore>, mut commits: CommitReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = commits.recv().await {
            store.apply(&entry);
        }
        debug!(node = %store.node, applied = store.applied_index(), "commit stream ended");
    })
}
