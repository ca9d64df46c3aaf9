//! Ordered delivery of committed log entries to the state machine.
//!
//! [`commit_channel`] returns the two ends of a single-producer,
//! single-consumer queue. Neither end is `Clone`: the consensus module owns
//! the sender, the state machine owns the receiver. The sender refuses any
//! entry whose index is not exactly one past the previous one, so the
//! consumer sees indices 1, 2, 3, ... with no gaps and no duplicates no
//! matter how often the leader retransmits.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::command::Command;

/// A log entry that a majority has stored, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub command: Command,
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommitError {
    #[error("commit index {got} out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("commit stream consumer is gone")]
    Closed,
}

pub fn commit_channel() -> (CommitSender, CommitReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CommitSender { tx, next_index: 1 },
        CommitReceiver { rx, next_index: 1 },
    )
}

#[derive(Debug)]
pub struct CommitSender {
    tx: mpsc::UnboundedSender<CommitEntry>,
    next_index: u64,
}

impl CommitSender {
    /// Publishes `entry`, which must carry the next index in sequence.
    pub fn send(&mut self, entry: CommitEntry) -> Result<(), CommitError> {
        if entry.index != self.next_index {
            return Err(CommitError::OutOfOrder {
                expected: self.next_index,
                got: entry.index,
            });
        }
        self.tx.send(entry).map_err(|_| CommitError::Closed)?;
        self.next_index += 1;
        Ok(())
    }

    /// Index the next published entry must carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

#[derive(Debug)]
pub struct CommitReceiver {
    rx: mpsc::UnboundedReceiver<CommitEntry>,
    next_index: u64,
}

impl CommitReceiver {
    /// Waits for the next committed entry. Returns `None` once the sender
    /// has been dropped and every published entry was consumed.
    pub async fn recv(&mut self) -> Option<CommitEntry> {
        let entry = self.rx.recv().await?;
        debug_assert_eq!(entry.index, self.next_index);
        self.next_index = entry.index + 1;
        Some(entry)
    }

    /// Highest index handed out so far, 0 before the first entry.
    pub fn last_index(&self) -> u64 {
        self.next_index - 1
    }
}
