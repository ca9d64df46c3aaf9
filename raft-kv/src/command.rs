use serde::{Deserialize, Serialize};

/// Commands that flow through the Raft replicated log.
///
/// The consensus module never looks inside a command; only the key-value
/// state machine interprets it. Client requests are turned into one of these
/// variants once, at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set {
        key: String,
        value: String,
    },
    CompareAndSwap {
        key: String,
        expected: String,
        new: String,
    },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn cas(
        key: impl Into<String>,
        expected: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        Command::CompareAndSwap {
            key: key.into(),
            expected: expected.into(),
            new: new.into(),
        }
    }

    /// Key touched by this command.
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::CompareAndSwap { key, .. } => key,
        }
    }
}
