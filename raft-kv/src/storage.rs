//! Stable storage contract for the consensus module.
//!
//! The consensus module persists its term, vote and log through this trait
//! before replying to any RPC whose answer depends on them. [`MapStorage`]
//! keeps everything in memory: good enough for tests and demos, useless
//! across a crash. A disk-backed engine plugs in behind the same trait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Failure reported by a storage engine.
///
/// The consensus module treats every storage error as fatal: it stops
/// rather than keep running on state it could not persist.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: bincode::Error,
    },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Key/value persistence used for `current_term`, `voted_for` and `log`.
pub trait Storage: Send + Sync {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns true iff any `set` was ever made on this storage.
    fn has_data(&self) -> Result<bool, StorageError>;
}

/// In-memory [`Storage`] guarded by a mutex.
#[derive(Debug, Default)]
pub struct MapStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MapStorage {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries().get(key).cloned())
    }

    fn has_data(&self) -> Result<bool, StorageError> {
        Ok(!self.entries().is_empty())
    }
}
