//! Key-value store contract backing the auth repository.
//!
//! The repository only needs get / set-if-absent / delete / exists / ping, so
//! that is the whole trait. Production deployments put Redis or similar
//! behind it; [`MemoryStore`] serves tests and single-box setups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("store operation failed: {0}")]
    Operation(String),
}

/// Minimal key-value contract the auth repository is written against.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value. `None` means the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set the key only if absent. Returns `false` when the key already
    /// existed. A zero TTL means no expiry.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Delete a key. Returns `false` when nothing was removed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory store with TTL expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock();

        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.lock();

        if entries.get(key).is_some_and(|e| !e.expired()) {
            return Ok(false);
        }

        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at });

        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock();

        match entries.remove(key) {
            Some(entry) => Ok(!entry.expired()),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
