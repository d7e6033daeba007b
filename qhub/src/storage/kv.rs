//! The storage trait and the in-memory backend.

use crate::errors::{HubResult, StorageError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Minimal storage contract: get, put and list-by-prefix.
///
/// Values are opaque bytes. Implementations must make `put_if_absent`
/// atomic with respect to concurrent writers of the same key.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores `value` at `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Stores `value` only if `key` is absent. Returns true if written.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError>;

    /// Returns every key starting with `prefix`, sorted.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Checks that `key` is made of non-empty segments of `[A-Za-z0-9._-]`
/// that do not start with `.`.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && !segment.starts_with('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Reads and decodes a JSON record.
pub async fn load_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> HubResult<Option<T>> {
    match kv.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encodes and writes a JSON record.
pub async fn store_json<T: Serialize + Sync>(kv: &dyn KvStore, key: &str, value: &T) -> HubResult<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.put(key, bytes).await?;
    Ok(())
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryKvStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StorageError> {
        validate_key(key)?;
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
