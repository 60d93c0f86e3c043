//! Injected key-value capability used for the access-token cache, the
//! concurrent-IP tracking windows, and the geo lookup cache.
//!
//! Consumers are written against the [`KeyValueStore`] trait so no cache
//! technology leaks into the token logic. The Redis backend is the
//! production implementation; the in-memory backend keeps development and
//! the test suite free of external services.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::InMemoryKvStore;
pub use redis::RedisKvStore;

/// Errors that can occur during key-value operations
#[derive(Debug, Error)]
pub enum KvError {
    #[error("Failed to serialize value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(String),
}

/// Key-value capability: get / put-with-ttl / delete / scan-by-prefix.
///
/// Implementations must be safe to share across request handlers.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Store `value` under `key`, expiring after `ttl` when given.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// List every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// Typed read on top of the string capability.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Typed write on top of the string capability.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), KvError> {
    let raw = serde_json::to_string(value)?;
    store.put(key, &raw, ttl).await
}
