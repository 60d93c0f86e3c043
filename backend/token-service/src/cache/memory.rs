use super::{KvError, KeyValueStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Instant::now(),
            None => false,
        }
    }
}

/// In-memory key-value backend over a concurrent map.
///
/// Expiry is enforced lazily on read and scan, which is sufficient for the
/// development and test environments this backend serves.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let keys = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        Ok(keys)
    }
}
