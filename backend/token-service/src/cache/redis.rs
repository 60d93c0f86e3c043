use super::{KvError, KeyValueStore};
use redis_utils::{scan_match, with_timeout, SharedConnectionManager};
use std::time::Duration;

/// Redis-backed key-value capability.
///
/// Every command runs through the shared connection manager with the
/// library-wide operation timeout.
#[derive(Clone)]
pub struct RedisKvStore {
    manager: SharedConnectionManager,
}

impl RedisKvStore {
    pub fn new(manager: SharedConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.lock().await.clone();
        let value: Option<String> = with_timeout(async {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
        .map_err(|e| KvError::Redis(e.to_string()))?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.manager.lock().await.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // EX 0 is rejected by the server; clamp to one second.
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }

        with_timeout(async { cmd.query_async::<_, ()>(&mut conn).await })
            .await
            .map_err(|e| KvError::Redis(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.lock().await.clone();
        with_timeout(async {
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
        .map_err(|e| KvError::Redis(e.to_string()))?;

        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let pattern = format!("{}*", prefix);
        scan_match(&self.manager, &pattern)
            .await
            .map_err(|e| KvError::Redis(e.to_string()))
    }
}
