use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::info;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Upper bound applied to individual Redis commands.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis connection pool built on the multiplexed connection manager.
pub struct RedisPool {
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client =
            Client::open(redis_url).context("failed to parse REDIS_URL connection string")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        info!("Redis connection manager initialized");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }
}

/// Run a Redis operation with the default command timeout.
pub async fn with_timeout<T, F>(fut: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    with_timeout_after(DEFAULT_OP_TIMEOUT, fut).await
}

/// Run a Redis operation, failing with an IO error once `timeout` elapses.
pub async fn with_timeout_after<T, F>(timeout: Duration, fut: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from((
            ErrorKind::IoError,
            "redis operation timed out",
        ))),
    }
}

/// Collect every key matching `pattern` via cursor-based SCAN.
///
/// SCAN is used instead of KEYS so the sweep never blocks the server on
/// large keyspaces.
pub async fn scan_match(
    manager: &SharedConnectionManager,
    pattern: &str,
) -> Result<Vec<String>, RedisError> {
    let mut conn = manager.lock().await.clone();
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();

    loop {
        let (next, batch): (u64, Vec<String>) = with_timeout(async {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
        })
        .await?;

        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    Ok(keys)
}
