//! Write-through cache in front of the access-token store.
//!
//! Presented credentials have the shape `"{jti}|{secret}"`. Lookups are
//! served from the key-value store when possible, falling back to (and
//! repopulating from) the durable store on a miss. Negative lookups are
//! cached too. The cache is never a source of truth: every mutation of a
//! token record writes through or invalidates here, and the presented
//! secret is verified on every call, cache hit or not.

use crate::cache::{get_json, put_json, KeyValueStore};
use crate::config::TokenCacheSettings;
use crate::db::TokenStore;
use crate::error::Result;
use crate::models::{AccessToken, CachedTokenEntry};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn TokenStore>,
    kv: Arc<dyn KeyValueStore>,
    settings: TokenCacheSettings,
}

impl TokenCache {
    pub fn new(
        store: Arc<dyn TokenStore>,
        kv: Arc<dyn KeyValueStore>,
        settings: TokenCacheSettings,
    ) -> Self {
        Self {
            store,
            kv,
            settings,
        }
    }

    /// Resolve a presented credential to its token record and owner.
    ///
    /// Returns `None` for malformed credentials, unknown identifiers, and
    /// secret mismatches alike; the caller only learns pass/fail.
    pub async fn find_token(&self, presented: &str) -> Result<Option<CachedTokenEntry>> {
        let Some((jti, secret)) = presented.split_once('|') else {
            debug!("presented credential has no separator");
            return Ok(None);
        };

        let entry = if self.settings.enabled {
            match get_json::<Option<CachedTokenEntry>>(self.kv.as_ref(), &self.cache_key(jti))
                .await
            {
                Ok(Some(cached)) => cached,
                Ok(None) => self.populate(jti).await?,
                Err(e) => {
                    warn!(error = %e, "token cache read failed; falling back to store");
                    self.load_entry(jti).await?
                }
            }
        } else {
            self.load_entry(jti).await?
        };

        match entry {
            Some(entry) if verify_secret(secret, &entry.token.token_hash) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Write-through: store the current state of a token record, called on
    /// creation and every update.
    pub async fn cache_token(&self, token: &AccessToken) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let Some(user) = self.store.find_user(token.user_id).await? else {
            // Token without a resolvable owner cannot be projected; leave
            // lookups to the store.
            self.invalidate(&token.jti).await?;
            return Ok(());
        };

        let entry = Some(CachedTokenEntry {
            token: token.clone(),
            user,
        });
        put_json(self.kv.as_ref(), &self.cache_key(&token.jti), &entry, self.ttl()).await?;
        Ok(())
    }

    /// Drop the cache entry for a token, e.g. after deletion or revocation.
    pub async fn invalidate(&self, jti: &str) -> Result<()> {
        self.kv.delete(&self.cache_key(jti)).await?;
        Ok(())
    }

    /// Delete every token whose expiry has passed and drop the matching
    /// cache entries. Returns the number of deleted access tokens.
    pub async fn prune_expired(&self) -> Result<u64> {
        let jtis = self.store.delete_expired_tokens().await?;
        for jti in &jtis {
            self.invalidate(jti).await?;
        }
        Ok(jtis.len() as u64)
    }

    async fn populate(&self, jti: &str) -> Result<Option<CachedTokenEntry>> {
        let entry = self.load_entry(jti).await?;
        // Concurrent misses may both land here; the overwrite is
        // idempotent so no coordination is needed.
        put_json(self.kv.as_ref(), &self.cache_key(jti), &entry, self.ttl()).await?;
        Ok(entry)
    }

    async fn load_entry(&self, jti: &str) -> Result<Option<CachedTokenEntry>> {
        let Some(token) = self.store.find_access_token(jti).await? else {
            return Ok(None);
        };
        let Some(user) = self.store.find_user(token.user_id).await? else {
            return Ok(None);
        };
        Ok(Some(CachedTokenEntry { token, user }))
    }

    fn cache_key(&self, jti: &str) -> String {
        format!("{}{}", self.settings.prefix, jti)
    }

    fn ttl(&self) -> Option<Duration> {
        self.settings.ttl_seconds.map(Duration::from_secs)
    }
}

/// SHA-256 hex digest of a credential secret, the stored form.
pub fn hash_token_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    let computed = hash_token_secret(secret);
    constant_time_compare(computed.as_bytes(), stored_hash.as_bytes())
}

/// Compare two byte slices without short-circuiting on the first
/// difference, so lookup timing reveals nothing about the stored hash.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}
