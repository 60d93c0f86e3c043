//! Token chain ledger.
//!
//! Every login starts a chain; every refresh rotates the chain forward by
//! linking a new access/refresh pair to it and stamping the previous
//! refresh token as used. A used refresh token presented again is the
//! canonical replay signal: the instant it is seen, the whole chain is
//! revoked and the caller gets `TokenReuseDetected`.
//!
//! Refresh-token state machine: `unused -> used` on rotation, and from
//! either state `-> revoked` (reuse detection or an explicit
//! sign-out-everywhere). There is no way back to `unused`.

use crate::db::TokenStore;
use crate::error::{Result, TokenError};
use crate::models::{AccessToken, RefreshToken};
use crate::security::TokenCache;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct TokenChainService {
    store: Arc<dyn TokenStore>,
    cache: TokenCache,
}

impl TokenChainService {
    pub fn new(store: Arc<dyn TokenStore>, cache: TokenCache) -> Self {
        Self { store, cache }
    }

    /// Mint a chain id for a fresh token set.
    pub fn generate_chain_id() -> Uuid {
        Uuid::new_v4()
    }

    /// Link an access/refresh pair into a chain.
    ///
    /// With `previous_jti` given the pair inherits that token's chain and
    /// the previous token is stamped used; without it a new chain starts.
    /// The underlying writes are a single transaction — on any failure
    /// nothing is linked and `ChainLinkFailure` is returned.
    pub async fn link_tokens(
        &self,
        access_token: &AccessToken,
        refresh_token: &RefreshToken,
        previous_jti: Option<&str>,
    ) -> Result<()> {
        let chain_id = self.resolve_chain_id(previous_jti).await?;

        self.store
            .link_tokens(&access_token.jti, &refresh_token.jti, chain_id, previous_jti)
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    access_jti = %access_token.jti,
                    refresh_jti = %refresh_token.jti,
                    "Failed to link tokens in chain"
                );
                match e {
                    TokenError::ChainLinkFailure(_) => e,
                    other => TokenError::ChainLinkFailure(other.to_string()),
                }
            })?;

        // The access token row changed; keep the cache projection current.
        if let Some(updated) = self.store.find_access_token(&access_token.jti).await? {
            self.cache.cache_token(&updated).await?;
        }

        Ok(())
    }

    /// Check a refresh token before rotation.
    ///
    /// Reuse revokes the entire chain as a side effect and returns
    /// `TokenReuseDetected`; a revoked token returns `TokenRevoked`.
    pub async fn validate_refresh_token(&self, refresh_token: &RefreshToken) -> Result<()> {
        if refresh_token.was_used() {
            warn!(
                refresh_jti = %refresh_token.jti,
                chain_id = ?refresh_token.chain_id,
                used_at = ?refresh_token.used_at,
                "Refresh token reuse detected; revoking entire chain"
            );

            if let Some(chain_id) = refresh_token.chain_id {
                self.revoke_chain_detached(chain_id).await?;
            }

            return Err(TokenError::TokenReuseDetected);
        }

        if refresh_token.revoked {
            return Err(TokenError::TokenRevoked);
        }

        Ok(())
    }

    /// Revoke every access and refresh token in the chain. Idempotent.
    pub async fn revoke_chain(&self, chain_id: Uuid) -> Result<()> {
        let revoked_jtis = self.store.revoke_chain(chain_id).await?;
        for jti in &revoked_jtis {
            self.cache.invalidate(jti).await?;
        }

        info!(%chain_id, tokens_revoked = revoked_jtis.len(), "Token chain revoked");
        Ok(())
    }

    /// Run the revocation on its own task so a cancelled request cannot
    /// abort it once started; the result is still awaited and reported.
    async fn revoke_chain_detached(&self, chain_id: Uuid) -> Result<()> {
        let ledger = self.clone();
        tokio::spawn(async move { ledger.revoke_chain(chain_id).await })
            .await
            .map_err(|e| TokenError::Internal(format!("chain revocation task failed: {}", e)))?
    }

    async fn resolve_chain_id(&self, previous_jti: Option<&str>) -> Result<Uuid> {
        if let Some(previous_jti) = previous_jti {
            if let Some(previous) = self.store.find_refresh_token(previous_jti).await? {
                if let Some(chain_id) = previous.chain_id {
                    return Ok(chain_id);
                }
            }
        }

        Ok(Self::generate_chain_id())
    }
}
