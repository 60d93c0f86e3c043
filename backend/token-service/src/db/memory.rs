/// In-memory token store for development and hermetic tests.
///
/// A single `RwLock` over all record sets makes the multi-row operations
/// (`link_tokens`, `revoke_chain`, `revoke_all_for_user`) naturally atomic:
/// validation happens before any mutation, so a failed call leaves no
/// partial writes behind.
use crate::db::TokenStore;
use crate::error::{Result, TokenError};
use crate::models::{AccessToken, RefreshToken, TokenBindingMetadata, User};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, RefreshToken>,
    bindings: HashMap<String, TokenBindingMetadata>,
}

#[derive(Clone, Default)]
pub struct InMemoryTokenStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&user_id).cloned())
    }

    async fn insert_access_token(&self, token: &AccessToken) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.access_tokens.insert(token.jti.clone(), token.clone());
        Ok(())
    }

    async fn find_access_token(&self, jti: &str) -> Result<Option<AccessToken>> {
        let inner = self.inner.read().await;
        Ok(inner.access_tokens.get(jti).cloned())
    }

    async fn touch_last_refreshed(&self, jti: &str) -> Result<AccessToken> {
        let mut inner = self.inner.write().await;
        let token = inner
            .access_tokens
            .get_mut(jti)
            .ok_or(TokenError::TokenCreationFailure)?;
        token.last_refreshed_at = Some(Utc::now());
        Ok(token.clone())
    }

    async fn delete_expired_tokens(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        let expired: Vec<String> = inner
            .access_tokens
            .values()
            .filter(|token| matches!(token.expires_at, Some(expires_at) if expires_at < now))
            .map(|token| token.jti.clone())
            .collect();

        for jti in &expired {
            inner.access_tokens.remove(jti);
            inner.bindings.remove(jti);
        }

        inner
            .refresh_tokens
            .retain(|_, token| !matches!(token.expires_at, Some(expires_at) if expires_at < now));

        Ok(expired)
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .refresh_tokens
            .insert(token.jti.clone(), token.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, jti: &str) -> Result<Option<RefreshToken>> {
        let inner = self.inner.read().await;
        Ok(inner.refresh_tokens.get(jti).cloned())
    }

    async fn link_tokens(
        &self,
        access_jti: &str,
        refresh_jti: &str,
        chain_id: Uuid,
        previous_jti: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;

        // Validate all targets before touching anything so a failure
        // cannot leave a half-linked pair behind.
        if !inner.access_tokens.contains_key(access_jti) {
            return Err(TokenError::ChainLinkFailure(format!(
                "access token {} not found",
                access_jti
            )));
        }
        if !inner.refresh_tokens.contains_key(refresh_jti) {
            return Err(TokenError::ChainLinkFailure(format!(
                "refresh token {} not found",
                refresh_jti
            )));
        }

        if let Some(access) = inner.access_tokens.get_mut(access_jti) {
            access.chain_id = Some(chain_id);
        }
        if let Some(refresh) = inner.refresh_tokens.get_mut(refresh_jti) {
            refresh.chain_id = Some(chain_id);
            refresh.previous_jti = previous_jti.map(str::to_string);
        }
        if let Some(previous_jti) = previous_jti {
            if let Some(previous) = inner.refresh_tokens.get_mut(previous_jti) {
                previous.used_at = Some(Utc::now());
            }
        }

        Ok(())
    }

    async fn revoke_chain(&self, chain_id: Uuid) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let mut jtis = Vec::new();

        for token in inner.access_tokens.values_mut() {
            if token.chain_id == Some(chain_id) {
                token.revoked = true;
                jtis.push(token.jti.clone());
            }
        }
        for token in inner.refresh_tokens.values_mut() {
            if token.chain_id == Some(chain_id) {
                token.revoked = true;
            }
        }

        Ok(jtis)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let mut jtis = Vec::new();

        for token in inner.access_tokens.values_mut() {
            if token.user_id == user_id {
                token.revoked = true;
                jtis.push(token.jti.clone());
            }
        }
        for token in inner.refresh_tokens.values_mut() {
            if token.user_id == user_id {
                token.revoked = true;
            }
        }

        Ok(jtis)
    }

    async fn create_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .bindings
            .insert(metadata.token_jti.clone(), metadata.clone());
        Ok(())
    }

    async fn find_binding_metadata(&self, token_jti: &str) -> Result<Option<TokenBindingMetadata>> {
        let inner = self.inner.read().await;
        Ok(inner.bindings.get(token_jti).cloned())
    }

    async fn update_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .bindings
            .insert(metadata.token_jti.clone(), metadata.clone());
        Ok(())
    }
}
