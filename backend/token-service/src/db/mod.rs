//! Durable store for tokens, chains, and binding metadata.
//!
//! The store is injected as a capability so the lifecycle logic stays
//! independent of the storage engine. [`PgTokenStore`] is the production
//! backend; [`InMemoryTokenStore`] backs development and the hermetic test
//! suite. Multi-row mutations (`link_tokens`, `revoke_chain`,
//! `revoke_all_for_user`) are atomic in every backend: either all rows
//! change or none do.

use crate::error::Result;
use crate::models::{AccessToken, RefreshToken, TokenBindingMetadata, User};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTokenStore;
pub use postgres::PgTokenStore;

#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    // Principals
    async fn insert_user(&self, user: &User) -> Result<()>;
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;

    // Access tokens
    async fn insert_access_token(&self, token: &AccessToken) -> Result<()>;
    async fn find_access_token(&self, jti: &str) -> Result<Option<AccessToken>>;

    /// Stamp the last-refreshed time and return the updated row.
    async fn touch_last_refreshed(&self, jti: &str) -> Result<AccessToken>;

    /// Delete access and refresh tokens whose expiry has passed. Returns
    /// the jtis of the deleted access tokens so cache entries can be
    /// invalidated.
    async fn delete_expired_tokens(&self) -> Result<Vec<String>>;

    // Refresh tokens
    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<()>;
    async fn find_refresh_token(&self, jti: &str) -> Result<Option<RefreshToken>>;

    /// Atomically link an access/refresh pair into `chain_id`, recording
    /// the rotation lineage and stamping the previous refresh token as
    /// used when one is given.
    async fn link_tokens(
        &self,
        access_jti: &str,
        refresh_jti: &str,
        chain_id: Uuid,
        previous_jti: Option<&str>,
    ) -> Result<()>;

    /// Mark every token in the chain revoked. Idempotent. Returns the
    /// affected access-token jtis.
    async fn revoke_chain(&self, chain_id: Uuid) -> Result<Vec<String>>;

    /// Mark every token belonging to the principal revoked, access and
    /// refresh alike. Idempotent. Returns the affected access-token jtis.
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>>;

    // Binding metadata
    async fn create_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()>;
    async fn find_binding_metadata(&self, token_jti: &str) -> Result<Option<TokenBindingMetadata>>;
    async fn update_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()>;
}
