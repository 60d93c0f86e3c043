use crate::models::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Access token record.
///
/// Created by the authorization engine at issuance; this service links it
/// into a chain, stamps refreshes, and marks it revoked. Rows are never
/// deleted except by the expiry sweep.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccessToken {
    /// The `jti` claim of the issued token, used as the primary key.
    pub jti: String,
    pub user_id: Uuid,
    pub scopes: Json<Vec<String>>,
    /// SHA-256 hex digest of the secret half of the presented credential.
    pub token_hash: String,
    pub chain_id: Option<Uuid>,
    pub revoked: bool,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < Utc::now(),
            None => false,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.revoked && !self.is_expired()
    }
}

/// Refresh token record. Single use: once `used_at` is set, any further
/// presentation is a reuse event and revokes the whole chain.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub jti: String,
    pub user_id: Uuid,
    pub chain_id: Option<Uuid>,
    /// Previous refresh token in the rotation lineage; `None` for the
    /// first token of a fresh chain.
    pub previous_jti: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshToken {
    pub fn was_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at < Utc::now(),
            None => false,
        }
    }
}

/// Cache projection of an access token plus its owning principal.
///
/// Not a source of truth: always re-derivable from the token store and
/// invalidated whenever the underlying record changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTokenEntry {
    pub token: AccessToken,
    pub user: User,
}
