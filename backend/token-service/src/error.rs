use thiserror::Error;

pub type Result<T> = std::result::Result<T, TokenError>;

#[derive(Debug, Error)]
pub enum TokenError {
    /// A refresh token was presented a second time. The whole chain has
    /// been revoked by the time this error is returned.
    #[error("Refresh token has already been used; all tokens in its chain have been revoked")]
    TokenReuseDetected,

    #[error("Token has been revoked")]
    TokenRevoked,

    #[error("Refresh token not found")]
    RefreshTokenNotFound,

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Failed to link tokens in chain: {0}")]
    ChainLinkFailure(String),

    #[error("Failed to retrieve newly created token after issuance")]
    TokenCreationFailure,

    #[error("Authorization engine error: {0}")]
    AuthorizationEngine(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TokenError {
    /// Security-significant failures get a dedicated log channel and must
    /// never be collapsed into a generic server error in metrics.
    pub fn is_security_event(&self) -> bool {
        matches!(self, TokenError::TokenReuseDetected)
    }

    /// Structural failures indicate a programming or protocol defect
    /// rather than a hostile client.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TokenError::MalformedToken(_)
                | TokenError::ChainLinkFailure(_)
                | TokenError::TokenCreationFailure
        )
    }
}

// Conversions from external error types
impl From<sqlx::Error> for TokenError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {}", err);
        TokenError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for TokenError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!("Redis error: {}", err);
        TokenError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(err: serde_json::Error) -> Self {
        TokenError::Internal(format!("serialization error: {}", err))
    }
}

impl From<crate::cache::KvError> for TokenError {
    fn from(err: crate::cache::KvError) -> Self {
        TokenError::Cache(err.to_string())
    }
}
