/// Postgres-backed token store
use crate::config::DatabaseSettings;
use crate::db::TokenStore;
use crate::error::{Result, TokenError};
use crate::models::{AccessToken, RefreshToken, TokenBindingMetadata, User};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const ACCESS_TOKEN_COLUMNS: &str =
    "jti, user_id, scopes, token_hash, chain_id, revoked, last_refreshed_at, created_at, expires_at";

const REFRESH_TOKEN_COLUMNS: &str =
    "jti, user_id, chain_id, previous_jti, used_at, revoked, created_at, expires_at";

const BINDING_COLUMNS: &str = "token_jti, client_fingerprint, session_id, ip_address, ip_history, \
     ip_change_count, country_code, city, last_geo_notification_at, user_agent, created_at, updated_at";

#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout))
            .connect(&settings.url)
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| TokenError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl TokenStore for PgTokenStore {
    async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(user)
    }

    async fn insert_access_token(&self, token: &AccessToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_tokens (jti, user_id, scopes, token_hash, chain_id, revoked,
                                       last_refreshed_at, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&token.jti)
        .bind(token.user_id)
        .bind(&token.scopes)
        .bind(&token.token_hash)
        .bind(token.chain_id)
        .bind(token.revoked)
        .bind(token.last_refreshed_at)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_access_token(&self, jti: &str) -> Result<Option<AccessToken>> {
        let token = sqlx::query_as::<_, AccessToken>(&format!(
            "SELECT {} FROM access_tokens WHERE jti = $1",
            ACCESS_TOKEN_COLUMNS
        ))
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(token)
    }

    async fn touch_last_refreshed(&self, jti: &str) -> Result<AccessToken> {
        let token = sqlx::query_as::<_, AccessToken>(&format!(
            "UPDATE access_tokens SET last_refreshed_at = $1 WHERE jti = $2 RETURNING {}",
            ACCESS_TOKEN_COLUMNS
        ))
        .bind(Utc::now())
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        token.ok_or(TokenError::TokenCreationFailure)
    }

    async fn delete_expired_tokens(&self) -> Result<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        let jtis = sqlx::query_scalar::<_, String>(
            r#"
            DELETE FROM access_tokens
            WHERE expires_at IS NOT NULL AND expires_at < NOW()
            RETURNING jti
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            DELETE FROM refresh_tokens
            WHERE expires_at IS NOT NULL AND expires_at < NOW()
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(jtis)
    }

    async fn insert_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (jti, user_id, chain_id, previous_jti, used_at, revoked,
                                        created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&token.jti)
        .bind(token.user_id)
        .bind(token.chain_id)
        .bind(&token.previous_jti)
        .bind(token.used_at)
        .bind(token.revoked)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_refresh_token(&self, jti: &str) -> Result<Option<RefreshToken>> {
        let token = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {} FROM refresh_tokens WHERE jti = $1",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(token)
    }

    async fn link_tokens(
        &self,
        access_jti: &str,
        refresh_jti: &str,
        chain_id: Uuid,
        previous_jti: Option<&str>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        let updated = sqlx::query("UPDATE access_tokens SET chain_id = $1 WHERE jti = $2")
            .bind(chain_id)
            .bind(access_jti)
            .execute(&mut *tx)
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        if updated.rows_affected() == 0 {
            // Dropping the transaction rolls back the writes above.
            return Err(TokenError::ChainLinkFailure(format!(
                "access token {} not found",
                access_jti
            )));
        }

        let updated =
            sqlx::query("UPDATE refresh_tokens SET chain_id = $1, previous_jti = $2 WHERE jti = $3")
                .bind(chain_id)
                .bind(previous_jti)
                .bind(refresh_jti)
                .execute(&mut *tx)
                .await
                .map_err(|e| TokenError::Database(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(TokenError::ChainLinkFailure(format!(
                "refresh token {} not found",
                refresh_jti
            )));
        }

        if let Some(previous_jti) = previous_jti {
            sqlx::query("UPDATE refresh_tokens SET used_at = $1 WHERE jti = $2")
                .bind(Utc::now())
                .bind(previous_jti)
                .execute(&mut *tx)
                .await
                .map_err(|e| TokenError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }

    async fn revoke_chain(&self, chain_id: Uuid) -> Result<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        let jtis = sqlx::query_scalar::<_, String>(
            "UPDATE access_tokens SET revoked = TRUE WHERE chain_id = $1 RETURNING jti",
        )
        .bind(chain_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE chain_id = $1")
            .bind(chain_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(jtis)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        let jtis = sqlx::query_scalar::<_, String>(
            "UPDATE access_tokens SET revoked = TRUE WHERE user_id = $1 RETURNING jti",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(jtis)
    }

    async fn create_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_binding_metadata (token_jti, client_fingerprint, session_id,
                ip_address, ip_history, ip_change_count, country_code, city,
                last_geo_notification_at, user_agent, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&metadata.token_jti)
        .bind(&metadata.client_fingerprint)
        .bind(&metadata.session_id)
        .bind(&metadata.ip_address)
        .bind(&metadata.ip_history)
        .bind(metadata.ip_change_count)
        .bind(&metadata.country_code)
        .bind(&metadata.city)
        .bind(metadata.last_geo_notification_at)
        .bind(&metadata.user_agent)
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }

    async fn find_binding_metadata(&self, token_jti: &str) -> Result<Option<TokenBindingMetadata>> {
        let metadata = sqlx::query_as::<_, TokenBindingMetadata>(&format!(
            "SELECT {} FROM token_binding_metadata WHERE token_jti = $1",
            BINDING_COLUMNS
        ))
        .bind(token_jti)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(metadata)
    }

    async fn update_binding_metadata(&self, metadata: &TokenBindingMetadata) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE token_binding_metadata
            SET ip_address = $1, ip_history = $2, ip_change_count = $3, country_code = $4,
                city = $5, last_geo_notification_at = $6, user_agent = $7, updated_at = $8
            WHERE token_jti = $9
            "#,
        )
        .bind(&metadata.ip_address)
        .bind(&metadata.ip_history)
        .bind(metadata.ip_change_count)
        .bind(&metadata.country_code)
        .bind(&metadata.city)
        .bind(metadata.last_geo_notification_at)
        .bind(&metadata.user_agent)
        .bind(metadata.updated_at)
        .bind(&metadata.token_jti)
        .execute(&self.pool)
        .await
        .map_err(|e| TokenError::Database(e.to_string()))?;

        Ok(())
    }
}
