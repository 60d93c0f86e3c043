//! Issuance orchestrator: the only entry point for minting or rotating a
//! token set.
//!
//! Login and refresh both delegate token creation to the authorization
//! engine, then correlate the returned strings with their server-side
//! records by extracting identifiers: the `jti` claim from the signed
//! access token's middle segment, and the `refresh_token_id` field from
//! the opaque refresh wrap. An issued token that cannot be located
//! afterwards is an invariant violation (`TokenCreationFailure`) —
//! issuance must always be traceable.

use crate::config::AuthorizationSettings;
use crate::db::TokenStore;
use crate::error::{Result, TokenError};
use crate::security::{OpaqueTokenCipher, TokenCache};
use crate::services::authorization::{AuthorizationEngine, GrantRequest, GrantType};
use crate::services::token_binding::{RequestContext, TokenBindingService};
use crate::services::token_chain::TokenChainService;
use base64::prelude::*;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Token set handed back to the authentication layer.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct OAuthTokenService {
    engine: Arc<dyn AuthorizationEngine>,
    store: Arc<dyn TokenStore>,
    chain: TokenChainService,
    binding: TokenBindingService,
    cache: TokenCache,
    cipher: OpaqueTokenCipher,
    settings: AuthorizationSettings,
}

impl OAuthTokenService {
    pub fn new(
        engine: Arc<dyn AuthorizationEngine>,
        store: Arc<dyn TokenStore>,
        chain: TokenChainService,
        binding: TokenBindingService,
        cache: TokenCache,
        cipher: OpaqueTokenCipher,
        settings: AuthorizationSettings,
    ) -> Self {
        Self {
            engine,
            store,
            chain,
            binding,
            cache,
            cipher,
            settings,
        }
    }

    /// Create access and refresh tokens for an already-authenticated user.
    pub async fn create_token_set(
        &self,
        ctx: &RequestContext,
        user_id: Uuid,
        scopes: &[String],
        session_id: &str,
        fingerprint: &str,
    ) -> Result<TokenSet> {
        let grant = GrantRequest {
            grant_type: GrantType::PreAuthenticated,
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            user_id: Some(user_id),
            scope: scopes.join(" "),
            refresh_token: None,
        };
        let response = self.engine.respond_to_token_request(&grant).await?;

        let access_jti = extract_jti_from_signed_token(&response.access_token)?;
        let access_token = self
            .store
            .find_access_token(&access_jti)
            .await?
            .ok_or(TokenError::TokenCreationFailure)?;
        self.cache.cache_token(&access_token).await?;

        if let Some(refresh_token_string) = &response.refresh_token {
            let refresh_jti = self.cipher.extract_refresh_token_id(refresh_token_string)?;
            let refresh_token = self
                .store
                .find_refresh_token(&refresh_jti)
                .await?
                .ok_or(TokenError::TokenCreationFailure)?;

            // Fresh chain: no previous token to inherit from.
            self.chain
                .link_tokens(&access_token, &refresh_token, None)
                .await?;
        }

        self.binding
            .create_binding_metadata(ctx, &access_jti, session_id, fingerprint)
            .await?;

        info!(
            %user_id,
            access_jti = %access_jti,
            client_ip = %ctx.ip,
            "Issued token set"
        );

        Ok(TokenSet {
            access_token: response.access_token,
            expires_in: response.expires_in,
            refresh_token: response.refresh_token,
        })
    }

    /// Rotate a token set using a refresh token.
    ///
    /// `TokenReuseDetected` and `TokenRevoked` propagate unchanged — they
    /// are the fatal, non-recoverable outcomes of this method. Binding
    /// validation is not re-run here; it belongs to resource requests.
    pub async fn refresh_token(
        &self,
        ctx: &RequestContext,
        refresh_token_string: &str,
    ) -> Result<TokenSet> {
        let previous_jti = self.cipher.extract_refresh_token_id(refresh_token_string)?;
        let previous = self
            .store
            .find_refresh_token(&previous_jti)
            .await?
            .ok_or(TokenError::RefreshTokenNotFound)?;

        self.chain.validate_refresh_token(&previous).await?;

        let grant = GrantRequest {
            grant_type: GrantType::RefreshToken,
            client_id: self.settings.client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            user_id: None,
            scope: self.settings.refresh_scope.clone(),
            refresh_token: Some(refresh_token_string.to_string()),
        };
        let response = self.engine.respond_to_token_request(&grant).await?;

        let new_access_jti = extract_jti_from_signed_token(&response.access_token)?;
        let new_refresh_string = response
            .refresh_token
            .as_deref()
            .ok_or(TokenError::TokenCreationFailure)?;
        let new_refresh_jti = self.cipher.extract_refresh_token_id(new_refresh_string)?;

        let new_access = self
            .store
            .find_access_token(&new_access_jti)
            .await?
            .ok_or(TokenError::TokenCreationFailure)?;
        let new_refresh = self
            .store
            .find_refresh_token(&new_refresh_jti)
            .await?
            .ok_or(TokenError::TokenCreationFailure)?;

        self.chain
            .link_tokens(&new_access, &new_refresh, Some(&previous.jti))
            .await?;

        let updated = self.store.touch_last_refreshed(&new_access.jti).await?;
        self.cache.cache_token(&updated).await?;

        info!(
            user_id = %updated.user_id,
            access_jti = %updated.jti,
            chain_id = ?updated.chain_id,
            client_ip = %ctx.ip,
            "Rotated token set"
        );

        Ok(TokenSet {
            access_token: response.access_token.clone(),
            expires_in: response.expires_in,
            refresh_token: response.refresh_token,
        })
    }
}

/// Read the `jti` claim out of a signed token without verifying it.
///
/// The token must be the usual three dot-delimited segments; the middle
/// one base64url-decodes to a JSON claim set. Verification is the
/// engine's job — this only correlates the string with its record.
fn extract_jti_from_signed_token(token: &str) -> Result<String> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::MalformedToken(
            "signed token must have three dot-delimited segments".to_string(),
        ));
    };

    let decoded = BASE64_URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| {
            TokenError::MalformedToken("signed token payload is not valid base64url".to_string())
        })?;

    let claims: serde_json::Value = serde_json::from_slice(&decoded).map_err(|_| {
        TokenError::MalformedToken("signed token payload is not JSON".to_string())
    })?;

    claims
        .get("jti")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or_else(|| TokenError::MalformedToken("signed token missing jti claim".to_string()))
}
