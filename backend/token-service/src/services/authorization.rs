//! Seam to the external authorization engine.
//!
//! The engine owns grammar, signing, and persistence of issued tokens;
//! this service only sends it grant requests and reads the JSON body back.
//! Two grant types are in play: `pre_authenticated` for logins that were
//! already verified upstream, and the standard `refresh_token` grant.

use crate::error::{Result, TokenError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    PreAuthenticated,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreAuthenticated => "pre_authenticated",
            Self::RefreshToken => "refresh_token",
        }
    }
}

/// One grant request to the engine.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub grant_type: GrantType,
    pub client_id: String,
    pub client_secret: String,
    pub user_id: Option<Uuid>,
    pub scope: String,
    pub refresh_token: Option<String>,
}

/// JSON body the engine answers grant requests with.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrantResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[async_trait::async_trait]
pub trait AuthorizationEngine: Send + Sync {
    async fn respond_to_token_request(&self, grant: &GrantRequest) -> Result<TokenGrantResponse>;
}

/// HTTP backend posting grants to the engine's token endpoint as a form
/// body, the shape the engine's own first-party clients use.
#[derive(Clone)]
pub struct HttpAuthorizationEngine {
    http: Client,
    token_endpoint: String,
}

impl HttpAuthorizationEngine {
    pub fn new(token_endpoint: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(ENGINE_TIMEOUT)
            .build()
            .map_err(|e| TokenError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_endpoint,
        })
    }
}

#[async_trait::async_trait]
impl AuthorizationEngine for HttpAuthorizationEngine {
    async fn respond_to_token_request(&self, grant: &GrantRequest) -> Result<TokenGrantResponse> {
        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", grant.grant_type.as_str().to_string()),
            ("client_id", grant.client_id.clone()),
            ("client_secret", grant.client_secret.clone()),
            ("scope", grant.scope.clone()),
        ];
        if let Some(user_id) = grant.user_id {
            form.push(("user_id", user_id.to_string()));
        }
        if let Some(refresh_token) = &grant.refresh_token {
            form.push(("refresh_token", refresh_token.clone()));
        }

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::AuthorizationEngine(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TokenError::AuthorizationEngine(format!(
                "token request rejected with status {}",
                response.status()
            )));
        }

        response.json::<TokenGrantResponse>().await.map_err(|e| {
            TokenError::AuthorizationEngine(format!("invalid token response body: {}", e))
        })
    }
}
