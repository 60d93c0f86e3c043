#![allow(dead_code)]

use base64::prelude::*;
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::types::Json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use token_service::cache::InMemoryKvStore;
use token_service::config::{AuthorizationSettings, TokenBindingSettings, TokenCacheSettings};
use token_service::db::{InMemoryTokenStore, TokenStore};
use token_service::error::{Result, TokenError};
use token_service::models::{AccessToken, GeoLocation, RefreshToken, User};
use token_service::security::{hash_token_secret, OpaqueTokenCipher, TokenCache};
use token_service::services::{
    AuthorizationEngine, GeoResolver, GrantRequest, GrantType, OAuthTokenService, RequestContext,
    SecurityNotifier, TokenBindingService, TokenChainService, TokenGrantResponse,
};
use uuid::Uuid;

pub const TEST_FINGERPRINT: &str = "fp-primary";
pub const TEST_SESSION_ID: &str = "session-primary";

pub fn test_cipher() -> OpaqueTokenCipher {
    let key = BASE64_STANDARD.encode([42u8; 32]);
    OpaqueTokenCipher::new(&key).unwrap()
}

/// Engine double: answers grants with a signed-token lookalike and an
/// opaque refresh wrap, persisting the matching records the way the real
/// engine shares the token store with this service.
pub struct MockAuthorizationEngine {
    store: Arc<InMemoryTokenStore>,
    cipher: OpaqueTokenCipher,
    skip_persistence: AtomicBool,
}

impl MockAuthorizationEngine {
    pub fn new(store: Arc<InMemoryTokenStore>) -> Self {
        Self {
            store,
            cipher: test_cipher(),
            skip_persistence: AtomicBool::new(false),
        }
    }

    /// Make issued tokens untraceable, to exercise the orchestrator's
    /// issuance-traceability invariant.
    pub fn skip_persistence(&self) {
        self.skip_persistence.store(true, Ordering::SeqCst);
    }

    fn signed_token(jti: &str, user_id: Uuid) -> String {
        let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = BASE64_URL_SAFE_NO_PAD
            .encode(json!({"jti": jti, "sub": user_id.to_string()}).to_string().as_bytes());
        format!("{}.{}.test-signature", header, payload)
    }
}

#[async_trait::async_trait]
impl AuthorizationEngine for MockAuthorizationEngine {
    async fn respond_to_token_request(&self, grant: &GrantRequest) -> Result<TokenGrantResponse> {
        let user_id = match grant.grant_type {
            GrantType::PreAuthenticated => grant
                .user_id
                .ok_or_else(|| TokenError::AuthorizationEngine("missing user_id".to_string()))?,
            GrantType::RefreshToken => {
                let refresh_string = grant.refresh_token.as_deref().ok_or_else(|| {
                    TokenError::AuthorizationEngine("missing refresh_token".to_string())
                })?;
                let jti = self.cipher.extract_refresh_token_id(refresh_string)?;
                self.store
                    .find_refresh_token(&jti)
                    .await?
                    .ok_or_else(|| {
                        TokenError::AuthorizationEngine("unknown refresh token".to_string())
                    })?
                    .user_id
            }
        };

        let now = Utc::now();
        let access_jti = format!("at-{}", Uuid::new_v4());
        let refresh_jti = format!("rt-{}", Uuid::new_v4());

        if !self.skip_persistence.load(Ordering::SeqCst) {
            let scopes: Vec<String> =
                grant.scope.split_whitespace().map(str::to_string).collect();
            self.store
                .insert_access_token(&AccessToken {
                    jti: access_jti.clone(),
                    user_id,
                    scopes: Json(scopes),
                    token_hash: hash_token_secret(&format!("{}-secret", access_jti)),
                    chain_id: None,
                    revoked: false,
                    last_refreshed_at: None,
                    created_at: now,
                    expires_at: Some(now + Duration::hours(1)),
                })
                .await?;
            self.store
                .insert_refresh_token(&RefreshToken {
                    jti: refresh_jti.clone(),
                    user_id,
                    chain_id: None,
                    previous_jti: None,
                    used_at: None,
                    revoked: false,
                    created_at: now,
                    expires_at: Some(now + Duration::days(30)),
                })
                .await?;
        }

        let refresh_token = self
            .cipher
            .encrypt_payload(&json!({"refresh_token_id": refresh_jti}))?;

        Ok(TokenGrantResponse {
            access_token: Self::signed_token(&access_jti, user_id),
            token_type: Some("Bearer".to_string()),
            expires_in: 3600,
            refresh_token: Some(refresh_token),
        })
    }
}

/// Geo double mapping fixed IPs to locations; private addresses get the
/// local marker, anything unmapped resolves unknown.
#[derive(Default)]
pub struct StaticGeoResolver {
    map: HashMap<IpAddr, GeoLocation>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: &str, country_code: &str, country: &str, city: &str) -> Self {
        self.map.insert(
            ip.parse().unwrap(),
            GeoLocation {
                country: Some(country.to_string()),
                country_code: Some(country_code.to_string()),
                city: Some(city.to_string()),
                is_private: false,
            },
        );
        self
    }
}

#[async_trait::async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: IpAddr) -> GeoLocation {
        if token_service::services::geo::is_private_ip(ip) {
            return GeoLocation::local();
        }
        self.map
            .get(&ip)
            .cloned()
            .unwrap_or_else(GeoLocation::unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConcurrentAccess {
        user_id: Uuid,
        current_ip: String,
        concurrent_ips: Vec<String>,
    },
    LocationChange {
        user_id: Uuid,
        country_code: Option<String>,
        ip: String,
    },
}

/// Notifier double that records every alert and can simulate delivery
/// failures.
#[derive(Default)]
pub struct RecordingNotifier {
    records: Mutex<Vec<Notification>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Notification> {
        self.records.lock().unwrap().clone()
    }

    fn push(&self, record: Notification) -> Result<()> {
        self.records.lock().unwrap().push(record);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TokenError::Notification("simulated delivery failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SecurityNotifier for RecordingNotifier {
    async fn concurrent_access(
        &self,
        user: &User,
        current_ip: &str,
        concurrent_ips: &[String],
        _user_agent: Option<&str>,
    ) -> Result<()> {
        self.push(Notification::ConcurrentAccess {
            user_id: user.id,
            current_ip: current_ip.to_string(),
            concurrent_ips: concurrent_ips.to_vec(),
        })
    }

    async fn location_change(
        &self,
        user: &User,
        location: &GeoLocation,
        ip: &str,
        _user_agent: Option<&str>,
    ) -> Result<()> {
        self.push(Notification::LocationChange {
            user_id: user.id,
            country_code: location.country_code.clone(),
            ip: ip.to_string(),
        })
    }
}

/// Fully wired service graph over the in-memory backends.
pub struct TestHarness {
    pub store: Arc<InMemoryTokenStore>,
    pub kv: Arc<InMemoryKvStore>,
    pub cache: TokenCache,
    pub chain: TokenChainService,
    pub binding: TokenBindingService,
    pub tokens: OAuthTokenService,
    pub engine: Arc<MockAuthorizationEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub cipher: OpaqueTokenCipher,
}

pub fn harness() -> TestHarness {
    harness_with_geo(default_geo())
}

pub fn default_geo() -> StaticGeoResolver {
    StaticGeoResolver::new()
        .with("1.2.3.4", "US", "United States", "New York")
        .with("5.6.7.8", "US", "United States", "Chicago")
        .with("9.9.9.9", "US", "United States", "Seattle")
        .with("77.88.99.1", "DE", "Germany", "Berlin")
}

pub fn harness_with_geo(geo: StaticGeoResolver) -> TestHarness {
    let store = Arc::new(InMemoryTokenStore::new());
    let kv = Arc::new(InMemoryKvStore::new());
    let cipher = test_cipher();

    let cache = TokenCache::new(
        store.clone(),
        kv.clone(),
        TokenCacheSettings::default(),
    );
    let chain = TokenChainService::new(store.clone(), cache.clone());

    let geo: Arc<dyn GeoResolver> = Arc::new(geo);
    let notifier = Arc::new(RecordingNotifier::new());
    let binding = TokenBindingService::new(
        store.clone(),
        kv.clone(),
        cache.clone(),
        geo,
        notifier.clone(),
        TokenBindingSettings::default(),
    );

    let engine = Arc::new(MockAuthorizationEngine::new(store.clone()));
    let tokens = OAuthTokenService::new(
        engine.clone(),
        store.clone(),
        chain.clone(),
        binding.clone(),
        cache.clone(),
        cipher.clone(),
        AuthorizationSettings {
            token_endpoint: None,
            client_id: "first-party".to_string(),
            client_secret: "first-party-secret".to_string(),
            refresh_scope: "access-api".to_string(),
            refresh_token_key: BASE64_STANDARD.encode([42u8; 32]),
        },
    );

    TestHarness {
        store,
        kv,
        cache,
        chain,
        binding,
        tokens,
        engine,
        notifier,
        cipher,
    }
}

pub async fn create_user(store: &InMemoryTokenStore) -> User {
    let user = User {
        id: Uuid::new_v4(),
        username: format!("user-{}", Uuid::new_v4().simple()),
        email: "user@example.com".to_string(),
        created_at: Utc::now(),
    };
    store.insert_user(&user).await.unwrap();
    user
}

pub fn ctx(ip: &str) -> RequestContext {
    RequestContext {
        ip: ip.parse().unwrap(),
        user_agent: Some("test-agent/1.0".to_string()),
        fingerprint: TEST_FINGERPRINT.to_string(),
        session_id: Some(TEST_SESSION_ID.to_string()),
    }
}

/// Read the jti claim back out of a signed-token lookalike.
pub fn jwt_jti(token: &str) -> String {
    let payload = token.split('.').nth(1).unwrap();
    let decoded = BASE64_URL_SAFE_NO_PAD.decode(payload).unwrap();
    let claims: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
    claims["jti"].as_str().unwrap().to_string()
}

pub fn ctx_with(ip: &str, fingerprint: &str, session_id: &str) -> RequestContext {
    RequestContext {
        ip: ip.parse().unwrap(),
        user_agent: Some("test-agent/1.0".to_string()),
        fingerprint: fingerprint.to_string(),
        session_id: Some(session_id.to_string()),
    }
}
