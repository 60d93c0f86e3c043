//! Per-request token binding defense.
//!
//! A token is bound at issuance to the client fingerprint, session id, and
//! network origin that created it. Every resource request re-validates the
//! binding in a fixed order, short-circuiting on the first failure:
//!
//! 1. concurrent-IP window (theft signal, revokes the whole principal)
//! 2. client fingerprint
//! 3. session id
//! 4. IP change heuristics (rapid change, geo jump, change ceiling)
//! 5. window tracking on success
//!
//! Outcomes are values, not errors: callers must handle every branch of
//! [`BindingOutcome`] explicitly.

use crate::cache::{get_json, put_json, KeyValueStore};
use crate::config::TokenBindingSettings;
use crate::db::TokenStore;
use crate::error::{Result, TokenError};
use crate::models::{AccessToken, GeoLocation, IpHistoryEntry, IpUsageEntry, TokenBindingMetadata};
use crate::security::TokenCache;
use crate::services::geo::{self, GeoResolver};
use crate::services::notifications::SecurityNotifier;
use chrono::{Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Key prefix of the per-token concurrent-usage windows.
pub const IP_USAGE_KEY_PREFIX: &str = "token_ip_usage:";

const SESSION_ID_LEN: usize = 40;

/// Network/client context of the request under validation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: IpAddr,
    pub user_agent: Option<String>,
    pub fingerprint: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingFailureReason {
    FingerprintMismatch,
    SessionMismatch,
    RapidIpChanges,
    SuspiciousGeoJump,
    MaxIpChangesExceeded,
}

impl BindingFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::SessionMismatch => "session_mismatch",
            Self::RapidIpChanges => "rapid_ip_changes",
            Self::SuspiciousGeoJump => "suspicious_geo_jump",
            Self::MaxIpChangesExceeded => "max_ip_changes_exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityBreachReason {
    ConcurrentIpUsage,
}

impl SecurityBreachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrentIpUsage => "concurrent_ip_usage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    /// End this session; the rest of the principal's tokens stay live.
    Logout,
    /// The credentials are compromised; every token is gone.
    RevokeAllTokens,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::RevokeAllTokens => "revoke_all_tokens",
        }
    }
}

/// Result of one binding validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    Valid,
    /// Deny the request; likely a client-side artifact, no revocation.
    BindingFailure {
        reason: BindingFailureReason,
        action: Option<EnforcementAction>,
    },
    /// Theft signal with revocation side effects already applied.
    SecurityBreach {
        reason: SecurityBreachReason,
        action: EnforcementAction,
    },
}

impl BindingOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, BindingOutcome::Valid)
    }
}

/// Snapshot of the guard's tracking state and thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    pub active_tokens_tracked: usize,
    pub concurrent_ip_window_seconds: u64,
    pub max_concurrent_ips: usize,
    pub max_ip_changes: i32,
}

#[derive(Clone)]
pub struct TokenBindingService {
    store: Arc<dyn TokenStore>,
    kv: Arc<dyn KeyValueStore>,
    cache: TokenCache,
    geo: Arc<dyn GeoResolver>,
    notifier: Arc<dyn SecurityNotifier>,
    settings: TokenBindingSettings,
}

impl TokenBindingService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        kv: Arc<dyn KeyValueStore>,
        cache: TokenCache,
        geo: Arc<dyn GeoResolver>,
        notifier: Arc<dyn SecurityNotifier>,
        settings: TokenBindingSettings,
    ) -> Self {
        Self {
            store,
            kv,
            cache,
            geo,
            notifier,
            settings,
        }
    }

    /// Stable hash over the client-presented headers, used as a weak
    /// client-identity signal.
    pub fn client_fingerprint(
        user_agent: &str,
        accept_language: &str,
        accept_encoding: &str,
        accept: &str,
    ) -> String {
        let joined = [user_agent, accept_language, accept_encoding, accept].join("|");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn generate_session_id() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect()
    }

    /// Record the binding for a freshly issued token.
    pub async fn create_binding_metadata(
        &self,
        ctx: &RequestContext,
        token_jti: &str,
        session_id: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let location = self.geo.resolve(ctx.ip).await;
        let now = Utc::now();
        let ip = ctx.ip.to_string();

        let metadata = TokenBindingMetadata {
            token_jti: token_jti.to_string(),
            client_fingerprint: fingerprint.to_string(),
            session_id: session_id.to_string(),
            ip_address: ip.clone(),
            ip_history: Json(vec![IpHistoryEntry {
                ip,
                timestamp: now,
                location: location.clone(),
            }]),
            ip_change_count: 0,
            country_code: location.country_code,
            city: location.city,
            last_geo_notification_at: None,
            user_agent: ctx.user_agent.clone(),
            created_at: now,
            updated_at: now,
        };

        self.store.create_binding_metadata(&metadata).await
    }

    /// Validate that the request matches the token's binding.
    pub async fn validate_binding(
        &self,
        token: &AccessToken,
        ctx: &RequestContext,
    ) -> Result<BindingOutcome> {
        let Some(metadata) = self.store.find_binding_metadata(&token.jti).await? else {
            // Tokens issued through third-party providers carry no binding.
            return Ok(BindingOutcome::Valid);
        };
        if metadata.client_fingerprint.is_empty() {
            return Ok(BindingOutcome::Valid);
        }

        if let Some(breach) = self.check_concurrent_ip_usage(token, ctx).await? {
            return Ok(breach);
        }

        if metadata.client_fingerprint != ctx.fingerprint {
            warn!(
                user_id = %token.user_id,
                token_jti = %token.jti,
                stored_fingerprint = %fingerprint_prefix(&metadata.client_fingerprint),
                current_fingerprint = %fingerprint_prefix(&ctx.fingerprint),
                "Token fingerprint mismatch"
            );
            return Ok(BindingOutcome::BindingFailure {
                reason: BindingFailureReason::FingerprintMismatch,
                action: None,
            });
        }

        if ctx.session_id.as_deref() != Some(metadata.session_id.as_str()) {
            warn!(
                user_id = %token.user_id,
                token_jti = %token.jti,
                has_current_session = ctx.session_id.is_some(),
                "Token session id mismatch"
            );
            return Ok(BindingOutcome::BindingFailure {
                reason: BindingFailureReason::SessionMismatch,
                action: None,
            });
        }

        if let Some(failure) = self.validate_ip_address(token, metadata, ctx).await? {
            return Ok(failure);
        }

        self.track_ip_usage(&token.jti, ctx).await?;

        Ok(BindingOutcome::Valid)
    }

    /// Revoke every token the principal holds and clear the matching
    /// tracking windows and cache entries. Idempotent; re-running after an
    /// overlapping detection is harmless.
    pub async fn revoke_all_user_tokens(&self, user_id: Uuid, reason: &str) -> Result<u64> {
        let revoked_jtis = self.store.revoke_all_for_user(user_id).await?;

        error!(
            %user_id,
            reason,
            tokens_revoked = revoked_jtis.len(),
            "All tokens revoked for principal"
        );

        for jti in &revoked_jtis {
            self.cache.invalidate(jti).await?;
            if let Err(e) = self.kv.delete(&ip_usage_key(jti)).await {
                warn!(error = %e, token_jti = %jti, "Failed to clear tracking window");
            }
        }

        Ok(revoked_jtis.len() as u64)
    }

    /// Drop tracking windows whose entries have all aged out. The
    /// key-value store expires whole windows on its own; this sweep trims
    /// windows kept alive by a recent write that still carry stale rows.
    pub async fn cleanup_expired_tracking_data(&self) -> Result<u64> {
        let keys = self.kv.scan_prefix(IP_USAGE_KEY_PREFIX).await?;
        let window = self.window();
        let now = Utc::now();
        let mut cleaned = 0u64;

        for key in keys {
            let Some(mut recent) =
                get_json::<HashMap<String, IpUsageEntry>>(self.kv.as_ref(), &key).await?
            else {
                continue;
            };

            let before = recent.len();
            recent.retain(|_, entry| now - entry.last_seen <= window);

            if recent.is_empty() {
                self.kv.delete(&key).await?;
                cleaned += 1;
            } else if recent.len() != before {
                put_json(self.kv.as_ref(), &key, &recent, Some(self.window_ttl())).await?;
            }
        }

        info!(keys_cleaned = cleaned, "Tracking window cleanup completed");
        Ok(cleaned)
    }

    pub async fn security_stats(&self) -> Result<SecurityStats> {
        let keys = self.kv.scan_prefix(IP_USAGE_KEY_PREFIX).await?;
        Ok(SecurityStats {
            active_tokens_tracked: keys.len(),
            concurrent_ip_window_seconds: self.settings.concurrent_ip_window_seconds,
            max_concurrent_ips: self.settings.max_concurrent_ips,
            max_ip_changes: self.settings.max_ip_changes,
        })
    }

    async fn check_concurrent_ip_usage(
        &self,
        token: &AccessToken,
        ctx: &RequestContext,
    ) -> Result<Option<BindingOutcome>> {
        let key = ip_usage_key(&token.jti);
        let now = Utc::now();
        let window = self.window();

        let mut recent = get_json::<HashMap<String, IpUsageEntry>>(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_default();
        recent.retain(|_, entry| now - entry.last_seen <= window);

        let current_ip = ctx.ip.to_string();
        let mut other_ips: Vec<String> = recent
            .values()
            .filter(|entry| entry.ip != current_ip)
            .map(|entry| entry.ip.clone())
            .collect();
        other_ips.sort();
        other_ips.dedup();

        if other_ips.len() >= self.settings.max_concurrent_ips {
            error!(
                user_id = %token.user_id,
                token_jti = %token.jti,
                current_ip = %current_ip,
                concurrent_ips = ?other_ips,
                window_seconds = self.settings.concurrent_ip_window_seconds,
                "Concurrent IP usage detected"
            );

            self.send_concurrent_access_notification(token, &current_ip, &other_ips, ctx)
                .await;
            self.revoke_all_user_tokens(token.user_id, SecurityBreachReason::ConcurrentIpUsage.as_str())
                .await?;

            return Ok(Some(BindingOutcome::SecurityBreach {
                reason: SecurityBreachReason::ConcurrentIpUsage,
                action: EnforcementAction::RevokeAllTokens,
            }));
        }

        Ok(None)
    }

    async fn track_ip_usage(&self, token_jti: &str, ctx: &RequestContext) -> Result<()> {
        let key = ip_usage_key(token_jti);
        let now = Utc::now();
        let window = self.window();

        // TODO: replace this read-modify-write with a sorted-set window
        // (member = ip, score = last_seen) so two near-simultaneous
        // requests cannot both pass the concurrency check before either
        // write lands.
        let mut recent = get_json::<HashMap<String, IpUsageEntry>>(self.kv.as_ref(), &key)
            .await?
            .unwrap_or_default();
        recent.retain(|_, entry| now - entry.last_seen <= window);

        let current_ip = ctx.ip.to_string();
        recent.insert(
            current_ip.clone(),
            IpUsageEntry {
                ip: current_ip,
                last_seen: now,
                user_agent: ctx.user_agent.clone(),
            },
        );

        put_json(self.kv.as_ref(), &key, &recent, Some(self.window_ttl())).await?;
        Ok(())
    }

    /// Heuristics for a request arriving from a different IP than the one
    /// currently bound. Returns the failure to surface, or `None` once the
    /// change is accepted and the metadata updated.
    async fn validate_ip_address(
        &self,
        token: &AccessToken,
        mut metadata: TokenBindingMetadata,
        ctx: &RequestContext,
    ) -> Result<Option<BindingOutcome>> {
        let current_ip = ctx.ip.to_string();
        if metadata.ip_address == current_ip {
            return Ok(None);
        }

        if self.is_rapid_ip_change(&metadata) {
            warn!(
                token_jti = %metadata.token_jti,
                current_ip = %current_ip,
                previous_ip = %metadata.ip_address,
                "Rapid IP change rejected"
            );
            return Ok(Some(BindingOutcome::BindingFailure {
                reason: BindingFailureReason::RapidIpChanges,
                action: Some(EnforcementAction::Logout),
            }));
        }

        let location = self.geo.resolve(ctx.ip).await;

        if self.is_suspicious_geo_jump(&metadata, &location) {
            warn!(
                token_jti = %metadata.token_jti,
                from_country = ?metadata.country_code,
                to_country = ?location.country_code,
                from_ip = %metadata.ip_address,
                to_ip = %current_ip,
                "Suspicious geographic jump rejected"
            );
            return Ok(Some(BindingOutcome::BindingFailure {
                reason: BindingFailureReason::SuspiciousGeoJump,
                action: Some(EnforcementAction::Logout),
            }));
        }

        if metadata.ip_change_count >= self.settings.max_ip_changes {
            warn!(
                token_jti = %metadata.token_jti,
                ip_changes = metadata.ip_change_count,
                max_allowed = self.settings.max_ip_changes,
                current_ip = %current_ip,
                "Token exceeded maximum IP changes"
            );
            return Ok(Some(BindingOutcome::BindingFailure {
                reason: BindingFailureReason::MaxIpChangesExceeded,
                action: Some(EnforcementAction::Logout),
            }));
        }

        if self.should_notify_geo_change(&metadata, &location) {
            if self
                .send_geo_change_notification(token, &location, &current_ip, ctx)
                .await
            {
                metadata.last_geo_notification_at = Some(Utc::now());
            }
        }

        let now = Utc::now();
        metadata.push_ip_history(IpHistoryEntry {
            ip: current_ip.clone(),
            timestamp: now,
            location: location.clone(),
        });
        metadata.ip_address = current_ip;
        metadata.ip_change_count += 1;
        metadata.country_code = location.country_code;
        metadata.city = location.city;
        metadata.user_agent = ctx.user_agent.clone();
        metadata.updated_at = now;

        self.store.update_binding_metadata(&metadata).await?;

        info!(
            token_jti = %metadata.token_jti,
            new_ip = %metadata.ip_address,
            ip_change_count = metadata.ip_change_count,
            country = ?metadata.country_code,
            "Token IP binding updated"
        );

        Ok(None)
    }

    fn is_rapid_ip_change(&self, metadata: &TokenBindingMetadata) -> bool {
        let minutes_since_update = (Utc::now() - metadata.updated_at).num_minutes();
        minutes_since_update < self.settings.min_ip_change_interval_minutes
    }

    fn is_suspicious_geo_jump(
        &self,
        metadata: &TokenBindingMetadata,
        location: &GeoLocation,
    ) -> bool {
        let (Some(old), Some(new)) = (
            metadata.country_code.as_deref(),
            location.country_code.as_deref(),
        ) else {
            return false;
        };
        if old.is_empty() || new.is_empty() || old == new {
            return false;
        }

        let hours_since_update = (Utc::now() - metadata.updated_at).num_hours();
        hours_since_update < self.settings.suspicious_geo_jump_hours
    }

    fn should_notify_geo_change(
        &self,
        metadata: &TokenBindingMetadata,
        location: &GeoLocation,
    ) -> bool {
        if location.is_private {
            return false;
        }

        if !geo::has_country_changed(
            metadata.country_code.as_deref(),
            location.country_code.as_deref(),
        ) {
            return false;
        }

        if let Some(last_notified) = metadata.last_geo_notification_at {
            let cooldown_end = last_notified
                + ChronoDuration::seconds(self.settings.geo_change_cooldown_seconds);
            if Utc::now() < cooldown_end {
                return false;
            }
        }

        true
    }

    async fn send_concurrent_access_notification(
        &self,
        token: &AccessToken,
        current_ip: &str,
        concurrent_ips: &[String],
        ctx: &RequestContext,
    ) {
        match self.store.find_user(token.user_id).await {
            Ok(Some(user)) => {
                match self
                    .notifier
                    .concurrent_access(&user, current_ip, concurrent_ips, ctx.user_agent.as_deref())
                    .await
                {
                    Ok(()) => warn!(
                        user_id = %user.id,
                        token_jti = %token.jti,
                        "Concurrent access notification sent"
                    ),
                    Err(e) => error!(
                        user_id = %user.id,
                        error = %e,
                        "Failed to send concurrent access notification"
                    ),
                }
            }
            Ok(None) => warn!(
                user_id = %token.user_id,
                "Owner not found for concurrent access notification"
            ),
            Err(e) => error!(
                user_id = %token.user_id,
                error = %e,
                "Failed to load owner for concurrent access notification"
            ),
        }
    }

    /// Returns true when the notification went out, so the cooldown stamp
    /// is only advanced on actual delivery.
    async fn send_geo_change_notification(
        &self,
        token: &AccessToken,
        location: &GeoLocation,
        current_ip: &str,
        ctx: &RequestContext,
    ) -> bool {
        match self.store.find_user(token.user_id).await {
            Ok(Some(user)) => {
                match self
                    .notifier
                    .location_change(&user, location, current_ip, ctx.user_agent.as_deref())
                    .await
                {
                    Ok(()) => {
                        info!(
                            user_id = %user.id,
                            token_jti = %token.jti,
                            new_country = ?location.country_code,
                            ip_address = %current_ip,
                            "Location change notification sent"
                        );
                        true
                    }
                    Err(e) => {
                        error!(
                            user_id = %user.id,
                            error = %e,
                            "Failed to send location change notification"
                        );
                        false
                    }
                }
            }
            Ok(None) => {
                warn!(user_id = %token.user_id, "Owner not found for location change notification");
                false
            }
            Err(e) => {
                error!(
                    user_id = %token.user_id,
                    error = %e,
                    "Failed to load owner for location change notification"
                );
                false
            }
        }
    }

    fn window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.settings.concurrent_ip_window_seconds as i64)
    }

    fn window_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.concurrent_ip_window_seconds)
    }
}

fn ip_usage_key(token_jti: &str) -> String {
    format!("{}{}", IP_USAGE_KEY_PREFIX, token_jti)
}

fn fingerprint_prefix(fingerprint: &str) -> &str {
    fingerprint.get(..16).unwrap_or(fingerprint)
}
