//! Configuration for the token service.
//!
//! Every tunable is loaded from environment variables with a sane default,
//! so a bare development environment only needs `DATABASE_URL` and
//! `REDIS_URL`. A `.env` file is honored in debug builds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::info;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub authorization: AuthorizationSettings,
    pub token_binding: TokenBindingSettings,
    pub token_cache: TokenCacheSettings,
    pub geo: GeoSettings,
    pub email: EmailSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Ok(Settings {
            database: DatabaseSettings::from_env()?,
            redis: RedisSettings::from_env()?,
            authorization: AuthorizationSettings::from_env()?,
            token_binding: TokenBindingSettings::from_env()?,
            token_cache: TokenCacheSettings::from_env()?,
            geo: GeoSettings::from_env()?,
            email: EmailSettings::from_env()?,
        })
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
}

impl DatabaseSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("Invalid DATABASE_MAX_CONNECTIONS")?,
            min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid DATABASE_MIN_CONNECTIONS")?,
            acquire_timeout: env::var("DATABASE_ACQUIRE_TIMEOUT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DATABASE_ACQUIRE_TIMEOUT")?,
        })
    }
}

/// Redis cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
}

impl RedisSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("REDIS_URL").context("REDIS_URL must be set")?,
        })
    }
}

/// Authorization-engine client settings.
///
/// The engine itself is an external collaborator; this service only needs
/// the first-party client credentials it presents on grant requests, the
/// endpoint the HTTP backend posts to, and the symmetric key the engine
/// wraps refresh tokens with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationSettings {
    pub token_endpoint: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_scope: String,
    /// Base64-encoded 256-bit key shared with the authorization engine.
    pub refresh_token_key: String,
}

impl AuthorizationSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            token_endpoint: env::var("AUTHZ_TOKEN_ENDPOINT").ok(),
            client_id: env::var("AUTHZ_CLIENT_ID").context("AUTHZ_CLIENT_ID must be set")?,
            client_secret: env::var("AUTHZ_CLIENT_SECRET")
                .context("AUTHZ_CLIENT_SECRET must be set")?,
            refresh_scope: env::var("AUTHZ_REFRESH_SCOPE")
                .unwrap_or_else(|_| "access-api".to_string()),
            refresh_token_key: env::var("AUTHZ_REFRESH_TOKEN_KEY")
                .context("AUTHZ_REFRESH_TOKEN_KEY must be set")?,
        })
    }
}

/// Token binding security thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBindingSettings {
    /// Window during which usage from distinct IPs counts as concurrent.
    pub concurrent_ip_window_seconds: u64,
    /// Distinct other-IP count that trips the theft signal.
    pub max_concurrent_ips: usize,
    /// Lifetime ceiling on accepted IP changes per token.
    pub max_ip_changes: i32,
    /// Minimum gap between accepted IP changes.
    pub min_ip_change_interval_minutes: i64,
    /// Country changes inside this window are treated as impossible travel.
    pub suspicious_geo_jump_hours: i64,
    /// Cooldown between location-change notifications per token.
    pub geo_change_cooldown_seconds: i64,
}

impl Default for TokenBindingSettings {
    fn default() -> Self {
        Self {
            concurrent_ip_window_seconds: 300,
            max_concurrent_ips: 1,
            max_ip_changes: 10,
            min_ip_change_interval_minutes: 5,
            suspicious_geo_jump_hours: 2,
            geo_change_cooldown_seconds: 3600,
        }
    }
}

impl TokenBindingSettings {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            concurrent_ip_window_seconds: env_or(
                "TOKEN_BINDING_CONCURRENT_IP_WINDOW_SECONDS",
                defaults.concurrent_ip_window_seconds,
            )?,
            max_concurrent_ips: env_or(
                "TOKEN_BINDING_MAX_CONCURRENT_IPS",
                defaults.max_concurrent_ips,
            )?,
            max_ip_changes: env_or("TOKEN_BINDING_MAX_IP_CHANGES", defaults.max_ip_changes)?,
            min_ip_change_interval_minutes: env_or(
                "TOKEN_BINDING_MIN_IP_CHANGE_INTERVAL_MINUTES",
                defaults.min_ip_change_interval_minutes,
            )?,
            suspicious_geo_jump_hours: env_or(
                "TOKEN_BINDING_SUSPICIOUS_GEO_JUMP_HOURS",
                defaults.suspicious_geo_jump_hours,
            )?,
            geo_change_cooldown_seconds: env_or(
                "TOKEN_BINDING_GEO_CHANGE_COOLDOWN_SECONDS",
                defaults.geo_change_cooldown_seconds,
            )?,
        })
    }
}

/// Access-token cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheSettings {
    pub enabled: bool,
    pub prefix: String,
    /// `None` means cached entries never expire on their own and are only
    /// removed by write-through invalidation.
    pub ttl_seconds: Option<u64>,
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "token_cache:".to_string(),
            ttl_seconds: Some(3600),
        }
    }
}

impl TokenCacheSettings {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let ttl_seconds = match env::var("TOKEN_CACHE_TTL_SECONDS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().context("Invalid TOKEN_CACHE_TTL_SECONDS")?;
                if secs == 0 {
                    None
                } else {
                    Some(secs)
                }
            }
            Err(_) => defaults.ttl_seconds,
        };

        Ok(Self {
            enabled: env_or("TOKEN_CACHE_ENABLED", defaults.enabled)?,
            prefix: env::var("TOKEN_CACHE_PREFIX").unwrap_or(defaults.prefix),
            ttl_seconds,
        })
    }
}

/// Geo lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoSettings {
    pub endpoint: String,
    pub cache_ttl_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://ip-api.com/json".to_string(),
            cache_ttl_seconds: 3600,
            timeout_seconds: 5,
        }
    }
}

impl GeoSettings {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            endpoint: env::var("GEO_LOOKUP_ENDPOINT").unwrap_or(defaults.endpoint),
            cache_ttl_seconds: env_or("GEO_CACHE_TTL_SECONDS", defaults.cache_ttl_seconds)?,
            timeout_seconds: env_or("GEO_LOOKUP_TIMEOUT_SECONDS", defaults.timeout_seconds)?,
        })
    }
}

/// Security notification email settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    /// Empty host puts the notifier in no-op mode (log only).
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: String,
    pub use_starttls: bool,
}

impl EmailSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            smtp_host: env::var("SMTP_HOST").unwrap_or_default(),
            smtp_port: env::var("SMTP_PORT")
                .unwrap_or_else(|_| "1025".to_string())
                .parse()
                .context("Invalid SMTP_PORT")?,
            smtp_username: env::var("SMTP_USERNAME").ok(),
            smtp_password: env::var("SMTP_PASSWORD").ok(),
            smtp_from: env::var("SMTP_FROM").unwrap_or_else(|_| "security@aegis.dev".to_string()),
            use_starttls: env::var("SMTP_USE_STARTTLS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
