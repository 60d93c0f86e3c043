use crate::models::GeoLocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Bounded length of the per-token IP history; the oldest entry is
/// evicted once the cap is reached.
pub const IP_HISTORY_CAP: usize = 10;

/// One accepted IP observation in a token's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpHistoryEntry {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub location: GeoLocation,
}

/// Client/network context a token was bound to at issuance.
///
/// 1:1 with an access token. Mutated by the binding guard on every
/// accepted IP change; removed only by cascading token deletion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenBindingMetadata {
    pub token_jti: String,
    /// SHA-256 over the client-presented headers.
    pub client_fingerprint: String,
    pub session_id: String,
    pub ip_address: String,
    pub ip_history: Json<Vec<IpHistoryEntry>>,
    pub ip_change_count: i32,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub last_geo_notification_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenBindingMetadata {
    /// Append an observation, evicting the oldest entries beyond the cap.
    pub fn push_ip_history(&mut self, entry: IpHistoryEntry) {
        self.ip_history.0.push(entry);
        let len = self.ip_history.0.len();
        if len > IP_HISTORY_CAP {
            self.ip_history.0.drain(..len - IP_HISTORY_CAP);
        }
    }
}

/// Sliding-window record of recent usage of one token from one IP.
/// Lives in the key-value store under the concurrency window's TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpUsageEntry {
    pub ip: String,
    pub last_seen: DateTime<Utc>,
    pub user_agent: Option<String>,
}
