//! Coarse IP geolocation.
//!
//! Location data is advisory: it feeds the binding guard's jump heuristic
//! and notification wording, never an authentication decision on its own.
//! Private and non-routable addresses short-circuit to the `LOCAL` marker
//! without touching the network; public addresses go through the external
//! lookup collaborator with a short timeout and an hour of caching, and any
//! failure degrades to an unknown location.

use crate::cache::{get_json, put_json, KeyValueStore};
use crate::config::GeoSettings;
use crate::error::{Result, TokenError};
use crate::models::{GeoLocation, LOCAL_COUNTRY_CODE};
use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait::async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve an IP to coarse location data. Infallible by design;
    /// failures surface as [`GeoLocation::unknown`].
    async fn resolve(&self, ip: IpAddr) -> GeoLocation;
}

/// Response shape of the external lookup endpoint.
#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: String,
    country: Option<String>,
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
    city: Option<String>,
}

#[derive(Clone)]
pub struct GeoLocationService {
    http: Client,
    kv: Arc<dyn KeyValueStore>,
    settings: GeoSettings,
}

impl GeoLocationService {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: GeoSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| TokenError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, kv, settings })
    }

    async fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        let url = format!("{}/{}", self.settings.endpoint.trim_end_matches('/'), ip);
        let response = self.http.get(&url).send().await.ok()?;
        let body: GeoApiResponse = response.json().await.ok()?;

        if body.status != "success" {
            debug!(%ip, status = %body.status, "geo lookup returned failure status");
            return None;
        }

        Some(GeoLocation {
            country: body.country,
            country_code: body.country_code,
            city: body.city,
            is_private: false,
        })
    }

    fn cache_key(ip: IpAddr) -> String {
        format!("geo:ip:{}", ip)
    }
}

#[async_trait::async_trait]
impl GeoResolver for GeoLocationService {
    async fn resolve(&self, ip: IpAddr) -> GeoLocation {
        if is_private_ip(ip) {
            return GeoLocation::local();
        }

        let cache_key = Self::cache_key(ip);
        match get_json::<GeoLocation>(self.kv.as_ref(), &cache_key).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "geo cache read failed"),
        }

        let Some(location) = self.lookup(ip).await else {
            warn!(%ip, "geo lookup failed; continuing with unknown location");
            return GeoLocation::unknown();
        };

        let ttl = Duration::from_secs(self.settings.cache_ttl_seconds);
        if let Err(e) = put_json(self.kv.as_ref(), &cache_key, &location, Some(ttl)).await {
            warn!(error = %e, "geo cache write failed");
        }

        location
    }
}

/// Addresses that must never be sent to the external lookup.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// True iff both codes are present, differ, and neither is the synthetic
/// `LOCAL` marker.
pub fn has_country_changed(old: Option<&str>, new: Option<&str>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => {
            !old.is_empty()
                && !new.is_empty()
                && old != new
                && old != LOCAL_COUNTRY_CODE
                && new != LOCAL_COUNTRY_CODE
        }
        _ => false,
    }
}
