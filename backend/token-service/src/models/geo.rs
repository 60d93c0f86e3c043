use serde::{Deserialize, Serialize};

/// Synthetic country marker for private and loopback addresses.
pub const LOCAL_COUNTRY_CODE: &str = "LOCAL";

/// Coarse location data for an IP address.
///
/// Resolution is best effort: a failed lookup degrades to
/// [`GeoLocation::unknown`] rather than failing the request, since location
/// only feeds advisory heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub is_private: bool,
}

impl GeoLocation {
    /// Fixed result for private, loopback, and otherwise non-routable
    /// addresses. Never triggers an external lookup.
    pub fn local() -> Self {
        Self {
            country: Some("Local Network".to_string()),
            country_code: Some(LOCAL_COUNTRY_CODE.to_string()),
            city: None,
            is_private: true,
        }
    }

    /// Degraded result when resolution fails or times out.
    pub fn unknown() -> Self {
        Self {
            country: None,
            country_code: None,
            city: None,
            is_private: false,
        }
    }
}
