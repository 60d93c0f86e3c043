/// Data models for the token lifecycle subsystem
pub mod binding;
pub mod geo;
pub mod token;
pub mod user;

pub use binding::{IpHistoryEntry, IpUsageEntry, TokenBindingMetadata, IP_HISTORY_CAP};
pub use geo::{GeoLocation, LOCAL_COUNTRY_CODE};
pub use token::{AccessToken, CachedTokenEntry, RefreshToken};
pub use user::User;
