/// Token Service Library
///
/// Issues, rotates, and polices bearer credentials for the platform's
/// first-party clients: chained refresh-token rotation with reuse
/// detection, per-token client/network binding with concurrent-usage and
/// geo-anomaly detection, and a write-through cache for credential lookup.
/// Consumed as a library by the HTTP authentication middleware.
///
/// ## Modules
///
/// - `config`: Environment-driven settings
/// - `cache`: Injected key-value capability (Redis / in-memory)
/// - `db`: Durable token store (Postgres / in-memory)
/// - `error`: Error types
/// - `models`: Token, chain, and binding records
/// - `security`: Cached credential lookup, opaque refresh wrap
/// - `services`: Chain ledger, binding guard, geo resolver, orchestrator
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod security;
pub mod services;

// Re-export commonly used types
pub use error::{Result, TokenError};
