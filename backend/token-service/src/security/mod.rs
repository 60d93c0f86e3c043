/// Credential handling: cached token lookup and the opaque refresh wrap
pub mod opaque;
pub mod token_cache;

pub use opaque::OpaqueTokenCipher;
pub use token_cache::{hash_token_secret, TokenCache};
