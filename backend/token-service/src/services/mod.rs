/// Business logic: issuance, rotation, binding defense, and the seams to
/// the external collaborators
pub mod authorization;
pub mod geo;
pub mod notifications;
pub mod oauth_tokens;
pub mod token_binding;
pub mod token_chain;

pub use authorization::{
    AuthorizationEngine, GrantRequest, GrantType, HttpAuthorizationEngine, TokenGrantResponse,
};
pub use geo::{GeoLocationService, GeoResolver};
pub use notifications::{EmailNotifier, SecurityNotifier};
pub use oauth_tokens::{OAuthTokenService, TokenSet};
pub use token_binding::{
    BindingFailureReason, BindingOutcome, EnforcementAction, RequestContext, SecurityBreachReason,
    SecurityStats, TokenBindingService,
};
pub use token_chain::TokenChainService;
