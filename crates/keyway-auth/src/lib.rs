//! Keyway Auth: getting tokens into the system and keeping them fresh.
//!
//! [`AuthorizationCoordinator`] runs the browser login (authorization code +
//! PKCE) and is the only place a first credential is written.
//! [`TokenRefreshManager`] rotates credentials on backend rejection with a
//! per-session single flight.

pub mod coordinator;
pub mod pkce;
pub mod provider;
pub mod refresh;

pub use coordinator::{AuthorizationCoordinator, AuthorizationRequest, CallbackResult};
pub use pkce::PkcePair;
pub use provider::{HttpIdentityProvider, IdentityProvider, TokenResponse};
pub use refresh::TokenRefreshManager;

#[cfg(test)]
pub(crate) mod testing;
