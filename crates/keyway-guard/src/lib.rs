//! Keyway Guard: inbound bearer-token validation for protected backends.
//!
//! Checks run in a fixed order: presence, signature and issuer, expiry,
//! tenant. Callers rely on that order to tell a refreshable
//! `ExpiredToken` from a fatal `TenantMismatch`.

pub mod config;
pub mod context;
pub mod guard;
pub mod keys;
pub mod middleware;

pub use config::{GuardConfig, KeySource};
pub use context::{BearerContext, Claims};
pub use guard::ResourceGuard;
pub use keys::{JwksKeyResolver, KeyResolver, StaticKey};
pub use middleware::require_bearer;
