//! Wire-level error codes shared by the orchestrator, the delegation client
//! and protected backends.

pub const MISSING_TOKEN: &str = "missing_token";
pub const INVALID_TOKEN: &str = "invalid_token";
pub const TOKEN_EXPIRED: &str = "token_expired";
pub const TENANT_MISMATCH: &str = "tenant_mismatch";
pub const UNAUTHORIZED: &str = "unauthorized";
pub const AUTH_REQUIRED: &str = "auth_required";
pub const INVALID_STATE: &str = "invalid_state";
pub const INVALID_TRANSITION: &str = "invalid_transition";
pub const NOT_FOUND: &str = "not_found";
pub const PROVIDER_ERROR: &str = "provider_error";
pub const UPSTREAM_ERROR: &str = "upstream_error";
pub const BAD_REQUEST: &str = "bad_request";
pub const INTERNAL_ERROR: &str = "internal_error";

/// Error body returned by protected backends and by the orchestrator API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, alias = "error_description", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
