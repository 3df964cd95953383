//! Error types for Keyway.

use thiserror::Error;

use crate::wire;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Illegal remote link: {0}")]
    IllegalLink(String),

    #[error("Authentication required for session {session_key}")]
    AuthRequired { session_key: String },

    #[error("Access token expired")]
    ExpiredToken,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid or replayed authorization state")]
    InvalidState,

    #[error("Tenant mismatch: expected {expected}, found {}", found.as_deref().unwrap_or("<none>"))]
    TenantMismatch {
        expected: String,
        found: Option<String>,
    },

    #[error("No usable refresh token: {0}")]
    NoRefreshToken(String),

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidSignature(String),

    #[error("Identity provider error: {0}")]
    Provider(String),

    #[error("Delegation error: {0}")]
    Delegation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(_) | Self::Database(_) | Self::Io(_) | Self::Internal(_) => {
                wire::INTERNAL_ERROR
            }
            Self::NotFound(_) => wire::NOT_FOUND,
            Self::InvalidTransition { .. } => wire::INVALID_TRANSITION,
            Self::IllegalLink(_) => wire::INTERNAL_ERROR,
            Self::AuthRequired { .. } => wire::AUTH_REQUIRED,
            Self::ExpiredToken => wire::TOKEN_EXPIRED,
            Self::Unauthorized(_) => wire::UNAUTHORIZED,
            Self::InvalidState => wire::INVALID_STATE,
            Self::TenantMismatch { .. } => wire::TENANT_MISMATCH,
            Self::NoRefreshToken(_) => wire::AUTH_REQUIRED,
            Self::MissingToken => wire::MISSING_TOKEN,
            Self::InvalidSignature(_) => wire::INVALID_TOKEN,
            Self::Provider(_) => wire::PROVIDER_ERROR,
            Self::Delegation(_) | Self::Http(_) => wire::UPSTREAM_ERROR,
            Self::Json(_) | Self::Config(_) => wire::BAD_REQUEST,
        }
    }

    /// Whether a refresh-then-retry may recover from this error.
    pub fn is_retryable_auth(&self) -> bool {
        matches!(self, Self::ExpiredToken)
    }

    /// Whether the caller must send the user through the login flow.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, Self::AuthRequired { .. } | Self::NoRefreshToken(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
