//! Typed request context for bearer authentication.

use std::collections::HashMap;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};

/// Validated token claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Claims not modelled above (`aud`, `client_id`, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Bearer credentials of one inbound request.
///
/// Built from headers before validation; the middleware attaches the claims
/// once the token passes.
#[derive(Debug, Clone, Default)]
pub struct BearerContext {
    token: Option<String>,
    claims: Option<Claims>,
}

impl BearerContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .map(String::from);
        Self {
            token,
            claims: None,
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `tenant_id` of the validated token.
    pub fn tenant_claim(&self) -> Option<&str> {
        self.claims.as_ref()?.tenant_id.as_deref()
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    pub fn with_claims(mut self, claims: Claims) -> Self {
        self.claims = Some(claims);
        self
    }
}

fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
