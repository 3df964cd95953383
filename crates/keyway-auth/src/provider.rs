//! Identity provider token endpoint access.
//!
//! The coordinator and the refresh manager only ever see the
//! [`IdentityProvider`] trait; [`HttpIdentityProvider`] is the production
//! implementation speaking form-encoded OAuth2 to a token endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use keyway_core::{Error, ProviderConfig, Result};
use keyway_store::Credential;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Successful token endpoint response.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TokenResponse {
    /// Turn the response into the stored credential of `session_key`.
    ///
    /// A missing or empty `refresh_token` keeps `previous_refresh`, so a
    /// provider that does not rotate refresh tokens leaves the old one usable.
    pub fn into_credential(
        self,
        session_key: &str,
        tenant_id: &str,
        previous_refresh: Option<String>,
        now: DateTime<Utc>,
    ) -> Credential {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN).max(0);
        Credential {
            session_key: session_key.to_string(),
            tenant_id: tenant_id.to_string(),
            access_token: self.access_token,
            access_token_expiry: now + chrono::Duration::seconds(lifetime),
            refresh_token: self
                .refresh_token
                .filter(|t| !t.is_empty())
                .or(previous_refresh),
            issued_at: now,
        }
    }
}

/// The token endpoint of an OAuth2 identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `grant_type=authorization_code`.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse>;

    /// `grant_type=refresh_token`. A refresh token the provider no longer
    /// accepts fails `NoRefreshToken`.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// OAuth2 error body (`{"error", "error_description"}`).
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum TokenFailure {
    /// The provider answered with an OAuth error code.
    Rejected(OAuthErrorBody),
    Other(Error),
}

impl From<TokenFailure> for Error {
    fn from(failure: TokenFailure) -> Self {
        match failure {
            TokenFailure::Rejected(body) => Error::Provider(match body.error_description {
                Some(desc) => format!("{}: {}", body.error, desc),
                None => body.error,
            }),
            TokenFailure::Other(e) => e,
        }
    }
}

/// reqwest-backed provider using `client_secret_post` client authentication.
pub struct HttpIdentityProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    async fn post_token(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<TokenResponse, TokenFailure> {
        let response = self
            .http
            .post(endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| TokenFailure::Other(Error::Http(format!("Token endpoint unreachable: {}", e))))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TokenFailure::Other(Error::Http(e.to_string())))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(oauth) => {
                    warn!("Token endpoint rejected request ({}): {}", status, oauth.error);
                    TokenFailure::Rejected(oauth)
                }
                Err(_) => TokenFailure::Other(Error::Provider(format!(
                    "token endpoint returned {}: {}",
                    status, body
                ))),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            TokenFailure::Other(Error::Provider(format!("Malformed token response: {}", e)))
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let tokens = self.post_token(&self.config.token_endpoint, &form).await?;
        debug!("Exchanged authorization code ({:?})", tokens);
        Ok(tokens)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        match self.post_token(&self.config.refresh_endpoint, &form).await {
            Ok(tokens) => Ok(tokens),
            Err(TokenFailure::Rejected(body)) if body.error == "invalid_grant" => Err(
                Error::NoRefreshToken("rejected by identity provider".to_string()),
            ),
            Err(failure) => Err(failure.into()),
        }
    }
}
