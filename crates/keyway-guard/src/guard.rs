//! Token validation for one protected backend.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Validation};
use tracing::debug;

use crate::config::GuardConfig;
use crate::context::{BearerContext, Claims};
use crate::keys::KeyResolver;
use keyway_core::{Error, Result};

pub struct ResourceGuard {
    issuer: String,
    audience: Option<String>,
    tenant_id: String,
    leeway_secs: u64,
    keys: Arc<dyn KeyResolver>,
}

impl ResourceGuard {
    pub fn new(config: &GuardConfig, keys: Arc<dyn KeyResolver>) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            tenant_id: config.tenant_id.clone(),
            leeway_secs: config.leeway_secs,
            keys,
        }
    }

    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        Ok(Self::new(config, config.key_resolver()?))
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub async fn validate_context(&self, context: &BearerContext) -> Result<Claims> {
        self.validate(context.bearer_token().unwrap_or_default()).await
    }

    /// Validate `token` for this backend.
    ///
    /// Fails, in this order of precedence, with `MissingToken`,
    /// `InvalidSignature` (bad signature, issuer, audience or shape),
    /// `ExpiredToken`, then `TenantMismatch`.
    pub async fn validate(&self, token: &str) -> Result<Claims> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::MissingToken);
        }

        let header = decode_header(token)
            .map_err(|e| Error::InvalidSignature(format!("malformed token: {}", e)))?;
        let (key, algorithm) = self.keys.resolve(&header).await?;

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let claims = decode::<Claims>(token, &key, &validation)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::InvalidSignature => "invalid signature".to_string(),
                    ErrorKind::InvalidIssuer => "invalid issuer".to_string(),
                    ErrorKind::InvalidAudience => "invalid audience".to_string(),
                    _ => format!("token rejected: {}", e),
                };
                Error::InvalidSignature(reason)
            })?
            .claims;

        let now = Utc::now().timestamp();
        if claims.exp < now - self.leeway_secs as i64 {
            debug!(sub = %claims.sub, "Rejected expired token");
            return Err(Error::ExpiredToken);
        }

        match claims.tenant_id.as_deref() {
            Some(tenant) if tenant == self.tenant_id => Ok(claims),
            found => Err(Error::TenantMismatch {
                expected: self.tenant_id.clone(),
                found: found.map(String::from),
            }),
        }
    }
}
