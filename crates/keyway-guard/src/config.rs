//! Guard configuration of one protected backend.

use std::path::PathBuf;
use std::sync::Arc;

use keyway_core::{Error, Result};

use crate::keys::{JwksKeyResolver, KeyResolver, StaticKey};

/// Where verification keys come from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// HS256 shared secret.
    Secret(String),
    /// RS256 public key PEM file.
    RsaPemFile(PathBuf),
    /// OIDC discovery document URL; keys via its `jwks_uri`.
    Discovery(String),
    /// JWKS URL used directly.
    Jwks(String),
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Expected `iss`.
    pub issuer: String,
    /// Expected `aud`; unchecked when absent.
    pub audience: Option<String>,
    /// The tenant this backend serves.
    pub tenant_id: String,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
    pub key_source: KeySource,
}

impl GuardConfig {
    pub fn new(issuer: impl Into<String>, tenant_id: impl Into<String>, key_source: KeySource) -> Self {
        Self {
            issuer: issuer.into(),
            audience: None,
            tenant_id: tenant_id.into(),
            leeway_secs: 0,
            key_source,
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Read `KEYWAY_GUARD_*` variables.
    ///
    /// `KEYWAY_GUARD_TENANT` is required. Keys come from
    /// `KEYWAY_GUARD_HS256_SECRET`, then `KEYWAY_GUARD_PUBLIC_KEY_PEM`, then
    /// `KEYWAY_GUARD_JWKS_URL`, falling back to the issuer's discovery document.
    pub fn from_env() -> Result<Self> {
        let tenant_id = std::env::var("KEYWAY_GUARD_TENANT")
            .map_err(|_| Error::Config("KEYWAY_GUARD_TENANT is not set".into()))?;
        let issuer = std::env::var("KEYWAY_GUARD_ISSUER")
            .unwrap_or_else(|_| "http://localhost:5000".to_string());

        let key_source = if let Ok(secret) = std::env::var("KEYWAY_GUARD_HS256_SECRET") {
            KeySource::Secret(secret)
        } else if let Ok(path) = std::env::var("KEYWAY_GUARD_PUBLIC_KEY_PEM") {
            KeySource::RsaPemFile(PathBuf::from(path))
        } else if let Ok(url) = std::env::var("KEYWAY_GUARD_JWKS_URL") {
            KeySource::Jwks(url)
        } else {
            KeySource::Discovery(format!(
                "{}/.well-known/openid-configuration",
                issuer.trim_end_matches('/')
            ))
        };

        let mut config = Self::new(issuer, tenant_id, key_source);
        config.audience = std::env::var("KEYWAY_GUARD_AUDIENCE").ok();
        config.leeway_secs = std::env::var("KEYWAY_GUARD_LEEWAY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(config)
    }

    pub fn key_resolver(&self) -> Result<Arc<dyn KeyResolver>> {
        Ok(match &self.key_source {
            KeySource::Secret(secret) => Arc::new(StaticKey::hs256(secret.as_bytes())),
            KeySource::RsaPemFile(path) => {
                let pem = std::fs::read(path)?;
                Arc::new(StaticKey::rs256_pem(&pem)?)
            }
            KeySource::Discovery(url) => Arc::new(JwksKeyResolver::from_discovery(url.clone())?),
            KeySource::Jwks(url) => Arc::new(JwksKeyResolver::from_jwks_uri(url.clone())?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = GuardConfig::new("http://localhost:5000", "tenant-abc", KeySource::Secret("s".into()))
            .with_audience("http://localhost:8081")
            .with_leeway(5);
        assert_eq!(config.audience.as_deref(), Some("http://localhost:8081"));
        assert_eq!(config.leeway_secs, 5);
        assert!(config.key_resolver().is_ok());
    }

    #[test]
    fn test_pem_key_source() {
        let path = PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/rsa_public.pem"));
        let config = GuardConfig::new("iss", "tenant-abc", KeySource::RsaPemFile(path));
        assert!(config.key_resolver().is_ok());

        let missing = GuardConfig::new("iss", "tenant-abc", KeySource::RsaPemFile("/nope.pem".into()));
        assert!(missing.key_resolver().is_err());
    }
}
