//! Verification key resolution.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Header};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use keyway_core::{Error, Result};

/// Supplies the key (and algorithm) a token must verify against.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, header: &Header) -> Result<(DecodingKey, Algorithm)>;
}

/// One configured key: an HS256 shared secret or an RS256 public key.
pub struct StaticKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl StaticKey {
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn rs256_pem(pem: &[u8]) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| Error::Config(format!("Invalid RSA public key: {}", e)))?;
        Ok(Self {
            key,
            algorithm: Algorithm::RS256,
        })
    }
}

#[async_trait]
impl KeyResolver for StaticKey {
    async fn resolve(&self, header: &Header) -> Result<(DecodingKey, Algorithm)> {
        if header.alg != self.algorithm {
            return Err(Error::InvalidSignature(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        Ok((self.key.clone(), self.algorithm))
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

/// RSA keys published by the identity provider, looked up by `kid`.
///
/// The JWKS location comes from the OIDC discovery document unless given
/// directly. Keys are cached for `ttl`; an unknown `kid` forces one refetch.
pub struct JwksKeyResolver {
    discovery_url: Option<String>,
    jwks_uri: RwLock<Option<String>>,
    cache: RwLock<Option<CachedKeys>>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksKeyResolver {
    pub fn from_discovery(discovery_url: impl Into<String>) -> Result<Self> {
        Self::build(Some(discovery_url.into()), None)
    }

    pub fn from_jwks_uri(jwks_uri: impl Into<String>) -> Result<Self> {
        Self::build(None, Some(jwks_uri.into()))
    }

    fn build(discovery_url: Option<String>, jwks_uri: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            discovery_url,
            jwks_uri: RwLock::new(jwks_uri),
            cache: RwLock::new(None),
            http,
            ttl: Duration::from_secs(3600),
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    async fn jwks_uri(&self) -> Result<String> {
        if let Some(uri) = self.jwks_uri.read().await.as_ref() {
            return Ok(uri.clone());
        }
        let discovery_url = self
            .discovery_url
            .as_deref()
            .ok_or_else(|| Error::Config("no JWKS location configured".into()))?;

        debug!("Fetching OIDC discovery document from {}", discovery_url);
        let doc: DiscoveryDocument = self
            .http
            .get(discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Http(format!("Failed to fetch discovery document: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Http(format!("Malformed discovery document: {}", e)))?;

        *self.jwks_uri.write().await = Some(doc.jwks_uri.clone());
        Ok(doc.jwks_uri)
    }

    async fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        let cache = self.cache.read().await;
        let cached = cache.as_ref()?;
        if cached.fetched_at.elapsed() > self.ttl {
            return None;
        }
        cached.keys.get(kid).cloned()
    }

    async fn refresh_keys(&self) -> Result<()> {
        let uri = self.jwks_uri().await?;
        let set: JwkSet = self
            .http
            .get(&uri)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Http(format!("Failed to fetch JWKS: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Http(format!("Malformed JWKS: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in set.keys {
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                continue;
            };
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => warn!(kid = %kid, "Skipping unusable JWK: {}", err),
            }
        }

        info!("Cached {} signing keys from {}", keys.len(), uri);
        *self.cache.write().await = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl KeyResolver for JwksKeyResolver {
    async fn resolve(&self, header: &Header) -> Result<(DecodingKey, Algorithm)> {
        if !matches!(header.alg, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) {
            return Err(Error::InvalidSignature(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::InvalidSignature("token header missing kid".into()))?;

        if let Some(key) = self.cached_key(kid).await {
            return Ok((key, header.alg));
        }

        self.refresh_keys().await?;
        self.cached_key(kid)
            .await
            .map(|key| (key, header.alg))
            .ok_or_else(|| Error::InvalidSignature(format!("unknown key id {}", kid)))
    }
}
