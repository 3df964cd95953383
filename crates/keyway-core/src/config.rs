//! Configuration and data directory management.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Paths to all Keyway data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database holding tasks, credentials and pending logins (`data/keyway.db`).
    pub db_file: PathBuf,
    /// Static service table (`data/services.json`).
    pub services_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            db_file: root.join("keyway.db"),
            services_file: root.join("services.json"),
            root,
        })
    }
}

/// OAuth2 client registration at the identity provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Browser-facing authorization endpoint.
    pub authorization_endpoint: String,
    /// Token endpoint for `grant_type=authorization_code`.
    pub token_endpoint: String,
    /// Endpoint for `grant_type=refresh_token` (usually the token endpoint).
    pub refresh_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    /// Callback URL registered with the provider.
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("authorization_endpoint", &self.authorization_endpoint)
            .field("token_endpoint", &self.token_endpoint)
            .field("refresh_endpoint", &self.refresh_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl ProviderConfig {
    /// Build endpoints relative to an identity provider base URL.
    pub fn for_issuer(idp_url: &str, client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        let base = idp_url.trim_end_matches('/');
        Self {
            authorization_endpoint: format!("{}/authorize", base),
            token_endpoint: format!("{}/generate-token", base),
            refresh_endpoint: format!("{}/generate-token", base),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scopes: default_scopes(),
        }
    }

    /// Scopes joined for the `scope` query parameter.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    fn from_env(port: u16) -> Self {
        let idp_url = env_or("KEYWAY_IDP_URL", "http://localhost:5000");
        let redirect_uri = env_or(
            "KEYWAY_REDIRECT_URI",
            &format!("http://localhost:{}/callback", port),
        );
        let mut config = Self::for_issuer(
            &idp_url,
            &env_or("KEYWAY_CLIENT_ID", "keyway"),
            &env_or("KEYWAY_CLIENT_SECRET", ""),
            &redirect_uri,
        );
        if let Ok(url) = std::env::var("KEYWAY_AUTHORIZE_URL") {
            config.authorization_endpoint = url;
        }
        if let Ok(url) = std::env::var("KEYWAY_TOKEN_URL") {
            config.refresh_endpoint = url.clone();
            config.token_endpoint = url;
        }
        if let Ok(url) = std::env::var("KEYWAY_REFRESH_URL") {
            config.refresh_endpoint = url;
        }
        if let Ok(scopes) = std::env::var("KEYWAY_SCOPES") {
            config.scopes = scopes.split_whitespace().map(String::from).collect();
        }
        if config.client_secret.is_empty() {
            warn!("KEYWAY_CLIENT_SECRET is not set; token exchanges will likely be rejected");
        }
        config
    }
}

fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email", "api:read"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Top-level Keyway orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywayConfig {
    /// HTTP server port.
    pub port: u16,
    /// Externally reachable base URL of this orchestrator.
    pub public_url: String,
    /// Data directory paths.
    pub data_paths: DataPaths,
    /// Identity provider registration.
    pub provider: ProviderConfig,
    /// How long an issued authorization `state` stays redeemable.
    pub state_ttl_secs: u64,
    /// Access tokens this close to expiry are treated as expired.
    pub refresh_skew_secs: u64,
    /// Retention for tasks parked in `awaiting_auth`, used by the sweep.
    pub awaiting_retention_days: u64,
}

impl KeywayConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8083);

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            port,
            public_url: env_or("KEYWAY_PUBLIC_URL", &format!("http://localhost:{}", port)),
            data_paths,
            provider: ProviderConfig::from_env(port),
            state_ttl_secs: env_parse("KEYWAY_STATE_TTL_SECS", 1800),
            refresh_skew_secs: env_parse("KEYWAY_REFRESH_SKEW_SECS", 30),
            awaiting_retention_days: env_parse("KEYWAY_AWAITING_RETENTION_DAYS", 7),
        })
    }

    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs as i64)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_skew_secs as i64)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// A backend the orchestrator may delegate to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    /// Base URL; tasks are posted to `<url>/tasks`.
    pub url: String,
    /// Whether calls must carry a tenant-scoped bearer token.
    #[serde(default)]
    pub requires_auth: bool,
}

/// Static table of delegation targets (persisted to services.json).
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    services: HashMap<String, ServiceEndpoint>,
}

impl ServiceTable {
    pub fn new(services: impl IntoIterator<Item = ServiceEndpoint>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    /// Load the table from disk. A missing file yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("No service table at {}; delegation targets are empty", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let services: Vec<ServiceEndpoint> = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded {} delegation targets from {}", services.len(), path.display());
        Ok(Self::new(services))
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEndpoint> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
