//! Credential rotation after a backend rejects an access token.
//!
//! Providers may invalidate a refresh token on first use, so two callers
//! must never both spend the same one. Each session has its own async lock;
//! a caller that queued behind a rotation returns the rotated credential
//! instead of contacting the provider again.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::provider::IdentityProvider;
use keyway_core::{Error, Result};
use keyway_store::{Credential, CredentialStore};

pub struct TokenRefreshManager {
    provider: Arc<dyn IdentityProvider>,
    credentials: Arc<dyn CredentialStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenRefreshManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            provider,
            credentials,
            locks: DashMap::new(),
        }
    }

    fn session_lock(&self, session_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's lock entry once no other caller holds or awaits it.
    fn release(&self, session_key: &str, lock: Arc<Mutex<()>>) {
        self.locks
            .remove_if(session_key, |_, entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
    }

    /// Rotate the credential of `session_key` and return the new one.
    ///
    /// Fails `AuthRequired` with no stored credential, `TenantMismatch` if
    /// the stored credential belongs to another tenant, and `NoRefreshToken`
    /// when there is no usable refresh token. The last two leave the stored
    /// credential untouched.
    pub async fn on_auth_failure(&self, session_key: &str, tenant_id: &str) -> Result<Credential> {
        let seen = self
            .credentials
            .get(session_key)?
            .map(|c| c.access_token);

        let lock = self.session_lock(session_key);
        let guard = lock.lock().await;
        let result = self.rotate(session_key, tenant_id, seen).await;
        drop(guard);
        self.release(session_key, lock);
        result
    }

    async fn rotate(&self, session_key: &str, tenant_id: &str, seen: Option<String>) -> Result<Credential> {
        let current = self
            .credentials
            .get(session_key)?
            .ok_or_else(|| Error::AuthRequired {
                session_key: session_key.to_string(),
            })?;

        if current.tenant_id != tenant_id {
            return Err(Error::TenantMismatch {
                expected: tenant_id.to_string(),
                found: Some(current.tenant_id),
            });
        }

        if seen.as_deref() != Some(current.access_token.as_str()) {
            debug!(session_key = %session_key, "Credential rotated concurrently; reusing it");
            return Ok(current);
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::NoRefreshToken(format!("none stored for session {}", session_key)))?;

        let tokens = self.provider.refresh(&refresh_token).await?;
        let credential =
            tokens.into_credential(session_key, &current.tenant_id, Some(refresh_token), Utc::now());
        self.credentials.put(session_key, credential.clone())?;

        info!(session_key = %session_key, "Credential refreshed");
        Ok(credential)
    }

    /// Stored credential of `session_key`, rotated first when it expires
    /// within `skew` and can be refreshed.
    pub async fn usable_credential(
        &self,
        session_key: &str,
        tenant_id: &str,
        skew: chrono::Duration,
    ) -> Result<Option<Credential>> {
        let Some(current) = self.credentials.get(session_key)? else {
            return Ok(None);
        };
        if current.tenant_id != tenant_id {
            return Err(Error::TenantMismatch {
                expected: tenant_id.to_string(),
                found: Some(current.tenant_id),
            });
        }
        if !current.is_expired(Utc::now(), skew) || !current.has_refresh_token() {
            return Ok(Some(current));
        }

        debug!(session_key = %session_key, "Access token near expiry; refreshing ahead of use");
        match self.on_auth_failure(session_key, tenant_id).await {
            Ok(credential) => Ok(Some(credential)),
            // The backend will reject the stale token and the caller re-authenticates.
            Err(Error::NoRefreshToken(_)) => Ok(Some(current)),
            Err(e) => Err(e),
        }
    }
}
