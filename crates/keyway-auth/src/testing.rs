//! Scripted identity provider shared by the unit tests of this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::provider::{IdentityProvider, TokenResponse};
use keyway_core::{Error, Result};

#[derive(Default)]
pub(crate) struct FakeProvider {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub verifiers: Mutex<Vec<String>>,
    pub reject_refresh: bool,
    pub rotate_refresh: bool,
    pub refresh_delay: Duration,
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        self.verifiers.lock().push(code_verifier.to_string());
        if code == "bad" {
            return Err(Error::Provider("invalid_grant: code already used".into()));
        }
        Ok(TokenResponse {
            access_token: format!("at-{}", code),
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            refresh_token: Some(format!("rt-{}", code)),
            scope: None,
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.refresh_delay).await;
        if self.reject_refresh {
            return Err(Error::NoRefreshToken("rejected".into()));
        }
        Ok(TokenResponse {
            access_token: format!("at-refreshed-{}", n),
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            refresh_token: self.rotate_refresh.then(|| format!("rt-rotated-{}", n)),
            scope: None,
        })
    }
}
