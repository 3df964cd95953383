//! Shared application state.

use std::sync::Arc;

use keyway_auth::{AuthorizationCoordinator, HttpIdentityProvider, IdentityProvider, TokenRefreshManager};
use keyway_core::{KeywayConfig, Result, ServiceTable};
use keyway_delegate::{DelegationClient, HttpTransport, Transport};
use keyway_runtime::Orchestrator;
use keyway_store::SqliteStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: KeywayConfig,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Open the database and service table under the configured data
    /// directory and talk to the configured identity provider over HTTP.
    pub fn open(config: KeywayConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.data_paths.db_file)?);
        let services = ServiceTable::load(&config.data_paths.services_file)?;
        let provider = Arc::new(HttpIdentityProvider::new(config.provider.clone())?);
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_parts(config, store, services, provider, transport))
    }

    pub fn with_parts(
        config: KeywayConfig,
        store: Arc<SqliteStore>,
        services: ServiceTable,
        provider: Arc<dyn IdentityProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let coordinator = Arc::new(
            AuthorizationCoordinator::new(
                config.provider.clone(),
                provider.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
            )
            .with_state_ttl(config.state_ttl()),
        );
        let refresh = Arc::new(TokenRefreshManager::new(provider, store.clone()));
        let delegation = DelegationClient::new(transport, services, store.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            coordinator,
            refresh,
            delegation,
            config.public_url.clone(),
        )
        .with_refresh_skew(config.refresh_skew());

        Self {
            config,
            store,
            orchestrator,
        }
    }
}
