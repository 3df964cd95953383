//! Keyway Core: shared error type, configuration, and wire codes.

pub mod config;
pub mod error;
pub mod wire;

pub use config::{DataPaths, KeywayConfig, ProviderConfig, ServiceEndpoint, ServiceTable};
pub use error::{Error, Result};
