//! Delegation of tasks to backend services.
//!
//! The outbound message never carries a remote task identifier; the backend
//! assigns one and [`DelegationClient::dispatch`] records it exactly once.

pub mod client;
pub mod transport;
pub mod types;

pub use client::DelegationClient;
pub use transport::{HttpTransport, Transport};
pub use types::*;
