//! Runtime orchestrator: drives a task from submission through login,
//! token refresh and delegation to its remote completion.
//!
//! The orchestrator keeps no state of its own. A task waiting for a browser
//! login is a persisted `awaiting_auth` record, picked up again by
//! [`Orchestrator::resume`] or [`Orchestrator::complete_login`].

pub mod orchestrator;
pub mod types;

pub use orchestrator::Orchestrator;
pub use types::*;
