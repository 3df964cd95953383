//! Keyway Store: task records, per-session credentials, pending logins.
//!
//! Every store is reached through a narrow trait so the orchestrator can be
//! wired against SQLite in production and [`MemoryStore`] in tests.

pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CredentialStore, PendingAuthStore, TaskStore};
pub use types::*;
