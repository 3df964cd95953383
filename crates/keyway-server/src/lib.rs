//! Keyway orchestrator server: task submission, login callback and
//! maintenance over HTTP.

pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
