//! Shared application state for the API server.

use patchrunner::engine::Engine;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Owns the store, the log bus and every running job.
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}
