//! Shared application state for the operator API.

use std::sync::Arc;

use classbell_engine::dispatcher::Dispatcher;
use classbell_engine::store::QueryStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<dyn QueryStore>,
    pub dispatcher: Arc<Dispatcher>,
    /// Bearer token required on `/ops` routes; `None` leaves them open.
    pub ops_token: Option<String>,
}

impl AppState {
    pub fn new(
        queries: Arc<dyn QueryStore>,
        dispatcher: Arc<Dispatcher>,
        ops_token: Option<String>,
    ) -> Self {
        Self {
            queries,
            dispatcher,
            ops_token,
        }
    }
}
