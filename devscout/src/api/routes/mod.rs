//! API route modules.

pub mod control;
pub mod status;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(status::router())
        .merge(control::router())
        .with_state(state)
}
