//! Read-only routes: liveness, controller status, store statistics and the
//! command log.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde_json::json;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::controller::ControllerStatus;
use crate::store::StoreStats;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/status_db", get(status_db))
        .route("/log", get(command_log))
}

async fn index() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Queue depths, active workers per stage and feeders per kind.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match &state.controller {
        Some(controller) => (StatusCode::OK, Json(controller.status())),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ControllerStatus::default()),
        ),
    }
}

async fn status_db(State(state): State<AppState>) -> ApiResult<Json<StoreStats>> {
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Store not attached"))?;
    Ok(Json(store.stats().await?))
}

async fn command_log(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(
        state
            .controller
            .as_ref()
            .map(|c| c.command_log())
            .unwrap_or_default(),
    )
}
