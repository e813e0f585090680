//! Feeder commands and shutdown.
//!
//! Start and stop take the feeder kind from the `Feeder` header and always
//! answer `{"result": bool}`. A missing header is handled as an unknown kind.

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde_json::{Value, json};
use tracing::info;

use crate::api::server::AppState;

const FEEDER_HEADER: &str = "Feeder";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start_feeder", post(start_feeder))
        .route("/stop_feeder", post(stop_feeder))
        .route("/stop", post(stop))
}

fn feeder_kind(headers: &HeaderMap) -> &str {
    headers
        .get(FEEDER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn start_feeder(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let result = match &state.controller {
        Some(controller) => controller.start_feeder(feeder_kind(&headers)).await.is_ok(),
        None => false,
    };
    Json(json!({ "result": result }))
}

async fn stop_feeder(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let result = match &state.controller {
        Some(controller) => controller.stop_feeder(feeder_kind(&headers)).is_ok(),
        None => false,
    };
    Json(json!({ "result": result }))
}

/// Clear the run flag and shut the API down once this response is sent.
async fn stop(State(state): State<AppState>) -> Json<Value> {
    info!("Stop requested over the API");
    if let Some(controller) = &state.controller {
        controller.request_stop();
    }
    state.shutdown.cancel();
    Json(json!({ "result": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn post_json(state: AppState, uri: &str, feeder: Option<&str>) -> Value {
        let mut request = Request::builder().method("POST").uri(uri);
        if let Some(kind) = feeder {
            request = request.header(FEEDER_HEADER, kind);
        }
        let response = router()
            .with_state(state)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_commands_fail_without_controller() {
        let body = post_json(AppState::new(), "/start_feeder", Some("rescan")).await;
        assert_eq!(body, json!({"result": false}));
        let body = post_json(AppState::new(), "/stop_feeder", None).await;
        assert_eq!(body, json!({"result": false}));
    }

    #[tokio::test]
    async fn test_stop_cancels_shutdown_token() {
        let state = AppState::new();
        let token = state.shutdown.clone();
        let body = post_json(state, "/stop", None).await;
        assert_eq!(body, json!({"result": "ok"}));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_get_is_not_allowed() {
        let response = router()
            .with_state(AppState::new())
            .oneshot(Request::builder().uri("/stop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
