use axum::{
    Json, Router,
    http::Method,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{runs, webhook};

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook::webhook_endpoint))
        .route("/health", get(health_endpoint))
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{event_id}", get(runs::get_run))
        .route("/api/runs/{event_id}/abandon", post(runs::abandon_run))
        .layer(build_cors())
        .with_state(state)
}

async fn health_endpoint() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
