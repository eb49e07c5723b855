use axum::{
    Json,
    extract::{Path, State},
};

use super::super::AppState;
use crate::core::pipeline::PipelineRun;

fn run_summary(run: &PipelineRun) -> serde_json::Value {
    serde_json::json!({
        "run_id": run.run_id,
        "event_id": run.event_id,
        "state": run.state.as_str(),
        "needs_intervention": run.state.needs_intervention(),
        "last_error_kind": run.last_error_kind,
        "last_error": run.last_error,
        "created_at": run.created_at,
        "updated_at": run.updated_at,
    })
}

pub async fn list_runs(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.ctx.store.list_active_runs().await {
        Ok(runs) => {
            let runs: Vec<_> = runs.iter().map(run_summary).collect();
            Json(serde_json::json!({ "success": true, "runs": runs }))
        }
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Database error: {}", e)
        })),
    }
}

pub async fn get_run(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.ctx.store.get_run(&event_id).await {
        Ok(Some(run)) => {
            let mut body = run_summary(&run);
            body["attempts"] = serde_json::to_value(&run.attempts).unwrap_or_default();
            body["diagnosis"] = serde_json::to_value(&run.diagnosis).unwrap_or_default();
            body["delivery_receipt"] =
                serde_json::to_value(&run.delivery_receipt).unwrap_or_default();
            Json(serde_json::json!({ "success": true, "run": body }))
        }
        Ok(None) => Json(serde_json::json!({ "success": false, "error": "Run not found" })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Database error: {}", e)
        })),
    }
}

/// Operator escape hatch: mark a stuck or unwanted run abandoned. A run
/// already in a terminal state is left alone.
pub async fn abandon_run(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.ctx.store.abandon(&event_id).await {
        Ok(true) => Json(serde_json::json!({ "success": true, "message": "Run abandoned" })),
        Ok(false) => Json(serde_json::json!({
            "success": false,
            "error": "Run not found or already terminal"
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Database error: {}", e)
        })),
    }
}
