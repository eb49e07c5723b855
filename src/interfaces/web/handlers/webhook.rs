use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::Utc;
use tracing::{info, warn};

use super::super::AppState;
use crate::core::event::{self, WebhookDisposition};
use crate::core::pipeline::driver::run_pipeline;

/// Single ingestion endpoint for Jenkins and GitHub Actions failure
/// notifications. Acknowledges quickly; the pipeline runs in a spawned
/// task.
pub async fn webhook_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Some(secret) = &state.webhook_secret {
        if !verify_webhook_signature(&headers, &body, secret) {
            warn!("webhook rejected: signature verification failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "success": false, "error": "Signature verification failed" })),
            );
        }
    }

    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "success": false, "error": "Body is not valid JSON" })),
            );
        }
    };

    let event = match event::normalize(&payload, Utc::now()) {
        WebhookDisposition::Failure(event) => event,
        WebhookDisposition::Ignored(reason) => {
            info!(reason = reason, "webhook ignored");
            return (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true, "ignored": reason })),
            );
        }
        WebhookDisposition::Malformed(reason) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "success": false, "error": reason })),
            );
        }
    };

    let event_id = event.event_id.clone();
    match state.ctx.store.create_run(&event).await {
        Ok(true) => {
            info!(event_id = %event_id, source = event.source.as_str(), "failure event accepted");
            let ctx = state.ctx.clone();
            let id = event_id.clone();
            tokio::spawn(async move {
                run_pipeline(ctx, id).await;
            });
            (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true, "event_id": event_id, "duplicate": false })),
            )
        }
        Ok(false) => {
            // Replayed delivery of an event we already own. Ack without
            // spawning a second driver.
            info!(event_id = %event_id, "duplicate event, already tracked");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "success": true, "event_id": event_id, "duplicate": true })),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": format!("Database error: {}", e) })),
        ),
    }
}

/// Verify webhook signature. Supports GitHub-style X-Hub-Signature-256
/// and a generic X-Signature header carrying raw HMAC-SHA256 hex. No
/// recognized header means rejection when a secret is configured.
fn verify_webhook_signature(headers: &HeaderMap, body: &str, secret: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if let Some(sig) = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(hex_sig) = sig.strip_prefix("sha256=") {
            return constant_time_eq(hex_sig.as_bytes(), expected.as_bytes());
        }
    }

    if let Some(sig) = headers.get("x-signature").and_then(|v| v.to_str().ok()) {
        return constant_time_eq(sig.as_bytes(), expected.as_bytes());
    }

    false
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signed_headers(body: &str, secret: &str) -> HeaderMap {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", HeaderValue::from_str(&sig).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_github_signature() {
        let body = r#"{"a":1}"#;
        let headers = signed_headers(body, "s3cret");
        assert!(verify_webhook_signature(&headers, body, "s3cret"));
    }

    #[test]
    fn rejects_wrong_secret_and_missing_header() {
        let body = r#"{"a":1}"#;
        let headers = signed_headers(body, "other");
        assert!(!verify_webhook_signature(&headers, body, "s3cret"));
        assert!(!verify_webhook_signature(&HeaderMap::new(), body, "s3cret"));
    }
}
