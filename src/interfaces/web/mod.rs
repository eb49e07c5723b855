mod handlers;
mod router;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::pipeline::driver::PipelineContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ctx: Arc<PipelineContext>,
    pub(crate) webhook_secret: Option<String>,
}

/// Bind and serve the API. Runs until the listener fails.
pub async fn serve(
    bind_addr: &str,
    ctx: Arc<PipelineContext>,
    webhook_secret: Option<String>,
) -> Result<()> {
    let state = AppState {
        ctx,
        webhook_secret,
    };
    let app = router::build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("API server running at http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::PipelineConfig;
    use crate::core::diagnose::ReasoningService;
    use crate::core::error::StageError;
    use crate::core::event::RawLogRef;
    use crate::core::extract::LogSource;
    use crate::core::limiter::RateLimiter;
    use crate::core::patch::RepoSnapshot;
    use crate::core::store::Store;

    struct NullLogSource;
    #[async_trait]
    impl LogSource for NullLogSource {
        async fn fetch(&self, log_ref: &RawLogRef) -> Result<String, StageError> {
            match log_ref {
                RawLogRef::Inline { text } => Ok(text.clone()),
                RawLogRef::Url { url } => Err(StageError::NotFound(url.clone())),
            }
        }
    }

    struct NullReasoner;
    #[async_trait]
    impl ReasoningService for NullReasoner {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, StageError> {
            Err(StageError::Fatal("no reasoner in tests".into()))
        }
    }

    struct NullRepo;
    #[async_trait]
    impl RepoSnapshot for NullRepo {
        async fn read_file(
            &self,
            _repository: &str,
            _commit_sha: &str,
            _path: &str,
        ) -> Result<Option<String>, StageError> {
            Ok(None)
        }
    }

    fn test_app(dir: &std::path::Path) -> Router {
        let store = Store::open(dir.join("test.db")).unwrap();
        let ctx = Arc::new(PipelineContext {
            store,
            config: PipelineConfig::default(),
            limiter: RateLimiter::new(10, std::time::Duration::from_secs(60)),
            log_source: Arc::new(NullLogSource),
            reasoner: Arc::new(NullReasoner),
            repo: Arc::new(NullRepo),
            vcs: None,
            notifier: None,
            annotator: None,
        });
        router::build_router(AppState {
            ctx,
            webhook_secret: None,
        })
    }

    async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_app(dir.path())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_yields_400() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = post_json(test_app(dir.path()), "/webhook", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn successful_build_is_acknowledged_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let payload = serde_json::json!({
            "build": { "phase": "FINALIZED", "status": "SUCCESS", "number": 7 },
            "name": "widgets"
        });
        let (status, body) =
            post_json(test_app(dir.path()), "/webhook", &payload.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["ignored"].is_string());
    }

    #[tokio::test]
    async fn duplicate_failure_event_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let payload = serde_json::json!({
            "build": {
                "phase": "FINALIZED",
                "status": "FAILURE",
                "number": 12,
                "full_url": "http://jenkins/job/widgets/12/",
                "scm": { "commit": "abc1234", "url": "https://github.com/acme/widgets" },
                "log": "FATAL: boom"
            },
            "name": "widgets"
        });

        let (status, body) = post_json(app.clone(), "/webhook", &payload.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duplicate"], false);
        let event_id = body["event_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(app, "/webhook", &payload.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["duplicate"], true);
        assert_eq!(body["event_id"], event_id.as_str());
    }

    #[tokio::test]
    async fn unknown_run_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let res = test_app(dir.path())
            .oneshot(
                Request::builder()
                    .uri("/api/runs/no-such-event")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
    }
}
