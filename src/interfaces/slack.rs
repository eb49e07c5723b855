use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::core::delivery::Notifier;
use crate::core::error::StageError;

/// Posts to a Slack incoming webhook. Slack webhooks answer with a bare
/// "ok" rather than a message id, so the delivery reference is generated
/// locally once the post succeeds.
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, text: &str, _pr_reference: Option<&str>) -> Result<String, StageError> {
        let res = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("slack request failed: {}", e)))?;

        let status = res.status();
        if status.as_u16() == 404 || status.as_u16() == 403 {
            // A dead webhook URL will never start working; don't retry.
            return Err(StageError::Fatal(format!("slack webhook rejected ({})", status)));
        }
        if !status.is_success() {
            return Err(StageError::Transient(format!("slack returned {}", status)));
        }

        let reference = format!("slack-{}", Uuid::new_v4());
        info!(reference = %reference, "notification posted");
        Ok(reference)
    }
}
