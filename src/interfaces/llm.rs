use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::diagnose::ReasoningService;
use crate::core::error::StageError;

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

/// Reasoning service over any OpenAI-compatible chat-completions endpoint
/// (Groq, OpenAI, a local gateway). Temperature is pinned to zero; the
/// pipeline wants the most deterministic diagnosis the model can give.
pub struct OpenAiCompatReasoner {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompatReasoner {
    pub fn new(base_url: &str, api_key: &str, model: &str, max_tokens: u32) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }
}

#[async_trait]
impl ReasoningService for OpenAiCompatReasoner {
    async fn complete(&self, system: &str, user: &str) -> Result<String, StageError> {
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
            max_tokens: self.max_tokens,
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("reasoning request failed: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: ChatResponse = res.json().await.map_err(|e| {
            StageError::SchemaViolation(format!("malformed completion envelope: {}", e))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| StageError::SchemaViolation("completion had no choices".into()))
    }
}

fn classify_status(status: u16, body: &str) -> StageError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        401 | 403 => StageError::Fatal(format!("reasoning service rejected credentials: {}", snippet)),
        429 => StageError::RateLimited(format!("reasoning service throttled: {}", snippet)),
        500..=599 => StageError::Transient(format!("reasoning service error {}: {}", status, snippet)),
        _ => StageError::Transient(format!("reasoning service status {}: {}", status, snippet)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::RetryClass;

    #[test]
    fn status_classification_matches_retry_policy() {
        assert!(matches!(classify_status(401, ""), StageError::Fatal(_)));
        assert!(matches!(classify_status(429, ""), StageError::RateLimited(_)));
        assert!(matches!(classify_status(503, ""), StageError::Transient(_)));
        assert_eq!(classify_status(429, "").retry_class(), RetryClass::Transient);
        assert_eq!(classify_status(401, "").retry_class(), RetryClass::None);
    }
}
