mod parse;
mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::StageError;
use super::event::CiEvent;
use super::extract::ExtractedSummary;
use super::limiter::RateLimiter;

pub use parse::extract_json;

/// Bounded root-cause categories the model must choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    Dependency,
    TestFlake,
    ConfigError,
    CompileError,
    Infra,
    Unknown,
}

impl RootCause {
    pub fn as_str(self) -> &'static str {
        match self {
            RootCause::Dependency => "dependency",
            RootCause::TestFlake => "test_flake",
            RootCause::ConfigError => "config_error",
            RootCause::CompileError => "compile_error",
            RootCause::Infra => "infra",
            RootCause::Unknown => "unknown",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "dependency" => Some(RootCause::Dependency),
            "test_flake" | "flake" => Some(RootCause::TestFlake),
            "config_error" | "config" => Some(RootCause::ConfigError),
            "compile_error" | "compile" => Some(RootCause::CompileError),
            "infra" | "infrastructure" => Some(RootCause::Infra),
            "unknown" => Some(RootCause::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedFix {
    pub target_file: String,
    pub description: String,
    /// Proposed replacement content for the target file, when the model
    /// supplied one.
    pub patch: Option<String>,
}

/// Structured model output, validated against the schema before it is
/// accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    pub root_cause_category: RootCause,
    pub confidence: f64,
    pub suggested_fixes: Vec<SuggestedFix>,
}

/// The external reasoning service. Implementations classify their own
/// failures: 429 → `RateLimited`, 5xx/network → `Transient`, bad
/// credentials → `Fatal`.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, StageError>;
}

#[derive(Debug, Clone)]
pub struct DiagnoseConfig {
    pub call_timeout: Duration,
    pub rate_limit_max_wait: Duration,
    pub max_fixes: usize,
}

/// One diagnosis attempt: rate-limit token, prompt, call, schema check.
///
/// Deliberately a single attempt — retry scheduling, backoff, and attempt
/// accounting belong to the pipeline driver, which persists attempt counts
/// across process restarts.
pub async fn diagnose_once(
    reasoner: &dyn ReasoningService,
    limiter: &RateLimiter,
    event: &CiEvent,
    summary: &ExtractedSummary,
    cfg: &DiagnoseConfig,
) -> Result<Diagnosis, StageError> {
    limiter.acquire(cfg.rate_limit_max_wait).await?;

    let system = prompt::system_prompt();
    let user = prompt::user_prompt(event, summary);

    let raw = tokio::time::timeout(cfg.call_timeout, reasoner.complete(system, &user))
        .await
        .map_err(|_| StageError::Timeout(cfg.call_timeout))??;

    let value = parse::extract_json(&raw).ok_or_else(|| {
        StageError::SchemaViolation(format!(
            "no JSON object in model response: {}",
            truncate(&raw, 200)
        ))
    })?;

    validate(&value, cfg.max_fixes)
}

/// Check the raw JSON against the `Diagnosis` schema.
fn validate(value: &serde_json::Value, max_fixes: usize) -> Result<Diagnosis, StageError> {
    let summary = value["summary"]
        .as_str()
        .or_else(|| value["diagnosis"].as_str())
        .ok_or_else(|| StageError::SchemaViolation("missing summary".into()))?
        .trim()
        .to_string();
    if summary.is_empty() {
        return Err(StageError::SchemaViolation("empty summary".into()));
    }

    let category_raw = value["root_cause_category"]
        .as_str()
        .or_else(|| value["root_cause"].as_str())
        .ok_or_else(|| StageError::SchemaViolation("missing root_cause_category".into()))?;
    let root_cause_category = RootCause::parse(category_raw).ok_or_else(|| {
        StageError::SchemaViolation(format!("unrecognized root cause: {}", category_raw))
    })?;

    let confidence = value["confidence"]
        .as_f64()
        .ok_or_else(|| StageError::SchemaViolation("missing confidence".into()))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(StageError::SchemaViolation(format!(
            "confidence {} out of range",
            confidence
        )));
    }

    let fixes_raw = match &value["suggested_fixes"] {
        serde_json::Value::Array(a) => a.as_slice(),
        serde_json::Value::Null => match &value["fixes"] {
            serde_json::Value::Array(a) => a.as_slice(),
            serde_json::Value::Null => &[],
            _ => return Err(StageError::SchemaViolation("fixes is not an array".into())),
        },
        _ => {
            return Err(StageError::SchemaViolation(
                "suggested_fixes is not an array".into(),
            ));
        }
    };

    let mut suggested_fixes = Vec::new();
    for fix in fixes_raw.iter().take(max_fixes) {
        let Some(target_file) = fix["target_file"].as_str() else {
            return Err(StageError::SchemaViolation(
                "fix entry missing target_file".into(),
            ));
        };
        let Some(description) = fix["description"].as_str() else {
            return Err(StageError::SchemaViolation(
                "fix entry missing description".into(),
            ));
        };
        suggested_fixes.push(SuggestedFix {
            target_file: target_file.to_string(),
            description: description.to_string(),
            patch: fix["patch"].as_str().map(|s| s.to_string()),
        });
    }

    Ok(Diagnosis {
        summary,
        root_cause_category,
        confidence,
        suggested_fixes,
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
