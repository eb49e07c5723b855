use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiSource {
    Jenkins,
    GithubActions,
    Other,
}

impl CiSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CiSource::Jenkins => "jenkins",
            CiSource::GithubActions => "github_actions",
            CiSource::Other => "other",
        }
    }
}

/// Handle to the raw build log. The log body itself is never stored on the
/// event; inline payload logs are the exception for sources that ship them
/// in the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawLogRef {
    Inline { text: String },
    Url { url: String },
}

/// One failing build notification. Immutable once created, unique by
/// `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiEvent {
    pub event_id: String,
    pub source: CiSource,
    pub repository: String,
    pub commit_sha: String,
    pub raw_log_ref: RawLogRef,
    pub build_url: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Outcome of normalizing a webhook payload.
#[derive(Debug)]
pub enum WebhookDisposition {
    /// A failing build worth running the pipeline for.
    Failure(CiEvent),
    /// Recognized payload that is not a failure (success, ping, wrong action).
    Ignored(&'static str),
    /// Payload we could not make sense of; rejected with a 4xx.
    Malformed(&'static str),
}

/// Normalize an incoming payload to a `CiEvent`.
///
/// Supports Jenkins notification-plugin payloads (`build`), GitHub Actions
/// `workflow_run` payloads, and a generic shape with explicit fields.
pub fn normalize(payload: &Value, received_at: DateTime<Utc>) -> WebhookDisposition {
    if payload.get("build").is_some() {
        return normalize_jenkins(payload, received_at);
    }
    if payload.get("workflow_run").is_some() {
        return normalize_github(payload, received_at);
    }
    if payload.get("zen").is_some() || payload.get("hook_id").is_some() {
        return WebhookDisposition::Ignored("github ping");
    }
    normalize_generic(payload, received_at)
}

fn normalize_jenkins(payload: &Value, received_at: DateTime<Utc>) -> WebhookDisposition {
    let build = &payload["build"];
    if !build.is_object() {
        return WebhookDisposition::Malformed("jenkins payload: build is not an object");
    }

    let status = build["status"].as_str().unwrap_or_default();
    if !matches!(status, "FAILURE" | "FAILED" | "UNSTABLE" | "ABORTED") {
        return WebhookDisposition::Ignored("jenkins build is not a failure");
    }

    let job = payload["name"].as_str().unwrap_or_default();
    let number = build["number"].as_u64();
    let url = build["full_url"]
        .as_str()
        .or_else(|| build["url"].as_str())
        .map(|s| s.to_string());
    let commit_sha = build["scm"]["commit"].as_str().unwrap_or_default();

    // Inline logs when the notification plugin attaches them, otherwise the
    // build's consoleText endpoint.
    let raw_log_ref = if let Some(log) = build["log"].as_str().or_else(|| build["logs"].as_str()) {
        RawLogRef::Inline {
            text: log.to_string(),
        }
    } else if let Some(u) = &url {
        RawLogRef::Url {
            url: format!("{}/consoleText", u.trim_end_matches('/')),
        }
    } else {
        return WebhookDisposition::Malformed("jenkins payload has neither logs nor a build url");
    };

    if job.is_empty() && url.is_none() {
        return WebhookDisposition::Malformed("jenkins payload has no job name or url");
    }

    let event_id = explicit_event_id(payload).unwrap_or_else(|| {
        synthesize_event_id(&[
            "jenkins",
            job,
            &number.map(|n| n.to_string()).unwrap_or_default(),
            commit_sha,
        ])
    });

    WebhookDisposition::Failure(CiEvent {
        event_id,
        source: CiSource::Jenkins,
        repository: job.to_string(),
        commit_sha: commit_sha.to_string(),
        raw_log_ref,
        build_url: url,
        received_at,
    })
}

fn normalize_github(payload: &Value, received_at: DateTime<Utc>) -> WebhookDisposition {
    let run = &payload["workflow_run"];
    if payload["action"].as_str() != Some("completed") {
        return WebhookDisposition::Ignored("workflow_run not completed");
    }
    if run["conclusion"].as_str() != Some("failure") {
        return WebhookDisposition::Ignored("workflow_run did not fail");
    }

    let Some(repository) = payload["repository"]["full_name"].as_str() else {
        return WebhookDisposition::Malformed("workflow_run payload missing repository");
    };
    let Some(commit_sha) = run["head_sha"].as_str() else {
        return WebhookDisposition::Malformed("workflow_run payload missing head_sha");
    };
    let Some(logs_url) = run["logs_url"].as_str() else {
        return WebhookDisposition::Malformed("workflow_run payload missing logs_url");
    };

    let run_id = run["id"].as_u64().unwrap_or_default();
    let event_id = explicit_event_id(payload).unwrap_or_else(|| {
        synthesize_event_id(&["gha", repository, &run_id.to_string(), commit_sha])
    });

    WebhookDisposition::Failure(CiEvent {
        event_id,
        source: CiSource::GithubActions,
        repository: repository.to_string(),
        commit_sha: commit_sha.to_string(),
        raw_log_ref: RawLogRef::Url {
            url: logs_url.to_string(),
        },
        build_url: run["html_url"].as_str().map(|s| s.to_string()),
        received_at,
    })
}

fn normalize_generic(payload: &Value, received_at: DateTime<Utc>) -> WebhookDisposition {
    let repository = payload["repository"].as_str().unwrap_or_default();
    let commit_sha = payload["commit_sha"].as_str().unwrap_or_default();

    let raw_log_ref = if let Some(log) = payload["log"].as_str() {
        RawLogRef::Inline {
            text: log.to_string(),
        }
    } else if let Some(u) = payload["log_url"].as_str() {
        RawLogRef::Url { url: u.to_string() }
    } else {
        return WebhookDisposition::Malformed("unrecognized payload shape");
    };

    if repository.is_empty() {
        return WebhookDisposition::Malformed("payload missing repository");
    }

    let event_id = explicit_event_id(payload)
        .unwrap_or_else(|| synthesize_event_id(&["other", repository, commit_sha]));

    WebhookDisposition::Failure(CiEvent {
        event_id,
        source: CiSource::Other,
        repository: repository.to_string(),
        commit_sha: commit_sha.to_string(),
        raw_log_ref,
        build_url: payload["build_url"].as_str().map(|s| s.to_string()),
        received_at,
    })
}

fn explicit_event_id(payload: &Value) -> Option<String> {
    payload["event_id"]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(sanitize_id)
}

/// Deterministic dedup key from whatever identifying parts the source gave
/// us. Empty parts are skipped so jenkins jobs without SCM info still get a
/// stable id.
fn synthesize_event_id(parts: &[&str]) -> String {
    let joined: Vec<String> = parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| sanitize_id(p))
        .collect();
    joined.join("-")
}

fn sanitize_id(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
