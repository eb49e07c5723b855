use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::delivery::ChangeRequestApi;
use crate::core::diagnose::Diagnosis;
use crate::core::error::StageError;
use crate::core::event::CiEvent;
use crate::core::patch::{PatchProposal, RepoSnapshot};

/// GitHub REST client implementing both collaborator seams that talk to
/// the repository: snapshot reads (contents API at a commit) and
/// change-request creation (branch + contents + pull request).
pub struct GitHubClient {
    client: Client,
    api_base: String,
    token: String,
    base_branch: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: &str, base_branch: &str) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            base_branch: base_branch.to_string(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ci-medic")
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(StatusCode, Value), StageError> {
        let res = req
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("github request failed: {}", e)))?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StageError::Fatal(format!(
                "github rejected credentials ({})",
                status
            )));
        }
        if status.is_server_error() {
            return Err(StageError::Transient(format!("github error {}", status)));
        }
        let body: Value = res.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Open PR with the given head branch, if one exists.
    async fn find_open_pr(&self, repository: &str, branch: &str) -> Result<Option<String>, StageError> {
        let owner = repository.split('/').next().unwrap_or_default();
        let (status, body) = self
            .send(self.get(&format!(
                "/repos/{}/pulls?state=open&head={}:{}",
                repository, owner, branch
            )))
            .await?;
        if !status.is_success() {
            return Err(StageError::Transient(format!(
                "pull request lookup failed ({})",
                status
            )));
        }
        Ok(body
            .as_array()
            .and_then(|prs| prs.first())
            .and_then(|pr| pr["html_url"].as_str())
            .map(|s| s.to_string()))
    }

    async fn base_sha(&self, repository: &str) -> Result<String, StageError> {
        let (status, body) = self
            .send(self.get(&format!(
                "/repos/{}/git/ref/heads/{}",
                repository, self.base_branch
            )))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StageError::NotFound(format!(
                "base branch {} not found in {}",
                self.base_branch, repository
            )));
        }
        body["object"]["sha"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| StageError::Transient("base ref response missing sha".into()))
    }

    async fn ensure_branch(&self, repository: &str, branch: &str, sha: &str) -> Result<(), StageError> {
        let (status, _) = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/git/refs", repository))
                    .json(&json!({ "ref": format!("refs/heads/{}", branch), "sha": sha })),
            )
            .await?;
        // 422 means the branch already exists — fine, this is a retry.
        if status.is_success() || status == StatusCode::UNPROCESSABLE_ENTITY {
            Ok(())
        } else {
            Err(StageError::Transient(format!(
                "branch creation failed ({})",
                status
            )))
        }
    }

    async fn put_file(
        &self,
        repository: &str,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), StageError> {
        // The contents API needs the current blob sha when updating.
        let (status, body) = self
            .send(self.get(&format!(
                "/repos/{}/contents/{}?ref={}",
                repository, path, branch
            )))
            .await?;
        let existing_sha = if status.is_success() {
            body["sha"].as_str().map(|s| s.to_string())
        } else {
            None
        };

        let mut payload = json!({
            "message": message,
            "content": BASE64.encode(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            payload["sha"] = Value::String(sha);
        }

        let (status, _) = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    &format!("/repos/{}/contents/{}", repository, path),
                )
                .json(&payload),
            )
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(StageError::Transient(format!(
                "file commit for {} failed ({})",
                path, status
            )))
        }
    }
}

#[async_trait]
impl ChangeRequestApi for GitHubClient {
    /// Create-or-get keyed by a branch named after the idempotency key: a
    /// retry that finds the PR already open returns its reference instead
    /// of opening a second one.
    async fn create_or_get(
        &self,
        idempotency_key: &str,
        event: &CiEvent,
        diagnosis: &Diagnosis,
        proposal: &PatchProposal,
    ) -> Result<String, StageError> {
        let branch = format!("ci-medic/{}", idempotency_key);

        if let Some(existing) = self.find_open_pr(&event.repository, &branch).await? {
            info!(repository = %event.repository, pr = %existing, "reusing existing change request");
            return Ok(existing);
        }

        let sha = self.base_sha(&event.repository).await?;
        self.ensure_branch(&event.repository, &branch, &sha).await?;

        for change in &proposal.file_changes {
            self.put_file(
                &event.repository,
                &branch,
                &change.path,
                &change.new_excerpt,
                &format!("ci-medic: proposed fix for {}", change.path),
            )
            .await?;
        }

        let title = format!("CI fix proposal: {}", diagnosis.summary);
        let body = format!(
            "Automated proposal from ci-medic for failing build `{}`.\n\n\
             **Root cause**: {}\n**Confidence**: {:.2}\n\n{}\n\n\
             Please review before merging.",
            event.event_id,
            diagnosis.root_cause_category.as_str(),
            diagnosis.confidence,
            diagnosis.summary,
        );
        let (status, pr_body) = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/pulls", event.repository))
                    .json(&json!({
                        "title": title,
                        "head": branch,
                        "base": self.base_branch,
                        "body": body,
                    })),
            )
            .await?;

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            // Lost a race with a concurrent retry; the PR should exist now.
            warn!(repository = %event.repository, "pull request creation raced, re-checking");
            if let Some(existing) = self.find_open_pr(&event.repository, &branch).await? {
                return Ok(existing);
            }
            return Err(StageError::Transient(
                "pull request creation returned 422 but no open PR was found".into(),
            ));
        }
        if !status.is_success() {
            return Err(StageError::Transient(format!(
                "pull request creation failed ({})",
                status
            )));
        }
        pr_body["html_url"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| StageError::Transient("pull request response missing html_url".into()))
    }
}

#[async_trait]
impl RepoSnapshot for GitHubClient {
    async fn read_file(
        &self,
        repository: &str,
        commit_sha: &str,
        path: &str,
    ) -> Result<Option<String>, StageError> {
        let reference = if commit_sha.is_empty() {
            self.base_branch.clone()
        } else {
            commit_sha.to_string()
        };
        let (status, body) = self
            .send(self.get(&format!(
                "/repos/{}/contents/{}?ref={}",
                repository, path, reference
            )))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StageError::Transient(format!(
                "snapshot read of {} failed ({})",
                path, status
            )));
        }
        let encoded = body["content"]
            .as_str()
            .ok_or_else(|| StageError::Transient("contents response missing content".into()))?;
        let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(cleaned)
            .map_err(|e| StageError::Transient(format!("undecodable file content: {}", e)))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
