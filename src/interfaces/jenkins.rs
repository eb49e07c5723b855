use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::core::delivery::BuildAnnotator;
use crate::core::diagnose::Diagnosis;
use crate::core::error::StageError;
use crate::core::event::{CiEvent, RawLogRef};
use crate::core::extract::LogSource;

/// Fetches raw logs over HTTP. Inline payloads pass straight through;
/// URL references (Jenkins consoleText, GHA log endpoints) are fetched
/// with optional Jenkins basic auth.
pub struct HttpLogSource {
    client: Client,
    jenkins_user: Option<String>,
    jenkins_api_token: Option<String>,
}

impl HttpLogSource {
    pub fn new(jenkins_user: Option<String>, jenkins_api_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            jenkins_user,
            jenkins_api_token,
        }
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn fetch(&self, log_ref: &RawLogRef) -> Result<String, StageError> {
        let url = match log_ref {
            RawLogRef::Inline { text } => return Ok(text.clone()),
            RawLogRef::Url { url } => url,
        };

        let mut req = self.client.get(url);
        if let (Some(user), Some(token)) = (&self.jenkins_user, &self.jenkins_api_token) {
            req = req.basic_auth(user, Some(token));
        }
        let res = req
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("log fetch failed: {}", e)))?;

        let status = res.status();
        if status.as_u16() == 404 {
            return Err(StageError::NotFound(format!("no log at {}", url)));
        }
        if !status.is_success() {
            return Err(StageError::Transient(format!(
                "log endpoint {} returned {}",
                url, status
            )));
        }
        res.text()
            .await
            .map_err(|e| StageError::Transient(format!("log body unreadable: {}", e)))
    }
}

#[derive(Deserialize)]
struct Crumb {
    #[serde(rename = "crumbRequestField")]
    field: String,
    crumb: String,
}

/// Posts the diagnosis back onto the failing Jenkins build as its
/// description. Strictly best-effort: callers log and move on if this
/// fails.
pub struct JenkinsAnnotator {
    client: Client,
    user: String,
    api_token: String,
}

impl JenkinsAnnotator {
    pub fn new(user: &str, api_token: &str) -> Self {
        Self {
            client: Client::new(),
            user: user.to_string(),
            api_token: api_token.to_string(),
        }
    }

    async fn crumb(&self, base_url: &str) -> Option<Crumb> {
        // CSRF protection may be off, in which case this 404s.
        let res = self
            .client
            .get(format!("{}/crumbIssuer/api/json", base_url))
            .basic_auth(&self.user, Some(&self.api_token))
            .send()
            .await
            .ok()?;
        if !res.status().is_success() {
            debug!("crumb issuer unavailable, posting without crumb");
            return None;
        }
        res.json().await.ok()
    }
}

#[async_trait]
impl BuildAnnotator for JenkinsAnnotator {
    async fn annotate(&self, event: &CiEvent, diagnosis: &Diagnosis) -> Result<(), StageError> {
        let build_url = event
            .build_url
            .as_deref()
            .ok_or_else(|| StageError::NotFound("event has no build url".into()))?;
        let build_url = build_url.trim_end_matches('/');

        // The crumb issuer lives at the Jenkins root, two path segments up
        // from .../job/<name>/<number>.
        let root = build_url
            .split("/job/")
            .next()
            .unwrap_or(build_url)
            .to_string();

        let description = format!(
            "<h4>Automated diagnosis</h4><p>{}</p><p>Root cause: <b>{}</b> (confidence {:.2})</p>",
            html_escape(&diagnosis.summary),
            diagnosis.root_cause_category.as_str(),
            diagnosis.confidence,
        );

        let mut req = self
            .client
            .post(format!("{}/submitDescription", build_url))
            .basic_auth(&self.user, Some(&self.api_token))
            .form(&[("description", description.as_str())]);
        if let Some(crumb) = self.crumb(&root).await {
            req = req.header(crumb.field.as_str(), crumb.crumb);
        }

        let res = req
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("description post failed: {}", e)))?;
        let status = res.status();
        if status.is_success() || status.is_redirection() {
            info!(build = %build_url, "build description updated");
            Ok(())
        } else {
            Err(StageError::Transient(format!(
                "jenkins returned {} for description post",
                status
            )))
        }
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
