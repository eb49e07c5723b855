use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ci_medic::config::Config;
use ci_medic::core::delivery::{BuildAnnotator, ChangeRequestApi, Notifier};
use ci_medic::core::limiter::RateLimiter;
use ci_medic::core::pipeline::{PipelineContext, run_pipeline};
use ci_medic::core::store::Store;
use ci_medic::interfaces::github::GitHubClient;
use ci_medic::interfaces::jenkins::{HttpLogSource, JenkinsAnnotator};
use ci_medic::interfaces::llm::OpenAiCompatReasoner;
use ci_medic::interfaces::slack::SlackNotifier;
use ci_medic::interfaces::web;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    let store = Store::open(config.data_dir.join("ci-medic.db"))?;

    let reasoner = OpenAiCompatReasoner::new(
        &config.llm_base_url,
        config.llm_api_key.as_deref().unwrap_or_default(),
        &config.llm_model,
        config.llm_max_tokens,
    );
    if config.llm_api_key.is_none() {
        warn!("no LLM API key configured; diagnosis calls will be rejected upstream");
    }

    let github = Arc::new(GitHubClient::new(
        &config.github_api_base,
        config.github_token.as_deref().unwrap_or_default(),
        &config.github_base_branch,
    ));
    let vcs = if config.github_token.is_some() {
        Some(github.clone() as Arc<dyn ChangeRequestApi>)
    } else {
        warn!("no GitHub token configured; runs will deliver diagnosis-only");
        None
    };
    let notifier = match &config.slack_webhook {
        Some(url) => Some(Arc::new(SlackNotifier::new(url)) as Arc<dyn Notifier>),
        None => {
            warn!("no Slack webhook configured; notifications disabled");
            None
        }
    };
    let annotator = match (&config.jenkins_user, &config.jenkins_api_token) {
        (Some(user), Some(token)) => {
            Some(Arc::new(JenkinsAnnotator::new(user, token)) as Arc<dyn BuildAnnotator>)
        }
        _ => None,
    };

    let ctx = Arc::new(PipelineContext {
        store,
        config: config.pipeline.clone(),
        limiter: RateLimiter::new(config.rate_limit_requests, config.rate_limit_window),
        log_source: Arc::new(HttpLogSource::new(
            config.jenkins_user.clone(),
            config.jenkins_api_token.clone(),
        )),
        reasoner: Arc::new(reasoner),
        repo: github,
        vcs,
        notifier,
        annotator,
    });

    // Resume anything that was mid-flight when the process last stopped.
    let stranded = ctx.store.list_active_runs().await?;
    if !stranded.is_empty() {
        info!(count = stranded.len(), "resuming unfinished runs");
        for run in stranded {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                run_pipeline(ctx, run.event_id).await;
            });
        }
    }

    web::serve(&config.bind_addr, ctx, config.webhook_secret.clone()).await
}
