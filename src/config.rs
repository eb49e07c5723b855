use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::extract::ExtractConfig;

/// Pipeline tunables. Policy behavior is fixed by the state machine;
/// the numbers here are operator choices.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Diagnoses below this confidence skip patch synthesis.
    pub confidence_threshold: f64,
    /// Per-stage retry budget for transient failures.
    pub transient_budget: u32,
    /// Separate, smaller budget for schema violations.
    pub schema_budget: u32,
    pub max_fixes: usize,
    pub extract: ExtractConfig,
    pub extract_timeout: Duration,
    pub diagnosis_timeout: Duration,
    pub delivery_call_timeout: Duration,
    pub rate_limit_max_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            transient_budget: 3,
            schema_budget: 2,
            max_fixes: 5,
            extract: ExtractConfig::default(),
            extract_timeout: Duration::from_secs(10),
            diagnosis_timeout: Duration::from_secs(60),
            delivery_call_timeout: Duration::from_secs(30),
            rate_limit_max_wait: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Full service configuration, environment-driven like the rest of the
/// deployment. Missing optional collaborators (GitHub token, Slack
/// webhook, Jenkins credentials) disable those integrations rather than
/// failing startup; malformed numbers are fatal.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub webhook_secret: Option<String>,

    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    pub github_api_base: String,
    pub github_token: Option<String>,
    pub github_base_branch: String,
    pub slack_webhook: Option<String>,
    pub jenkins_user: Option<String>,
    pub jenkins_api_token: Option<String>,

    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let pipeline = PipelineConfig {
            confidence_threshold: env_parse("CIMEDIC_CONFIDENCE_THRESHOLD", 0.7)?,
            transient_budget: env_parse("CIMEDIC_TRANSIENT_BUDGET", 3)?,
            schema_budget: env_parse("CIMEDIC_SCHEMA_BUDGET", 2)?,
            max_fixes: env_parse("CIMEDIC_MAX_FIXES", 5)?,
            extract: ExtractConfig {
                cap_bytes: env_parse("CIMEDIC_SUMMARY_CAP_BYTES", 6144)?,
                lookback_lines: env_parse("CIMEDIC_LOOKBACK_LINES", 2000)?,
                fallback_tail_lines: env_parse("CIMEDIC_FALLBACK_TAIL_LINES", 200)?,
            },
            extract_timeout: env_secs("CIMEDIC_EXTRACT_TIMEOUT_SECS", 10)?,
            diagnosis_timeout: env_secs("CIMEDIC_DIAGNOSIS_TIMEOUT_SECS", 60)?,
            delivery_call_timeout: env_secs("CIMEDIC_DELIVERY_TIMEOUT_SECS", 30)?,
            rate_limit_max_wait: env_secs("CIMEDIC_RATE_LIMIT_MAX_WAIT_SECS", 30)?,
            backoff_base: Duration::from_millis(env_parse("CIMEDIC_BACKOFF_BASE_MS", 500)?),
            backoff_cap: Duration::from_millis(env_parse("CIMEDIC_BACKOFF_CAP_MS", 60_000)?),
        };

        Ok(Self {
            bind_addr: env_or("CIMEDIC_BIND_ADDR", "0.0.0.0:8080"),
            data_dir: PathBuf::from(env_or("CIMEDIC_DATA_DIR", "./data")),
            webhook_secret: env_opt("WEBHOOK_SECRET"),

            llm_base_url: env_or("LLM_BASE_URL", "https://api.groq.com/openai/v1"),
            llm_api_key: env_opt("LLM_API_KEY"),
            llm_model: env_or("LLM_MODEL", "llama-3.3-70b-versatile"),
            llm_max_tokens: env_parse("LLM_MAX_TOKENS", 1024)?,
            rate_limit_requests: env_parse("CIMEDIC_RATE_LIMIT_REQUESTS", 30)?,
            rate_limit_window: env_secs("CIMEDIC_RATE_LIMIT_WINDOW_SECS", 60)?,

            github_api_base: env_or("GITHUB_API_BASE", "https://api.github.com"),
            github_token: env_opt("GITHUB_TOKEN"),
            github_base_branch: env_or("GITHUB_BASE_BRANCH", "main"),
            slack_webhook: env_opt("SLACK_WEBHOOK"),
            jenkins_user: env_opt("JENKINS_USER"),
            jenkins_api_token: env_opt("JENKINS_API_TOKEN"),

            pipeline,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}
