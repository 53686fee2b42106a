use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use digest_agents::OpenAiConfig;
use digest_storage::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub mailbox_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub workspace_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/newsletter.db".to_string(),
            mailbox_dir: PathBuf::from("./mailbox"),
            artifacts_dir: PathBuf::from("./data/newsletters"),
            openai_api_key: None,
            openai_model: "gpt-4o".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            http_timeout_secs: 60,
            max_retries: 3,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            mailbox_dir: std::env::var("MAILBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.mailbox_dir),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            openai_model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            http_timeout_secs: std::env::var("DIGEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_retries: std::env::var("DIGEST_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            workspace_root: std::env::var("DIGEST_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn topics_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("topics.yaml")
    }

    /// Model settings; only stages that call the model need the API key.
    pub fn openai(&self) -> Result<OpenAiConfig> {
        let api_key = self
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY is not set")?;
        let mut config = OpenAiConfig::new(api_key);
        config.model = self.openai_model.clone();
        config.base_url = self.openai_base_url.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        Ok(config)
    }
}
