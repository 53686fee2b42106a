//! Stage orchestration for the newsletter digest: sources, download, parse, rollup, compose.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Utc};
use digest_agents::{
    DirectoryMailbox, ExtractionAgent, MessageSource, ModelSummarizer, OpenAiClient,
    StructuredModel,
};
use digest_core::{DateWindow, Newsletter, ParseRun, RollupRun, TopicVocabulary};
use digest_storage::{ArtifactStore, Database, StoredArtifact};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub mod compose;
pub mod config;
pub mod download;
pub mod parse;
pub mod registry;
pub mod rollup;

pub use compose::{
    compose, latest_newsletter, JsonRenderer, LatestNewsletter, MarkdownRenderer,
    NewsletterComposer, NewsletterRenderer, RenderFormat,
};
pub use config::PipelineConfig;
pub use download::{download_new_messages, DownloadOptions, DownloadSummary};
pub use parse::{run_parse_batch, ParseBatchError, ParseBatchOutcome, ParseOptions, ParseRunLogger};
pub use registry::{load_topic_vocabulary, sync_sources, SourceRegistry, SourceSyncReport};
pub use rollup::{group_by_topic, RollupEngine, RollupOptions};

pub const CRATE_NAME: &str = "digest-pipeline";

/// The seven days ending at the next UTC midnight after `now`.
pub fn default_rollup_window(now: DateTime<Utc>) -> DateWindow {
    let end = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or_else(|| now.date_naive());
    DateWindow::week_ending(end)
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_per_source: Option<usize>,
    pub limit: Option<usize>,
    pub window: Option<DateWindow>,
    pub include_other_topics: bool,
    pub format: RenderFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: SourceSyncReport,
    pub download: DownloadSummary,
    pub parse: ParseRun,
    pub rollup: RollupRun,
    pub newsletter: Newsletter,
}

impl RunReport {
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!(
                "sources: {} added, {} activated, {} deactivated",
                self.sources.added.len(),
                self.sources.activated.len(),
                self.sources.deactivated.len()
            ),
            format!(
                "download: {} sources, {} fetched, {} new",
                self.download.run.sources_checked,
                self.download.run.messages_fetched,
                self.download.run.messages_inserted
            ),
            format!(
                "parse: {} messages, {} articles, {} errors",
                self.parse.messages_attempted, self.parse.articles_produced, self.parse.errors_count
            ),
            format!(
                "rollup: {} bullet points for {} to {}",
                self.rollup.bullet_points.len(),
                self.rollup.window.start().format("%Y-%m-%d"),
                self.rollup.window.end().format("%Y-%m-%d")
            ),
            format!(
                "compose: newsletter {} at {}",
                self.newsletter.id,
                self.newsletter
                    .rendered_artifact_location
                    .as_deref()
                    .unwrap_or("-")
            ),
        ]
    }
}

/// Wires configuration, storage and collaborators together for the CLI.
pub struct Pipeline {
    config: PipelineConfig,
    db: Database,
    store: ArtifactStore,
    vocabulary: TopicVocabulary,
    mailbox: Arc<dyn MessageSource>,
    model: Option<Arc<dyn StructuredModel>>,
}

impl Pipeline {
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        let vocabulary = load_topic_vocabulary(&config.topics_path()).await?;
        Ok(Self {
            store: ArtifactStore::new(config.artifacts_dir.clone()),
            mailbox: Arc::new(DirectoryMailbox::new(config.mailbox_dir.clone())),
            config,
            db,
            vocabulary,
            model: None,
        })
    }

    pub async fn open_from_env() -> Result<Self> {
        Self::open(PipelineConfig::from_env()).await
    }

    pub fn from_parts(config: PipelineConfig, db: Database, vocabulary: TopicVocabulary) -> Self {
        Self {
            store: ArtifactStore::new(config.artifacts_dir.clone()),
            mailbox: Arc::new(DirectoryMailbox::new(config.mailbox_dir.clone())),
            config,
            db,
            vocabulary,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn StructuredModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn MessageSource>) -> Self {
        self.mailbox = mailbox;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn vocabulary(&self) -> &TopicVocabulary {
        &self.vocabulary
    }

    /// The injected model, or an OpenAI client built from config on first use.
    fn model(&self) -> Result<Arc<dyn StructuredModel>> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }
        let openai = self
            .config
            .openai()
            .context("model-backed stages need a configured model")?;
        Ok(Arc::new(OpenAiClient::new(openai)?))
    }

    pub async fn sync_sources(&self, dry_run: bool) -> Result<SourceSyncReport> {
        let registry = SourceRegistry::load(&self.config.sources_path()).await?;
        sync_sources(&self.db, &registry, dry_run, Utc::now()).await
    }

    pub async fn download(&self, options: DownloadOptions) -> Result<DownloadSummary> {
        download_new_messages(&self.db, self.mailbox.as_ref(), options, Utc::now()).await
    }

    pub async fn parse(&self, options: ParseOptions) -> Result<ParseBatchOutcome, ParseBatchError> {
        let agent = ExtractionAgent::new(self.model()?, self.vocabulary.clone(), self.config.backoff());
        run_parse_batch(&self.db, &agent, options, Utc::now()).await
    }

    pub async fn rollup(&self, options: RollupOptions) -> Result<RollupRun> {
        let summarizer = Arc::new(ModelSummarizer::new(self.model()?, self.config.backoff()));
        RollupEngine::new(self.db.clone(), summarizer, self.vocabulary.clone())
            .run(options, Utc::now())
            .await
    }

    pub async fn compose(&self, format: RenderFormat) -> Result<Newsletter> {
        NewsletterComposer::new(self.db.clone(), self.store.clone(), format.renderer())
            .compose_latest(Utc::now())
            .await
    }

    pub async fn latest(&self) -> Result<Option<LatestNewsletter>> {
        latest_newsletter(&self.db, &self.store).await
    }

    /// Runs every stage in order; the first unrecoverable failure stops the run.
    pub async fn run_all(&self, options: RunOptions) -> Result<RunReport> {
        let started_at = Utc::now();
        let sources = self.sync_sources(false).await.context("source sync stage")?;
        let download = self
            .download(DownloadOptions {
                max_per_source: options.max_per_source,
            })
            .await
            .context("download stage")?;
        let parse = self
            .parse(ParseOptions {
                limit: options.limit,
                ..ParseOptions::default()
            })
            .await
            .context("parse stage")?;
        let rollup = self
            .rollup(RollupOptions {
                window: options
                    .window
                    .unwrap_or_else(|| default_rollup_window(started_at)),
                include_other_topics: options.include_other_topics,
                dry_run: false,
            })
            .await
            .context("rollup stage")?;
        let newsletter = self.compose(options.format).await.context("compose stage")?;

        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            sources,
            download,
            parse: parse.run,
            rollup,
            newsletter,
        };
        let stored = self.write_run_report(&report).await?;
        info!(run_id = %report.run_id, report = %stored.absolute_path.display(), "pipeline run complete");
        Ok(report)
    }

    async fn write_run_report(&self, report: &RunReport) -> Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        self.store
            .store_bytes(report.finished_at, "reports", "json", &bytes)
            .await
    }
}
