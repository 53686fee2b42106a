use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use digest_agents::{ExtractionAgent, ExtractionError};
use digest_core::{utc_midnight, Article, ArticleDraft, ParseRun};
use digest_storage::db::MessageQuery;
use digest_storage::Database;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    pub limit: Option<usize>,
    /// Run every extraction call but commit nothing, not even the run log.
    pub dry_run: bool,
    /// Re-extract already parsed messages, replacing their article sets.
    pub force: bool,
    pub start_date: Option<NaiveDate>,
}

/// Accumulates the counters of one extraction batch and turns them into a [`ParseRun`].
#[derive(Debug)]
pub struct ParseRunLogger {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    timer: Instant,
    attempted: u32,
    errors: u32,
    per_message: Vec<u32>,
}

impl ParseRunLogger {
    pub fn start(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            timer: Instant::now(),
            attempted: 0,
            errors: 0,
            per_message: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_success(&mut self, articles: usize) {
        self.attempted += 1;
        self.per_message.push(articles as u32);
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.errors += 1;
    }

    pub fn finish(self, error_message: Option<String>) -> ParseRun {
        let produced: u32 = self.per_message.iter().sum();
        ParseRun {
            id: self.run_id,
            started_at: self.started_at,
            duration_ms: self.timer.elapsed().as_millis() as u64,
            messages_attempted: self.attempted,
            articles_produced: produced,
            errors_count: self.errors,
            mean_articles_per_message: mean(&self.per_message),
            median_articles_per_message: median(&self.per_message),
            error_message,
        }
    }
}

fn mean(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

fn median(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (f64::from(sorted[mid - 1]) + f64::from(sorted[mid])) / 2.0
    } else {
        f64::from(sorted[mid])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageExtraction {
    pub message_id: String,
    pub drafts: Vec<ArticleDraft>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParseBatchOutcome {
    pub run: ParseRun,
    /// Successful extractions in processing order, returned even under dry-run.
    pub extractions: Vec<MessageExtraction>,
    pub dry_run: bool,
}

#[derive(Debug, Error)]
pub enum ParseBatchError {
    #[error("parse run {} aborted after {} messages: {source}", .run.id, .run.messages_attempted)]
    Aborted {
        run: ParseRun,
        /// Extractions finished before the abort; the only record of them under dry-run.
        extractions: Vec<MessageExtraction>,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runs one extraction batch over the unparsed (or, with `force`, all) messages in scope.
///
/// Per-message failures are counted and skipped. A systemic failure stops the batch; the
/// partial run is still logged before [`ParseBatchError::Aborted`] is returned.
pub async fn run_parse_batch(
    db: &Database,
    agent: &ExtractionAgent,
    options: ParseOptions,
    now: DateTime<Utc>,
) -> Result<ParseBatchOutcome, ParseBatchError> {
    let mut logger = ParseRunLogger::start(now);
    let candidates = db
        .messages_for_extraction(&MessageQuery {
            include_parsed: options.force,
            received_since: options.start_date.map(utc_midnight),
            limit: options.limit,
        })
        .await?;
    debug!(
        run_id = %logger.run_id(),
        candidates = candidates.len(),
        dry_run = options.dry_run,
        force = options.force,
        "starting parse batch"
    );

    let mut extractions = Vec::new();
    let mut abort = None;

    for message in &candidates {
        let drafts = match agent.extract(message, options.force).await {
            Ok(drafts) => drafts,
            Err(err) if err.is_systemic() => {
                logger.record_failure();
                warn!(message_id = %message.id, error = %err, "systemic extraction failure; aborting batch");
                abort = Some(err);
                break;
            }
            Err(err) => {
                logger.record_failure();
                debug!(message_id = %message.id, kind = %err.kind(), error = %err, "extraction failed");
                continue;
            }
        };

        if !options.dry_run {
            let articles: Vec<Article> = drafts
                .iter()
                .cloned()
                .map(|draft| Article::from_draft(draft, message, logger.run_id()))
                .collect();
            if let Err(err) = db
                .commit_extraction(&message.id, &articles, options.force)
                .await
            {
                logger.record_failure();
                let run = logger.finish(Some(format!("storage failure: {err:#}")));
                if let Err(log_err) = db.insert_parse_run(&run).await {
                    warn!(run_id = %run.id, error = %format!("{log_err:#}"), "could not record partial parse run");
                }
                return Err(ParseBatchError::Other(err));
            }
        }

        debug!(message_id = %message.id, articles = drafts.len(), "message extracted");
        logger.record_success(drafts.len());
        extractions.push(MessageExtraction {
            message_id: message.id.clone(),
            drafts,
        });
    }

    let run = logger.finish(abort.as_ref().map(|err| err.to_string()));
    if !options.dry_run {
        db.insert_parse_run(&run).await?;
    }
    info!(
        run_id = %run.id,
        attempted = run.messages_attempted,
        articles = run.articles_produced,
        errors = run.errors_count,
        duration_ms = run.duration_ms,
        dry_run = options.dry_run,
        "parse run complete"
    );

    match abort {
        Some(source) => Err(ParseBatchError::Aborted {
            run,
            extractions,
            source,
        }),
        None => Ok(ParseBatchOutcome {
            run,
            extractions,
            dry_run: options.dry_run,
        }),
    }
}
