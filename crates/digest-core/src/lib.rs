//! Core domain model for the newsletter digest pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "digest-core";

/// Reserved topic label for articles that fit no controlled topic.
pub const OTHER_TOPIC: &str = "other";

/// A registered newsletter sender and its sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSource {
    pub address: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Download checkpoint; `None` until the first successful download.
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Message as handed over by the downloader collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub transport_id: String,
    pub sender: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Persisted downloaded message, the unit of extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source_address: String,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_body: String,
    pub parsed: bool,
}

impl Message {
    pub fn from_raw(raw: RawMessage, source_address: &str) -> Self {
        Self {
            id: raw.transport_id,
            source_address: source_address.to_string(),
            subject: raw.subject,
            received_at: raw.received_at,
            raw_body: raw.body,
            parsed: false,
        }
    }
}

/// Validated extraction output for one article, before it is bound to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub summary: String,
    pub topic: String,
    pub url: Option<String>,
    pub tags: Vec<String>,
}

/// Persisted article. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub message_id: String,
    pub parse_run_id: Uuid,
    pub title: String,
    pub summary: String,
    pub topic: String,
    pub url: Option<String>,
    pub tags: Vec<String>,
    /// Copied from the owning message's `received_at`.
    pub published_at: DateTime<Utc>,
}

impl Article {
    pub fn from_draft(draft: ArticleDraft, message: &Message, parse_run_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.id.clone(),
            parse_run_id,
            title: draft.title,
            summary: draft.summary,
            topic: draft.topic,
            url: draft.url,
            tags: draft.tags,
            published_at: message.received_at,
        }
    }
}

/// Audit row for one extraction batch invocation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub messages_attempted: u32,
    pub articles_produced: u32,
    pub errors_count: u32,
    pub mean_articles_per_message: f64,
    pub median_articles_per_message: f64,
    pub error_message: Option<String>,
}

/// Audit row for one download stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub sources_checked: u32,
    pub messages_fetched: u32,
    pub messages_inserted: u32,
    pub error_message: Option<String>,
}

/// Per-topic summary over a rollup window. Derived data, safe to regenerate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulletPoint {
    pub topic: String,
    pub summary_text: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub supporting_article_ids: Vec<Uuid>,
}

impl BulletPoint {
    pub fn support_count(&self) -> usize {
        self.supporting_article_ids.len()
    }
}

/// Recorded output of one rollup invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRun {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub window: DateWindow,
    pub include_other_topics: bool,
    pub bullet_points: Vec<BulletPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Newsletter {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub bullet_points: Vec<BulletPoint>,
    pub rendered_artifact_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window start {start} is not before window end {end}")]
    Empty {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if start >= end {
            return Err(WindowError::Empty { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window from UTC midnight of `start` to UTC midnight of `end`.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        Self::new(utc_midnight(start), utc_midnight(end))
    }

    /// The seven days ending at `end` (exclusive).
    pub fn week_ending(end: NaiveDate) -> Self {
        let end = utc_midnight(end);
        Self {
            start: end - Duration::days(7),
            end,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

pub fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Bounded set of topic labels the extraction model may assign.
///
/// [`OTHER_TOPIC`] is never part of the controlled set itself; extraction admits it
/// separately and rollups only keep it when asked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicVocabulary {
    topics: BTreeSet<String>,
}

impl TopicVocabulary {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics = topics
            .into_iter()
            .map(Into::into)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && t != OTHER_TOPIC)
            .collect();
        Self { topics }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// True for controlled topics and for [`OTHER_TOPIC`].
    pub fn admits(&self, topic: &str) -> bool {
        topic == OTHER_TOPIC || self.contains(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    /// Labels offered to the model, controlled topics first and `other` last.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.topics.iter().cloned().collect();
        labels.push(OTHER_TOPIC.to_string());
        labels
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl Default for TopicVocabulary {
    fn default() -> Self {
        Self::new([
            "computer vision",
            "healthcare AI",
            "large language models",
            "hardware for AI",
            "AI policy",
        ])
    }
}
