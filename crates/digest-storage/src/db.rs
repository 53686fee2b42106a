//! SQLite persistence for sources, messages, articles and run logs.
//!
//! Timestamps are stored as UTC milliseconds so range predicates compare integers.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use digest_core::{
    Article, BulletPoint, DateWindow, DownloadRun, EmailSource, Message, Newsletter, ParseRun,
    RollupRun,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

/// Candidate selection for an extraction batch.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub include_parsed: bool,
    pub received_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableCounts {
    pub sources: i64,
    pub messages: i64,
    pub parsed_messages: i64,
    pub articles: i64,
    pub parse_runs: i64,
    pub download_runs: i64,
    pub rollup_runs: i64,
    pub newsletters: i64,
}

/// Handle over the single-connection SQLite pool.
///
/// One connection keeps every stage's write transaction exclusive.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let parent = options.get_filename().parent().map(|p| p.to_path_buf());
        if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory database")?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }

    // -- sources ----------------------------------------------------------

    /// Inserts the source unless the address is already registered.
    pub async fn insert_source(&self, source: &EmailSource) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO email_sources (address, display_name, active, created_at, last_checked_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(address) DO NOTHING",
        )
        .bind(&source.address)
        .bind(&source.display_name)
        .bind(source.active)
        .bind(to_millis(source.created_at))
        .bind(source.last_checked_at.map(to_millis))
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting source {}", source.address))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_source_active(&self, address: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE email_sources SET active = ? WHERE address = ?")
            .bind(active)
            .bind(address)
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating source {address}"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_source_checkpoint(&self, address: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE email_sources SET last_checked_at = ? WHERE address = ?")
            .bind(to_millis(at))
            .bind(address)
            .execute(&self.pool)
            .await
            .with_context(|| format!("advancing checkpoint for {address}"))?;
        Ok(())
    }

    pub async fn get_source(&self, address: &str) -> Result<Option<EmailSource>> {
        let row = sqlx::query(
            "SELECT address, display_name, active, created_at, last_checked_at
             FROM email_sources WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    pub async fn list_sources(&self) -> Result<Vec<EmailSource>> {
        let rows = sqlx::query(
            "SELECT address, display_name, active, created_at, last_checked_at
             FROM email_sources ORDER BY address ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    pub async fn active_sources(&self) -> Result<Vec<EmailSource>> {
        Ok(self
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    // -- messages ---------------------------------------------------------

    /// Inserts a downloaded message; a repeated transport id is ignored.
    pub async fn insert_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (id, source_address, subject, received_at, raw_body, parsed)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.source_address)
        .bind(&message.subject)
        .bind(to_millis(message.received_at))
        .bind(&message.raw_body)
        .bind(message.parsed)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting message {}", message.id))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, source_address, subject, received_at, raw_body, parsed
             FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Messages in receive order, oldest first.
    pub async fn messages_for_extraction(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let limit = query
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT id, source_address, subject, received_at, raw_body, parsed
             FROM messages
             WHERE (? OR parsed = 0) AND received_at >= ?
             ORDER BY received_at ASC, id ASC
             LIMIT ?",
        )
        .bind(query.include_parsed)
        .bind(query.received_since.map(to_millis).unwrap_or(i64::MIN))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    // -- articles ---------------------------------------------------------

    /// Writes a message's articles and flips it to parsed in one transaction.
    ///
    /// With `replace_existing` the message's previous article set is deleted first.
    pub async fn commit_extraction(
        &self,
        message_id: &str,
        articles: &[Article],
        replace_existing: bool,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        if replace_existing {
            let removed = sqlx::query("DELETE FROM articles WHERE message_id = ?")
                .bind(message_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("clearing articles of {message_id}"))?;
            debug!(message_id, removed = removed.rows_affected(), "replaced article set");
        }

        let mut inserted = 0u64;
        for article in articles {
            let tags = serde_json::to_string(&article.tags).context("serializing tags")?;
            let result = sqlx::query(
                "INSERT INTO articles (id, message_id, parse_run_id, title, summary, topic, url, tags, published_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(article.id.to_string())
            .bind(&article.message_id)
            .bind(article.parse_run_id.to_string())
            .bind(&article.title)
            .bind(&article.summary)
            .bind(&article.topic)
            .bind(&article.url)
            .bind(tags)
            .bind(to_millis(article.published_at))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting article for {message_id}"))?;
            inserted += result.rows_affected();
        }

        let flipped = sqlx::query("UPDATE messages SET parsed = 1 WHERE id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        if flipped.rows_affected() == 0 {
            anyhow::bail!("message {message_id} does not exist");
        }

        tx.commit()
            .await
            .with_context(|| format!("committing extraction of {message_id}"))?;
        Ok(inserted)
    }

    pub async fn articles_for_message(&self, message_id: &str) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            "SELECT id, message_id, parse_run_id, title, summary, topic, url, tags, published_at
             FROM articles WHERE message_id = ? ORDER BY rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(article_from_row).collect()
    }

    /// Articles whose owning message was received inside `[start, end)`.
    pub async fn articles_in_window(&self, window: &DateWindow) -> Result<Vec<Article>> {
        let rows = sqlx::query(
            "SELECT a.id, a.message_id, a.parse_run_id, a.title, a.summary, a.topic, a.url, a.tags, a.published_at
             FROM articles a
             JOIN messages m ON m.id = a.message_id
             WHERE m.received_at >= ? AND m.received_at < ?
             ORDER BY m.received_at ASC, a.rowid ASC",
        )
        .bind(to_millis(window.start()))
        .bind(to_millis(window.end()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(article_from_row).collect()
    }

    pub async fn count_articles_for_run(&self, parse_run_id: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM articles WHERE parse_run_id = ?")
            .bind(parse_run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    // -- run logs ---------------------------------------------------------

    pub async fn insert_parse_run(&self, run: &ParseRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO parse_runs (id, started_at, duration_ms, messages_attempted, articles_produced,
                errors_count, mean_articles_per_message, median_articles_per_message, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(to_millis(run.started_at))
        .bind(run.duration_ms as i64)
        .bind(i64::from(run.messages_attempted))
        .bind(i64::from(run.articles_produced))
        .bind(i64::from(run.errors_count))
        .bind(run.mean_articles_per_message)
        .bind(run.median_articles_per_message)
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording parse run {}", run.id))?;
        Ok(())
    }

    /// Most recent first.
    pub async fn list_parse_runs(&self, limit: usize) -> Result<Vec<ParseRun>> {
        let rows = sqlx::query(
            "SELECT id, started_at, duration_ms, messages_attempted, articles_produced, errors_count,
                mean_articles_per_message, median_articles_per_message, error_message
             FROM parse_runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ParseRun> {
                Ok(ParseRun {
                    id: uuid_col(row, "id")?,
                    started_at: time_col(row, "started_at")?,
                    duration_ms: row.try_get::<i64, _>("duration_ms")?.max(0) as u64,
                    messages_attempted: count_col(row, "messages_attempted")?,
                    articles_produced: count_col(row, "articles_produced")?,
                    errors_count: count_col(row, "errors_count")?,
                    mean_articles_per_message: row.try_get("mean_articles_per_message")?,
                    median_articles_per_message: row.try_get("median_articles_per_message")?,
                    error_message: row.try_get("error_message")?,
                })
            })
            .collect()
    }

    pub async fn insert_download_run(&self, run: &DownloadRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO download_runs (id, started_at, duration_ms, sources_checked, messages_fetched,
                messages_inserted, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(to_millis(run.started_at))
        .bind(run.duration_ms as i64)
        .bind(i64::from(run.sources_checked))
        .bind(i64::from(run.messages_fetched))
        .bind(i64::from(run.messages_inserted))
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording download run {}", run.id))?;
        Ok(())
    }

    pub async fn insert_rollup_run(&self, run: &RollupRun) -> Result<()> {
        let bullets = serde_json::to_string(&run.bullet_points).context("serializing bullets")?;
        sqlx::query(
            "INSERT INTO rollup_runs (id, generated_at, window_start, window_end, include_other_topics, bullet_points)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(to_millis(run.generated_at))
        .bind(to_millis(run.window.start()))
        .bind(to_millis(run.window.end()))
        .bind(run.include_other_topics)
        .bind(bullets)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording rollup run {}", run.id))?;
        Ok(())
    }

    pub async fn latest_rollup_run(&self) -> Result<Option<RollupRun>> {
        let row = sqlx::query(
            "SELECT id, generated_at, window_start, window_end, include_other_topics, bullet_points
             FROM rollup_runs ORDER BY generated_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let window = DateWindow::new(time_col(&row, "window_start")?, time_col(&row, "window_end")?)
            .context("stored rollup window is empty")?;
        Ok(Some(RollupRun {
            id: uuid_col(&row, "id")?,
            generated_at: time_col(&row, "generated_at")?,
            window,
            include_other_topics: row.try_get("include_other_topics")?,
            bullet_points: bullets_col(&row)?,
        }))
    }

    // -- newsletters ------------------------------------------------------

    pub async fn insert_newsletter(&self, newsletter: &Newsletter) -> Result<()> {
        let bullets =
            serde_json::to_string(&newsletter.bullet_points).context("serializing bullets")?;
        sqlx::query(
            "INSERT INTO newsletters (id, generated_at, bullet_points, rendered_artifact_location)
             VALUES (?, ?, ?, ?)",
        )
        .bind(newsletter.id.to_string())
        .bind(to_millis(newsletter.generated_at))
        .bind(bullets)
        .bind(&newsletter.rendered_artifact_location)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording newsletter {}", newsletter.id))?;
        Ok(())
    }

    /// Latest by `generated_at`, independent of insertion order.
    pub async fn latest_newsletter(&self) -> Result<Option<Newsletter>> {
        Ok(self.list_newsletters(1).await?.into_iter().next())
    }

    /// Most recent first.
    pub async fn list_newsletters(&self, limit: usize) -> Result<Vec<Newsletter>> {
        let rows = sqlx::query(
            "SELECT id, generated_at, bullet_points, rendered_artifact_location
             FROM newsletters ORDER BY generated_at DESC, id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<Newsletter> {
                Ok(Newsletter {
                    id: uuid_col(row, "id")?,
                    generated_at: time_col(row, "generated_at")?,
                    bullet_points: bullets_col(row)?,
                    rendered_artifact_location: row.try_get("rendered_artifact_location")?,
                })
            })
            .collect()
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM email_sources) AS sources,
                (SELECT COUNT(*) FROM messages) AS messages,
                (SELECT COUNT(*) FROM messages WHERE parsed = 1) AS parsed_messages,
                (SELECT COUNT(*) FROM articles) AS articles,
                (SELECT COUNT(*) FROM parse_runs) AS parse_runs,
                (SELECT COUNT(*) FROM download_runs) AS download_runs,
                (SELECT COUNT(*) FROM rollup_runs) AS rollup_runs,
                (SELECT COUNT(*) FROM newsletters) AS newsletters",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TableCounts {
            sources: row.try_get("sources")?,
            messages: row.try_get("messages")?,
            parsed_messages: row.try_get("parsed_messages")?,
            articles: row.try_get("articles")?,
            parse_runs: row.try_get("parse_runs")?,
            download_runs: row.try_get("download_runs")?,
            rollup_runs: row.try_get("rollup_runs")?,
            newsletters: row.try_get("newsletters")?,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn time_col(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let millis: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(millis)
        .with_context(|| format!("column {column} holds out-of-range timestamp {millis}"))
}

fn uuid_col(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("column {column} holds invalid uuid {raw}"))
}

fn count_col(row: &SqliteRow, column: &str) -> Result<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).with_context(|| format!("column {column} holds invalid count {value}"))
}

fn bullets_col(row: &SqliteRow) -> Result<Vec<BulletPoint>> {
    let raw: String = row.try_get("bullet_points")?;
    serde_json::from_str(&raw).context("decoding stored bullet points")
}

fn source_from_row(row: &SqliteRow) -> Result<EmailSource> {
    let last_checked: Option<i64> = row.try_get("last_checked_at")?;
    Ok(EmailSource {
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        active: row.try_get("active")?,
        created_at: time_col(row, "created_at")?,
        last_checked_at: last_checked.and_then(DateTime::from_timestamp_millis),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        source_address: row.try_get("source_address")?,
        subject: row.try_get("subject")?,
        received_at: time_col(row, "received_at")?,
        raw_body: row.try_get("raw_body")?,
        parsed: row.try_get("parsed")?,
    })
}

fn article_from_row(row: &SqliteRow) -> Result<Article> {
    let tags: String = row.try_get("tags")?;
    Ok(Article {
        id: uuid_col(row, "id")?,
        message_id: row.try_get("message_id")?,
        parse_run_id: uuid_col(row, "parse_run_id")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        topic: row.try_get("topic")?,
        url: row.try_get("url")?,
        tags: serde_json::from_str(&tags).context("decoding article tags")?,
        published_at: time_col(row, "published_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use digest_core::ArticleDraft;

    fn ts(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).single().unwrap()
    }

    fn source(address: &str) -> EmailSource {
        EmailSource {
            address: address.to_string(),
            display_name: None,
            active: true,
            created_at: ts(1, 0),
            last_checked_at: None,
        }
    }

    fn message(id: &str, received_at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            source_address: "digest@example.com".to_string(),
            subject: Some(format!("issue {id}")),
            received_at,
            raw_body: format!("body of {id}"),
            parsed: false,
        }
    }

    fn article(message: &Message, run: Uuid, title: &str, topic: &str) -> Article {
        Article::from_draft(
            ArticleDraft {
                title: title.to_string(),
                summary: format!("{title} summary"),
                topic: topic.to_string(),
                url: None,
                tags: vec!["t".to_string()],
            },
            message,
            run,
        )
    }

    async fn seeded() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.insert_source(&source("digest@example.com")).await.unwrap();
        db
    }

    #[tokio::test]
    async fn duplicate_transport_ids_never_create_two_rows() {
        let db = seeded().await;
        let m = message("m-1", ts(1, 8));

        assert!(db.insert_message(&m).await.unwrap());
        assert!(!db.insert_message(&m).await.unwrap());
        assert_eq!(db.table_counts().await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn commit_extraction_flips_parsed_and_counts_rows() {
        let db = seeded().await;
        let m = message("m-1", ts(1, 8));
        db.insert_message(&m).await.unwrap();
        let run = Uuid::new_v4();

        let inserted = db
            .commit_extraction(
                &m.id,
                &[article(&m, run, "a", "ai"), article(&m, run, "b", "ai")],
                false,
            )
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        assert!(db.get_message("m-1").await.unwrap().unwrap().parsed);
        assert_eq!(db.count_articles_for_run(run).await.unwrap(), 2);
        let stored = db.articles_for_message("m-1").await.unwrap();
        assert_eq!(stored[0].title, "a");
        assert_eq!(stored[0].tags, vec!["t".to_string()]);
        assert_eq!(stored[0].published_at, m.received_at);
    }

    #[tokio::test]
    async fn replace_existing_swaps_the_article_set() {
        let db = seeded().await;
        let m = message("m-1", ts(1, 8));
        db.insert_message(&m).await.unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        db.commit_extraction(&m.id, &[article(&m, first, "old", "ai")], false)
            .await
            .unwrap();

        db.commit_extraction(&m.id, &[article(&m, second, "new", "ai")], true)
            .await
            .unwrap();

        let stored = db.articles_for_message("m-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "new");
        assert_eq!(db.count_articles_for_run(first).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_articles() {
        let db = seeded().await;
        let ghost = message("missing", ts(1, 8));

        let err = db
            .commit_extraction(&ghost.id, &[article(&ghost, Uuid::new_v4(), "a", "ai")], false)
            .await;

        assert!(err.is_err());
        assert_eq!(db.table_counts().await.unwrap().articles, 0);
    }

    #[tokio::test]
    async fn extraction_candidates_skip_parsed_and_respect_limit() {
        let db = seeded().await;
        for (id, day) in [("m-3", 3), ("m-1", 1), ("m-2", 2)] {
            db.insert_message(&message(id, ts(day, 8))).await.unwrap();
        }
        db.commit_extraction("m-1", &[], false).await.unwrap();

        let unparsed = db
            .messages_for_extraction(&MessageQuery::default())
            .await
            .unwrap();
        let ids: Vec<_> = unparsed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-2", "m-3"]);

        let limited = db
            .messages_for_extraction(&MessageQuery {
                include_parsed: true,
                received_since: None,
                limit: Some(2),
            })
            .await
            .unwrap();
        let ids: Vec<_> = limited.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);

        let since = db
            .messages_for_extraction(&MessageQuery {
                include_parsed: false,
                received_since: Some(ts(3, 0)),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "m-3");
    }

    #[tokio::test]
    async fn window_query_is_half_open_on_message_received_at() {
        let db = seeded().await;
        let inside = message("inside", Utc.with_ymd_and_hms(2024, 1, 7, 23, 59, 59).unwrap());
        let boundary = message("boundary", Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap());
        let run = Uuid::new_v4();
        for m in [&inside, &boundary] {
            db.insert_message(m).await.unwrap();
            db.commit_extraction(&m.id, &[article(m, run, &m.id, "ai")], false)
                .await
                .unwrap();
        }

        let window = DateWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let selected = db.articles_in_window(&window).await.unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].message_id, "inside");
    }

    #[tokio::test]
    async fn latest_newsletter_orders_by_generated_at_not_insertion() {
        let db = seeded().await;
        let newer = Newsletter {
            id: Uuid::new_v4(),
            generated_at: ts(9, 12),
            bullet_points: vec![],
            rendered_artifact_location: Some("newer.md".to_string()),
        };
        let older = Newsletter {
            id: Uuid::new_v4(),
            generated_at: ts(2, 12),
            bullet_points: vec![],
            rendered_artifact_location: Some("older.md".to_string()),
        };
        db.insert_newsletter(&newer).await.unwrap();
        db.insert_newsletter(&older).await.unwrap();

        let latest = db.latest_newsletter().await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
    }

    #[tokio::test]
    async fn sources_track_activity_and_checkpoints() {
        let db = seeded().await;
        assert!(!db.insert_source(&source("digest@example.com")).await.unwrap());
        db.insert_source(&source("weekly@example.com")).await.unwrap();
        db.set_source_active("weekly@example.com", false).await.unwrap();
        db.set_source_checkpoint("digest@example.com", ts(5, 0))
            .await
            .unwrap();

        let active = db.active_sources().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].last_checked_at, Some(ts(5, 0)));
        assert_eq!(db.list_sources().await.unwrap().len(), 2);
    }
}
