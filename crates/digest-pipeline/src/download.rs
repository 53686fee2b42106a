use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use digest_agents::MessageSource;
use digest_core::{DownloadRun, Message};
use digest_storage::Database;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    /// Caps how many new messages are stored from each source per run.
    pub max_per_source: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDownload {
    pub address: String,
    pub fetched: usize,
    pub inserted: usize,
    pub checkpoint: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub run: DownloadRun,
    pub sources: Vec<SourceDownload>,
}

/// Pulls new messages for every active source into the message store.
///
/// A failing source keeps its checkpoint and does not stop the others. The cap counts newly
/// stored messages; a capped source advances only to its newest examined message so the
/// remainder is fetched next time.
pub async fn download_new_messages(
    db: &Database,
    mailbox: &dyn MessageSource,
    options: DownloadOptions,
    now: DateTime<Utc>,
) -> Result<DownloadSummary> {
    let timer = Instant::now();
    let sources = db.active_sources().await?;
    let mut results = Vec::with_capacity(sources.len());
    let mut failures = Vec::new();

    for source in &sources {
        let since = source.last_checked_at;
        let fetched = match mailbox.fetch_new(&source.address, since).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(source = %source.address, error = %format!("{err:#}"), "fetch failed");
                failures.push(format!("{}: {err:#}", source.address));
                results.push(SourceDownload {
                    address: source.address.clone(),
                    fetched: 0,
                    inserted: 0,
                    checkpoint: since,
                    error: Some(format!("{err:#}")),
                });
                continue;
            }
        };

        // the cap counts new messages only; overlap at the checkpoint is skipped for free
        let max = options.max_per_source.unwrap_or(usize::MAX);
        let mut pending = fetched.into_iter().peekable();
        let mut examined = 0usize;
        let mut inserted = 0usize;
        let mut newest = None;
        while inserted < max {
            let Some(raw) = pending.next() else {
                break;
            };
            examined += 1;
            newest = Some(raw.received_at);
            let message = Message::from_raw(raw, &source.address);
            if db.insert_message(&message).await? {
                inserted += 1;
            } else {
                debug!(message_id = %message.id, "message already stored");
            }
        }
        let capped = pending.peek().is_some();

        let checkpoint = if capped { newest.or(since) } else { Some(now) };
        if let Some(checkpoint) = checkpoint {
            db.set_source_checkpoint(&source.address, checkpoint).await?;
        }
        debug!(source = %source.address, fetched = examined, inserted, capped, "source downloaded");
        results.push(SourceDownload {
            address: source.address.clone(),
            fetched: examined,
            inserted,
            checkpoint,
            error: None,
        });
    }

    let run = DownloadRun {
        id: Uuid::new_v4(),
        started_at: now,
        duration_ms: timer.elapsed().as_millis() as u64,
        sources_checked: sources.len() as u32,
        messages_fetched: results.iter().map(|r| r.fetched as u32).sum(),
        messages_inserted: results.iter().map(|r| r.inserted as u32).sum(),
        error_message: (!failures.is_empty()).then(|| failures.join("; ")),
    };
    db.insert_download_run(&run).await?;
    info!(
        run_id = %run.id,
        sources = run.sources_checked,
        fetched = run.messages_fetched,
        inserted = run.messages_inserted,
        failed_sources = failures.len(),
        "download run complete"
    );

    Ok(DownloadSummary {
        run,
        sources: results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use digest_agents::MemoryMailbox;
    use digest_core::{EmailSource, RawMessage};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
    }

    fn raw(id: &str, day: u32) -> RawMessage {
        RawMessage {
            transport_id: id.to_string(),
            sender: "digest@example.com".to_string(),
            subject: None,
            received_at: at(day),
            body: format!("body {id}"),
        }
    }

    async fn db_with_source(address: &str, active: bool) -> Database {
        let db = Database::in_memory().await.unwrap();
        db.insert_source(&EmailSource {
            address: address.to_string(),
            display_name: None,
            active,
            created_at: at(1),
            last_checked_at: None,
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn repeated_downloads_never_duplicate_messages() {
        let db = db_with_source("digest@example.com", true).await;
        let mailbox = MemoryMailbox::new();
        mailbox.deliver("digest@example.com", raw("m-1", 1));
        mailbox.deliver("digest@example.com", raw("m-2", 2));

        let first = download_new_messages(&db, &mailbox, DownloadOptions::default(), at(1))
            .await
            .unwrap();
        assert_eq!(first.run.messages_inserted, 2);

        // checkpoint is day 1 09:00, so both messages overlap the second fetch
        let second = download_new_messages(&db, &mailbox, DownloadOptions::default(), at(3))
            .await
            .unwrap();
        assert_eq!(second.run.messages_fetched, 2);
        assert_eq!(second.run.messages_inserted, 0);

        let counts = db.table_counts().await.unwrap();
        assert_eq!(counts.messages, 2);
        assert_eq!(counts.download_runs, 2);
        assert_eq!(
            mailbox.fetches(),
            vec![
                ("digest@example.com".to_string(), None),
                ("digest@example.com".to_string(), Some(at(1))),
            ]
        );
    }

    #[tokio::test]
    async fn capped_source_checkpoints_at_last_taken_message() {
        let db = db_with_source("digest@example.com", true).await;
        let mailbox = MemoryMailbox::new();
        for (id, day) in [("m-1", 1), ("m-2", 2), ("m-3", 3)] {
            mailbox.deliver("digest@example.com", raw(id, day));
        }

        let summary = download_new_messages(
            &db,
            &mailbox,
            DownloadOptions {
                max_per_source: Some(2),
            },
            at(10),
        )
        .await
        .unwrap();

        assert_eq!(summary.run.messages_inserted, 2);
        assert_eq!(summary.sources[0].checkpoint, Some(at(2)));
        let source = db.get_source("digest@example.com").await.unwrap().unwrap();
        assert_eq!(source.last_checked_at, Some(at(2)));
    }

    async fn capped_runs(db: &Database, mailbox: &MemoryMailbox, max: usize, runs: u32) -> Vec<usize> {
        let mut inserted = Vec::new();
        for run in 0..runs {
            let summary = download_new_messages(
                db,
                mailbox,
                DownloadOptions {
                    max_per_source: Some(max),
                },
                at(10 + run),
            )
            .await
            .unwrap();
            inserted.push(summary.run.messages_inserted as usize);
        }
        inserted
    }

    #[tokio::test]
    async fn cap_of_one_drains_the_backlog_one_message_per_run() {
        let db = db_with_source("digest@example.com", true).await;
        let mailbox = MemoryMailbox::new();
        for (id, day) in [("m-1", 1), ("m-2", 2), ("m-3", 3)] {
            mailbox.deliver("digest@example.com", raw(id, day));
        }

        assert_eq!(capped_runs(&db, &mailbox, 1, 4).await, vec![1, 1, 1, 0]);
        assert_eq!(db.table_counts().await.unwrap().messages, 3);
        let source = db.get_source("digest@example.com").await.unwrap().unwrap();
        assert_eq!(source.last_checked_at, Some(at(13)));
    }

    #[tokio::test]
    async fn cap_makes_progress_through_messages_sharing_a_timestamp() {
        let db = db_with_source("digest@example.com", true).await;
        let mailbox = MemoryMailbox::new();
        for id in ["m-a", "m-b", "m-c", "m-d", "m-e"] {
            mailbox.deliver("digest@example.com", raw(id, 2));
        }

        assert_eq!(capped_runs(&db, &mailbox, 2, 4).await, vec![2, 2, 1, 0]);
        assert_eq!(db.table_counts().await.unwrap().messages, 5);
    }

    #[tokio::test]
    async fn inactive_sources_are_not_fetched() {
        let db = db_with_source("paused@example.com", false).await;
        let mailbox = MemoryMailbox::new();
        mailbox.deliver("paused@example.com", raw("m-1", 1));

        let summary = download_new_messages(&db, &mailbox, DownloadOptions::default(), at(2))
            .await
            .unwrap();

        assert_eq!(summary.run.sources_checked, 0);
        assert!(mailbox.fetches().is_empty());
    }

    struct BrokenMailbox;

    #[async_trait]
    impl MessageSource for BrokenMailbox {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn fetch_new(
            &self,
            _source: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<RawMessage>> {
            anyhow::bail!("mailbox offline")
        }
    }

    #[tokio::test]
    async fn failed_fetch_keeps_checkpoint_and_is_recorded() {
        let db = db_with_source("digest@example.com", true).await;

        let summary = download_new_messages(&db, &BrokenMailbox, DownloadOptions::default(), at(2))
            .await
            .unwrap();

        assert!(summary
            .run
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("mailbox offline")));
        let source = db.get_source("digest@example.com").await.unwrap().unwrap();
        assert!(source.last_checked_at.is_none());
    }
}
