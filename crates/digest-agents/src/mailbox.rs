use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digest_core::RawMessage;
use tokio::fs;
use tracing::debug;

/// Downloader collaborator: hands over messages a source sent since a checkpoint.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Messages from `source` received at or after `since` (all of them when `None`),
    /// oldest first. Overlap with earlier fetches is allowed; the store dedups by id.
    async fn fetch_new(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>>;
}

fn keep_since(mut messages: Vec<RawMessage>, since: Option<DateTime<Utc>>) -> Vec<RawMessage> {
    if let Some(since) = since {
        messages.retain(|m| m.received_at >= since);
    }
    messages.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.transport_id.cmp(&b.transport_id))
    });
    messages
}

/// Reads exported messages from `<root>/<source address>/*.json`, one message per file.
#[derive(Debug, Clone)]
pub struct DirectoryMailbox {
    root: PathBuf,
}

impl DirectoryMailbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn source_dir(&self, source: &str) -> PathBuf {
        self.root.join(source)
    }
}

async fn read_message_file(path: &Path) -> Result<RawMessage> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl MessageSource for DirectoryMailbox {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn fetch_new(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>> {
        let dir = self.source_dir(source);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking mailbox directory {}", dir.display()))?
        {
            debug!(source, dir = %dir.display(), "no mailbox directory for source");
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing mailbox directory {}", dir.display()))?;
        let mut messages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing mailbox directory {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            messages.push(read_message_file(&path).await?);
        }
        Ok(keep_since(messages, since))
    }
}

/// In-process mailbox for tests and scripted runs.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    messages: Mutex<BTreeMap<String, Vec<RawMessage>>>,
    fetches: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, source: &str, message: RawMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.entry(source.to_string()).or_default().push(message);
        }
    }

    /// Every `(source, since)` pair passed to `fetch_new`, in call order.
    pub fn fetches(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
        self.fetches.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageSource for MemoryMailbox {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch_new(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>> {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.push((source.to_string(), since));
        }
        let messages = self
            .messages
            .lock()
            .map_err(|_| anyhow::anyhow!("memory mailbox lock poisoned"))?
            .get(source)
            .cloned()
            .unwrap_or_default();
        Ok(keep_since(messages, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn raw(id: &str, day: u32) -> RawMessage {
        RawMessage {
            transport_id: id.to_string(),
            sender: "digest@example.com".to_string(),
            subject: Some(format!("Issue {id}")),
            received_at: Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap(),
            body: format!("body of {id}"),
        }
    }

    #[tokio::test]
    async fn directory_mailbox_reads_json_files_oldest_first() {
        let dir = tempdir().unwrap();
        let source_dir = dir.path().join("digest@example.com");
        std::fs::create_dir_all(&source_dir).unwrap();
        for (name, msg) in [("b.json", raw("m-2", 2)), ("a.json", raw("m-3", 3)), ("c.json", raw("m-1", 1))] {
            std::fs::write(source_dir.join(name), serde_json::to_string(&msg).unwrap()).unwrap();
        }
        std::fs::write(source_dir.join("notes.txt"), "ignored").unwrap();

        let mailbox = DirectoryMailbox::new(dir.path());
        let all = mailbox.fetch_new("digest@example.com", None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.transport_id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);

        let since = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        let newer = mailbox
            .fetch_new("digest@example.com", Some(since))
            .await
            .unwrap();
        assert_eq!(newer.len(), 2);
    }

    #[tokio::test]
    async fn missing_source_directory_is_empty() {
        let dir = tempdir().unwrap();
        let mailbox = DirectoryMailbox::new(dir.path());
        assert!(mailbox.fetch_new("nobody@example.com", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_message_file_is_an_error() {
        let dir = tempdir().unwrap();
        let source_dir = dir.path().join("digest@example.com");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("bad.json"), "{").unwrap();

        let err = DirectoryMailbox::new(dir.path())
            .fetch_new("digest@example.com", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[tokio::test]
    async fn memory_mailbox_records_checkpoints() {
        let mailbox = MemoryMailbox::new();
        mailbox.deliver("digest@example.com", raw("m-1", 1));
        let since = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();

        assert!(mailbox
            .fetch_new("digest@example.com", Some(since))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            mailbox.fetches(),
            vec![("digest@example.com".to_string(), Some(since))]
        );
    }
}
