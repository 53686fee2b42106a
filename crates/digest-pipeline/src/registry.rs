use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use digest_core::{EmailSource, TopicVocabulary};
use digest_storage::Database;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            let address = normalize_address(&source.address);
            if address.is_empty() {
                bail!("source entry with an empty address");
            }
            if !seen.insert(address.clone()) {
                bail!("source {address} is listed more than once");
            }
        }
        Ok(())
    }

    /// Configured entries keyed by normalized address.
    pub fn by_address(&self) -> BTreeMap<String, &SourceConfig> {
        self.sources
            .iter()
            .map(|s| (normalize_address(&s.address), s))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TopicRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    topics: Vec<String>,
}

/// Loads `rules/topics.yaml`, falling back to the built-in vocabulary when it is absent.
pub async fn load_topic_vocabulary(path: &Path) -> Result<TopicVocabulary> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        debug!(path = %path.display(), "no topic rules file; using built-in vocabulary");
        return Ok(TopicVocabulary::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let rules: TopicRulesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let vocabulary = TopicVocabulary::new(rules.topics);
    if vocabulary.is_empty() {
        bail!("{} defines no topics", path.display());
    }
    Ok(vocabulary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSyncReport {
    pub added: Vec<String>,
    pub activated: Vec<String>,
    pub deactivated: Vec<String>,
    pub unchanged: usize,
    pub dry_run: bool,
}

impl SourceSyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.activated.is_empty() && self.deactivated.is_empty()
    }
}

/// Reconciles stored sources with the registry file. Sources are never deleted, only
/// deactivated, so their messages stay attributable.
pub async fn sync_sources(
    db: &Database,
    registry: &SourceRegistry,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<SourceSyncReport> {
    let configured = registry.by_address();
    let stored: BTreeMap<String, EmailSource> = db
        .list_sources()
        .await?
        .into_iter()
        .map(|s| (s.address.clone(), s))
        .collect();

    let mut report = SourceSyncReport {
        dry_run,
        ..SourceSyncReport::default()
    };

    for (address, config) in &configured {
        match stored.get(address) {
            None => {
                if !dry_run {
                    db.insert_source(&EmailSource {
                        address: address.clone(),
                        display_name: config.display_name.clone(),
                        active: config.enabled,
                        created_at: now,
                        last_checked_at: None,
                    })
                    .await
                    .with_context(|| format!("registering source {address}"))?;
                }
                report.added.push(address.clone());
            }
            Some(existing) if existing.active != config.enabled => {
                if !dry_run {
                    db.set_source_active(address, config.enabled).await?;
                }
                if config.enabled {
                    report.activated.push(address.clone());
                } else {
                    report.deactivated.push(address.clone());
                }
            }
            Some(_) => report.unchanged += 1,
        }
    }

    for (address, existing) in &stored {
        if configured.contains_key(address) {
            continue;
        }
        if existing.active {
            if !dry_run {
                db.set_source_active(address, false).await?;
            }
            report.deactivated.push(address.clone());
        } else {
            report.unchanged += 1;
        }
    }

    info!(
        added = report.added.len(),
        activated = report.activated.len(),
        deactivated = report.deactivated.len(),
        unchanged = report.unchanged,
        dry_run,
        "source registry synced"
    );
    Ok(report)
}
