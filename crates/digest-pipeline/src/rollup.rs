use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use digest_agents::Summarize;
use digest_core::{Article, BulletPoint, DateWindow, RollupRun, TopicVocabulary, OTHER_TOPIC};
use digest_storage::Database;
use tracing::{debug, info};
use uuid::Uuid;

/// Articles sharing one topic, in receive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGroup {
    pub topic: String,
    pub articles: Vec<Article>,
}

/// Groups articles by topic and orders the groups by descending size, then topic name.
///
/// Topics outside `vocabulary` (including `other`) are dropped unless `include_other` is
/// set, in which case they are merged into a single `other` group.
pub fn group_by_topic(
    articles: Vec<Article>,
    vocabulary: &TopicVocabulary,
    include_other: bool,
) -> Vec<TopicGroup> {
    let mut groups: BTreeMap<String, Vec<Article>> = BTreeMap::new();
    for article in articles {
        let topic = if vocabulary.contains(&article.topic) {
            article.topic.clone()
        } else if include_other {
            OTHER_TOPIC.to_string()
        } else {
            debug!(article_id = %article.id, topic = %article.topic, "dropping out-of-vocabulary topic");
            continue;
        };
        groups.entry(topic).or_default().push(article);
    }

    let mut groups: Vec<TopicGroup> = groups
        .into_iter()
        .map(|(topic, articles)| TopicGroup { topic, articles })
        .collect();
    groups.sort_by(|a, b| {
        b.articles
            .len()
            .cmp(&a.articles.len())
            .then_with(|| a.topic.cmp(&b.topic))
    });
    groups
}

#[derive(Debug, Clone, Copy)]
pub struct RollupOptions {
    pub window: DateWindow,
    pub include_other_topics: bool,
    /// Compute bullets without recording a rollup run.
    pub dry_run: bool,
}

pub struct RollupEngine {
    db: Database,
    summarizer: Arc<dyn Summarize>,
    vocabulary: TopicVocabulary,
}

impl RollupEngine {
    pub fn new(db: Database, summarizer: Arc<dyn Summarize>, vocabulary: TopicVocabulary) -> Self {
        Self {
            db,
            summarizer,
            vocabulary,
        }
    }

    /// Bullet points for the articles whose message arrived inside `window`.
    pub async fn rollup(
        &self,
        window: DateWindow,
        include_other_topics: bool,
    ) -> Result<Vec<BulletPoint>> {
        let articles = self.db.articles_in_window(&window).await?;
        let selected = articles.len();
        let groups = group_by_topic(articles, &self.vocabulary, include_other_topics);

        let mut bullets = Vec::with_capacity(groups.len());
        for group in groups {
            let summaries: Vec<String> = group.articles.iter().map(|a| a.summary.clone()).collect();
            let summary_text = self
                .summarizer
                .summarize(&group.topic, &summaries)
                .await
                .with_context(|| format!("summarizing topic {}", group.topic))?;
            bullets.push(BulletPoint {
                topic: group.topic,
                summary_text,
                window_start: window.start(),
                window_end: window.end(),
                supporting_article_ids: group.articles.iter().map(|a| a.id).collect(),
            });
        }
        debug!(
            start = %window.start(),
            end = %window.end(),
            articles = selected,
            bullets = bullets.len(),
            "rollup computed"
        );
        Ok(bullets)
    }

    /// Computes a rollup and, unless dry-run, records it for the composer.
    pub async fn run(&self, options: RollupOptions, now: DateTime<Utc>) -> Result<RollupRun> {
        let bullet_points = self
            .rollup(options.window, options.include_other_topics)
            .await?;
        let run = RollupRun {
            id: Uuid::new_v4(),
            generated_at: now,
            window: options.window,
            include_other_topics: options.include_other_topics,
            bullet_points,
        };
        if !options.dry_run {
            self.db.insert_rollup_run(&run).await?;
        }
        info!(
            run_id = %run.id,
            bullets = run.bullet_points.len(),
            include_other = run.include_other_topics,
            dry_run = options.dry_run,
            "rollup complete"
        );
        Ok(run)
    }
}
