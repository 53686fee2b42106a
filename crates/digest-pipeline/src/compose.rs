use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use digest_core::{BulletPoint, Newsletter};
use digest_storage::{ArtifactStore, Database};
use tracing::info;
use uuid::Uuid;

pub const NEWSLETTER_TITLE: &str = "AI Weekly Recap";
const ARTIFACT_KIND: &str = "newsletters";

/// Builds a newsletter from bullets in the order given. Touches no stored state.
pub fn compose(bullet_points: Vec<BulletPoint>, generated_at: DateTime<Utc>) -> Newsletter {
    Newsletter {
        id: Uuid::new_v4(),
        generated_at,
        bullet_points,
        rendered_artifact_location: None,
    }
}

pub trait NewsletterRenderer: Send + Sync {
    fn extension(&self) -> &'static str;
    fn render(&self, newsletter: &Newsletter) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenderFormat {
    #[default]
    Markdown,
    Json,
}

impl RenderFormat {
    pub fn renderer(self) -> Box<dyn NewsletterRenderer> {
        match self {
            RenderFormat::Markdown => Box::new(MarkdownRenderer),
            RenderFormat::Json => Box::new(JsonRenderer),
        }
    }
}

impl FromStr for RenderFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(RenderFormat::Markdown),
            "json" => Ok(RenderFormat::Json),
            other => bail!("unknown newsletter format `{other}`"),
        }
    }
}

fn display_topic(topic: &str) -> String {
    let mut chars = topic.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn anchor(topic: &str) -> String {
    topic
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' {
                Some(c)
            } else if c.is_whitespace() {
                Some('-')
            } else {
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

impl NewsletterRenderer for MarkdownRenderer {
    fn extension(&self) -> &'static str {
        "md"
    }

    fn render(&self, newsletter: &Newsletter) -> Result<String> {
        let mut lines = vec![
            format!("# {NEWSLETTER_TITLE}"),
            String::new(),
            format!(
                "_Generated {}_",
                newsletter.generated_at.format("%Y-%m-%d %H:%M UTC")
            ),
            String::new(),
        ];

        if newsletter.bullet_points.is_empty() {
            lines.push("No articles were collected for this window.".to_string());
            lines.push(String::new());
            return Ok(lines.join("\n"));
        }

        lines.push("## Topics".to_string());
        lines.push(String::new());
        for bullet in &newsletter.bullet_points {
            let title = display_topic(&bullet.topic);
            lines.push(format!("- [{title}](#{})", anchor(&title)));
        }
        lines.push(String::new());

        for bullet in &newsletter.bullet_points {
            lines.push(format!("## {}", display_topic(&bullet.topic)));
            lines.push(String::new());
            lines.push(format!("- {}", bullet.summary_text));
            lines.push(String::new());
            let noun = if bullet.support_count() == 1 {
                "article"
            } else {
                "articles"
            };
            lines.push(format!(
                "_{} {noun}, {} to {}_",
                bullet.support_count(),
                bullet.window_start.format("%Y-%m-%d"),
                bullet.window_end.format("%Y-%m-%d")
            ));
            lines.push(String::new());
        }
        Ok(lines.join("\n"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

impl NewsletterRenderer for JsonRenderer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, newsletter: &Newsletter) -> Result<String> {
        serde_json::to_string_pretty(&serde_json::json!({
            "title": NEWSLETTER_TITLE,
            "id": newsletter.id,
            "generated_at": newsletter.generated_at,
            "bullet_points": newsletter.bullet_points,
        }))
        .context("serializing newsletter")
    }
}

/// Renders the most recent rollup and records the result.
pub struct NewsletterComposer {
    db: Database,
    store: ArtifactStore,
    renderer: Box<dyn NewsletterRenderer>,
}

impl NewsletterComposer {
    pub fn new(db: Database, store: ArtifactStore, renderer: Box<dyn NewsletterRenderer>) -> Self {
        Self {
            db,
            store,
            renderer,
        }
    }

    pub async fn compose_latest(&self, now: DateTime<Utc>) -> Result<Newsletter> {
        let rollup = self
            .db
            .latest_rollup_run()
            .await?
            .context("no rollup has been recorded yet; run the rollup stage first")?;
        self.publish(rollup.bullet_points, now).await
    }

    /// Composes `bullet_points`, writes the rendered artifact and stores the newsletter row.
    pub async fn publish(
        &self,
        bullet_points: Vec<BulletPoint>,
        now: DateTime<Utc>,
    ) -> Result<Newsletter> {
        let mut newsletter = compose(bullet_points, now);
        let rendered = self.renderer.render(&newsletter)?;
        let stored = self
            .store
            .store_bytes(now, ARTIFACT_KIND, self.renderer.extension(), rendered.as_bytes())
            .await?;
        newsletter.rendered_artifact_location = Some(stored.relative_path.display().to_string());
        self.db.insert_newsletter(&newsletter).await?;
        info!(
            newsletter_id = %newsletter.id,
            bullets = newsletter.bullet_points.len(),
            location = %stored.absolute_path.display(),
            "newsletter composed"
        );
        Ok(newsletter)
    }
}

#[derive(Debug, Clone)]
pub struct LatestNewsletter {
    pub newsletter: Newsletter,
    pub content: Option<String>,
}

/// The newsletter with the greatest `generated_at`, with its rendered content when present.
pub async fn latest_newsletter(
    db: &Database,
    store: &ArtifactStore,
) -> Result<Option<LatestNewsletter>> {
    let Some(newsletter) = db.latest_newsletter().await? else {
        return Ok(None);
    };
    let content = match &newsletter.rendered_artifact_location {
        Some(location) => Some(store.read_to_string(location).await?),
        None => None,
    };
    Ok(Some(LatestNewsletter {
        newsletter,
        content,
    }))
}
