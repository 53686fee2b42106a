use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use digest_core::{utc_midnight, DateWindow};
use digest_pipeline::{
    default_rollup_window, DownloadOptions, ParseOptions, Pipeline, RenderFormat, RollupOptions,
    RunOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "digest")]
#[command(about = "Newsletter digest pipeline: sync, download, parse, rollup, compose")]
struct Cli {
    /// Log every per-message failure (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile stored sources with sources.yaml.
    SyncSources {
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch new messages for every active source.
    Download {
        #[arg(long)]
        max_per_source: Option<usize>,
    },
    /// Extract articles from unparsed messages.
    Parse {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        start_date: Option<NaiveDate>,
    },
    /// Summarize a window of articles into topic bullet points.
    Rollup {
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long)]
        dry_run: bool,
    },
    /// Render the latest rollup as a newsletter.
    Compose {
        #[arg(long, value_enum, default_value_t = FormatArg::Markdown)]
        format: FormatArg,
    },
    /// Print the most recent newsletter.
    Latest,
    /// Run every stage in order.
    Run {
        #[arg(long)]
        max_per_source: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        #[command(flatten)]
        window: WindowArgs,
        #[arg(long, value_enum, default_value_t = FormatArg::Markdown)]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct WindowArgs {
    /// Inclusive window start (UTC midnight).
    #[arg(long)]
    start_date: Option<NaiveDate>,
    /// Exclusive window end (UTC midnight).
    #[arg(long)]
    end_date: Option<NaiveDate>,
    #[arg(long)]
    include_other_topics: bool,
}

impl WindowArgs {
    fn resolve(&self, now: DateTime<Utc>) -> Result<DateWindow> {
        match (self.start_date, self.end_date) {
            (None, None) => Ok(default_rollup_window(now)),
            (Some(start), Some(end)) => Ok(DateWindow::from_dates(start, end)?),
            (None, Some(end)) => Ok(DateWindow::week_ending(end)),
            (Some(start), None) => {
                let end = default_rollup_window(now).end();
                DateWindow::new(utc_midnight(start), end)
                    .context("--start-date must be before the default window end")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Markdown,
    Json,
}

impl From<FormatArg> for RenderFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Markdown => RenderFormat::Markdown,
            FormatArg::Json => RenderFormat::Json,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let pipeline = Pipeline::open_from_env().await?;

    match cli.command {
        Commands::SyncSources { dry_run } => {
            let report = pipeline.sync_sources(dry_run).await?;
            println!(
                "sources synced: added={} activated={} deactivated={} unchanged={}{}",
                report.added.len(),
                report.activated.len(),
                report.deactivated.len(),
                report.unchanged,
                if dry_run { " (dry run)" } else { "" }
            );
        }
        Commands::Download { max_per_source } => {
            let summary = pipeline
                .download(DownloadOptions { max_per_source })
                .await?;
            println!(
                "download complete: run_id={} sources={} fetched={} new={}",
                summary.run.id,
                summary.run.sources_checked,
                summary.run.messages_fetched,
                summary.run.messages_inserted
            );
        }
        Commands::Parse {
            limit,
            dry_run,
            force,
            start_date,
        } => {
            let outcome = pipeline
                .parse(ParseOptions {
                    limit,
                    dry_run,
                    force,
                    start_date,
                })
                .await?;
            println!(
                "parse complete: run_id={} messages={} articles={} errors={} mean={:.2} median={:.1}{}",
                outcome.run.id,
                outcome.run.messages_attempted,
                outcome.run.articles_produced,
                outcome.run.errors_count,
                outcome.run.mean_articles_per_message,
                outcome.run.median_articles_per_message,
                if dry_run { " (dry run, nothing committed)" } else { "" }
            );
            if dry_run {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome.extractions)
                        .context("serializing dry-run extractions")?
                );
            }
        }
        Commands::Rollup { window, dry_run } => {
            let run = pipeline
                .rollup(RollupOptions {
                    window: window.resolve(Utc::now())?,
                    include_other_topics: window.include_other_topics,
                    dry_run,
                })
                .await?;
            for bullet in &run.bullet_points {
                println!(
                    "- [{}] ({} articles) {}",
                    bullet.topic,
                    bullet.support_count(),
                    bullet.summary_text
                );
            }
            println!(
                "rollup complete: {} bullet points for {} to {}",
                run.bullet_points.len(),
                run.window.start().format("%Y-%m-%d"),
                run.window.end().format("%Y-%m-%d")
            );
        }
        Commands::Compose { format } => {
            let newsletter = pipeline.compose(format.into()).await?;
            println!(
                "newsletter composed: id={} bullets={} artifact={}",
                newsletter.id,
                newsletter.bullet_points.len(),
                newsletter
                    .rendered_artifact_location
                    .as_deref()
                    .unwrap_or("-")
            );
        }
        Commands::Latest => match pipeline.latest().await? {
            Some(latest) => {
                println!(
                    "latest newsletter: id={} generated_at={} artifact={}",
                    latest.newsletter.id,
                    latest.newsletter.generated_at.to_rfc3339(),
                    latest
                        .newsletter
                        .rendered_artifact_location
                        .as_deref()
                        .unwrap_or("-")
                );
                if let Some(content) = latest.content {
                    println!();
                    println!("{content}");
                }
            }
            None => println!("no newsletter has been composed yet"),
        },
        Commands::Run {
            max_per_source,
            limit,
            window,
            format,
        } => {
            let report = pipeline
                .run_all(RunOptions {
                    max_per_source,
                    limit,
                    window: Some(window.resolve(Utc::now())?),
                    include_other_topics: window.include_other_topics,
                    format: format.into(),
                })
                .await?;
            for line in report.summary_lines() {
                println!("{line}");
            }
        }
    }

    Ok(())
}
