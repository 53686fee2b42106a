use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use digest_agents::{MemoryMailbox, ScriptedModel};
use digest_core::{DateWindow, RawMessage, TopicVocabulary};
use digest_pipeline::{
    ParseOptions, Pipeline, PipelineConfig, RenderFormat, RollupOptions, RunOptions,
};
use digest_storage::db::MessageQuery;
use digest_storage::Database;
use tempfile::{tempdir, TempDir};

const SOURCE: &str = "digest@example.com";

const TWO_AI: &str = r#"{"articles":[
    {"title":"Model launch","summary":"A lab released a new model.","topic":"ai","url":"https://news.test/a","tags":["llm"]},
    {"title":"Benchmark","summary":"A benchmark was updated.","topic":"ai","url":null,"tags":null}
]}"#;
const NO_ARTICLES: &str = r#"{"articles":[]}"#;
const ONE_OTHER: &str = r#"{"articles":[
    {"title":"Office move","summary":"The team moved offices.","topic":"other","url":null,"tags":null}
]}"#;
const AI_SUMMARY: &str = r#"{"summary":"A new model shipped and a benchmark was updated."}"#;

fn received(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 7, 30, 0).unwrap()
}

fn week() -> DateWindow {
    DateWindow::from_dates(
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
    )
    .unwrap()
}

struct Harness {
    _dir: TempDir,
    pipeline: Pipeline,
    model: Arc<ScriptedModel>,
}

async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("sources.yaml"),
        format!("sources:\n  - address: {SOURCE}\n    display_name: Digest\n    enabled: true\n"),
    )
    .unwrap();

    let mailbox = Arc::new(MemoryMailbox::new());
    for day in 1..=3 {
        mailbox.deliver(
            SOURCE,
            RawMessage {
                transport_id: format!("msg-{day}"),
                sender: SOURCE.to_string(),
                subject: Some(format!("Issue {day}")),
                received_at: received(day),
                body: format!("newsletter issue {day}"),
            },
        );
    }

    let config = PipelineConfig {
        workspace_root: dir.path().to_path_buf(),
        artifacts_dir: dir.path().join("artifacts"),
        mailbox_dir: dir.path().join("mailbox"),
        ..PipelineConfig::default()
    };
    let model = Arc::new(ScriptedModel::new());
    let pipeline = Pipeline::from_parts(
        config,
        Database::in_memory().await.unwrap(),
        TopicVocabulary::new(["ai"]),
    )
    .with_model(model.clone())
    .with_mailbox(mailbox);

    Harness {
        _dir: dir,
        pipeline,
        model,
    }
}

async fn ingest(h: &Harness) {
    h.pipeline.sync_sources(false).await.unwrap();
    let summary = h.pipeline.download(Default::default()).await.unwrap();
    assert_eq!(summary.run.messages_inserted, 3);
}

#[tokio::test]
async fn weekly_digest_scenario_end_to_end() {
    let h = harness().await;
    for response in [TWO_AI, NO_ARTICLES, ONE_OTHER, AI_SUMMARY] {
        h.model.push_ok(response);
    }

    let report = h
        .pipeline
        .run_all(RunOptions {
            window: Some(week()),
            include_other_topics: true,
            format: RenderFormat::Markdown,
            ..RunOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(report.sources.added, vec![SOURCE]);
    assert_eq!(report.download.run.messages_inserted, 3);
    assert_eq!(report.parse.messages_attempted, 3);
    assert_eq!(report.parse.articles_produced, 3);
    assert_eq!(report.parse.errors_count, 0);

    let bullets = &report.newsletter.bullet_points;
    assert_eq!(bullets.len(), 2);
    assert_eq!(bullets[0].topic, "ai");
    assert_eq!(bullets[0].support_count(), 2);
    assert_eq!(
        bullets[0].summary_text,
        "A new model shipped and a benchmark was updated."
    );
    assert_eq!(bullets[1].topic, "other");
    assert_eq!(bullets[1].support_count(), 1);
    for bullet in bullets {
        assert_eq!(bullet.window_start, week().start());
        assert_eq!(bullet.window_end, week().end());
    }

    let db = h.pipeline.database();
    let conserved = db.count_articles_for_run(report.parse.id).await.unwrap();
    assert_eq!(conserved, i64::from(report.parse.articles_produced));

    let latest = h.pipeline.latest().await.unwrap().unwrap();
    assert_eq!(latest.newsletter.id, report.newsletter.id);
    let content = latest.content.unwrap();
    assert!(content.contains("## Ai"));
    assert!(content.contains("## Other"));
    assert_eq!(h.model.calls(), 4);
}

#[tokio::test]
async fn reparsing_a_parsed_set_is_free() {
    let h = harness().await;
    ingest(&h).await;
    for response in [TWO_AI, NO_ARTICLES, ONE_OTHER] {
        h.model.push_ok(response);
    }

    h.pipeline.parse(ParseOptions::default()).await.unwrap();
    let calls = h.model.calls();
    let articles = h.pipeline.database().table_counts().await.unwrap().articles;

    let again = h.pipeline.parse(ParseOptions::default()).await.unwrap();

    assert_eq!(again.run.messages_attempted, 0);
    assert_eq!(again.run.articles_produced, 0);
    assert_eq!(h.model.calls(), calls);
    let counts = h.pipeline.database().table_counts().await.unwrap();
    assert_eq!(counts.articles, articles);
    assert_eq!(counts.parse_runs, 2);
}

#[tokio::test]
async fn dry_run_parse_leaves_tables_untouched() {
    let h = harness().await;
    ingest(&h).await;
    for response in [TWO_AI, NO_ARTICLES, ONE_OTHER] {
        h.model.push_ok(response);
    }
    let db = h.pipeline.database();
    let all = MessageQuery {
        include_parsed: true,
        ..MessageQuery::default()
    };
    let counts_before = db.table_counts().await.unwrap();
    let messages_before = db.messages_for_extraction(&all).await.unwrap();

    let outcome = h
        .pipeline
        .parse(ParseOptions {
            dry_run: true,
            ..ParseOptions::default()
        })
        .await
        .unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.run.articles_produced, 3);
    let extracted: Vec<_> = outcome
        .extractions
        .iter()
        .map(|e| (e.message_id.as_str(), e.drafts.len()))
        .collect();
    assert_eq!(extracted, vec![("msg-1", 2), ("msg-2", 0), ("msg-3", 1)]);
    assert_eq!(db.table_counts().await.unwrap(), counts_before);
    assert_eq!(db.messages_for_extraction(&all).await.unwrap(), messages_before);
}

#[tokio::test]
async fn rollups_over_the_same_data_are_identical() {
    let h = harness().await;
    ingest(&h).await;
    for response in [TWO_AI, NO_ARTICLES, ONE_OTHER, AI_SUMMARY, AI_SUMMARY, AI_SUMMARY] {
        h.model.push_ok(response);
    }
    h.pipeline.parse(ParseOptions::default()).await.unwrap();

    let options = RollupOptions {
        window: week(),
        include_other_topics: true,
        dry_run: true,
    };
    let first = h.pipeline.rollup(options).await.unwrap();
    let second = h.pipeline.rollup(options).await.unwrap();

    assert_eq!(first.bullet_points, second.bullet_points);

    let without_other = h
        .pipeline
        .rollup(RollupOptions {
            include_other_topics: false,
            ..options
        })
        .await
        .unwrap();
    let topics: Vec<_> = without_other
        .bullet_points
        .iter()
        .map(|b| b.topic.as_str())
        .collect();
    assert_eq!(topics, vec!["ai"]);
}
