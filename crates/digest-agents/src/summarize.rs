use std::sync::Arc;

use async_trait::async_trait;
use digest_storage::BackoffPolicy;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{
    generate_with_retry, ExtractionError, StructuredModel, StructuredRequest, ValidationError,
};

pub const SUMMARY_SCHEMA_NAME: &str = "topic_summary";

/// Condenses the ordered article summaries of one topic into a single bullet text.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(&self, topic: &str, summaries: &[String]) -> Result<String, ExtractionError>;
}

pub fn summary_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"}
        },
        "required": ["summary"],
        "additionalProperties": false
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummaryResponse {
    summary: String,
}

pub fn validate_summary(raw: &str) -> Result<String, ValidationError> {
    let response: SummaryResponse =
        serde_json::from_str(raw).map_err(|err| ValidationError::Malformed(err.to_string()))?;
    let summary = response.summary.trim();
    if summary.is_empty() {
        return Err(ValidationError::EmptyField {
            index: 0,
            field: "summary",
        });
    }
    Ok(summary.to_string())
}

/// Summarizer backed by the same structured-output model as extraction.
#[derive(Clone)]
pub struct ModelSummarizer {
    model: Arc<dyn StructuredModel>,
    backoff: BackoffPolicy,
}

impl ModelSummarizer {
    pub fn new(model: Arc<dyn StructuredModel>, backoff: BackoffPolicy) -> Self {
        Self { model, backoff }
    }

    pub fn request_for(topic: &str, summaries: &[String]) -> StructuredRequest {
        let input = summaries
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");
        StructuredRequest {
            schema_name: SUMMARY_SCHEMA_NAME,
            schema: summary_schema(),
            instructions: format!(
                "You write one bullet point for a newsletter section on \"{topic}\".\n\
                 Combine the numbered article summaries into a single concise paragraph.\n\
                 Use only facts stated in the summaries; do not add names, numbers or claims."
            ),
            input,
        }
    }
}

#[async_trait]
impl Summarize for ModelSummarizer {
    async fn summarize(&self, topic: &str, summaries: &[String]) -> Result<String, ExtractionError> {
        // A lone article already is its own summary.
        if let [only] = summaries {
            return Ok(only.trim().to_string());
        }
        if summaries.is_empty() {
            return Err(ValidationError::EmptyField {
                index: 0,
                field: "summaries",
            }
            .into());
        }
        let request = Self::request_for(topic, summaries);
        let raw = generate_with_retry(self.model.as_ref(), &request, &self.backoff).await?;
        Ok(validate_summary(&raw)?)
    }
}
