use std::sync::Arc;

use digest_core::{ArticleDraft, Message, TopicVocabulary};
use digest_storage::BackoffPolicy;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{
    generate_with_retry, ExtractionError, StructuredModel, StructuredRequest, ValidationError,
};

pub const EXTRACTION_SCHEMA_NAME: &str = "article_extraction";

/// Strict structured-output schema for one extraction call.
///
/// Every field is required; optional values are expressed as nullable types so the
/// model can never silently omit one.
pub fn extraction_schema(vocabulary: &TopicVocabulary) -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "articles": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "summary": {"type": "string"},
                        "topic": {"type": "string", "enum": vocabulary.labels()},
                        "url": {"type": ["string", "null"]},
                        "tags": {
                            "type": ["array", "null"],
                            "items": {"type": "string"}
                        }
                    },
                    "required": ["title", "summary", "topic", "url", "tags"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["articles"],
        "additionalProperties": false
    })
}

pub fn extraction_instructions(vocabulary: &TopicVocabulary) -> String {
    let topics = vocabulary
        .labels()
        .iter()
        .map(|label| format!("- \"{label}\""))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You parse email newsletters into their individual articles.\n\
         Extract every distinct article in the text. For each article return:\n\
         - title: the article heading\n\
         - summary: a faithful summary of the article using only facts present in the text\n\
         - topic: exactly one of the labels below\n\
         - url: the article link, or null when none is present\n\
         - tags: short keywords for the article, or null when none apply\n\n\
         Topic labels:\n{topics}\n\n\
         Use \"other\" when no other label fits. Skip advertisements, sponsor blocks and \
         subscription boilerplate. Return an empty list when the text holds no articles."
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractionResponse {
    articles: Vec<DraftPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DraftPayload {
    title: String,
    summary: String,
    topic: String,
    #[serde(deserialize_with = "nullable")]
    url: Option<String>,
    #[serde(deserialize_with = "nullable")]
    tags: Option<Vec<String>>,
}

// Plain `Option` fields default to `None` when absent; this keeps them required.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer)
}

/// Validates a raw model response as a whole; any bad article rejects all of them.
pub fn validate_extraction(
    raw: &str,
    vocabulary: &TopicVocabulary,
) -> Result<Vec<ArticleDraft>, ValidationError> {
    let response: ExtractionResponse =
        serde_json::from_str(raw).map_err(|err| ValidationError::Malformed(err.to_string()))?;

    response
        .articles
        .into_iter()
        .enumerate()
        .map(|(index, payload)| {
            let title = payload.title.trim();
            if title.is_empty() {
                return Err(ValidationError::EmptyField {
                    index,
                    field: "title",
                });
            }
            let summary = payload.summary.trim();
            if summary.is_empty() {
                return Err(ValidationError::EmptyField {
                    index,
                    field: "summary",
                });
            }
            if !vocabulary.admits(&payload.topic) {
                return Err(ValidationError::UnknownTopic {
                    index,
                    topic: payload.topic,
                });
            }
            let url = payload
                .url
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty());
            let tags = payload
                .tags
                .unwrap_or_default()
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            Ok(ArticleDraft {
                title: title.to_string(),
                summary: summary.to_string(),
                topic: payload.topic,
                url,
                tags,
            })
        })
        .collect()
}

/// Turns one message into validated article drafts.
#[derive(Clone)]
pub struct ExtractionAgent {
    model: Arc<dyn StructuredModel>,
    vocabulary: TopicVocabulary,
    backoff: BackoffPolicy,
}

impl ExtractionAgent {
    pub fn new(
        model: Arc<dyn StructuredModel>,
        vocabulary: TopicVocabulary,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            model,
            vocabulary,
            backoff,
        }
    }

    pub fn vocabulary(&self) -> &TopicVocabulary {
        &self.vocabulary
    }

    pub fn request_for(&self, message: &Message) -> StructuredRequest {
        let input = match message.subject.as_deref() {
            Some(subject) if !subject.trim().is_empty() => {
                format!("Subject: {}\n\n{}", subject.trim(), message.raw_body)
            }
            _ => message.raw_body.clone(),
        };
        StructuredRequest {
            schema_name: EXTRACTION_SCHEMA_NAME,
            schema: extraction_schema(&self.vocabulary),
            instructions: extraction_instructions(&self.vocabulary),
            input,
        }
    }

    /// Extracts the articles of `message`.
    ///
    /// Already-parsed messages return no drafts and never reach the model unless `force`
    /// is set. A blank body is a valid empty extraction.
    pub async fn extract(
        &self,
        message: &Message,
        force: bool,
    ) -> Result<Vec<ArticleDraft>, ExtractionError> {
        if message.parsed && !force {
            debug!(message_id = %message.id, "message already parsed; skipping");
            return Ok(Vec::new());
        }
        if message.raw_body.trim().is_empty() {
            debug!(message_id = %message.id, "empty message body");
            return Ok(Vec::new());
        }

        let request = self.request_for(message);
        let raw = generate_with_retry(self.model.as_ref(), &request, &self.backoff).await?;
        let drafts = validate_extraction(&raw, &self.vocabulary)?;
        debug!(message_id = %message.id, articles = drafts.len(), "extraction validated");
        Ok(drafts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorKind, ScriptedModel};
    use chrono::{TimeZone, Utc};

    fn vocab() -> TopicVocabulary {
        TopicVocabulary::new(["ai", "robotics"])
    }

    fn message(parsed: bool) -> Message {
        Message {
            id: "m-1".to_string(),
            source_address: "digest@example.com".to_string(),
            subject: Some("Weekly AI".to_string()),
            received_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            raw_body: "Story one. Story two.".to_string(),
            parsed,
        }
    }

    fn agent(model: Arc<ScriptedModel>) -> ExtractionAgent {
        ExtractionAgent::new(model, vocab(), BackoffPolicy::immediate(2))
    }

    #[test]
    fn valid_response_is_accepted_whole() {
        let raw = r#"{"articles":[
            {"title":" GPT news ","summary":"A model shipped.","topic":"ai","url":"https://x.test/a","tags":["llm"," "]},
            {"title":"Odd item","summary":"Something else.","topic":"other","url":null,"tags":null}
        ]}"#;

        let drafts = validate_extraction(raw, &vocab()).unwrap();

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].title, "GPT news");
        assert_eq!(drafts[0].tags, vec!["llm"]);
        assert_eq!(drafts[1].topic, "other");
        assert!(drafts[1].url.is_none());
        assert!(drafts[1].tags.is_empty());
    }

    #[test]
    fn one_bad_article_rejects_the_whole_response() {
        let raw = r#"{"articles":[
            {"title":"Fine","summary":"ok","topic":"ai","url":null,"tags":null},
            {"title":"   ","summary":"ok","topic":"ai","url":null,"tags":null}
        ]}"#;
        assert_eq!(
            validate_extraction(raw, &vocab()),
            Err(ValidationError::EmptyField {
                index: 1,
                field: "title"
            })
        );

        let raw = r#"{"articles":[{"title":"T","summary":"S","topic":"finance","url":null,"tags":null}]}"#;
        assert!(matches!(
            validate_extraction(raw, &vocab()),
            Err(ValidationError::UnknownTopic { index: 0, .. })
        ));
    }

    #[test]
    fn missing_or_extra_fields_are_malformed() {
        let missing_url = r#"{"articles":[{"title":"T","summary":"S","topic":"ai","tags":null}]}"#;
        assert!(matches!(
            validate_extraction(missing_url, &vocab()),
            Err(ValidationError::Malformed(_))
        ));

        let extra = r#"{"articles":[{"title":"T","summary":"S","topic":"ai","url":null,"tags":null,"score":3}]}"#;
        assert!(matches!(
            validate_extraction(extra, &vocab()),
            Err(ValidationError::Malformed(_))
        ));

        assert!(matches!(
            validate_extraction("[]", &vocab()),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn schema_lists_vocabulary_and_other() {
        let schema = extraction_schema(&vocab());
        let topics = &schema["properties"]["articles"]["items"]["properties"]["topic"]["enum"];
        assert_eq!(topics, &json!(["ai", "robotics", "other"]));
    }

    #[tokio::test]
    async fn parsed_message_is_a_no_op_without_force() {
        let model = Arc::new(ScriptedModel::new());
        let drafts = agent(model.clone()).extract(&message(true), false).await.unwrap();
        assert!(drafts.is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn forced_extraction_calls_the_model_again() {
        let model = Arc::new(ScriptedModel::with_responses([
            r#"{"articles":[{"title":"T","summary":"S","topic":"ai","url":null,"tags":null}]}"#,
        ]));
        let drafts = agent(model.clone()).extract(&message(true), true).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(model.calls(), 1);
        assert!(model.requests()[0].input.starts_with("Subject: Weekly AI"));
    }

    #[tokio::test]
    async fn invalid_output_is_not_retried() {
        let model = Arc::new(ScriptedModel::with_responses(["not json", "{\"articles\":[]}"]));
        let err = agent(model.clone())
            .extract(&message(false), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn blank_body_yields_no_articles_without_a_call() {
        let model = Arc::new(ScriptedModel::new());
        let mut msg = message(false);
        msg.raw_body = "  \n".to_string();
        let drafts = agent(model.clone()).extract(&msg, false).await.unwrap();
        assert!(drafts.is_empty());
        assert_eq!(model.calls(), 0);
    }
}
