use std::time::Duration;

use async_trait::async_trait;
use digest_storage::{classify_reqwest_error, classify_status, HttpClientConfig};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{ExtractionError, StructuredModel, StructuredRequest, ValidationError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.1,
            timeout: Duration::from_secs(60),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Chat-completions client that requests strict `json_schema` structured output.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: OpenAiConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let http = HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
        }
        .build_client()?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn request_body(&self, request: &StructuredRequest) -> JsonValue {
        json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                },
            },
            "messages": [
                {"role": "system", "content": request.instructions},
                {"role": "user", "content": request.input},
            ],
        })
    }
}

fn content_from_completion(body: &str) -> Result<String, ExtractionError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|err| ValidationError::Malformed(format!("completion envelope: {err}")))?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| ValidationError::Malformed("completion has no choices".to_string()))?;
    if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ValidationError::Refused(refusal).into());
    }
    message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ValidationError::Malformed("completion has no content".to_string()).into())
}

#[async_trait]
impl StructuredModel for OpenAiClient {
    async fn generate(&self, request: &StructuredRequest) -> Result<String, ExtractionError> {
        let url = self.config.completions_url();
        debug!(model = %self.config.model, schema = request.schema_name, "sending structured-output request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|err| ExtractionError::classified(classify_reqwest_error(&err), err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail = format!("{status}: {}", detail.chars().take(200).collect::<String>());
            return Err(ExtractionError::classified(classify_status(status), detail));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ExtractionError::classified(classify_reqwest_error(&err), err.to_string()))?;
        content_from_completion(&body)
    }
}
