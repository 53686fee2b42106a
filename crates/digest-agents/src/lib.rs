//! Model-backed agents and collaborator contracts for the digest pipeline.
//!
//! Everything that talks to a structured-output model goes through [`StructuredModel`];
//! responses are validated whole before anything downstream sees them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use digest_storage::{BackoffPolicy, FailureClass};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub mod extract;
pub mod mailbox;
pub mod openai;
pub mod summarize;

pub use extract::{validate_extraction, ExtractionAgent};
pub use mailbox::{DirectoryMailbox, MemoryMailbox, MessageSource};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use summarize::{ModelSummarizer, Summarize};

pub const CRATE_NAME: &str = "digest-agents";

/// Why a model response was rejected. A rejection always covers the whole response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("response does not match the schema: {0}")]
    Malformed(String),
    #[error("article {index}: field `{field}` is empty")]
    EmptyField { index: usize, field: &'static str },
    #[error("article {index}: topic `{topic}` is not in the vocabulary")]
    UnknownTopic { index: usize, topic: String },
    #[error("model refused the request: {0}")]
    Refused(String),
}

/// Failure taxonomy shared by every structured-output call.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model rate limited: {0}")]
    RateLimited(String),
    #[error("schema validation failed: {0}")]
    SchemaInvalid(#[from] ValidationError),
    #[error("model endpoint unavailable: {0}")]
    Systemic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    SchemaInvalid,
    Systemic,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SchemaInvalid => "schema_invalid",
            ErrorKind::Systemic => "systemic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExtractionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractionError::Transient(_) => ErrorKind::Transient,
            ExtractionError::RateLimited(_) => ErrorKind::RateLimited,
            ExtractionError::SchemaInvalid(_) => ErrorKind::SchemaInvalid,
            ExtractionError::Systemic(_) => ErrorKind::Systemic,
        }
    }

    pub fn is_systemic(&self) -> bool {
        matches!(self, ExtractionError::Systemic(_))
    }

    /// Backoff class for retryable errors; `None` means never retry.
    pub fn retry_class(&self) -> Option<FailureClass> {
        match self {
            ExtractionError::Transient(_) => Some(FailureClass::Transient),
            ExtractionError::RateLimited(_) => Some(FailureClass::RateLimited),
            ExtractionError::SchemaInvalid(_) | ExtractionError::Systemic(_) => None,
        }
    }

    pub fn classified(class: FailureClass, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match class {
            FailureClass::Transient => ExtractionError::Transient(detail),
            FailureClass::RateLimited => ExtractionError::RateLimited(detail),
            FailureClass::Systemic => ExtractionError::Systemic(detail),
        }
    }
}

/// One structured-output call: fixed schema, system instructions, untrusted input text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredRequest {
    pub schema_name: &'static str,
    pub schema: JsonValue,
    pub instructions: String,
    pub input: String,
}

#[async_trait]
pub trait StructuredModel: Send + Sync {
    /// Returns the raw JSON text produced for `request`; validation is the caller's job.
    async fn generate(&self, request: &StructuredRequest) -> Result<String, ExtractionError>;
}

/// Calls `model`, retrying transient and rate-limited failures per `backoff`.
pub async fn generate_with_retry(
    model: &dyn StructuredModel,
    request: &StructuredRequest,
    backoff: &BackoffPolicy,
) -> Result<String, ExtractionError> {
    let mut attempt = 0usize;
    loop {
        let err = match model.generate(request).await {
            Ok(text) => return Ok(text),
            Err(err) => err,
        };
        let Some(class) = err.retry_class() else {
            return Err(err);
        };
        if attempt >= backoff.max_retries {
            return Err(err);
        }
        let delay = backoff.delay_for(class, attempt);
        debug!(
            schema = request.schema_name,
            attempt,
            kind = %err.kind(),
            delay_ms = delay.as_millis() as u64,
            "retrying model call"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Replays queued responses in order and records every request it receives.
///
/// Used for offline runs and tests; an exhausted script answers with a systemic error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, ExtractionError>>>,
    requests: Mutex<Vec<StructuredRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        for response in responses {
            model.push_ok(response);
        }
        model
    }

    pub fn push_ok(&self, response: impl Into<String>) {
        self.push(Ok(response.into()));
    }

    pub fn push_err(&self, err: ExtractionError) {
        self.push(Err(err));
    }

    fn push(&self, response: Result<String, ExtractionError>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StructuredModel for ScriptedModel {
    async fn generate(&self, request: &StructuredRequest) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.unwrap_or_else(|| Err(ExtractionError::Systemic("script exhausted".to_string())))
    }
}
