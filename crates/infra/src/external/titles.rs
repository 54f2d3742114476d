//! Work titles from an OpenAI-compatible chat completion endpoint.
//!
//! Best effort: callers fall back to [`artforge_predictions::fallback_title`]
//! on any error.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::instrument;

use artforge_predictions::sanitize_title;

use super::{http_client, trim_base};

const SYSTEM_PROMPT: &str = "You name artworks. Reply with a short, evocative title of at most six words for the image described by the user. Reply with the title only.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TitleError {
    #[error("title service unreachable: {0}")]
    Network(String),

    #[error("title service error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("unusable title response: {0}")]
    Parse(String),

    #[error("title generation disabled")]
    Disabled,
}

#[async_trait::async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate_title(&self, prompt: &str) -> Result<String, TitleError>;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OpenAiTitleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiTitleGenerator {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TitleError> {
        let client = http_client(timeout).map_err(|e| TitleError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait::async_trait]
impl TitleGenerator for OpenAiTitleGenerator {
    #[instrument(skip(self, prompt), fields(model = %self.model), err)]
    async fn generate_title(&self, prompt: &str) -> Result<String, TitleError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": 24,
            "temperature": 0.7,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TitleError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TitleError::Api {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| TitleError::Parse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .as_deref()
            .and_then(sanitize_title)
            .ok_or_else(|| TitleError::Parse("empty completion".to_string()))
    }
}

/// Used when no title service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTitleGenerator;

#[async_trait::async_trait]
impl TitleGenerator for NoopTitleGenerator {
    async fn generate_title(&self, _prompt: &str) -> Result<String, TitleError> {
        Err(TitleError::Disabled)
    }
}

#[derive(Debug, Clone)]
pub struct FixedTitleGenerator(pub String);

#[async_trait::async_trait]
impl TitleGenerator for FixedTitleGenerator {
    async fn generate_title(&self, _prompt: &str) -> Result<String, TitleError> {
        Ok(self.0.clone())
    }
}
