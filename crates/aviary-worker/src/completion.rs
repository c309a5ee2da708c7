//! Completion API client: bearer-auth chat completions over HTTP.
//!
//! The runtime owns timeout and retry; one `complete` call is one attempt.
//! Per the boundary contract, every non-success outcome is retryable.

use aviary_instance::{CompletionSettings, GenerationParams};
use serde::{Deserialize, Serialize};
use serenity::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub temperature: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl CompletionRequest {
    pub fn new(model: &str, messages: Vec<ChatTurn>, generation: &GenerationParams) -> Self {
        Self {
            model: model.to_string(),
            messages,
            temperature: generation.temperature,
            presence_penalty: generation.presence_penalty,
            frequency_penalty: generation.frequency_penalty,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion API returned status {0}")]
    Status(u16),
    #[error("malformed completion response: {0}")]
    Malformed(String),
    #[error("completion attempt timed out")]
    TimedOut,
}

#[async_trait]
pub trait CompletionApi: Send + Sync + 'static {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

pub struct HttpCompletion {
    client: reqwest::Client,
    settings: CompletionSettings,
}

impl HttpCompletion {
    pub fn new(settings: CompletionSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }
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
    content: String,
}

#[async_trait]
impl CompletionApi for HttpCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let response = self
            .client
            .post(&self.settings.url)
            .bearer_auth(&self.settings.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompletionError::Status(status.as_u16()));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Malformed(err.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(CompletionError::Malformed("empty completion".to_string()));
        }
        Ok(content)
    }
}
