//! Remote completion service: the trait the classifier calls, and an
//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::prompt::Prompt;
use crate::config::ClassifierConfig;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication rejected (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Short class label recorded in Unknown rationales.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Connection(_) => "connection",
            ServiceError::Auth { .. } => "auth",
            ServiceError::RateLimited(_) => "rate_limit",
            ServiceError::Http { .. } => "http",
            ServiceError::Malformed(_) => "malformed",
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ServiceError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            ServiceError::Connection(e.to_string())
        } else if e.is_decode() || e.is_body() {
            ServiceError::Malformed(e.to_string())
        } else {
            ServiceError::Connection(e.to_string())
        }
    }
}

/// One prompt in, the model's reply text out. Exactly one request per call.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError>;

    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiService {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    json_mode: bool,
}

impl OpenAiService {
    pub fn new(api_key: impl Into<String>, config: &ClassifierConfig) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::Connection(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            json_mode: config.json_mode,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiService {
    async fn complete(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            response_format: self.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.model, chars = prompt.user.chars().count(), "chat completion request");
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Auth {
                    status: status.as_u16(),
                    body,
                },
                StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited(body),
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                    ServiceError::Timeout(format!("HTTP {}", status.as_u16()))
                }
                _ => ServiceError::Http {
                    status: status.as_u16(),
                    body,
                },
            });
        }

        let text = response.text().await?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ServiceError::Malformed(format!("invalid JSON body: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ServiceError::Malformed("no message content in response".into()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}
