//! Text-completion service interface and the Ollama HTTP adapter

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

/// An opaque text-completion service
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Complete a single user prompt
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Short name for logs
    fn name(&self) -> &str {
        "completion"
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

/// Completion through a local Ollama server's `/api/chat`
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::completion(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Build a client from the configured base URL, or `None` when completion
    /// is disabled
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        config
            .completion_base_url
            .as_deref()
            .map(|url| Self::new(url, &config.completion_model, config.completion_timeout))
            .transpose()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: false,
            options: ChatOptions { temperature: 0.0 },
        }
    }
}

#[async_trait]
impl CompletionService for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "sending completion request");

        let response = self
            .client
            .post(self.chat_url())
            .json(&self.request(prompt))
            .send()
            .await
            .map_err(|e| Error::completion(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::completion(format!("Ollama returned {status}: {body}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::completion(format!("Invalid Ollama response: {e}")))?;

        Ok(body.message.map(|m| m.content).unwrap_or_default())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
