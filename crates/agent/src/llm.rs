//! Text generation backends used for email bodies and reply classification.
//!
//! The model only ever writes prose or a single category word. Every decision about who
//! gets contacted, when, and what happens to a lead is made deterministically in core.

use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{LlmConfig, LlmProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out")]
    Timeout,
    #[error("llm http error: {0}")]
    Http(String),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be used: {0}")]
    InvalidResponse(String),
    #[error("llm is not configured: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error.to_string())
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Builds the configured backend.
pub fn from_config(config: &LlmConfig) -> Result<Box<dyn LlmClient>, LlmError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let client = match config.provider {
        LlmProvider::Ollama => Box::new(OllamaClient::new(
            config.base_url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL),
            &config.model,
            timeout,
        )?) as Box<dyn LlmClient>,
        LlmProvider::OpenAi => Box::new(OpenAiClient::new(
            config.base_url.as_deref().unwrap_or(OPENAI_DEFAULT_URL),
            &config.model,
            require_key(config)?,
            timeout,
        )?),
        LlmProvider::Anthropic => Box::new(AnthropicClient::new(
            config.base_url.as_deref().unwrap_or(ANTHROPIC_DEFAULT_URL),
            &config.model,
            require_key(config)?,
            timeout,
        )?),
    };
    Ok(client)
}

fn require_key(config: &LlmConfig) -> Result<SecretString, LlmError> {
    config
        .api_key
        .clone()
        .ok_or_else(|| LlmError::Configuration("api_key is required for this provider".to_string()))
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| LlmError::Configuration(error.to_string()))
}

async fn checked_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, LlmError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Status { status: status.as_u16(), body });
    }
    response.json::<T>().await.map_err(|error| LlmError::InvalidResponse(error.to_string()))
}

fn non_empty(text: String) -> Result<String, LlmError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(LlmError::InvalidResponse("empty completion".to_string()))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Local Ollama server, non-streaming `/api/generate`.
pub struct OllamaClient {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
            client: http_client(timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({ "model": self.model, "prompt": prompt, "stream": false });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let parsed: OllamaResponse = checked_json(response).await?;
        non_empty(parsed.response)
    }
}

/// Any OpenAI-compatible chat completions endpoint.
pub struct OpenAiClient {
    endpoint: String,
    model: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            client: http_client(timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .json(&body)
            .send()
            .await?;
        let parsed: ChatCompletion = checked_json(response).await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("no choices returned".to_string()))?;
        non_empty(content)
    }
}

pub struct AnthropicClient {
    endpoint: String,
    model: String,
    api_key: SecretString,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: format!("{}/messages", base_url.trim_end_matches('/')),
            model: model.to_string(),
            api_key,
            client: http_client(timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct AnthropicMessage {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        let parsed: AnthropicMessage = checked_json(response).await?;
        let text: String = parsed.content.into_iter().filter_map(|block| block.text).collect();
        non_empty(text)
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::config::{LlmConfig, LlmProvider};

    use super::{from_config, non_empty, LlmError};

    fn config(provider: LlmProvider) -> LlmConfig {
        LlmConfig {
            provider,
            api_key: None,
            base_url: None,
            model: "llama3".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn hosted_providers_require_an_api_key() {
        let error = from_config(&config(LlmProvider::OpenAi)).err();
        assert!(matches!(error, Some(LlmError::Configuration(_))));

        let error = from_config(&config(LlmProvider::Anthropic)).err();
        assert!(matches!(error, Some(LlmError::Configuration(_))));
    }

    #[test]
    fn ollama_needs_no_credentials() {
        let client = from_config(&config(LlmProvider::Ollama)).expect("ollama client");
        assert_eq!(client.name(), "ollama");

        let mut keyed = config(LlmProvider::OpenAi);
        keyed.api_key = Some("sk-test".to_string().into());
        let client = from_config(&keyed).expect("openai client");
        assert_eq!(client.name(), "openai");
    }

    #[test]
    fn blank_completions_are_rejected() {
        assert!(matches!(non_empty("  \n".to_string()), Err(LlmError::InvalidResponse(_))));
        assert_eq!(non_empty("  interested\n".to_string()).expect("text"), "interested");
    }
}
