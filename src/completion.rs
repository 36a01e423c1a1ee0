//! Chat completion providers.
//!
//! | Provider | Endpoint |
//! |----------|----------|
//! | [`OpenAICompleter`] | `POST {url}/v1/chat/completions` |
//! | [`OllamaCompleter`] | `POST {url}/api/chat` (non-streaming) |
//! | [`DisabledCompleter`] | none; every call fails with [`ProviderError::Disabled`] |
//!
//! A response whose `finish_reason` is `content_filter` is reported as
//! [`ProviderError::ContentFiltered`] even when the HTTP status is 200.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use knowbridge_core::error::ProviderError;
use knowbridge_core::models::Role;

use crate::config::CompletionConfig;
use crate::embedding::{http_client, post_json};

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// One message of a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate the assistant reply for `messages`. One provider call.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ProviderError>;
}

pub fn create_completer(config: &CompletionConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompleter)),
        "openai" => Ok(Arc::new(OpenAICompleter::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaCompleter::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}

pub struct DisabledCompleter;

#[async_trait]
impl CompletionProvider for DisabledCompleter {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

/// OpenAI-compatible chat completions. Reads `OPENAI_API_KEY`.
pub struct OpenAICompleter {
    model: String,
    url: String,
    api_key: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAICompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("completion.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
            api_key,
            timeout_secs: config.timeout_secs,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });
        let request = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json(request, &body, self.timeout_secs).await?;
        parse_openai_chat(&json)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<String, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::Unavailable("response missing choices".to_string()))?;

    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("content_filter") {
        return Err(ProviderError::ContentFiltered(
            "completion stopped by content filter".to_string(),
        ));
    }

    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::Unavailable("response missing message content".to_string()))
}

/// Chat against a local Ollama model.
pub struct OllamaCompleter {
    model: String,
    url: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OllamaCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("completion.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string()),
            timeout_secs: config.timeout_secs,
            client: http_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl CompletionProvider for OllamaCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": temperature },
        });
        let request = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')));
        let json = post_json(request, &body, self.timeout_secs).await?;
        json.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::Unavailable("response missing message content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_serializes_lowercase_role() {
        let msg = ChatMessage::new(Role::System, "be brief");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "system", "content": "be brief"})
        );
    }

    #[test]
    fn test_parse_openai_chat() {
        let ok = json!({"choices": [{"finish_reason": "stop", "message": {"content": "Hi."}}]});
        assert_eq!(parse_openai_chat(&ok).unwrap(), "Hi.");

        let filtered = json!({"choices": [{"finish_reason": "content_filter", "message": {"content": ""}}]});
        assert!(matches!(
            parse_openai_chat(&filtered),
            Err(ProviderError::ContentFiltered(_))
        ));

        assert!(parse_openai_chat(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_completer() {
        let completer = create_completer(&CompletionConfig::default()).unwrap();
        assert_eq!(
            completer.complete(&[], 0.0).await,
            Err(ProviderError::Disabled)
        );
    }
}
