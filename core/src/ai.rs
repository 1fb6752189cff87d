//! AI provider boundary.
//!
//! spec.md §9 calls for treating the assistant as "an injected provider
//! interface `{chat(messages, opts) -> text | error}`; tests supply a
//! deterministic stub" — the same seam the teacher draws around
//! `ModelClient` in `core/src/client.rs`, trimmed to the one method this
//! system actually needs (no streaming, no tool calls).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai request timed out after {0:?}")]
    Timeout(Duration),
    #[error("ai transport error: {0}")]
    Transport(String),
    #[error("ai provider returned an unparseable response")]
    BadResponse,
}

/// A text-in/text-out assistant. Renderer (C10) and the NPC-AI worker are
/// both plain callers of this trait — the pipeline never depends on a
/// concrete provider, so tests can supply a stub.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String, AiError>;
}

/// Strips Markdown code fences from a model response and substitutes a
/// fallback string for an empty result (spec.md §4.10).
pub fn sanitize_narration(raw: &str) -> String {
    let trimmed = strip_code_fences(raw.trim());
    if trimmed.is_empty() {
        "Narration unavailable.".to_string()
    } else {
        trimmed
    }
}

fn strip_code_fences(text: &str) -> String {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix(|c: char| c.is_alphabetic()).unwrap_or(rest);
        let rest = rest.trim_start_matches('\n');
        rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
    } else {
        text.to_string()
    }
}

/// Minimal Ollama `/api/chat` client. Grounded on `core/src/client.rs`'s
/// reqwest-based request/response shape, without the SSE streaming this
/// system has no use for.
pub struct OllamaProvider {
    client: reqwest::Client,
    host: String,
}

impl OllamaProvider {
    pub fn new(host: impl Into<String>) -> Self {
        OllamaProvider {
            client: reqwest::Client::new(),
            host: host.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[async_trait]
impl AiProvider for OllamaProvider {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String, AiError> {
        let request = OllamaRequest {
            model: &opts.model,
            messages,
            stream: false,
        };

        let send = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send();

        let response = tokio::time::timeout(opts.timeout, send)
            .await
            .map_err(|_| AiError::Timeout(opts.timeout))?
            .map_err(|e| AiError::Transport(e.to_string()))?;

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|_| AiError::BadResponse)?;

        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_code_block() {
        let raw = "```text\nThe door creaks open.\n```";
        assert_eq!(sanitize_narration(raw), "The door creaks open.");
    }

    #[test]
    fn empty_response_falls_back() {
        assert_eq!(sanitize_narration("   "), "Narration unavailable.");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(sanitize_narration("Plain narration."), "Plain narration.");
    }
}
