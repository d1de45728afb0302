//! LLM, embedding and reranking capability seams.
//!
//! Concrete providers live outside this crate; here are the contracts plus
//! two wire clients: native Anthropic and a generic OpenAI-compatible
//! translation path. [`LlmProvider`] is the single facade the rest of the
//! core calls.

mod anthropic;
mod openai_compat;
mod provider;
mod types;

pub use anthropic::AnthropicClient;
pub use openai_compat::OpenAiCompatClient;
pub use provider::{GenerateParams, LlmProvider, RoutedChatModel, ephemeral_cache_control};
pub use types::{
    ChatMessage, ChatRequest, LlmBlock, LlmResponse, StopReason, ToolDefinition, Usage,
};

use crate::Result;
use std::time::Duration;

/// A chat-capable model endpoint.
pub trait ChatModel: Send + Sync {
    /// Provider identifier for logging.
    fn name(&self) -> &'static str;

    /// Generates a response for the request.
    fn generate(&self, request: &ChatRequest) -> Result<LlmResponse>;
}

/// A text-embedding capability.
///
/// Implementations must be deterministic for a given text.
pub trait Embedder: Send + Sync {
    /// Embedding dimensionality.
    fn dimension(&self) -> usize;

    /// Embeds one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embeds a batch of texts, preserving order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// A cross-encoder reranking capability.
pub trait Reranker: Send + Sync {
    /// Scores each document against the query; higher is more relevant.
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// HTTP client configuration for provider requests.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    /// Request timeout in milliseconds (0 to disable).
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds (0 to disable).
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            connect_timeout_ms: 3_000,
        }
    }
}

/// Builds a blocking HTTP client with configured timeouts.
#[must_use]
pub fn build_http_client(config: HttpConfig) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder();
    if config.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(config.timeout_ms));
    }
    if config.connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!("failed to build LLM HTTP client: {err}");
        reqwest::blocking::Client::new()
    })
}

/// Extracts JSON from an LLM response that may include markdown fences,
/// prose, or other surrounding text.
///
/// Handles, in order: ```` ```json ```` blocks, bare ```` ``` ```` blocks,
/// raw objects (first `{` to last `}`), and arrays (first `[` to last `]`).
/// Falls back to the trimmed input.
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some((json_start, end)) = trimmed.find("```json").and_then(|start| {
        let json_start = start + 7;
        trimmed[json_start..].find("```").map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    if let Some((json_start, end)) = trimmed.find("```").and_then(|start| {
        let content_start = start + 3;
        let after_marker = &trimmed[content_start..];
        let json_start = after_marker
            .find('{')
            .map_or(content_start, |pos| content_start + pos);
        trimmed[json_start..].find("```").map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_raw() {
        assert_eq!(
            extract_json_from_response(r#"{"key": "value"}"#),
            r#"{"key": "value"}"#
        );
    }

    #[test]
    fn test_extract_json_markdown() {
        let response = "```json\n{\"key\": \"value\"}\n```";
        assert!(extract_json_from_response(response).contains("\"key\""));
    }

    #[test]
    fn test_extract_json_with_prose() {
        let response = "Here is the result: {\"key\": \"value\"} hope this helps";
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_array() {
        assert_eq!(
            extract_json_from_response(r#"["a", "b"]"#),
            r#"["a", "b"]"#
        );
    }
}
