//! Provider-neutral LLM types, Anthropic-shaped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A content block in a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmBlock {
    /// Generated text.
    Text {
        /// The text content.
        text: String,
    },
    /// A tool invocation request.
    ToolUse {
        /// Provider-assigned call id, preserved verbatim.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// Extended-thinking content.
    Thinking {
        /// The reasoning text.
        thinking: String,
        /// Provider signature, when present.
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the turn.
    EndTurn,
    /// The model requested tool execution.
    ToolUse,
    /// The token limit was hit.
    MaxTokens,
}

impl StopReason {
    /// Maps an OpenAI `finish_reason` to the Anthropic-shaped reason.
    #[must_use]
    pub fn from_finish_reason(finish_reason: &str) -> Self {
        match finish_reason {
            "tool_calls" => Self::ToolUse,
            "length" => Self::MaxTokens,
            _ => Self::EndTurn,
        }
    }
}

/// Token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Tokens written to the provider prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Tokens served from the provider prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// A provider-neutral model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Content blocks in generation order (thinking first, then text/tools).
    pub content: Vec<LlmBlock>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting.
    pub usage: Usage,
    /// Raw `reasoning_details` from reasoning-capable OpenAI-compatible
    /// providers, preserved byte-for-byte for round-tripping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

/// A message in a chat request, Anthropic-shaped.
///
/// `content` is either a string or an array of content-block objects;
/// keeping it as a [`Value`] lets the continuum attach provider-specific
/// markers (`cache_control`) without this layer knowing about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant` or `tool`.
    pub role: String,
    /// String or content-block array.
    pub content: Value,
    /// Tool-call correlation id for `role: tool` messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Raw reasoning payload to round-trip back to the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

impl ChatMessage {
    /// A plain text message.
    #[must_use]
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            tool_call_id: None,
            reasoning_details: None,
        }
    }
}

/// An Anthropic-style tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Stable tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    pub input_schema: Value,
}

/// Parameters for one generation call.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// System prompt (string or block array with cache markers).
    pub system: Option<Value>,
    /// Tools offered this turn.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Token cap.
    pub max_tokens: Option<u32>,
    /// Enable extended thinking / reasoning.
    pub thinking_enabled: bool,
    /// Response format constraint (`{"type": "json_object"}`).
    pub response_format: Option<Value>,
}

impl LlmResponse {
    /// Returns the concatenated text blocks.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                LlmBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Returns the tool-use blocks.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                LlmBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(StopReason::from_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(
            StopReason::from_finish_reason("tool_calls"),
            StopReason::ToolUse
        );
        assert_eq!(
            StopReason::from_finish_reason("length"),
            StopReason::MaxTokens
        );
        assert_eq!(
            StopReason::from_finish_reason("anything-else"),
            StopReason::EndTurn
        );
    }

    #[test]
    fn test_text_content_concatenates() {
        let response = LlmResponse {
            content: vec![
                LlmBlock::Thinking {
                    thinking: "hmm".into(),
                    signature: None,
                },
                LlmBlock::Text { text: "Hello ".into() },
                LlmBlock::Text { text: "world".into() },
            ],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
            reasoning_details: None,
        };
        assert_eq!(response.text_content(), "Hello world");
    }
}
