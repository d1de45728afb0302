//! Native Anthropic messages client.

use serde_json::{Value, json};

use super::types::{ChatRequest, LlmBlock, LlmResponse, StopReason, Usage};
use super::{ChatModel, HttpConfig, build_http_client};
use crate::{Error, Result};

/// Anthropic messages-API client.
pub struct AnthropicClient {
    api_key: String,
    endpoint: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl AnthropicClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com/v1";

    /// Creates a client for the given key and model.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: model.into(),
            client: build_http_client(HttpConfig::default()),
        }
    }

    /// Overrides the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Overrides HTTP timeouts.
    #[must_use]
    pub fn with_http_config(mut self, config: HttpConfig) -> Self {
        self.client = build_http_client(config);
        self
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut max_tokens = request.max_tokens.unwrap_or(4096);
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|msg| json!({"role": msg.role, "content": msg.content}))
            .collect();

        let mut payload = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": messages,
        });

        if let Some(system) = &request.system {
            payload["system"] = system.clone();
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(request.tools);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if request.thinking_enabled {
            let budget = 1024u32;
            max_tokens += budget;
            payload["max_tokens"] = json!(max_tokens);
            payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }

        payload
    }

    fn map_error(status: u16, body: &str) -> Error {
        if status == 400 && body.contains("prompt is too long") {
            return Error::ContextOverflow;
        }
        match status {
            401 | 403 => Error::PermissionDenied("anthropic authentication failed".to_string()),
            429 => Error::RateLimited("anthropic rate limit exceeded".to_string()),
            status if status >= 500 => {
                Error::op("anthropic_request", format!("server error: {status}"))
            }
            status => Error::op("anthropic_request", format!("API error: {status}")),
        }
    }

    fn parse_response(body: &Value) -> Result<LlmResponse> {
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::op("anthropic_response", "missing content array"))?;

        let mut content = Vec::with_capacity(blocks.len());
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => content.push(LlmBlock::Text {
                    text: block
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                Some("tool_use") => content.push(LlmBlock::ToolUse {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: block.get("input").cloned().unwrap_or(json!({})),
                }),
                Some("thinking") => content.push(LlmBlock::Thinking {
                    thinking: block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    signature: block
                        .get("signature")
                        .and_then(Value::as_str)
                        .map(String::from),
                }),
                other => {
                    tracing::debug!("skipping unknown anthropic block type: {other:?}");
                }
            }
        }

        let stop_reason = match body.get("stop_reason").and_then(Value::as_str) {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = body
            .get("usage")
            .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            stop_reason,
            usage,
            reasoning_details: None,
        })
    }
}

impl ChatModel for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn generate(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let payload = self.build_payload(request);

        let response = self
            .client
            .post(format!("{}/messages", self.endpoint))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .map_err(|e| Error::op("anthropic_request", e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().unwrap_or_default();
            let preview: String = body.chars().take(500).collect();
            tracing::error!("anthropic HTTP error: {status} - {preview}");
            return Err(Self::map_error(status, &body));
        }

        let body: Value = response
            .json()
            .map_err(|e| Error::op("anthropic_response", e))?;
        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            AnthropicClient::map_error(400, "prompt is too long: 250000 tokens"),
            Error::ContextOverflow
        ));
        assert!(matches!(
            AnthropicClient::map_error(401, ""),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            AnthropicClient::map_error(429, ""),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            AnthropicClient::map_error(529, ""),
            Error::OperationFailed { .. }
        ));
    }

    #[test]
    fn test_parse_response_blocks() {
        let body = json!({
            "content": [
                {"type": "thinking", "thinking": "let me see", "signature": "sig"},
                {"type": "text", "text": "Answer"},
                {"type": "tool_use", "id": "call_1", "name": "maps_tool", "input": {"q": "cafe"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        });
        let response = AnthropicClient::parse_response(&body).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.content.len(), 3);
        assert_eq!(response.text_content(), "Answer");
        let tools = response.tool_uses();
        assert_eq!(tools[0].0, "call_1");
        assert_eq!(tools[0].1, "maps_tool");
    }
}
