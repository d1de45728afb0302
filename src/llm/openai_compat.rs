//! Generic OpenAI-compatible client with Anthropic format translation.
//!
//! Accepts Anthropic-shaped messages and tools, translates them to the
//! OpenAI chat-completions format, and translates responses back. Used for
//! failover providers, cheap classification models, and local inference.
//!
//! Translation rules:
//! - `tool_use` blocks ↔ `tool_calls` entries (ids preserved verbatim);
//! - `tool_result` user-blocks → `role: tool` messages;
//! - `thinking` blocks are stripped outbound;
//! - `reasoning_details` round-trips untouched for reasoning models;
//! - tools with no parameters tolerate a missing `arguments` field (some
//!   proxies omit it instead of sending `{}`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader};

use super::types::{ChatMessage, ChatRequest, LlmBlock, LlmResponse, StopReason, Usage};
use super::{ChatModel, HttpConfig, build_http_client};
use crate::{Error, Result};

static TOOL_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"attempted to call tool '(\w+)'").unwrap();
    re
});

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    default_max_tokens: u32,
}

impl OpenAiCompatClient {
    /// Creates a client for a full chat-completions URL.
    ///
    /// `api_key` is optional for local providers (Ollama, LM Studio).
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            client: build_http_client(HttpConfig::default()),
            default_max_tokens: 4096,
        }
    }

    /// Overrides HTTP timeouts.
    #[must_use]
    pub fn with_http_config(mut self, config: HttpConfig) -> Self {
        self.client = build_http_client(config);
        self
    }

    /// Converts an Anthropic system prompt (string or block array) to an
    /// OpenAI system message, stripping cache markers.
    fn convert_system_prompt(system: &Value) -> Value {
        let text = match system {
            Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        json!({"role": "system", "content": text})
    }

    /// Converts Anthropic messages to OpenAI format.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut converted = Vec::with_capacity(messages.len());

        for msg in messages {
            match msg.role.as_str() {
                "user" => Self::convert_user_message(msg, &mut converted),
                "assistant" => Self::convert_assistant_message(msg, &mut converted),
                "tool" => {
                    converted.push(json!({
                        "role": "tool",
                        "tool_call_id": msg.tool_call_id,
                        "content": Self::stringify_content(&msg.content),
                    }));
                }
                other => {
                    tracing::debug!("skipping message with unsupported role: {other}");
                }
            }
        }

        converted
    }

    fn convert_user_message(msg: &ChatMessage, out: &mut Vec<Value>) {
        if let Value::Array(blocks) = &msg.content {
            let tool_results: Vec<&Value> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
                .collect();
            if tool_results.is_empty() {
                let text: String = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if !text.is_empty() {
                    out.push(json!({"role": "user", "content": text}));
                }
            } else {
                for result in tool_results {
                    let content = result.get("content").cloned().unwrap_or(Value::Null);
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.get("tool_use_id").cloned().unwrap_or(Value::Null),
                        "content": Self::stringify_content(&content),
                    }));
                }
            }
        } else {
            out.push(json!({"role": "user", "content": msg.content}));
        }
    }

    fn convert_assistant_message(msg: &ChatMessage, out: &mut Vec<Value>) {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        match &msg.content {
            Value::Array(blocks) => {
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                text_parts.push(text.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let input = block.get("input").cloned().unwrap_or(json!({}));
                            tool_calls.push(json!({
                                "id": block.get("id").cloned().unwrap_or(Value::Null),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                                    "arguments": input.to_string(),
                                },
                            }));
                        }
                        // Not supported by generic providers.
                        Some("thinking") => {}
                        _ => {}
                    }
                }
            }
            Value::String(text) => text_parts.push(text.clone()),
            _ => {}
        }

        let mut obj = serde_json::Map::new();
        obj.insert("role".into(), json!("assistant"));
        if !text_parts.is_empty() {
            obj.insert("content".into(), json!(text_parts.join("")));
        }
        if !tool_calls.is_empty() {
            obj.insert("tool_calls".into(), Value::Array(tool_calls));
        }
        if let Some(details) = &msg.reasoning_details {
            obj.insert("reasoning_details".into(), details.clone());
        }
        out.push(Value::Object(obj));
    }

    fn stringify_content(content: &Value) -> String {
        match content {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Converts Anthropic tool schemas to OpenAI function definitions.
    fn convert_tools(request: &ChatRequest) -> Vec<Value> {
        request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    },
                })
            })
            .collect()
    }

    fn build_payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut max_tokens = request.max_tokens.unwrap_or(self.default_max_tokens);
        if request.thinking_enabled {
            max_tokens += 1024;
        }

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(Self::convert_system_prompt(system));
        }
        messages.extend(Self::convert_messages(&request.messages));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(Self::convert_tools(request));
        }
        if request.thinking_enabled {
            payload["reasoning"] = json!({"effort": "high"});
        }
        if let Some(format) = &request.response_format {
            payload["response_format"] = format.clone();
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    /// Maps an HTTP error to the exceptions the provider facade expects.
    fn map_http_error(status: u16, body: Option<&Value>) -> Error {
        if status == 400 {
            if let Some(error_info) = body.and_then(|b| b.get("error")) {
                let code = error_info
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let message = error_info
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                if code.contains("context_length")
                    || message.to_lowercase().contains("reduce the length")
                {
                    return Error::ContextOverflow;
                }

                // Groq-style tool validation failure: the model called a tool
                // that was not in request.tools.
                if code == "tool_use_failed" {
                    let tool_name = TOOL_NAME_RE
                        .captures(message)
                        .and_then(|caps| caps.get(1))
                        .map_or_else(|| "unknown_tool".to_string(), |m| m.as_str().to_string());
                    return Error::ToolNotLoaded { tool_name };
                }
            }
        }

        match status {
            401 | 403 => {
                Error::PermissionDenied("openai-compatible authentication failed".to_string())
            }
            429 => Error::RateLimited("openai-compatible rate limit exceeded".to_string()),
            status if status >= 500 => {
                Error::op("openai_compat_request", format!("server error: {status}"))
            }
            status => Error::op("openai_compat_request", format!("API error: {status}")),
        }
    }

    /// Converts an OpenAI response body to the Anthropic-shaped response.
    fn wrap_response(body: &Value) -> Result<LlmResponse> {
        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| Error::op("openai_compat_response", "missing or empty choices"))?;
        let message = choice
            .get("message")
            .filter(|m| m.is_object())
            .ok_or_else(|| Error::op("openai_compat_response", "empty message"))?;

        let mut content = Vec::new();

        // Reasoning first, matching Anthropic's thinking-first ordering.
        let reasoning_details = body
            .get("reasoning_details")
            .or_else(|| message.get("reasoning_details"))
            .cloned();
        let reasoning_text = Self::extract_reasoning_text(message, reasoning_details.as_ref());
        if let Some(thinking) = reasoning_text {
            content.push(LlmBlock::Thinking {
                thinking,
                signature: None,
            });
        }

        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                content.push(LlmBlock::Text {
                    text: text.to_string(),
                });
            }
        }

        if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in tool_calls {
                let function = call.get("function").cloned().unwrap_or(json!({}));
                // Some proxies omit 'arguments' for no-parameter tools
                // instead of sending "{}" per the OpenAI spec.
                let arguments_str = function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or("{}");
                let input = if arguments_str.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(arguments_str).unwrap_or_else(|_| {
                        tracing::warn!("failed to parse tool arguments: {arguments_str}");
                        json!({})
                    })
                };
                content.push(LlmBlock::ToolUse {
                    id: call
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: function
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input,
                });
            }
        }

        let stop_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map_or(StopReason::EndTurn, StopReason::from_finish_reason);

        let usage = body.get("usage").map_or_else(Usage::default, |usage| Usage {
            input_tokens: usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        });

        Ok(LlmResponse {
            content,
            stop_reason,
            usage,
            reasoning_details,
        })
    }

    fn extract_reasoning_text(message: &Value, details: Option<&Value>) -> Option<String> {
        if let Some(Value::Array(items)) = details {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(obj)
                        if obj.get("type").and_then(Value::as_str)
                            == Some("reasoning.text") =>
                    {
                        obj.get("text").and_then(Value::as_str)
                    }
                    Value::String(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if !parts.is_empty() {
                return Some(parts.join("\n"));
            }
        }
        message
            .get("reasoning")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Streams a response via SSE, yielding raw chunk values.
    ///
    /// Each chunk has `choices[0].delta` with incremental content or tool
    /// calls; the final chunk carries `finish_reason`, which maps the same
    /// way as the non-streaming stop reason.
    pub fn generate_streaming(
        &self,
        request: &ChatRequest,
    ) -> Result<impl Iterator<Item = Result<Value>>> {
        let payload = self.build_payload(request, true);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json");
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .json(&payload)
            .send()
            .map_err(|e| Error::op("openai_compat_stream", e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body: Option<Value> = response.json().ok();
            return Err(Self::map_http_error(status, body.as_ref()));
        }

        let reader = BufReader::new(response);
        Ok(reader.lines().filter_map(|line| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::op("openai_compat_stream", e))),
            };
            let line = line.trim();
            if line.is_empty() || line == "data: [DONE]" {
                return None;
            }
            line.strip_prefix("data: ").map(|data| {
                serde_json::from_str::<Value>(data)
                    .map_err(|e| Error::op("openai_compat_stream", format!("bad SSE chunk: {e}")))
            })
        }))
    }
}

impl ChatModel for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn generate(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let payload = self.build_payload(request, false);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json");
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .json(&payload)
            .send()
            .map_err(|e| Error::op("openai_compat_request", e))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body: Option<Value> = response.json().ok();
            tracing::error!("openai-compatible HTTP error: {status}");
            return Err(Self::map_http_error(status, body.as_ref()));
        }

        let body: Value = response
            .json()
            .map_err(|e| Error::op("openai_compat_response", e))?;
        Self::wrap_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ToolDefinition;

    #[test]
    fn test_tool_use_round_trip_preserves_ids() {
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: json!([
                {"type": "text", "text": "Checking"},
                {"type": "tool_use", "id": "call_abc", "name": "maps_tool", "input": {"q": "cafe"}}
            ]),
            tool_call_id: None,
            reasoning_details: None,
        }];
        let converted = OpenAiCompatClient::convert_messages(&messages);
        assert_eq!(converted.len(), 1);
        let tool_calls = converted[0]["tool_calls"].as_array().unwrap();
        assert_eq!(tool_calls[0]["id"], "call_abc");
        assert_eq!(tool_calls[0]["function"]["name"], "maps_tool");
    }

    #[test]
    fn test_tool_result_becomes_tool_role() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: json!([
                {"type": "tool_result", "tool_use_id": "call_abc", "content": "42 results"}
            ]),
            tool_call_id: None,
            reasoning_details: None,
        }];
        let converted = OpenAiCompatClient::convert_messages(&messages);
        assert_eq!(converted[0]["role"], "tool");
        assert_eq!(converted[0]["tool_call_id"], "call_abc");
        assert_eq!(converted[0]["content"], "42 results");
    }

    #[test]
    fn test_thinking_blocks_stripped_outbound() {
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: json!([
                {"type": "thinking", "thinking": "private"},
                {"type": "text", "text": "public"}
            ]),
            tool_call_id: None,
            reasoning_details: None,
        }];
        let converted = OpenAiCompatClient::convert_messages(&messages);
        assert_eq!(converted[0]["content"], "public");
        assert!(!converted[0].to_string().contains("private"));
    }

    #[test]
    fn test_reasoning_details_round_trip() {
        let details = json!([{"type": "reasoning.text", "text": "step 1"}]);
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: json!("answer"),
            tool_call_id: None,
            reasoning_details: Some(details.clone()),
        }];
        let converted = OpenAiCompatClient::convert_messages(&messages);
        assert_eq!(converted[0]["reasoning_details"], details);
    }

    #[test]
    fn test_wrap_response_missing_arguments_tolerated() {
        let body = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "getcontext"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        });
        let response = OpenAiCompatClient::wrap_response(&body).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        let tools = response.tool_uses();
        assert_eq!(tools[0].2, &json!({}));
    }

    #[test]
    fn test_wrap_response_reasoning_becomes_thinking() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "final",
                    "reasoning_details": [{"type": "reasoning.text", "text": "because"}]
                },
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let response = OpenAiCompatClient::wrap_response(&body).unwrap();
        assert!(matches!(
            &response.content[0],
            LlmBlock::Thinking { thinking, .. } if thinking == "because"
        ));
        assert!(response.reasoning_details.is_some());
    }

    #[test]
    fn test_map_http_error_context_overflow() {
        let body = json!({"error": {"code": "context_length_exceeded", "message": ""}});
        assert!(matches!(
            OpenAiCompatClient::map_http_error(400, Some(&body)),
            Error::ContextOverflow
        ));

        let body = json!({"error": {"code": "", "message": "Please reduce the length of your prompt"}});
        assert!(matches!(
            OpenAiCompatClient::map_http_error(400, Some(&body)),
            Error::ContextOverflow
        ));
    }

    #[test]
    fn test_map_http_error_tool_not_loaded() {
        let body = json!({"error": {
            "code": "tool_use_failed",
            "message": "attempted to call tool 'maps_tool' which was not in request.tools"
        }});
        match OpenAiCompatClient::map_http_error(400, Some(&body)) {
            Error::ToolNotLoaded { tool_name } => assert_eq!(tool_name, "maps_tool"),
            other => panic!("expected ToolNotLoaded, got {other}"),
        }
    }

    #[test]
    fn test_map_http_error_statuses() {
        assert!(matches!(
            OpenAiCompatClient::map_http_error(401, None),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            OpenAiCompatClient::map_http_error(429, None),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            OpenAiCompatClient::map_http_error(503, None),
            Error::OperationFailed { .. }
        ));
    }

    #[test]
    fn test_tools_convert_to_function_schema() {
        let request = ChatRequest {
            tools: vec![ToolDefinition {
                name: "getweather".into(),
                description: "Get weather".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            }],
            ..ChatRequest::default()
        };
        let tools = OpenAiCompatClient::convert_tools(&request);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "getweather");
    }
}
