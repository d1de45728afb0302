//! Continuum aggregate root.
//!
//! Encapsulates conversation state and business rules without external
//! dependencies. Mutations append to the hot cache and return the created
//! message plus domain events; persistence is the orchestrator's job, never
//! inline.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::segments::{self, SegmentStatus};
use crate::llm::ChatMessage;
use crate::models::{ContentBlock, ContinuumEvent, Message, MessageContent, Role};
use crate::{Error, Result};

/// Options for [`Continuum::get_messages_for_api`].
#[derive(Debug, Clone, Default)]
pub struct ApiFormatOptions {
    /// IANA timezone for ephemeral timestamp prefixes; skipped when absent.
    pub timezone: Option<String>,
}

/// Persistent identity of a continuum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ContinuumState {
    id: Uuid,
    user_id: Uuid,
}

/// The per-user conversation aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Continuum {
    state: ContinuumState,
    /// Hot cache of recent messages, including sentinels.
    messages: Vec<Message>,
}

impl Continuum {
    /// Creates a new continuum for a user.
    #[must_use]
    pub fn create_new(user_id: Uuid) -> Self {
        Self {
            state: ContinuumState {
                id: Uuid::new_v4(),
                user_id,
            },
            messages: Vec::new(),
        }
    }

    /// The continuum id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.state.id
    }

    /// The owning user.
    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.state.user_id
    }

    /// The hot cache contents.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replaces the hot cache with an externally pruned list.
    ///
    /// Used by the hot-cache manager after collapse and topic-based pruning.
    pub fn apply_cache(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Appends a user message. Creates a fresh segment sentinel first when
    /// no segment is active.
    pub fn add_user_message(
        &mut self,
        content: impl Into<MessageContent>,
    ) -> Result<(Message, Vec<ContinuumEvent>)> {
        self.ensure_active_segment()?;
        let message = Message::new(Role::User, content)?;
        self.messages.push(message.clone());
        Ok((message, Vec::new()))
    }

    /// Appends an assistant message.
    ///
    /// Content must be non-blank unless the metadata carries
    /// `has_tool_calls: true`.
    pub fn add_assistant_message(
        &mut self,
        content: impl Into<MessageContent>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(Message, Vec<ContinuumEvent>)> {
        self.ensure_active_segment()?;
        let message =
            Message::with_meta(Role::Assistant, content, metadata.unwrap_or_default())?;
        self.messages.push(message.clone());
        Ok((message, Vec::new()))
    }

    /// Appends a tool result message correlated by `tool_call_id`.
    pub fn add_tool_message(
        &mut self,
        content: impl Into<MessageContent>,
        tool_call_id: &str,
    ) -> Result<(Message, Vec<ContinuumEvent>)> {
        let mut metadata = Map::new();
        metadata.insert("tool_call_id".into(), json!(tool_call_id));
        let message = Message::with_meta(Role::Tool, content, metadata)?;
        self.messages.push(message.clone());
        Ok((message, Vec::new()))
    }

    /// Requests an explicit segment boundary, returning the new sentinel.
    pub fn begin_segment(&mut self) -> Result<Message> {
        let sentinel = segments::new_sentinel()?;
        self.messages.push(sentinel.clone());
        Ok(sentinel)
    }

    /// The currently active sentinel, if any.
    #[must_use]
    pub fn active_sentinel(&self) -> Option<&Message> {
        segments::active_sentinel(&self.messages)
    }

    fn ensure_active_segment(&mut self) -> Result<()> {
        if self.active_sentinel().is_none() {
            self.begin_segment()?;
        }
        Ok(())
    }

    /// Produces the provider-neutral message list for the LLM.
    ///
    /// Transformations:
    /// - collapsed sentinels render as their display format;
    /// - user/assistant messages (non-notification, non-boundary) get an
    ///   ephemeral `[h:mma]` local-time prefix, inside the first text block
    ///   for multimodal content — never persisted;
    /// - the last assistant message gets `cache_control: ephemeral` on its
    ///   final content block;
    /// - tool messages carry `tool_call_id`.
    #[must_use]
    pub fn get_messages_for_api(&self, options: &ApiFormatOptions) -> Vec<ChatMessage> {
        let tz: Option<Tz> = options
            .timezone
            .as_deref()
            .and_then(|name| name.parse().ok());

        let mut formatted: Vec<ChatMessage> = Vec::with_capacity(self.messages.len());

        for message in &self.messages {
            if segments::sentinel_status(message) == Some(SegmentStatus::Collapsed) {
                formatted.push(ChatMessage::text(
                    "user",
                    segments::format_segment_for_display(message),
                ));
                continue;
            }
            if segments::sentinel_status(message) == Some(SegmentStatus::Active) {
                // Active boundaries are bookkeeping, not model input.
                continue;
            }

            match message.role {
                Role::Tool => formatted.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Value::String(message.content.text()),
                    tool_call_id: message.meta_str("tool_call_id").map(String::from),
                    reasoning_details: None,
                }),
                Role::User | Role::Assistant => {
                    let content =
                        Self::render_content(message, tz.as_ref());
                    let mut chat = ChatMessage {
                        role: message.role.to_string(),
                        content,
                        tool_call_id: None,
                        reasoning_details: message.metadata.get("reasoning_details").cloned(),
                    };
                    if message.role == Role::Assistant && message.meta_flag("has_tool_calls") {
                        // Tool-use blocks already live in the content; the
                        // flag only relaxes the empty-content rule.
                        if chat.content == Value::String(String::new()) {
                            chat.content = json!([]);
                        }
                    }
                    formatted.push(chat);
                }
            }
        }

        Self::mark_last_assistant_for_caching(&mut formatted);
        formatted
    }

    fn render_content(message: &Message, tz: Option<&Tz>) -> Value {
        let prefix = tz.and_then(|tz| {
            if message.is_system_notification() {
                return None;
            }
            Some(timestamp_prefix(message.created_at, tz))
        });

        match &message.content {
            MessageContent::Text(text) => match prefix {
                Some(prefix) => Value::String(format!("{prefix} {text}")),
                None => Value::String(text.clone()),
            },
            MessageContent::Blocks(blocks) => {
                let mut rendered: Vec<Value> = blocks
                    .iter()
                    .filter_map(|b| serde_json::to_value(b).ok())
                    .collect();
                if let Some(prefix) = prefix {
                    for block in &mut rendered {
                        if block.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                let prefixed = format!("{prefix} {text}");
                                block["text"] = Value::String(prefixed);
                            }
                            break;
                        }
                    }
                }
                Value::Array(rendered)
            }
        }
    }

    /// Applies `cache_control: ephemeral` to the final content block of the
    /// last assistant message.
    ///
    /// Providers ignore cache markers below their token minimum, so the
    /// marker is always applied and the API handles the threshold.
    fn mark_last_assistant_for_caching(messages: &mut [ChatMessage]) {
        for chat in messages.iter_mut().rev() {
            if chat.role != "assistant" {
                continue;
            }
            let blocks = match chat.content.take() {
                Value::String(text) => vec![json!({"type": "text", "text": text})],
                Value::Array(blocks) => blocks,
                other => {
                    chat.content = other;
                    return;
                }
            };
            let mut blocks = blocks;
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = json!({"type": "ephemeral"});
            }
            chat.content = Value::Array(blocks);
            return;
        }
    }

    /// Serializes the aggregate for persistence.
    pub fn to_dict(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::op("continuum_serialize", e))
    }

    /// Restores an aggregate from its serialized form.
    pub fn from_dict(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::op("continuum_deserialize", e))
    }
}

/// Formats the ephemeral timestamp prefix, e.g. `[3:07pm]`.
fn timestamp_prefix(created_at: DateTime<Utc>, tz: &Tz) -> String {
    let local = created_at.with_timezone(tz);
    format!("[{}]", local.format("%-I:%M%P"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuum::segments::collapse_sentinel;

    fn with_tz() -> ApiFormatOptions {
        ApiFormatOptions {
            timezone: Some("America/New_York".to_string()),
        }
    }

    #[test]
    fn test_first_user_message_creates_segment() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("hello").unwrap();
        assert!(continuum.active_sentinel().is_some());
        assert_eq!(continuum.messages().len(), 2);
    }

    #[test]
    fn test_blank_assistant_rejected_without_tool_calls() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        assert!(continuum.add_assistant_message("  ", None).is_err());
    }

    #[test]
    fn test_serde_round_trip_preserves_state() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("first").unwrap();
        continuum.add_assistant_message("second", None).unwrap();

        let dict = continuum.to_dict().unwrap();
        let restored = Continuum::from_dict(dict).unwrap();
        assert_eq!(restored, continuum);
    }

    #[test]
    fn test_api_format_prefixes_timestamp() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("hello there").unwrap();

        let formatted = continuum.get_messages_for_api(&with_tz());
        let content = formatted[0].content.as_str().unwrap();
        assert!(content.starts_with('['), "expected prefix, got {content}");
        assert!(content.ends_with("] hello there"));
        // The persisted message is untouched.
        assert_eq!(continuum.messages()[1].content.text(), "hello there");
    }

    #[test]
    fn test_api_format_without_timezone_skips_prefix() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("hello").unwrap();
        let formatted = continuum.get_messages_for_api(&ApiFormatOptions::default());
        assert_eq!(formatted[0].content, Value::String("hello".into()));
    }

    #[test]
    fn test_multimodal_prefix_goes_into_first_text_block() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        let blocks = MessageContent::Blocks(vec![
            ContentBlock::Image {
                source: json!({"type": "base64", "data": "aGk="}),
            },
            ContentBlock::text("what is this?"),
        ]);
        continuum.add_user_message(blocks).unwrap();

        let formatted = continuum.get_messages_for_api(&with_tz());
        let rendered = formatted[0].content.as_array().unwrap();
        let text = rendered[1]["text"].as_str().unwrap();
        assert!(text.contains("] what is this?"));
    }

    #[test]
    fn test_cache_control_on_last_assistant_block() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("q1").unwrap();
        continuum.add_assistant_message("a1", None).unwrap();
        continuum.add_user_message("q2").unwrap();
        continuum.add_assistant_message("a2", None).unwrap();
        continuum.add_user_message("q3").unwrap();

        let formatted = continuum.get_messages_for_api(&ApiFormatOptions::default());
        let assistants: Vec<&ChatMessage> =
            formatted.iter().filter(|m| m.role == "assistant").collect();

        let last_blocks = assistants[1].content.as_array().unwrap();
        assert_eq!(
            last_blocks.last().unwrap()["cache_control"],
            json!({"type": "ephemeral"})
        );
        // Only the last assistant message is marked.
        assert!(assistants[0].content.as_str().is_some());
    }

    #[test]
    fn test_collapsed_sentinel_renders_display_format() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("old talk").unwrap();

        let sentinel = continuum.active_sentinel().unwrap().clone();
        let collapsed =
            collapse_sentinel(&sentinel, "We planned a trip.", "Trip planning", 2, &[]).unwrap();
        let mut cache: Vec<Message> = continuum.messages().to_vec();
        cache[0] = collapsed;
        continuum.apply_cache(cache);

        let formatted = continuum.get_messages_for_api(&ApiFormatOptions::default());
        let first = formatted[0].content.as_str().unwrap();
        assert!(first.contains("Trip planning"));
        assert!(first.contains("We planned a trip."));
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let mut continuum = Continuum::create_new(Uuid::new_v4());
        continuum.add_user_message("q").unwrap();
        continuum.add_tool_message("result", "call_9").unwrap();

        let formatted = continuum.get_messages_for_api(&ApiFormatOptions::default());
        let tool = formatted.iter().find(|m| m.role == "tool").unwrap();
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_9"));
    }
}
