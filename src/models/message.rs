//! Immutable message value objects.
//!
//! A [`Message`] never changes once created; metadata updates go through
//! [`Message::with_metadata`], which returns a new value with the same id,
//! role, content and creation time. Timestamps are UTC everywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Result};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human turn.
    User,
    /// A model turn.
    Assistant,
    /// A tool-result turn, correlated by `tool_call_id` metadata.
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single typed block inside a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text, optionally carrying a provider cache marker.
    Text {
        /// The text content.
        text: String,
        /// Prompt-cache hint (`{"type": "ephemeral"}`), provider-specific.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    /// An image reference (provider-shaped source object).
    Image {
        /// Source descriptor (base64 payload or URL form).
        source: Value,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Provider-assigned call id, preserved verbatim across translation.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// Id of the `tool_use` block this result answers.
        tool_use_id: String,
        /// Result payload.
        content: Value,
    },
    /// A file uploaded into the provider's container.
    ContainerUpload {
        /// Provider file id.
        file_id: String,
    },
}

impl ContentBlock {
    /// Convenience constructor for a plain text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            cache_control: None,
        }
    }
}

/// Message content: a plain string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Multimodal content blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Returns true when the content is empty (blank text or no blocks).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }

    /// Returns the concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Approximate character length, used for summarization chunking.
    #[must_use]
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text, .. } => text.len(),
                    ContentBlock::ToolResult { content, .. } => content.to_string().len(),
                    _ => 64,
                })
                .sum(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Immutable message value object.
///
/// Invariants, checked at construction:
/// - the role is one of user / assistant / tool;
/// - content is non-empty, unless the role is assistant and the metadata
///   carries `has_tool_calls: true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier.
    pub id: Uuid,
    /// Author role.
    pub role: Role,
    /// Content (text or typed blocks).
    pub content: MessageContent,
    /// Creation timestamp (UTC).
    pub created_at: DateTime<Utc>,
    /// Open metadata map (segment markers, tool-call ids, notification flags).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Creates a new message, validating the non-empty content rule.
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Result<Self> {
        Self::with_meta(role, content, Map::new())
    }

    /// Creates a new message with metadata.
    pub fn with_meta(
        role: Role,
        content: impl Into<MessageContent>,
        metadata: Map<String, Value>,
    ) -> Result<Self> {
        let content = content.into();

        if content.is_empty() {
            let tool_call_carrier = role == Role::Assistant
                && metadata
                    .get("has_tool_calls")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            if !tool_call_carrier {
                return Err(Error::InvalidInput(format!(
                    "message content cannot be empty for {role} messages"
                )));
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            role,
            content,
            created_at: Utc::now(),
            metadata,
        })
    }

    /// Returns a new message with the given metadata entries merged in.
    ///
    /// Id, role, content and `created_at` are carried over unchanged; this
    /// is the only sanctioned way to "mutate" a message.
    #[must_use]
    pub fn with_metadata(&self, updates: Map<String, Value>) -> Self {
        let mut metadata = self.metadata.clone();
        for (key, value) in updates {
            metadata.insert(key, value);
        }
        Self {
            id: self.id,
            role: self.role,
            content: self.content.clone(),
            created_at: self.created_at,
            metadata,
        }
    }

    /// Returns a new message with the content replaced.
    ///
    /// Only the collapse path uses this, to write the synopsis into a
    /// sentinel; ordinary messages never change content.
    #[must_use]
    pub fn with_content(&self, content: MessageContent) -> Self {
        Self {
            id: self.id,
            role: self.role,
            content,
            created_at: self.created_at,
            metadata: self.metadata.clone(),
        }
    }

    /// Reads a boolean metadata flag, defaulting to false.
    #[must_use]
    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Reads a string metadata field.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// True for system-notification messages, which are excluded from
    /// summarization input and timestamp prefixing.
    #[must_use]
    pub fn is_system_notification(&self) -> bool {
        self.meta_flag("system_notification")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_user_content() {
        let err = Message::new(Role::User, "   ").unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_allows_empty_assistant_with_tool_calls() {
        let mut meta = Map::new();
        meta.insert("has_tool_calls".into(), Value::Bool(true));
        let msg = Message::with_meta(Role::Assistant, "", meta).unwrap();
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn test_rejects_empty_assistant_without_tool_calls() {
        assert!(Message::new(Role::Assistant, "").is_err());
    }

    #[test]
    fn test_with_metadata_preserves_identity() {
        let msg = Message::new(Role::User, "hello").unwrap();
        let mut updates = Map::new();
        updates.insert("pinned".into(), Value::Bool(true));
        let updated = msg.with_metadata(updates);

        assert_eq!(updated.id, msg.id);
        assert_eq!(updated.created_at, msg.created_at);
        assert_eq!(updated.content, msg.content);
        assert!(updated.meta_flag("pinned"));
        assert!(!msg.meta_flag("pinned"));
    }

    #[test]
    fn test_serde_round_trip() {
        let msg = Message::new(Role::User, "round trip").unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_multimodal_round_trip() {
        let blocks = vec![
            ContentBlock::text("look at this"),
            ContentBlock::Image {
                source: serde_json::json!({"type": "base64", "data": "aGk="}),
            },
        ];
        let msg = Message::new(Role::User, MessageContent::Blocks(blocks)).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.content.text(), "look at this");
    }
}
