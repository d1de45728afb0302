//! Segment summary generation.
//!
//! Produces `(synopsis, display_title, complexity)` triples from segment
//! messages. When the provider reports a context overflow, falls back to
//! hierarchical chunked summarization: split into ~50k-token chunks,
//! summarize each, synthesize the chunk synopses. A summarizer that refuses
//! to emit a display title produces a tombstone rather than retrying
//! forever.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ContinuumConfig;
use crate::llm::{ChatMessage, ChatRequest, GenerateParams, LlmProvider};
use crate::models::{ContentBlock, Message, MessageContent};
use crate::{Error, Result};

/// Target ~50k tokens per chunk, estimated at 4 chars/token.
const CHUNK_TARGET_CHARS: usize = 200_000;

/// Tombstone used when the summarizer refuses to follow the tag format.
pub const TOMBSTONE_SYNOPSIS: &str = "[Segment content not summarized]";
/// Tombstone title for refused summaries.
pub const TOMBSTONE_TITLE: &str = "Archived segment";
/// Tombstone title for oversized segments whose chunked pass also failed.
pub const OVERSIZE_TOMBSTONE_TITLE: &str = "Large segment archived";

static DISPLAY_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"(?s)<mira:display_title>\s*(.*?)\s*</mira:display_title>").unwrap();
    re
});
static COMPLEXITY_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r"<mira:complexity>\s*([0-9]+)\s*</mira:complexity>").unwrap();
    re
});

const SEGMENT_SYSTEM_PROMPT: &str = "You are MIRA's archivist. It is {current_time}. \
Summarize the conversation segment below into a rich synopsis that preserves decisions, \
facts, open threads and emotional tone. After the synopsis, emit exactly one \
<mira:display_title>telegraphic title</mira:display_title> tag and one \
<mira:complexity>N</mira:complexity> tag where N is 1 (simple), 2 (moderate) or 3 (complex).";

const SEGMENT_USER_TEMPLATE: &str = "Tools used in this segment: {tools_used}\n\n\
Conversation:\n{conversation_text}";

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are MIRA's archivist. The segment below was too \
large for one pass and was summarized in parts. Merge the part synopses into one synopsis, \
then emit <mira:display_title> and <mira:complexity> tags as usual.";

const SYNTHESIS_USER_TEMPLATE: &str = "Tools used: {tools_used}\n\nPart synopses:\n{chunk_summaries}";

/// A generated segment summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    /// The synopsis text that becomes the sentinel content.
    pub synopsis: String,
    /// Telegraphic display title.
    pub display_title: String,
    /// Complexity score in `{1, 2, 3}`.
    pub complexity: u8,
}

/// Capability seam for summary generation, mockable in tests.
pub trait Summarizer: Send + Sync {
    /// Generates a summary for a segment's messages.
    fn generate_summary(
        &self,
        messages: &[Message],
        tools_used: &[String],
    ) -> Result<SegmentSummary>;
}

/// LLM-backed summary generator.
pub struct SummaryGenerator {
    provider: LlmProvider,
    params: GenerateParams,
    config: ContinuumConfig,
}

impl SummaryGenerator {
    /// Creates a generator routed per the summary role config.
    #[must_use]
    pub fn new(provider: LlmProvider, params: GenerateParams, config: ContinuumConfig) -> Self {
        Self {
            provider,
            params,
            config,
        }
    }

    /// Formats messages into readable text, stripping binary/media content.
    ///
    /// System notifications are skipped; multimodal blocks flatten to text
    /// with media counted, tool calls named, and tool results truncated.
    fn format_messages(messages: &[Message]) -> String {
        let mut lines = Vec::with_capacity(messages.len());

        for msg in messages {
            if msg.is_system_notification() {
                continue;
            }

            let role_label = msg.role.to_string().to_uppercase();
            let content = match &msg.content {
                MessageContent::Text(text) => text.clone(),
                MessageContent::Blocks(blocks) => Self::flatten_blocks(blocks),
            };
            lines.push(format!("{role_label}: {content}"));
        }

        lines.join("\n\n")
    }

    fn flatten_blocks(blocks: &[ContentBlock]) -> String {
        let mut parts = Vec::new();
        let mut media_count = 0usize;

        for block in blocks {
            match block {
                ContentBlock::Text { text, .. } => parts.push(text.clone()),
                ContentBlock::Image { .. } | ContentBlock::ContainerUpload { .. } => {
                    media_count += 1;
                }
                ContentBlock::ToolUse { name, .. } => {
                    parts.push(format!("[Used tool: {name}]"));
                }
                ContentBlock::ToolResult { content, .. } => {
                    let result = match content {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let result = if result.chars().count() > 200 {
                        let truncated: String = result.chars().take(200).collect();
                        format!("{truncated}...")
                    } else {
                        result
                    };
                    parts.push(format!("[Tool result: {result}]"));
                }
            }
        }

        let mut combined = parts.join(" ");
        if media_count > 0 {
            if combined.is_empty() {
                combined = format!("[{media_count} image(s) shared, no text]");
            } else {
                combined = format!("[{media_count} image(s) shared] {combined}");
            }
        }
        combined
    }

    /// Extracts synopsis, display title and complexity from the raw output.
    ///
    /// A missing display title means the model refused or failed to follow
    /// instructions; the segment autocollapses as a tombstone instead of
    /// retrying. A missing or invalid complexity defaults to 2.
    fn extract_components(output: &str) -> SegmentSummary {
        let display_title = DISPLAY_TITLE_RE
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|title| !title.is_empty());

        let Some(display_title) = display_title else {
            let preview: String = output.chars().take(200).collect();
            tracing::warn!(
                "summarizer did not emit <mira:display_title>, autocollapsing with tombstone; \
                 output (first 200 chars): {preview}"
            );
            return SegmentSummary {
                synopsis: TOMBSTONE_SYNOPSIS.to_string(),
                display_title: TOMBSTONE_TITLE.to_string(),
                complexity: 1,
            };
        };

        let complexity = COMPLEXITY_RE
            .captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .filter(|c| (1..=3).contains(c))
            .unwrap_or_else(|| {
                tracing::warn!("summarizer gave no valid complexity score, defaulting to 2");
                2
            });

        let synopsis = COMPLEXITY_RE
            .replace_all(&DISPLAY_TITLE_RE.replace_all(output, ""), "")
            .trim()
            .to_string();

        SegmentSummary {
            synopsis,
            display_title,
            complexity,
        }
    }

    fn segment_time(messages: &[Message]) -> String {
        messages.first().map_or_else(
            || chrono::Utc::now().format("%B %d, %Y").to_string(),
            |msg| msg.created_at.format("%B %d, %Y").to_string(),
        )
    }

    fn call_llm(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            messages: vec![ChatMessage::text("user", user)],
            system: Some(serde_json::Value::String(system.to_string())),
            temperature: Some(self.config.summary_temperature),
            max_tokens: Some(self.config.summary_max_tokens),
            thinking_enabled: false,
            ..ChatRequest::default()
        };
        let response = self.provider.generate_response(&request, &self.params)?;
        Ok(LlmProvider::extract_text_content(&response))
    }

    fn summarize_once(
        &self,
        messages: &[Message],
        tools_used: &[String],
    ) -> Result<SegmentSummary> {
        let conversation = Self::format_messages(messages);
        let tools_text = if tools_used.is_empty() {
            "None".to_string()
        } else {
            tools_used.join(", ")
        };
        let system =
            SEGMENT_SYSTEM_PROMPT.replace("{current_time}", &Self::segment_time(messages));
        let user = SEGMENT_USER_TEMPLATE
            .replace("{tools_used}", &tools_text)
            .replace("{conversation_text}", &conversation);

        let output = self.call_llm(&system, &user)?;
        Ok(Self::extract_components(&output))
    }

    /// Splits messages into chunks of roughly [`CHUNK_TARGET_CHARS`] each.
    fn chunk_messages(messages: &[Message]) -> Vec<Vec<Message>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut current_chars = 0usize;

        for msg in messages {
            let msg_chars = msg.content.char_len();
            if current_chars + msg_chars > CHUNK_TARGET_CHARS && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_chars = 0;
            }
            current.push(msg.clone());
            current_chars += msg_chars;
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Hierarchical summarization for oversized segments.
    fn generate_chunked(
        &self,
        messages: &[Message],
        tools_used: &[String],
    ) -> Result<SegmentSummary> {
        let chunks = Self::chunk_messages(messages);
        tracing::info!(
            "segment exceeded context limit, split into {} chunks",
            chunks.len()
        );

        let mut chunk_summaries = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let summary = self.summarize_once(chunk, tools_used)?;
            // Per-chunk titles and complexities are discarded; only the
            // synopses feed synthesis.
            chunk_summaries.push(summary.synopsis);
        }

        let combined = chunk_summaries
            .iter()
            .enumerate()
            .map(|(i, synopsis)| format!("**Part {}:**\n{synopsis}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");
        let tools_text = if tools_used.is_empty() {
            "None".to_string()
        } else {
            tools_used.join(", ")
        };
        let user = SYNTHESIS_USER_TEMPLATE
            .replace("{tools_used}", &tools_text)
            .replace("{chunk_summaries}", &combined);

        let output = self.call_llm(SYNTHESIS_SYSTEM_PROMPT, &user)?;
        Ok(Self::extract_components(&output))
    }
}

impl Summarizer for SummaryGenerator {
    fn generate_summary(
        &self,
        messages: &[Message],
        tools_used: &[String],
    ) -> Result<SegmentSummary> {
        match self.summarize_once(messages, tools_used) {
            Ok(summary) => Ok(summary),
            Err(Error::ContextOverflow) => {
                match self.generate_chunked(messages, tools_used) {
                    Ok(summary) => Ok(summary),
                    Err(err) => {
                        tracing::error!("chunked summarization also failed: {err}");
                        Ok(SegmentSummary {
                            synopsis: TOMBSTONE_SYNOPSIS.to_string(),
                            display_title: OVERSIZE_TOMBSTONE_TITLE.to_string(),
                            complexity: 1,
                        })
                    }
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn test_extract_components_full_output() {
        let output = "We discussed a trip to Lisbon and booked flights.\n\n\
            <mira:display_title>Lisbon trip booking</mira:display_title>\n\
            <mira:complexity>2</mira:complexity>";
        let summary = SummaryGenerator::extract_components(output);
        assert_eq!(summary.display_title, "Lisbon trip booking");
        assert_eq!(summary.complexity, 2);
        assert_eq!(summary.synopsis, "We discussed a trip to Lisbon and booked flights.");
    }

    #[test]
    fn test_missing_title_yields_tombstone() {
        let summary = SummaryGenerator::extract_components("Just some text, no tags.");
        assert_eq!(summary.display_title, TOMBSTONE_TITLE);
        assert_eq!(summary.synopsis, TOMBSTONE_SYNOPSIS);
        assert_eq!(summary.complexity, 1);
    }

    #[test]
    fn test_invalid_complexity_defaults_to_moderate() {
        let output = "Synopsis here.\n<mira:display_title>Title</mira:display_title>\n\
            <mira:complexity>7</mira:complexity>";
        let summary = SummaryGenerator::extract_components(output);
        assert_eq!(summary.complexity, 2);
    }

    #[test]
    fn test_format_messages_skips_notifications() {
        let mut meta = serde_json::Map::new();
        meta.insert("system_notification".into(), serde_json::json!(true));
        let messages = vec![
            Message::new(Role::User, "real message").unwrap(),
            Message::with_meta(Role::User, "session boundary", meta).unwrap(),
        ];
        let formatted = SummaryGenerator::format_messages(&messages);
        assert!(formatted.contains("USER: real message"));
        assert!(!formatted.contains("session boundary"));
    }

    #[test]
    fn test_flatten_blocks_counts_media_and_truncates_results() {
        let long_result = "x".repeat(300);
        let blocks = vec![
            ContentBlock::Image {
                source: serde_json::json!({}),
            },
            ContentBlock::text("caption"),
            ContentBlock::ToolUse {
                id: "1".into(),
                name: "maps_tool".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::ToolResult {
                tool_use_id: "1".into(),
                content: serde_json::Value::String(long_result),
            },
        ];
        let flattened = SummaryGenerator::flatten_blocks(&blocks);
        assert!(flattened.starts_with("[1 image(s) shared]"));
        assert!(flattened.contains("[Used tool: maps_tool]"));
        assert!(flattened.contains("..."));
        assert!(flattened.len() < 350);
    }

    #[test]
    fn test_chunk_messages_respects_target() {
        let big = "y".repeat(CHUNK_TARGET_CHARS / 2 + 1);
        let messages: Vec<Message> = (0..4)
            .map(|_| Message::new(Role::User, big.as_str()).unwrap())
            .collect();
        let chunks = SummaryGenerator::chunk_messages(&messages);
        assert_eq!(chunks.len(), 4);

        let small: Vec<Message> = (0..4)
            .map(|_| Message::new(Role::User, "short").unwrap())
            .collect();
        assert_eq!(SummaryGenerator::chunk_messages(&small).len(), 1);
    }
}
