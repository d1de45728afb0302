//! Segment sentinel helpers.
//!
//! A segment is the range of messages between two sentinels. Sentinels are
//! ordinary [`Message`]s tagged `is_segment_boundary`; the metadata map is
//! the storage format and these helpers are the only readers of it.
//!
//! Invariants maintained here:
//! - sentinels are totally ordered by `created_at`, at most one `active`;
//! - a collapsed sentinel holds the synopsis as content, plus
//!   `display_title` and `complexity` in `{1, 2, 3}`.

use chrono::Utc;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::models::{Message, MessageContent, Role};
use crate::{Error, Result};

/// Sentinel lifecycle state. `Collapsed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Accepting messages.
    Active,
    /// Summarized and frozen.
    Collapsed,
}

/// True when the message is a segment boundary sentinel.
#[must_use]
pub fn is_sentinel(message: &Message) -> bool {
    message.meta_flag("is_segment_boundary")
}

/// Reads a sentinel's status; `None` for non-sentinels or unknown values.
#[must_use]
pub fn sentinel_status(message: &Message) -> Option<SegmentStatus> {
    if !is_sentinel(message) {
        return None;
    }
    match message.meta_str("status") {
        Some("active") => Some(SegmentStatus::Active),
        Some("collapsed") => Some(SegmentStatus::Collapsed),
        _ => None,
    }
}

/// Reads a sentinel's segment id.
#[must_use]
pub fn segment_id_of(message: &Message) -> Option<Uuid> {
    message
        .meta_str("segment_id")
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Creates a fresh active sentinel for a new segment.
pub fn new_sentinel() -> Result<Message> {
    let segment_id = Uuid::new_v4();
    let mut metadata = Map::new();
    metadata.insert("is_segment_boundary".into(), json!(true));
    metadata.insert("segment_id".into(), json!(segment_id.to_string()));
    metadata.insert("status".into(), json!("active"));
    Message::with_meta(Role::User, "New conversation segment", metadata)
}

/// Returns the active sentinel: the last chronological sentinel with
/// `status == active`.
#[must_use]
pub fn active_sentinel(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .filter(|m| sentinel_status(m) == Some(SegmentStatus::Active))
        .max_by_key(|m| m.created_at)
}

/// Transitions a sentinel in place to collapsed state.
///
/// The returned message keeps the sentinel's id and `created_at`; content
/// becomes the synopsis and the metadata is enriched with the collapse
/// outcome.
pub fn collapse_sentinel(
    sentinel: &Message,
    synopsis: &str,
    display_title: &str,
    complexity: u8,
    tools_used: &[String],
) -> Result<Message> {
    if sentinel_status(sentinel) != Some(SegmentStatus::Active) {
        return Err(Error::InvariantViolation(
            "only an active sentinel can collapse".to_string(),
        ));
    }
    if !(1..=3).contains(&complexity) {
        return Err(Error::InvariantViolation(format!(
            "complexity must be 1-3, got {complexity}"
        )));
    }

    let mut updates = Map::new();
    updates.insert("status".into(), json!("collapsed"));
    updates.insert("display_title".into(), json!(display_title));
    updates.insert("complexity".into(), json!(complexity));
    updates.insert("tools_used".into(), json!(tools_used));
    updates.insert("collapsed_at".into(), json!(Utc::now().to_rfc3339()));

    Ok(sentinel
        .with_content(MessageContent::Text(synopsis.to_string()))
        .with_metadata(updates))
}

/// Renders a collapsed sentinel for the LLM context.
#[must_use]
pub fn format_segment_for_display(sentinel: &Message) -> String {
    let title = sentinel.meta_str("display_title").unwrap_or("Earlier conversation");
    format!(
        "[Collapsed segment: {title}]\n{}",
        sentinel.content.text()
    )
}

/// Collects the non-sentinel messages belonging to a segment: everything
/// after its sentinel up to the next sentinel. System notifications are
/// excluded (they never feed summarization).
#[must_use]
pub fn segment_messages<'a>(messages: &'a [Message], segment_id: Uuid) -> Vec<&'a Message> {
    let Some(start) = messages
        .iter()
        .position(|m| segment_id_of(m) == Some(segment_id))
    else {
        return Vec::new();
    };

    messages[start + 1..]
        .iter()
        .take_while(|m| !is_sentinel(m))
        .filter(|m| !m.is_system_notification())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_msg(text: &str) -> Message {
        Message::new(Role::User, text).unwrap()
    }

    #[test]
    fn test_new_sentinel_is_active() {
        let sentinel = new_sentinel().unwrap();
        assert!(is_sentinel(&sentinel));
        assert_eq!(sentinel_status(&sentinel), Some(SegmentStatus::Active));
        assert!(segment_id_of(&sentinel).is_some());
    }

    #[test]
    fn test_collapse_enriches_metadata() {
        let sentinel = new_sentinel().unwrap();
        let collapsed = collapse_sentinel(
            &sentinel,
            "Talked about travel plans.",
            "Travel plans",
            2,
            &["maps_tool".to_string()],
        )
        .unwrap();

        assert_eq!(collapsed.id, sentinel.id);
        assert_eq!(collapsed.created_at, sentinel.created_at);
        assert_eq!(sentinel_status(&collapsed), Some(SegmentStatus::Collapsed));
        assert_eq!(collapsed.content.text(), "Talked about travel plans.");
        assert_eq!(collapsed.meta_str("display_title"), Some("Travel plans"));
        assert_eq!(
            collapsed.metadata.get("complexity").and_then(Value::as_u64),
            Some(2)
        );
    }

    #[test]
    fn test_collapse_is_terminal() {
        let sentinel = new_sentinel().unwrap();
        let collapsed = collapse_sentinel(&sentinel, "s", "t", 1, &[]).unwrap();
        assert!(collapse_sentinel(&collapsed, "again", "t2", 1, &[]).is_err());
    }

    #[test]
    fn test_collapse_rejects_bad_complexity() {
        let sentinel = new_sentinel().unwrap();
        assert!(collapse_sentinel(&sentinel, "s", "t", 0, &[]).is_err());
        assert!(collapse_sentinel(&sentinel, "s", "t", 4, &[]).is_err());
    }

    #[test]
    fn test_active_sentinel_picks_latest_active() {
        let old = new_sentinel().unwrap();
        let collapsed = collapse_sentinel(&old, "s", "t", 1, &[]).unwrap();
        let newer = new_sentinel().unwrap();
        let messages = vec![collapsed, user_msg("hi"), newer.clone()];

        let active = active_sentinel(&messages).unwrap();
        assert_eq!(active.id, newer.id);
    }

    #[test]
    fn test_segment_messages_stops_at_next_sentinel() {
        let first = new_sentinel().unwrap();
        let first_id = segment_id_of(&first).unwrap();
        let second = new_sentinel().unwrap();

        let mut notification_meta = Map::new();
        notification_meta.insert("system_notification".into(), json!(true));
        let notification =
            Message::with_meta(Role::User, "session boundary", notification_meta).unwrap();

        let messages = vec![
            first,
            user_msg("one"),
            notification,
            user_msg("two"),
            second,
            user_msg("other segment"),
        ];

        let collected = segment_messages(&messages, first_id);
        let texts: Vec<String> = collected.iter().map(|m| m.content.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_segment_messages_unknown_segment_is_empty() {
        let messages = vec![user_msg("hi")];
        assert!(segment_messages(&messages, Uuid::new_v4()).is_empty());
    }
}
