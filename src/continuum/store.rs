//! Persistence seam for the continuum engine.
//!
//! The engine mutates in memory and publishes events; this trait is how the
//! collapse handler and the timeout scanner reach durable state. The
//! Postgres-backed implementation lives in [`crate::storage`]; tests use
//! in-memory fakes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::models::Message;

/// A continuum with an active segment, as seen by the timeout scanner.
#[derive(Debug, Clone)]
pub struct ActiveSegment {
    /// The continuum id.
    pub continuum_id: Uuid,
    /// The owning user.
    pub user_id: Uuid,
    /// The active sentinel's segment id.
    pub segment_id: Uuid,
    /// The user's IANA timezone preference, when known.
    pub timezone: Option<String>,
}

/// Durable storage operations the continuum engine depends on.
pub trait ContinuumStore: Send + Sync {
    /// Appends a message to a continuum.
    fn append_message(&self, continuum_id: Uuid, message: &Message) -> Result<()>;

    /// Lists continuums that currently have an active segment.
    fn active_segments(&self) -> Result<Vec<ActiveSegment>>;

    /// Loads the sentinel message for a segment, if it exists.
    fn load_sentinel(&self, continuum_id: Uuid, segment_id: Uuid) -> Result<Option<Message>>;

    /// Loads the non-sentinel messages of a segment in chronological order,
    /// up to the next sentinel.
    fn load_segment_messages(&self, continuum_id: Uuid, segment_id: Uuid)
    -> Result<Vec<Message>>;

    /// Timestamp of the most recent user message in a continuum.
    fn last_user_message_time(&self, continuum_id: Uuid) -> Result<Option<DateTime<Utc>>>;

    /// Persists a collapsed sentinel and its segment embedding atomically.
    ///
    /// Either both the mutated sentinel row and the `segment_embedding`
    /// column land, or neither does.
    fn persist_collapsed_sentinel(
        &self,
        continuum_id: Uuid,
        sentinel: &Message,
        embedding: &[f32],
    ) -> Result<()>;
}
