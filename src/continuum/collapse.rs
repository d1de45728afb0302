//! Segment collapse orchestration.
//!
//! Subscribed to `SegmentTimeoutEvent`. On each event: load the sentinel and
//! its messages, summarize, embed, persist the mutated sentinel atomically,
//! publish `SegmentCollapsedEvent` + `ManifestUpdatedEvent`, and submit the
//! segment downstream for memory extraction.
//!
//! Failure semantics: a summary or embedding failure aborts the collapse.
//! No partial state — the sentinel stays active and no events are
//! published.

use std::sync::Arc;
use uuid::Uuid;

use super::segments::{self, SegmentStatus};
use super::store::ContinuumStore;
use super::summary::Summarizer;
use crate::events::EventBus;
use crate::llm::Embedder;
use crate::models::{ContinuumEvent, Message};
use crate::observability::{UserContext, enter_user_context};
use crate::{EMBEDDING_DIM, Error, Result};

/// Downstream sink for collapsed segments (the extraction orchestrator).
pub trait ExtractionSink: Send + Sync {
    /// Submits a collapsed segment's messages for memory extraction.
    fn submit_segment_extraction(
        &self,
        user_id: Uuid,
        segment_id: Uuid,
        messages: &[Message],
    ) -> Result<()>;
}

/// Handles segment timeout events by collapsing the segment.
pub struct SegmentCollapseHandler {
    store: Arc<dyn ContinuumStore>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    extraction: Arc<dyn ExtractionSink>,
}

impl SegmentCollapseHandler {
    /// Creates a collapse handler.
    #[must_use]
    pub fn new(
        store: Arc<dyn ContinuumStore>,
        summarizer: Arc<dyn Summarizer>,
        embedder: Arc<dyn Embedder>,
        extraction: Arc<dyn ExtractionSink>,
    ) -> Self {
        Self {
            store,
            summarizer,
            embedder,
            extraction,
        }
    }

    /// Subscribes the handler to `SegmentTimeoutEvent` on the bus.
    ///
    /// The bus reference passed here is also used to publish the collapse
    /// outcome events.
    pub fn subscribe(self: &Arc<Self>, bus: &Arc<EventBus>) {
        let handler = Arc::clone(self);
        let publish_bus = Arc::clone(bus);
        bus.subscribe("SegmentTimeoutEvent", move |event| {
            if let ContinuumEvent::SegmentTimeout {
                continuum_id,
                user_id,
                segment_id,
                ..
            } = event
            {
                handler.collapse_segment(&publish_bus, *continuum_id, *user_id, *segment_id)?;
            }
            Ok(())
        });
    }

    /// Collapses one segment. Also the entry point for explicit `/collapse`.
    ///
    /// Returns `Ok(false)` when there was nothing to do (already collapsed,
    /// missing sentinel, or empty segment); `Ok(true)` when the segment
    /// collapsed.
    pub fn collapse_segment(
        &self,
        bus: &EventBus,
        continuum_id: Uuid,
        user_id: Uuid,
        segment_id: Uuid,
    ) -> Result<bool> {
        let _ctx = enter_user_context(UserContext::new(user_id).with_continuum(continuum_id));

        let Some(sentinel) = self.store.load_sentinel(continuum_id, segment_id)? else {
            tracing::warn!("collapse requested for unknown segment {segment_id}");
            return Ok(false);
        };
        if segments::sentinel_status(&sentinel) != Some(SegmentStatus::Active) {
            tracing::debug!("segment {segment_id} already collapsed, skipping");
            return Ok(false);
        }

        // Notifications never feed summarization; the store keeps them out
        // of the returned list as well, this is belt-and-braces.
        let messages: Vec<Message> = self
            .store
            .load_segment_messages(continuum_id, segment_id)?
            .into_iter()
            .filter(|m| !m.is_system_notification())
            .collect();

        if messages.is_empty() {
            tracing::error!(
                "segment {segment_id} has no messages, aborting collapse (non-empty invariant)"
            );
            return Ok(false);
        }

        let tools_used = Self::tools_used(&sentinel);
        let summary = self.summarizer.generate_summary(&messages, &tools_used)?;

        let embedding = self.embedder.embed(&summary.synopsis)?;
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::InvariantViolation(format!(
                "segment embedding has {} components, expected {EMBEDDING_DIM}",
                embedding.len()
            )));
        }

        let collapsed = segments::collapse_sentinel(
            &sentinel,
            &summary.synopsis,
            &summary.display_title,
            summary.complexity,
            &tools_used,
        )?;
        self.store
            .persist_collapsed_sentinel(continuum_id, &collapsed, &embedding)?;

        metrics::counter!("mira_segments_collapsed_total").increment(1);
        tracing::info!(
            "collapsed segment {segment_id} ({} messages, complexity {})",
            messages.len(),
            summary.complexity
        );

        bus.publish(&ContinuumEvent::SegmentCollapsed {
            continuum_id,
            user_id,
            segment_id,
            summary: summary.synopsis.clone(),
            display_title: summary.display_title.clone(),
            complexity: summary.complexity,
            tools_used: tools_used.clone(),
        });
        bus.publish(&ContinuumEvent::ManifestUpdated { continuum_id });

        self.extraction
            .submit_segment_extraction(user_id, segment_id, &messages)?;

        Ok(true)
    }

    fn tools_used(sentinel: &Message) -> Vec<String> {
        sentinel
            .metadata
            .get("tools_used")
            .and_then(serde_json::Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
