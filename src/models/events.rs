//! Domain events published on the continuum event bus.

use uuid::Uuid;

/// Events emitted by the continuum engine and its collaborators.
///
/// Handlers are dispatched synchronously in registration order; see
/// [`crate::events::EventBus`].
#[derive(Debug, Clone)]
pub enum ContinuumEvent {
    /// An active segment exceeded its inactivity threshold.
    SegmentTimeout {
        /// The continuum that owns the segment.
        continuum_id: Uuid,
        /// The owning user.
        user_id: Uuid,
        /// The sentinel's segment id.
        segment_id: Uuid,
        /// How long the segment has been idle.
        inactive_duration_minutes: i64,
        /// The user's local hour when the timeout fired (threshold input).
        local_hour: u8,
    },
    /// A segment finished collapsing.
    SegmentCollapsed {
        /// The continuum that owns the segment.
        continuum_id: Uuid,
        /// The owning user.
        user_id: Uuid,
        /// The collapsed segment id.
        segment_id: Uuid,
        /// The generated synopsis.
        summary: String,
        /// Telegraphic title for display.
        display_title: String,
        /// Complexity score in `{1, 2, 3}`.
        complexity: u8,
        /// Tools used during the segment.
        tools_used: Vec<String>,
    },
    /// The manifest of collapsed segments changed.
    ManifestUpdated {
        /// The continuum whose manifest changed.
        continuum_id: Uuid,
    },
    /// Working-memory categories changed for a continuum.
    WorkingMemoryUpdated {
        /// The continuum whose working memory changed.
        continuum_id: Uuid,
        /// Which categories were touched.
        updated_categories: Vec<String>,
    },
    /// A UI trinket should refresh.
    UpdateTrinket {
        /// Which trinket to refresh.
        target_trinket: String,
        /// Free-form refresh context.
        context: String,
    },
}

impl ContinuumEvent {
    /// Returns the event type name used as the subscription key.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SegmentTimeout { .. } => "SegmentTimeoutEvent",
            Self::SegmentCollapsed { .. } => "SegmentCollapsedEvent",
            Self::ManifestUpdated { .. } => "ManifestUpdatedEvent",
            Self::WorkingMemoryUpdated { .. } => "WorkingMemoryUpdatedEvent",
            Self::UpdateTrinket { .. } => "UpdateTrinketEvent",
        }
    }

    /// Returns the user id for user-scoped events.
    #[must_use]
    pub const fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::SegmentTimeout { user_id, .. } | Self::SegmentCollapsed { user_id, .. } => {
                Some(*user_id)
            }
            _ => None,
        }
    }
}
