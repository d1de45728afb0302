//! Bookkeeping records for asynchronous LLM batch jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a batch job.
///
/// Transitions are idempotent: replaying a terminal state is a no-op, and
/// the poller may observe the same provider state any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Accepted by the provider, not yet running.
    Submitted,
    /// Running at the provider.
    Processing,
    /// All items finished.
    Completed,
    /// Provider-side failure.
    Failed,
    /// Provider expired the batch before completion.
    Expired,
    /// Cancelled by us.
    Cancelled,
}

impl BatchStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Applies a provider-observed status, ignoring regressions.
    ///
    /// Terminal states never change; `Processing` never falls back to
    /// `Submitted`. Returns the effective status.
    #[must_use]
    pub fn advance_to(self, observed: Self) -> Self {
        if self.is_terminal() {
            return self;
        }
        if self == Self::Processing && observed == Self::Submitted {
            return self;
        }
        observed
    }
}

/// Kind of post-processing work a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// Memory extraction from a collapsed segment.
    Extraction,
    /// Pairwise relationship classification.
    RelationshipClassification,
    /// Cluster consolidation.
    Consolidation,
    /// Review of consolidation output.
    ConsolidationReview,
}

/// An extraction batch submitted for a collapsed segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionBatch {
    /// Our id.
    pub id: Uuid,
    /// Provider batch id, once accepted.
    pub provider_batch_id: Option<String>,
    /// Owning user.
    pub user_id: Uuid,
    /// The collapsed segment being processed.
    pub segment_id: Uuid,
    /// Number of chunks submitted.
    pub chunk_count: usize,
    /// Current status.
    pub status: BatchStatus,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Completion time for terminal states.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last provider error, for failed batches.
    pub last_error: Option<String>,
}

/// A post-processing batch (classification, consolidation, review).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessingBatch {
    /// Our id.
    pub id: Uuid,
    /// Provider batch id, once accepted.
    pub provider_batch_id: Option<String>,
    /// Owning user.
    pub user_id: Uuid,
    /// What this batch does.
    pub kind: BatchKind,
    /// Current status.
    pub status: BatchStatus,
    /// Items submitted.
    pub items_submitted: usize,
    /// Items finished successfully.
    pub items_completed: usize,
    /// Items that failed.
    pub items_failed: usize,
    /// Links persisted from this batch.
    pub links_created: usize,
    /// Conflict links flagged for review.
    pub conflicts_flagged: usize,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Completion time for terminal states.
    pub completed_at: Option<DateTime<Utc>>,
}
