//! LT-Memory types: memories, entities, links and pipeline records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Message;

/// A single long-term memory fact.
///
/// `similarity_score` is transient: populated by search, never persisted.
/// `importance_score == 0.0` means cold storage and is excluded from most
/// queries via the importance floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// The fact text.
    pub text: String,
    /// 768-d embedding, absent until vectorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Importance in `[0, 1]`; 0.0 is cold storage.
    pub importance_score: f32,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Expiry for time-bounded facts.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the described event occurs, for scheduled facts.
    pub happens_at: Option<DateTime<Utc>>,
    /// Number of times search has returned this memory.
    pub access_count: i64,
    /// Timestamp of the most recent access.
    pub last_accessed: Option<DateTime<Utc>>,
    /// Links pointing at this memory.
    #[serde(default)]
    pub inbound_links: Vec<LinkRef>,
    /// Links from this memory to others.
    #[serde(default)]
    pub outbound_links: Vec<LinkRef>,
    /// Entities this memory mentions.
    #[serde(default)]
    pub entity_links: Vec<EntityLink>,
    /// Archived memories are kept but excluded from search.
    pub is_archived: bool,
    /// When the memory was archived.
    pub archived_at: Option<DateTime<Utc>>,
    /// Whether refinement has rewritten this memory.
    pub is_refined: bool,
    /// Most recent refinement time, for cooldown.
    pub last_refined_at: Option<DateTime<Utc>>,
    /// Times the refinement model declined to rewrite this memory.
    pub refinement_rejection_count: i32,
    /// Distinct days on which this memory was accessed.
    pub active_days_count: i32,
    /// Most recent day counted in `active_days_count`.
    pub last_active_day: Option<DateTime<Utc>>,
    /// Transient search score; never persisted.
    #[serde(skip)]
    pub similarity_score: Option<f32>,
    /// Transient raw RRF score kept alongside for debugging.
    #[serde(skip)]
    pub raw_rrf_score: Option<f32>,
}

impl Memory {
    /// Creates a fresh memory with default counters.
    #[must_use]
    pub fn new(user_id: Uuid, text: impl Into<String>, importance: f32, confidence: f32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            text: text.into(),
            embedding: None,
            importance_score: importance.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            created_at: now,
            updated_at: now,
            expires_at: None,
            happens_at: None,
            access_count: 0,
            last_accessed: None,
            inbound_links: Vec::new(),
            outbound_links: Vec::new(),
            entity_links: Vec::new(),
            is_archived: false,
            archived_at: None,
            is_refined: false,
            last_refined_at: None,
            refinement_rejection_count: 0,
            active_days_count: 0,
            last_active_day: None,
            similarity_score: None,
            raw_rrf_score: None,
        }
    }

    /// Counts inbound links that are semantic (not entity co-mention edges).
    #[must_use]
    pub fn semantic_inbound_count(&self) -> usize {
        self.inbound_links
            .iter()
            .filter(|link| !link.link_type.starts_with("shares_entity:"))
            .count()
    }
}

/// A link entry as materialized on a memory's JSONB arrays.
///
/// Every link is recorded on both endpoints (bidirectional
/// materialization); traversal deletes dangling halves on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRef {
    /// The other endpoint.
    pub uuid: Uuid,
    /// Relationship type (storage set, canonicalized at persistence).
    #[serde(rename = "type")]
    pub link_type: String,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f32,
    /// Classifier explanation.
    #[serde(default)]
    pub reasoning: String,
}

/// An entity reference on a memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    /// Entity id.
    pub uuid: Uuid,
}

/// A per-user named thing referenced by memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Canonical name.
    pub name: String,
    /// NER type (PERSON, ORG, PRODUCT, GPE, EVENT, ...).
    pub entity_type: String,
    /// Optional 300-d name embedding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Number of memories linking to this entity.
    pub link_count: i64,
    /// Most recent link time.
    pub last_linked_at: Option<DateTime<Utc>>,
    /// Archived entities are excluded from priming.
    pub is_archived: bool,
}

/// Relationship types the classifier may emit.
///
/// Storage reduces the extended set to `{related, supports, conflicts,
/// supersedes}` via [`LinkType::canonical`]. `Null` means "no link" and is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// General association.
    Related,
    /// Target reinforces source.
    Supports,
    /// Mutually exclusive or contradictory information.
    Conflicts,
    /// Source explicitly updates or replaces target.
    Supersedes,
    /// Source directly leads to or triggers target.
    Causes,
    /// Source is a specific example of target's general pattern.
    InstanceOf,
    /// Source provides evidence disproving target.
    InvalidatedBy,
    /// Source explains the reasoning behind target.
    MotivatedBy,
    /// No meaningful relationship; do not persist.
    Null,
}

impl LinkType {
    /// Parses a classifier string into a link type.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "related" => Some(Self::Related),
            "supports" => Some(Self::Supports),
            "conflicts" => Some(Self::Conflicts),
            "supersedes" => Some(Self::Supersedes),
            "causes" => Some(Self::Causes),
            "instance_of" => Some(Self::InstanceOf),
            "invalidated_by" => Some(Self::InvalidatedBy),
            "motivated_by" => Some(Self::MotivatedBy),
            "null" => Some(Self::Null),
            _ => None,
        }
    }

    /// Reduces the extended classifier set to the storage set.
    ///
    /// `conflicts` and `supersedes` carry real retrieval semantics and are
    /// kept; the finer-grained causal types collapse to `related` /
    /// `supports`.
    #[must_use]
    pub const fn canonical(self) -> Self {
        match self {
            Self::Conflicts => Self::Conflicts,
            Self::Supersedes | Self::InvalidatedBy => Self::Supersedes,
            Self::Supports | Self::MotivatedBy => Self::Supports,
            Self::Related | Self::Causes | Self::InstanceOf => Self::Related,
            Self::Null => Self::Null,
        }
    }

    /// Storage string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Supports => "supports",
            Self::Conflicts => "conflicts",
            Self::Supersedes => "supersedes",
            Self::Causes => "causes",
            Self::InstanceOf => "instance_of",
            Self::InvalidatedBy => "invalidated_by",
            Self::MotivatedBy => "motivated_by",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed, typed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    /// Source memory.
    pub source_id: Uuid,
    /// Target memory.
    pub target_id: Uuid,
    /// Relationship type.
    pub link_type: LinkType,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f32,
    /// Classifier explanation.
    pub reasoning: String,
    /// Classification time.
    pub created_at: DateTime<Utc>,
}

/// Candidate memory emitted by the extraction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMemory {
    /// The fact text.
    pub text: String,
    /// Proposed importance.
    pub importance_score: f32,
    /// Extraction confidence.
    pub confidence: f32,
    /// Expiry for time-bounded facts.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the described event occurs.
    pub happens_at: Option<DateTime<Utc>>,
    /// Ids of existing memories this relates to.
    #[serde(default)]
    pub related_memory_ids: Vec<String>,
    /// Ids of memories this replaces (refinement, consolidation).
    #[serde(default)]
    pub consolidates_memory_ids: Vec<String>,
    /// Proposed relationship type toward `related_memory_ids`.
    #[serde(default)]
    pub proposed_relationship: Option<String>,
}

/// An ordered, non-empty slice of messages fed to extraction.
#[derive(Debug, Clone)]
pub struct ProcessingChunk {
    /// Messages in chronological order.
    pub messages: Vec<Message>,
    /// Timestamp of the first message.
    pub temporal_start: DateTime<Utc>,
    /// Timestamp of the last message.
    pub temporal_end: DateTime<Utc>,
    /// Position of this chunk in the submission.
    pub chunk_index: usize,
    /// Snapshot of memory context available at chunk time.
    pub memory_context: String,
}

/// An oversized memory selected for trimming or splitting.
#[derive(Debug, Clone)]
pub struct RefinementCandidate {
    /// The memory to refine.
    pub memory_id: Uuid,
    /// Why it was selected (currently always "verbose").
    pub reason: String,
    /// The current text.
    pub current_text: String,
    /// Character count, used for ordering.
    pub char_count: usize,
}

/// A cluster of near-duplicate memories around a hub.
#[derive(Debug, Clone)]
pub struct ConsolidationCluster {
    /// Stable id derived from the hub memory.
    pub cluster_id: String,
    /// Member memory ids, hub first.
    pub memory_ids: Vec<Uuid>,
    /// Member texts, aligned with `memory_ids`.
    pub memory_texts: Vec<String>,
    /// Similarity of each non-hub member to the hub.
    pub similarity_scores: Vec<f32>,
    /// Mean member similarity.
    pub avg_similarity: f32,
    /// Confidence that consolidation would help (avg similarity).
    pub consolidation_confidence: f32,
}

/// Search intent, steering the BM25/vector fusion weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchIntent {
    /// User trying to remember something specific.
    Recall,
    /// User exploring concepts.
    Explore,
    /// User used exact phrases.
    Exact,
    /// Balanced default for ambient understanding.
    #[default]
    General,
}

impl SearchIntent {
    /// Returns `(bm25_weight, vector_weight)` for RRF fusion.
    #[must_use]
    pub const fn fusion_weights(self) -> (f32, f32) {
        match self {
            Self::Recall => (0.6, 0.4),
            Self::Explore => (0.3, 0.7),
            Self::Exact => (0.8, 0.2),
            Self::General => (0.4, 0.6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_canonicalization() {
        assert_eq!(LinkType::Causes.canonical(), LinkType::Related);
        assert_eq!(LinkType::InstanceOf.canonical(), LinkType::Related);
        assert_eq!(LinkType::InvalidatedBy.canonical(), LinkType::Supersedes);
        assert_eq!(LinkType::MotivatedBy.canonical(), LinkType::Supports);
        assert_eq!(LinkType::Conflicts.canonical(), LinkType::Conflicts);
        assert_eq!(LinkType::Null.canonical(), LinkType::Null);
    }

    #[test]
    fn test_link_type_parse_round_trip() {
        for s in [
            "related",
            "supports",
            "conflicts",
            "supersedes",
            "causes",
            "instance_of",
            "invalidated_by",
            "motivated_by",
            "null",
        ] {
            let parsed = LinkType::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!(LinkType::parse("friends_with").is_none());
    }

    #[test]
    fn test_fusion_weights() {
        assert_eq!(SearchIntent::Exact.fusion_weights(), (0.8, 0.2));
        assert_eq!(SearchIntent::General.fusion_weights(), (0.4, 0.6));
    }

    #[test]
    fn test_semantic_inbound_count_skips_entity_edges() {
        let user = Uuid::new_v4();
        let mut memory = Memory::new(user, "fact", 0.5, 0.9);
        memory.inbound_links = vec![
            LinkRef {
                uuid: Uuid::new_v4(),
                link_type: "related".into(),
                confidence: 0.8,
                reasoning: String::new(),
            },
            LinkRef {
                uuid: Uuid::new_v4(),
                link_type: "shares_entity:acme".into(),
                confidence: 1.0,
                reasoning: String::new(),
            },
        ];
        assert_eq!(memory.semantic_inbound_count(), 1);
    }

    #[test]
    fn test_importance_clamped() {
        let memory = Memory::new(Uuid::new_v4(), "fact", 1.7, -0.2);
        assert!((memory.importance_score - 1.0).abs() < f32::EPSILON);
        assert!(memory.confidence.abs() < f32::EPSILON);
    }
}
