//! Relationship discovery and link management.
//!
//! Finds semantically related memories, classifies the relationship with
//! an LLM, and materializes links bidirectionally. Traversal walks the
//! outbound graph breadth-first, healing dangling references as it reads.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::store::MemoryStore;
use super::vector_ops::VectorOps;
use crate::config::LinkingConfig;
use crate::llm::{
    ChatMessage, ChatRequest, GenerateParams, LlmProvider, extract_json_from_response,
};
use crate::models::{LinkType, Memory, MemoryLink};
use crate::{Error, Result};

const RELATIONSHIP_SYSTEM_PROMPT: &str = "You classify the relationship between two \
memories from a personal assistant's long-term store. Be conservative: sparse, \
high-confidence links are better than dense, noisy ones.";

/// Link counts by direction and type for one memory.
#[derive(Debug, Clone, Default)]
pub struct LinkStatistics {
    /// Total inbound links.
    pub total_inbound: usize,
    /// Total outbound links.
    pub total_outbound: usize,
    /// Inbound counts keyed by link type.
    pub inbound_by_type: std::collections::HashMap<String, usize>,
    /// Outbound counts keyed by link type.
    pub outbound_by_type: std::collections::HashMap<String, usize>,
}

/// A memory reached during graph traversal, with the edge that led there.
#[derive(Debug, Clone)]
pub struct TraversedMemory {
    /// The reached memory.
    pub memory: Memory,
    /// Type of the edge followed.
    pub link_type: Option<String>,
    /// Confidence of the edge followed.
    pub confidence: Option<f32>,
    /// Reasoning of the edge followed.
    pub reasoning: Option<String>,
    /// Depth at which the memory was reached (1 = direct neighbor).
    pub depth: usize,
    /// The memory the edge came from.
    pub linked_from_id: Option<Uuid>,
}

/// Service for discovering and managing memory relationships.
pub struct LinkingService {
    config: LinkingConfig,
    vector_ops: Arc<VectorOps>,
    store: Arc<dyn MemoryStore>,
    classifier: Option<(LlmProvider, GenerateParams)>,
}

impl LinkingService {
    /// Creates the linking service; the classifier is optional (batch
    /// pipelines build payloads without one).
    #[must_use]
    pub fn new(
        config: LinkingConfig,
        vector_ops: Arc<VectorOps>,
        store: Arc<dyn MemoryStore>,
        classifier: Option<(LlmProvider, GenerateParams)>,
    ) -> Self {
        Self {
            config,
            vector_ops,
            store,
            classifier,
        }
    }

    /// Finds candidate memories for relationship classification.
    ///
    /// Cold-storage memories (importance 0.0) are excluded via the 0.001
    /// floor; everything else above the linking similarity threshold is a
    /// candidate.
    pub fn find_similar_candidates(&self, memory_id: Uuid) -> Result<Vec<Memory>> {
        let candidates = self.vector_ops.find_similar_to_memory(
            memory_id,
            self.config.max_candidates_per_memory,
            self.config.similarity_threshold_for_linking,
            0.001,
        )?;
        tracing::debug!("found {} candidates for memory {memory_id}", candidates.len());
        Ok(candidates)
    }

    fn format_temporal(memory: &Memory) -> String {
        let mut parts = Vec::new();
        if let Some(happens_at) = memory.happens_at {
            parts.push(format!("happens_at: {}", happens_at.to_rfc3339()));
        }
        if let Some(expires_at) = memory.expires_at {
            parts.push(format!("expires_at: {}", expires_at.to_rfc3339()));
        }
        if parts.is_empty() {
            "no temporal constraints".to_string()
        } else {
            parts.join(" | ")
        }
    }

    /// Builds the classification user prompt for a memory pair.
    #[must_use]
    pub fn build_relationship_prompt(source: &Memory, target: &Memory) -> String {
        format!(
            r#"Analyze the relationship between these memories:

NEW MEMORY:
Text: "{}"
Temporal: {}
Importance: {:.3}

EXISTING MEMORY:
Text: "{}"
Temporal: {}
Importance: {:.3}

RELATIONSHIP TYPES:
- conflicts: Mutually exclusive or contradictory information
- supersedes: New memory explicitly updates or replaces old information
- causes: New memory directly leads to or triggers target memory
- instance_of: New memory is specific example of target memory's general pattern
- invalidated_by: New memory provides empirical evidence that disproves target memory
- motivated_by: New memory explains the reasoning/intent behind target memory
- null: No meaningful relationship (default when uncertain)

Default to "null" when uncertain - sparse, high-confidence links are better than dense, noisy ones.

Respond with JSON:
{{
    "relationship_type": "conflicts|supersedes|causes|instance_of|invalidated_by|motivated_by|null",
    "confidence": 0.0-1.0,
    "reasoning": "Brief explanation"
}}"#,
            source.text,
            Self::format_temporal(source),
            source.importance_score,
            target.text,
            Self::format_temporal(target),
            target.importance_score,
        )
    }

    /// Parses and validates a classification response.
    ///
    /// Returns `None` for malformed output or unknown types; classification
    /// noise never becomes a persisted edge.
    #[allow(clippy::cast_possible_truncation)]
    fn parse_classification(response_text: &str) -> Option<(LinkType, f32, String)> {
        let parsed: Value =
            serde_json::from_str(extract_json_from_response(response_text)).ok()?;
        let type_str = parsed.get("relationship_type").and_then(Value::as_str)?;
        let Some(link_type) = LinkType::parse(type_str) else {
            tracing::warn!("invalid relationship type: {type_str}");
            return None;
        };
        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((link_type, confidence, reasoning))
    }

    /// Synchronously classifies one memory pair.
    ///
    /// Returns `None` when the classifier says `null`, emits noise, or the
    /// confidence is below the persistence threshold. Use sparingly; batch
    /// classification is the cost-efficient path.
    pub fn classify_relationship_sync(
        &self,
        source: &Memory,
        target: &Memory,
    ) -> Result<Option<MemoryLink>> {
        let Some((provider, params)) = &self.classifier else {
            return Err(Error::op(
                "classify_relationship",
                "LLM provider required for synchronous classification",
            ));
        };

        let request = ChatRequest {
            messages: vec![ChatMessage::text(
                "user",
                Self::build_relationship_prompt(source, target),
            )],
            system: Some(Value::String(RELATIONSHIP_SYSTEM_PROMPT.to_string())),
            temperature: Some(0.2),
            max_tokens: Some(self.config.classification_max_tokens),
            response_format: Some(serde_json::json!({"type": "json_object"})),
            ..ChatRequest::default()
        };
        let response = provider.generate_response(&request, params)?;
        let text = LlmProvider::extract_text_content(&response);

        let Some((link_type, confidence, reasoning)) = Self::parse_classification(&text) else {
            return Ok(None);
        };
        if link_type == LinkType::Null {
            return Ok(None);
        }
        if confidence < self.config.link_confidence_threshold {
            tracing::debug!(
                "link confidence {confidence:.2} below threshold {:.2}",
                self.config.link_confidence_threshold
            );
            return Ok(None);
        }

        Ok(Some(MemoryLink {
            source_id: source.id,
            target_id: target.id,
            link_type,
            confidence,
            reasoning,
            created_at: chrono::Utc::now(),
        }))
    }

    /// Persists one bidirectional link.
    pub fn create_bidirectional_link(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        link_type: LinkType,
        confidence: f32,
        reasoning: &str,
    ) -> Result<()> {
        self.create_bidirectional_links(&[MemoryLink {
            source_id,
            target_id,
            link_type,
            confidence,
            reasoning: reasoning.to_string(),
            created_at: chrono::Utc::now(),
        }])
    }

    /// Persists bidirectional links; both endpoints in one transaction.
    pub fn create_bidirectional_links(&self, links: &[MemoryLink]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        self.store.create_links(links)?;
        if links.len() == 1 {
            tracing::info!(
                "created bidirectional {} link: {} <-> {}",
                links[0].link_type,
                links[0].source_id,
                links[0].target_id
            );
        } else {
            tracing::info!("created {} bidirectional links", links.len());
        }
        Ok(())
    }

    /// BFS over outbound links up to `depth`, deduplicating by id.
    ///
    /// Dangling references discovered along the way are removed from
    /// storage (heal-on-read) and skipped in the result.
    pub fn traverse_related(
        &self,
        memory_id: Uuid,
        depth: Option<usize>,
    ) -> Result<Vec<TraversedMemory>> {
        let depth = depth
            .unwrap_or(self.config.max_link_traversal_depth)
            .min(self.config.max_link_traversal_depth);
        if depth == 0 {
            return Ok(Vec::new());
        }

        let mut visited: HashSet<Uuid> = HashSet::from([memory_id]);
        let mut current_level: Vec<(Uuid, Option<(String, f32, String, Uuid)>, usize)> =
            vec![(memory_id, None, 0)];
        let mut related = Vec::new();

        // Level 0 is the start memory itself; levels 1..=depth are the
        // neighbors added to the result.
        for current_depth in 0..=depth {
            if current_level.is_empty() {
                break;
            }

            let level_ids: Vec<Uuid> = current_level.iter().map(|(id, _, _)| *id).collect();
            let found = self.store.get_memories_by_ids(&level_ids)?;
            let found_ids: HashSet<Uuid> = found.iter().map(|m| m.id).collect();

            let dead: Vec<Uuid> = level_ids
                .iter()
                .copied()
                .filter(|id| !found_ids.contains(id))
                .collect();
            if !dead.is_empty() {
                let removed = self.store.remove_dead_links(&dead)?;
                if removed > 0 {
                    tracing::info!(
                        "heal-on-read removed {removed} dead link references for {} ids",
                        dead.len()
                    );
                }
            }

            let expand = current_depth < depth;
            let mut next_level = Vec::new();
            for (id, edge, edge_depth) in current_level {
                let Some(memory) = found.iter().find(|m| m.id == id) else {
                    continue;
                };

                if id != memory_id {
                    let (link_type, confidence, reasoning, from) = match &edge {
                        Some((t, c, r, f)) => {
                            (Some(t.clone()), Some(*c), Some(r.clone()), Some(*f))
                        }
                        None => (None, None, None, None),
                    };
                    related.push(TraversedMemory {
                        memory: memory.clone(),
                        link_type,
                        confidence,
                        reasoning,
                        depth: edge_depth,
                        linked_from_id: from,
                    });
                }

                if !expand {
                    continue;
                }
                for link in &memory.outbound_links {
                    if visited.insert(link.uuid) {
                        next_level.push((
                            link.uuid,
                            Some((
                                link.link_type.clone(),
                                link.confidence,
                                link.reasoning.clone(),
                                id,
                            )),
                            current_depth + 1,
                        ));
                    }
                }
            }
            current_level = next_level;
        }

        Ok(related)
    }

    /// Link counts by type for a memory.
    pub fn get_link_statistics(&self, memory_id: Uuid) -> Result<LinkStatistics> {
        let memory = self
            .store
            .get_memory(memory_id)?
            .ok_or_else(|| Error::NotFound(format!("memory {memory_id} not found")))?;

        let mut stats = LinkStatistics {
            total_inbound: memory.inbound_links.len(),
            total_outbound: memory.outbound_links.len(),
            ..LinkStatistics::default()
        };
        for link in &memory.inbound_links {
            *stats.inbound_by_type.entry(link.link_type.clone()).or_insert(0) += 1;
        }
        for link in &memory.outbound_links {
            *stats.outbound_by_type.entry(link.link_type.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
