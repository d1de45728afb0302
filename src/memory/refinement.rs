//! Memory refinement: verbose trimming and consolidation clustering.
//!
//! Two passes keep the store healthy over time. Verbose trimming distills
//! long, frequently-accessed memories into their core facts (trim, split,
//! or leave alone). Consolidation finds hub memories and clusters of
//! near-duplicates around them for an LLM merge decision.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::store::MemoryStore;
use super::vector_ops::VectorOps;
use crate::config::RefinementConfig;
use crate::llm::{
    ChatMessage, ChatRequest, GenerateParams, LlmProvider, extract_json_from_response,
};
use crate::models::{ConsolidationCluster, ExtractedMemory, Memory, RefinementCandidate};
use crate::{Error, Result};

const REFINEMENT_SYSTEM_PROMPT: &str = "You distill verbose memories from a personal \
assistant's long-term store into concise core facts. Preserve importance and critical \
details. Respond with JSON: {\"action\": \"trim|split|do_nothing\", \"refined_text\": \
\"...\", \"split_memories\": [\"...\"], \"confidence\": 0.0-1.0, \"reason\": \"...\"}.";

const CONSOLIDATION_SYSTEM_PROMPT: &str = "You decide whether a cluster of similar \
memories should merge into one. Consolidate only when the merge is a clear improvement; \
information loss is worse than redundancy.";

/// What the refinement model decided for one memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementAction {
    /// One replacement memory.
    Trim,
    /// Two or more replacement memories.
    Split,
    /// Leave as-is; the rejection counter increments.
    DoNothing,
}

/// Outcome of refining one memory.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    /// The decision.
    pub action: RefinementAction,
    /// Replacement memories (empty for `DoNothing`).
    pub refined_memories: Vec<ExtractedMemory>,
    /// How much to bump the rejection counter.
    pub rejection_count_increment: i32,
}

/// Refinement and consolidation service.
pub struct RefinementService {
    config: RefinementConfig,
    vector_ops: Arc<VectorOps>,
    store: Arc<dyn MemoryStore>,
    refiner: Option<(LlmProvider, GenerateParams)>,
}

impl RefinementService {
    /// Creates the service; the LLM is optional (analysis passes run
    /// without one).
    #[must_use]
    pub fn new(
        config: RefinementConfig,
        vector_ops: Arc<VectorOps>,
        store: Arc<dyn MemoryStore>,
        refiner: Option<(LlmProvider, GenerateParams)>,
    ) -> Self {
        Self {
            config,
            vector_ops,
            store,
            refiner,
        }
    }

    /// Selects verbose memories worth refining.
    ///
    /// A candidate exceeds the character threshold, has been accessed
    /// enough to be stable, is old enough, is outside its refinement
    /// cooldown, and has not been declined too many times.
    pub fn identify_verbose_memories(&self, limit: usize) -> Result<Vec<RefinementCandidate>> {
        let now = chrono::Utc::now();
        let min_age = chrono::Duration::days(self.config.min_age_for_refinement_days);
        let cooldown = chrono::Duration::days(self.config.refinement_cooldown_days);

        let mut candidates: Vec<RefinementCandidate> = self
            .store
            .all_memories(false)?
            .into_iter()
            .filter(|m| m.text.len() >= self.config.verbose_threshold_chars)
            .filter(|m| {
                !(m.is_refined
                    && m.last_refined_at.is_some_and(|at| at > now - cooldown))
            })
            .filter(|m| m.created_at <= now - min_age)
            .filter(|m| m.access_count >= self.config.min_access_count_for_refinement)
            .filter(|m| m.refinement_rejection_count < self.config.max_rejection_count)
            .map(|m| RefinementCandidate {
                memory_id: m.id,
                reason: "verbose".to_string(),
                char_count: m.text.len(),
                current_text: m.text,
            })
            .collect();

        candidates.sort_by_key(|c| std::cmp::Reverse(c.char_count));
        candidates.truncate(limit);
        tracing::info!("identified {} verbose memories for refinement", candidates.len());
        Ok(candidates)
    }

    /// Finds consolidation clusters around hub memories.
    ///
    /// Hubs are high-importance frequently-accessed memories, or memories
    /// with many semantic (non-entity) inbound links. Each hub expands by
    /// similarity; members of accepted clusters are not reused as hubs.
    pub fn identify_consolidation_clusters(&self) -> Result<Vec<ConsolidationCluster>> {
        let all = self.store.all_memories(false)?;

        let mut hubs: Vec<&Memory> = all
            .iter()
            .filter(|m| {
                (m.importance_score >= 0.3 && m.access_count >= 5)
                    || m.semantic_inbound_count() >= 5
            })
            .collect();
        hubs.sort_by(|a, b| {
            b.importance_score
                .partial_cmp(&a.importance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hubs.truncate(50);
        tracing::info!("found {} hub candidates for clustering", hubs.len());

        let mut processed: HashSet<Uuid> = HashSet::new();
        let mut clusters = Vec::new();

        for hub in hubs {
            if processed.contains(&hub.id) {
                continue;
            }

            let similar = self.vector_ops.find_similar_to_memory(
                hub.id,
                self.config.max_cluster_size,
                self.config.consolidation_similarity_threshold,
                0.001,
            )?;
            if similar.len() < self.config.min_cluster_size - 1 {
                continue;
            }

            let members: Vec<&Memory> = similar
                .iter()
                .take(self.config.max_cluster_size - 1)
                .collect();
            let similarity_scores: Vec<f32> = members
                .iter()
                .map(|m| {
                    m.similarity_score
                        .unwrap_or(self.config.consolidation_similarity_threshold)
                })
                .collect();
            #[allow(clippy::cast_precision_loss)]
            let avg_similarity = if similarity_scores.is_empty() {
                0.0
            } else {
                similarity_scores.iter().sum::<f32>() / similarity_scores.len() as f32
            };

            if avg_similarity < self.config.consolidation_confidence_threshold {
                continue;
            }

            let mut memory_ids = vec![hub.id];
            let mut memory_texts = vec![hub.text.clone()];
            for member in &members {
                memory_ids.push(member.id);
                memory_texts.push(member.text.clone());
            }
            processed.extend(memory_ids.iter().copied());

            clusters.push(ConsolidationCluster {
                cluster_id: format!("cluster_{}", hub.id),
                memory_ids,
                memory_texts,
                similarity_scores,
                avg_similarity,
                consolidation_confidence: avg_similarity,
            });
        }

        tracing::info!("identified {} consolidation clusters", clusters.len());
        Ok(clusters)
    }

    /// Builds the consolidation analysis payload for the batch API.
    ///
    /// The system prompt carries the policy; the user prompt carries only
    /// the data.
    #[must_use]
    pub fn build_consolidation_payload(cluster: &ConsolidationCluster) -> Value {
        let memories_text = cluster
            .memory_ids
            .iter()
            .zip(&cluster.memory_texts)
            .enumerate()
            .map(|(i, (id, text))| format!("Memory {} (ID: {id}):\n{text}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n");

        let user_prompt = format!(
            "Analyze these similar memories and determine if consolidation would provide \
             clear improvement:\n\n{memories_text}\n\nRespond with JSON:\n{{\n    \
             \"should_consolidate\": true/false,\n    \"consolidated_text\": \"Combined \
             memory text if consolidating (or empty string)\",\n    \"reason\": \"Brief \
             explanation of decision\"\n}}"
        );

        serde_json::json!({
            "cluster_id": cluster.cluster_id,
            "memory_ids": cluster.memory_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "system_prompt": CONSOLIDATION_SYSTEM_PROMPT,
            "user_prompt": user_prompt,
        })
    }

    /// Synchronously refines one verbose memory.
    ///
    /// Prefer batch processing; this exists for tools and tests.
    pub fn refine_verbose_memory_sync(&self, memory: &Memory) -> Result<RefinementOutcome> {
        let Some((provider, params)) = &self.refiner else {
            return Err(Error::op(
                "refine_memory",
                "LLM provider required for sync refinement",
            ));
        };

        let request = ChatRequest {
            messages: vec![ChatMessage::text(
                "user",
                format!("Refine this memory:\n\n{}", memory.text),
            )],
            system: Some(Value::String(REFINEMENT_SYSTEM_PROMPT.to_string())),
            temperature: Some(0.1),
            max_tokens: Some(self.config.refinement_max_tokens),
            ..ChatRequest::default()
        };
        let response = provider.generate_response(&request, params)?;
        let text = LlmProvider::extract_text_content(&response);

        let parsed: Value = serde_json::from_str(extract_json_from_response(&text))
            .map_err(|e| Error::op("refine_memory", format!("unparseable response: {e}")))?;
        Ok(Self::interpret_refinement(memory, &parsed))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn interpret_refinement(memory: &Memory, parsed: &Value) -> RefinementOutcome {
        let action = parsed
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("do_nothing");
        let confidence = |default: f32| -> f32 {
            parsed
                .get("confidence")
                .and_then(Value::as_f64)
                .map_or(default, |c| c as f32)
        };
        let replacement = |text: &str, conf: f32| ExtractedMemory {
            text: text.to_string(),
            importance_score: memory.importance_score,
            confidence: conf,
            expires_at: memory.expires_at,
            happens_at: memory.happens_at,
            related_memory_ids: Vec::new(),
            consolidates_memory_ids: vec![memory.id.to_string()],
            proposed_relationship: None,
        };

        match action {
            "trim" => {
                let refined_text = parsed
                    .get("refined_text")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if refined_text.is_empty() {
                    tracing::warn!("trim action produced empty text, treating as do_nothing");
                    return Self::do_nothing();
                }
                RefinementOutcome {
                    action: RefinementAction::Trim,
                    refined_memories: vec![replacement(&refined_text, confidence(0.95))],
                    rejection_count_increment: 0,
                }
            }
            "split" => {
                let split_texts: Vec<String> = parsed
                    .get("split_memories")
                    .and_then(Value::as_array)
                    .map(|texts| {
                        texts
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                if split_texts.len() < 2 {
                    tracing::warn!("split action with <2 memories, treating as do_nothing");
                    return Self::do_nothing();
                }
                let conf = confidence(0.90);
                RefinementOutcome {
                    action: RefinementAction::Split,
                    refined_memories: split_texts
                        .iter()
                        .map(|t| replacement(t, conf))
                        .collect(),
                    rejection_count_increment: 0,
                }
            }
            _ => {
                tracing::info!(
                    "memory {} marked do_nothing: {:?}",
                    memory.id,
                    parsed.get("reason").and_then(serde_json::Value::as_str)
                );
                Self::do_nothing()
            }
        }
    }

    const fn do_nothing() -> RefinementOutcome {
        RefinementOutcome {
            action: RefinementAction::DoNothing,
            refined_memories: Vec::new(),
            rejection_count_increment: 1,
        }
    }

    /// Applies a refinement outcome: store replacements, archive the
    /// original, or bump the rejection counter.
    pub fn apply_refinement(&self, memory: &Memory, outcome: &RefinementOutcome) -> Result<()> {
        match outcome.action {
            RefinementAction::DoNothing => {
                self.store.increment_rejection_count(memory.id)?;
            }
            RefinementAction::Trim | RefinementAction::Split => {
                self.vector_ops
                    .store_memories_with_embeddings(&outcome.refined_memories)?;
                self.store.archive_memories(&[memory.id], "refined")?;
            }
        }
        Ok(())
    }

    /// Daily analysis pass: candidate counts for scheduler logging.
    ///
    /// Actual refinement runs in batches; this only counts.
    pub fn run_full_refinement(&self) -> Result<(usize, usize)> {
        let verbose = self
            .identify_verbose_memories(self.config.verbose_candidates_limit)?
            .len();
        let clusters = self.identify_consolidation_clusters()?.len();
        tracing::info!(
            "refinement analysis complete: {verbose} verbose memories, {clusters} \
             consolidation clusters"
        );
        Ok((verbose, clusters))
    }
}
