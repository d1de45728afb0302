//! Hybrid retrieval: BM25 + vector legs fused with weighted Reciprocal
//! Rank Fusion, then entity priming.
//!
//! RRF accumulates `w_leg * 1/(k + rank)` with `k = 60` for each memory
//! ranked in either leg. Raw RRF scores cluster around 0.007-0.016, which
//! discriminates poorly; a sigmoid `1/(1+exp(-1000*(x-0.009)))` spreads
//! them into a usable ~0.1-0.85 band. The raw score is kept alongside for
//! debugging.
//!
//! Entity priming: entities named in the query are matched against the
//! user's known entities (exact name first, then fuzzy over the top
//! entities by link count), and memories linked to matched entities get a
//! multiplicative boost on `similarity_score`.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use uuid::Uuid;

use super::store::MemoryStore;
use crate::config::SearchConfig;
use crate::models::{Entity, Memory, SearchIntent};
use crate::Result;
use std::sync::Arc;

/// RRF constant; dampens the contribution of top ranks.
const RRF_K: f32 = 60.0;

/// Query-side named-entity extraction seam.
///
/// The production extractor is an external NER capability; the built-in
/// [`CapitalizedSpanExtractor`] keeps priming functional without it.
pub trait EntityExtractor: Send + Sync {
    /// Returns `(name, entity_type)` pairs found in the text.
    fn extract(&self, text: &str) -> Vec<(String, String)>;
}

/// Heuristic extractor: consecutive capitalized words form a span.
///
/// Sentence-initial single words are kept too; false positives cost one
/// entity lookup, false negatives cost recall.
pub struct CapitalizedSpanExtractor;

impl EntityExtractor for CapitalizedSpanExtractor {
    fn extract(&self, text: &str) -> Vec<(String, String)> {
        let mut spans = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        for raw in text.split_whitespace() {
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric());
            let capitalized = word
                .chars()
                .next()
                .is_some_and(char::is_uppercase);
            if capitalized && !word.is_empty() {
                current.push(word);
            } else if !current.is_empty() {
                spans.push(current.join(" "));
                current.clear();
            }
        }
        if !current.is_empty() {
            spans.push(current.join(" "));
        }

        spans
            .into_iter()
            .map(|name| (name, "UNKNOWN".to_string()))
            .collect()
    }
}

/// Hybrid searcher over the memory store.
pub struct HybridSearcher {
    store: Arc<dyn MemoryStore>,
    extractor: Arc<dyn EntityExtractor>,
    config: SearchConfig,
    /// Session cache of the user's top entities for fuzzy matching.
    entity_cache: Mutex<LruCache<Uuid, Vec<Entity>>>,
}

impl HybridSearcher {
    /// Creates a searcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn MemoryStore>,
        extractor: Arc<dyn EntityExtractor>,
        config: SearchConfig,
    ) -> Self {
        #[allow(clippy::unwrap_used)]
        let capacity = NonZeroUsize::new(64).unwrap();
        Self {
            store,
            extractor,
            config,
            entity_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Runs the hybrid search.
    pub fn hybrid_search(
        &self,
        user_id: Uuid,
        query_text: &str,
        query_embedding: &[f32],
        search_intent: SearchIntent,
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>> {
        // Oversample both legs for fusion.
        let bm25_results = self
            .store
            .bm25_search(query_text, limit * 2, min_importance)?;
        let vector_results = self.store.search_similar(
            query_embedding,
            limit * 2,
            similarity_threshold,
            min_importance,
        )?;

        let (bm25_weight, vector_weight) = search_intent.fusion_weights();
        let mut fused = Self::reciprocal_rank_fusion(
            bm25_results,
            vector_results,
            bm25_weight,
            vector_weight,
            limit,
        );

        let mut boosted_count = 0usize;
        if !query_text.is_empty() {
            boosted_count = self.apply_entity_priming(user_id, query_text, &mut fused)?;
        }

        metrics::counter!("mira_hybrid_searches_total").increment(1);
        tracing::info!(
            "hybrid search -> {} fused results (intent: {search_intent:?}, \
             entity_boosts: {boosted_count})",
            fused.len()
        );

        Ok(fused)
    }

    /// Weighted RRF with sigmoid normalization.
    ///
    /// Applying this twice to the same rank positions yields identical
    /// scores: the computation depends only on ranks and weights.
    fn reciprocal_rank_fusion(
        bm25_results: Vec<(Memory, f32)>,
        vector_results: Vec<Memory>,
        bm25_weight: f32,
        vector_weight: f32,
        limit: usize,
    ) -> Vec<Memory> {
        let mut rrf_scores: HashMap<Uuid, f32> = HashMap::new();
        let mut memory_map: HashMap<Uuid, Memory> = HashMap::new();

        #[allow(clippy::cast_precision_loss)]
        for (rank, (memory, _)) in bm25_results.into_iter().enumerate() {
            *rrf_scores.entry(memory.id).or_insert(0.0) +=
                bm25_weight * (1.0 / (RRF_K + rank as f32 + 1.0));
            memory_map.entry(memory.id).or_insert(memory);
        }

        #[allow(clippy::cast_precision_loss)]
        for (rank, memory) in vector_results.into_iter().enumerate() {
            *rrf_scores.entry(memory.id).or_insert(0.0) +=
                vector_weight * (1.0 / (RRF_K + rank as f32 + 1.0));
            // The vector copy carries the cosine similarity; prefer it as
            // the canonical object so that score survives for logging.
            memory_map.insert(memory.id, memory);
        }

        let mut ranked: Vec<(Uuid, f32)> = rrf_scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);

        ranked
            .into_iter()
            .filter_map(|(id, raw_score)| {
                memory_map.remove(&id).map(|mut memory| {
                    memory.similarity_score = Some(sigmoid_normalize(raw_score));
                    memory.raw_rrf_score = Some(raw_score);
                    memory
                })
            })
            .collect()
    }

    /// Applies the entity-priming boost; returns how many memories moved.
    fn apply_entity_priming(
        &self,
        user_id: Uuid,
        query_text: &str,
        memories: &mut Vec<Memory>,
    ) -> Result<usize> {
        if memories.is_empty() {
            return Ok(0);
        }
        let query_entities = self.extractor.extract(query_text);
        if query_entities.is_empty() {
            return Ok(0);
        }

        let matched = self.match_entities_to_user(user_id, &query_entities)?;
        if matched.is_empty() {
            return Ok(0);
        }

        let mut boosted = 0usize;
        for memory in memories.iter_mut() {
            let entity_boost = self.calculate_entity_boost(memory, &matched);
            if entity_boost > 0.0 {
                let boost_factor = 1.0 + entity_boost.min(self.config.max_entity_boost);
                if let Some(score) = memory.similarity_score.as_mut() {
                    *score *= boost_factor;
                }
                boosted += 1;
            }
        }

        memories.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        metrics::counter!("mira_entity_boosts_total").increment(boosted as u64);
        Ok(boosted)
    }

    /// Exact-name matches via a targeted query, then fuzzy matches against
    /// the user's top entities for whatever is left.
    fn match_entities_to_user(
        &self,
        user_id: Uuid,
        query_entities: &[(String, String)],
    ) -> Result<HashMap<Uuid, (f32, String)>> {
        let mut matched: HashMap<Uuid, (f32, String)> = HashMap::new();

        let names: Vec<String> = query_entities.iter().map(|(name, _)| name.clone()).collect();
        let exact = self.store.entities_by_names(&names)?;
        let matched_names: Vec<String> =
            exact.iter().map(|e| e.name.to_lowercase()).collect();
        for entity in exact {
            matched.insert(entity.id, (1.0, entity.entity_type));
        }

        let unmatched: Vec<&(String, String)> = query_entities
            .iter()
            .filter(|(name, _)| !matched_names.contains(&name.to_lowercase()))
            .collect();
        if unmatched.is_empty() {
            return Ok(matched);
        }

        let candidates = self.cached_top_entities(user_id)?;
        for (query_name, query_type) in unmatched {
            let query_lower = query_name.to_lowercase();
            let mut best: Option<(&Entity, f64)> = None;

            for entity in &candidates {
                if matched.contains_key(&entity.id) {
                    continue;
                }
                let mut score =
                    strsim::normalized_levenshtein(&query_lower, &entity.name.to_lowercase());
                if entity.entity_type == *query_type {
                    score = (score + 0.1).min(1.0);
                }
                if score >= self.config.fuzzy_match_threshold
                    && best.is_none_or(|(_, best_score)| score > best_score)
                {
                    best = Some((entity, score));
                }
            }

            if let Some((entity, score)) = best {
                #[allow(clippy::cast_possible_truncation)]
                matched.insert(entity.id, (score as f32, entity.entity_type.clone()));
            }
        }

        Ok(matched)
    }

    fn cached_top_entities(&self, user_id: Uuid) -> Result<Vec<Entity>> {
        if let Ok(mut cache) = self.entity_cache.lock() {
            if let Some(entities) = cache.get(&user_id) {
                return Ok(entities.clone());
            }
        }
        let entities = self.store.top_entities(self.config.fuzzy_candidate_pool)?;
        if let Ok(mut cache) = self.entity_cache.lock() {
            cache.put(user_id, entities.clone());
        }
        Ok(entities)
    }

    /// Sums `confidence * type_weight * coefficient` over matched entity
    /// links; the caller caps and applies the result.
    fn calculate_entity_boost(
        &self,
        memory: &Memory,
        matched: &HashMap<Uuid, (f32, String)>,
    ) -> f32 {
        memory
            .entity_links
            .iter()
            .filter_map(|link| matched.get(&link.uuid))
            .map(|(confidence, entity_type)| {
                confidence
                    * SearchConfig::entity_type_weight(entity_type)
                    * self.config.entity_boost_coefficient
            })
            .sum()
    }

    /// Clears the per-user entity cache (user context switch).
    pub fn clear_entity_cache(&self, user_id: Uuid) {
        if let Ok(mut cache) = self.entity_cache.lock() {
            cache.pop(&user_id);
        }
    }
}

/// Spreads raw RRF scores into a usable 0-1 band.
#[must_use]
fn sigmoid_normalize(raw_score: f32) -> f32 {
    1.0 / (1.0 + (-1000.0 * (raw_score - 0.009)).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector_ops::test_support::{FakeMemoryStore, HashEmbedder};
    use crate::llm::Embedder;
    use crate::models::EntityLink;

    fn searcher(store: Arc<FakeMemoryStore>) -> HybridSearcher {
        HybridSearcher::new(store, Arc::new(CapitalizedSpanExtractor), SearchConfig::default())
    }

    fn memory_with(store: &FakeMemoryStore, text: &str) -> Memory {
        let mut memory = Memory::new(Uuid::new_v4(), text, 0.5, 0.9);
        memory.embedding = Some(HashEmbedder.embed(text).unwrap());
        store.insert(memory.clone());
        memory
    }

    #[test]
    fn test_sigmoid_spreads_typical_band() {
        let low = sigmoid_normalize(0.007);
        let high = sigmoid_normalize(0.016);
        assert!(low > 0.05 && low < 0.25, "low was {low}");
        assert!(high > 0.8 && high < 1.0, "high was {high}");
        assert!(high > low);
    }

    #[test]
    fn test_rrf_is_deterministic_for_same_ranks() {
        let store = FakeMemoryStore::default();
        let a = memory_with(&store, "python is a programming language");
        let b = memory_with(&store, "javascript runs in browsers");

        let run = || {
            HybridSearcher::reciprocal_rank_fusion(
                vec![(a.clone(), 0.9), (b.clone(), 0.5)],
                vec![b.clone(), a.clone()],
                0.4,
                0.6,
                10,
            )
            .into_iter()
            .map(|m| (m.id, m.similarity_score.unwrap()))
            .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_membership_in_both_legs_ranks_higher() {
        let store = FakeMemoryStore::default();
        let both = memory_with(&store, "in both legs");
        let bm25_only = memory_with(&store, "bm25 only");
        let vector_only = memory_with(&store, "vector only");

        let fused = HybridSearcher::reciprocal_rank_fusion(
            vec![(both.clone(), 0.9), (bm25_only, 0.8)],
            vec![both.clone(), vector_only],
            0.4,
            0.6,
            10,
        );
        assert_eq!(fused[0].id, both.id);
    }

    #[test]
    fn test_scores_monotonically_non_increasing() {
        let store = Arc::new(FakeMemoryStore::default());
        let python1 = memory_with(&store, "Python is a programming language");
        let js = memory_with(&store, "JavaScript runs in browsers");
        let python2 = memory_with(&store, "Python programming tutorial");
        *store.bm25.lock().unwrap() = vec![(python1.id, 0.8), (python2.id, 0.7)];

        let searcher = searcher(Arc::clone(&store));
        let embedding = HashEmbedder.embed("Python coding").unwrap();
        let results = searcher
            .hybrid_search(
                Uuid::new_v4(),
                "Python coding",
                &embedding,
                SearchIntent::General,
                10,
                0.0,
                0.1,
            )
            .unwrap();

        assert!(!results.is_empty());
        for pair in results.windows(2) {
            assert!(pair[0].similarity_score >= pair[1].similarity_score);
        }
        // At least one Python memory above the JavaScript memory.
        let js_rank = results.iter().position(|m| m.id == js.id);
        let python_rank = results
            .iter()
            .position(|m| m.id == python1.id || m.id == python2.id);
        if let (Some(js_rank), Some(python_rank)) = (js_rank, python_rank) {
            assert!(python_rank < js_rank);
        }
    }

    #[test]
    fn test_entity_priming_boosts_linked_memory() {
        let store = Arc::new(FakeMemoryStore::default());
        let alice = Entity {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Alice".to_string(),
            entity_type: "PERSON".to_string(),
            embedding: None,
            link_count: 12,
            last_linked_at: None,
            is_archived: false,
        };
        let acme = Entity {
            id: Uuid::new_v4(),
            user_id: alice.user_id,
            name: "Acme".to_string(),
            entity_type: "ORG".to_string(),
            embedding: None,
            link_count: 8,
            last_linked_at: None,
            is_archived: false,
        };
        store.entities.lock().unwrap().extend([alice.clone(), acme.clone()]);

        let mut linked = Memory::new(alice.user_id, "Alice presented the Acme roadmap", 0.5, 0.9);
        linked.embedding = Some(HashEmbedder.embed(&linked.text).unwrap());
        linked.entity_links = vec![
            EntityLink { uuid: alice.id },
            EntityLink { uuid: acme.id },
        ];
        store.insert(linked.clone());
        let unrelated = memory_with(&store, "weekly grocery list");

        let searcher = searcher(Arc::clone(&store));
        let config = SearchConfig::default();
        let _ = unrelated;

        // Pre-boost baseline: same embedding, but the all-lowercase query
        // yields no entities, so no priming runs. Ranks (and therefore raw
        // RRF scores) are identical to the boosted run.
        let embedding = HashEmbedder.embed("what did Alice say at Acme?").unwrap();
        let baseline = searcher
            .hybrid_search(
                alice.user_id,
                "what did alice say at acme?",
                &embedding,
                SearchIntent::General,
                10,
                0.0,
                0.1,
            )
            .unwrap();
        let baseline_score = baseline
            .iter()
            .find(|m| m.id == linked.id)
            .and_then(|m| m.similarity_score)
            .unwrap();

        let boosted = searcher
            .hybrid_search(
                alice.user_id,
                "what did Alice say at Acme?",
                &embedding,
                SearchIntent::General,
                10,
                0.0,
                0.1,
            )
            .unwrap();
        let boosted_score = boosted
            .iter()
            .find(|m| m.id == linked.id)
            .and_then(|m| m.similarity_score)
            .unwrap();

        assert!(
            boosted_score > baseline_score,
            "boosted {boosted_score} <= baseline {baseline_score}"
        );
        assert!(boosted_score <= baseline_score * (1.0 + config.max_entity_boost) + 1e-6);
    }

    #[test]
    fn test_fuzzy_match_with_type_bonus() {
        let store = Arc::new(FakeMemoryStore::default());
        let entity = Entity {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Johnathan".to_string(),
            entity_type: "UNKNOWN".to_string(),
            embedding: None,
            link_count: 5,
            last_linked_at: None,
            is_archived: false,
        };
        store.entities.lock().unwrap().push(entity.clone());

        let searcher = searcher(Arc::clone(&store));
        let matched = searcher
            .match_entities_to_user(
                entity.user_id,
                &[("Johnathon".to_string(), "UNKNOWN".to_string())],
            )
            .unwrap();
        assert!(matched.contains_key(&entity.id));
    }

    #[test]
    fn test_capitalized_span_extractor() {
        let extractor = CapitalizedSpanExtractor;
        let entities = extractor.extract("what did Alice Smith say at Acme last week?");
        let names: Vec<&str> = entities.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"Alice Smith"));
        assert!(names.contains(&"Acme"));
    }

    #[test]
    fn test_empty_legs_fuse_to_empty() {
        let fused =
            HybridSearcher::reciprocal_rank_fusion(Vec::new(), Vec::new(), 0.4, 0.6, 10);
        assert!(fused.is_empty());
    }
}
