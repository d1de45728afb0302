//! Vector operations over the memory store.
//!
//! Owns the embedding dimension invariant: everything persisted through
//! here carries exactly 768 components, and searches with a wrong-sized
//! probe are rejected before touching the store.

use chrono::Utc;
use uuid::Uuid;

use super::store::MemoryStore;
use crate::llm::{Embedder, Reranker};
use crate::models::{ExtractedMemory, Memory};
use crate::observability::current_user_id;
use crate::{EMBEDDING_DIM, Error, Result};
use std::sync::Arc;

/// Embedding, storage and similarity operations.
pub struct VectorOps {
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    store: Arc<dyn MemoryStore>,
}

impl VectorOps {
    /// Creates the vector layer.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            embedder,
            reranker,
            store,
        }
    }

    fn check_dimension(embedding: &[f32]) -> Result<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::InvariantViolation(format!(
                "embedding has {} components, expected {EMBEDDING_DIM}",
                embedding.len()
            )));
        }
        Ok(())
    }

    /// Embeds one text; deterministic for a given input.
    pub fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.embedder.embed(text)?;
        Self::check_dimension(&embedding)?;
        Ok(embedding)
    }

    /// Embeds a batch of texts, preserving order.
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.embedder.embed_batch(texts)?;
        for embedding in &embeddings {
            Self::check_dimension(embedding)?;
        }
        Ok(embeddings)
    }

    /// Materializes extracted memories with embeddings under the ambient
    /// user, returning the new ids.
    pub fn store_memories_with_embeddings(
        &self,
        extracted: &[ExtractedMemory],
    ) -> Result<Vec<Uuid>> {
        if extracted.is_empty() {
            return Ok(Vec::new());
        }
        let user_id = current_user_id()?;

        let texts: Vec<String> = extracted.iter().map(|e| e.text.clone()).collect();
        let embeddings = self.generate_embeddings_batch(&texts)?;

        let memories: Vec<Memory> = extracted
            .iter()
            .zip(embeddings)
            .map(|(candidate, embedding)| {
                let mut memory = Memory::new(
                    user_id,
                    candidate.text.clone(),
                    candidate.importance_score,
                    candidate.confidence,
                );
                memory.embedding = Some(embedding);
                memory.expires_at = candidate.expires_at;
                memory.happens_at = candidate.happens_at;
                memory
            })
            .collect();

        let ids = self.store.insert_memories(&memories)?;
        metrics::counter!("mira_memories_stored_total").increment(ids.len() as u64);
        Ok(ids)
    }

    /// Text-in similarity search; populates `similarity_score`.
    ///
    /// An empty query returns an empty list rather than an error.
    pub fn find_similar_memories(
        &self,
        query_text: &str,
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>> {
        if query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.generate_embedding(query_text)?;
        self.find_similar_by_embedding(
            &embedding,
            Some(query_text),
            limit,
            similarity_threshold,
            min_importance,
        )
    }

    /// Embedding-in similarity search.
    ///
    /// Validates the probe dimension; when `query_text` is present and a
    /// reranker is configured, results come back reranked.
    pub fn find_similar_by_embedding(
        &self,
        embedding: &[f32],
        query_text: Option<&str>,
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>> {
        Self::check_dimension(embedding)?;
        let memories =
            self.store
                .search_similar(embedding, limit, similarity_threshold, min_importance)?;

        let accessed: Vec<Uuid> = memories.iter().map(|m| m.id).collect();
        if let Err(err) = self.store.record_access(&accessed, Utc::now()) {
            tracing::warn!("access counter update failed: {err}");
        }

        match query_text {
            Some(query) if self.reranker.is_some() => {
                Ok(self.rerank_memories(query, memories, limit))
            }
            _ => Ok(memories),
        }
    }

    /// Finds memories similar to an existing one, excluding itself.
    ///
    /// Unknown ids return an empty list (the caller asked a reasonable
    /// question with a stale id; that is not an error).
    pub fn find_similar_to_memory(
        &self,
        memory_id: Uuid,
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>> {
        let Some(reference) = self.store.get_memory(memory_id)? else {
            return Ok(Vec::new());
        };
        let Some(embedding) = reference.embedding.as_deref() else {
            return Ok(Vec::new());
        };

        // Oversample by one so the reference itself can be dropped.
        let mut memories = self.store.search_similar(
            embedding,
            limit + 1,
            similarity_threshold,
            min_importance,
        )?;
        memories.retain(|m| m.id != memory_id);
        memories.truncate(limit);
        Ok(memories)
    }

    /// Regenerates a memory's embedding for new text.
    ///
    /// Unknown ids are an error here: the caller claims the memory exists.
    pub fn update_memory_embedding(&self, memory_id: Uuid, new_text: &str) -> Result<()> {
        if self.store.get_memory(memory_id)?.is_none() {
            return Err(Error::NotFound(format!("memory {memory_id} not found")));
        }
        let embedding = self.generate_embedding(new_text)?;
        self.store
            .update_text_and_embedding(memory_id, new_text, &embedding)
    }

    /// Reranks memories against a query; fails soft.
    ///
    /// On reranker failure the input order is returned unchanged — search
    /// quality degrades, availability does not.
    #[must_use]
    pub fn rerank_memories(
        &self,
        query: &str,
        mut memories: Vec<Memory>,
        top_k: usize,
    ) -> Vec<Memory> {
        let Some(reranker) = &self.reranker else {
            memories.truncate(top_k);
            return memories;
        };

        let documents: Vec<String> = memories.iter().map(|m| m.text.clone()).collect();
        match reranker.score(query, &documents) {
            Ok(scores) if scores.len() == memories.len() => {
                let mut scored: Vec<(f32, Memory)> =
                    scores.into_iter().zip(memories).collect();
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(top_k);
                scored.into_iter().map(|(_, m)| m).collect()
            }
            Ok(_) => {
                tracing::warn!("reranker returned wrong score count, keeping input order");
                memories.truncate(top_k);
                memories
            }
            Err(err) => {
                tracing::warn!("reranker failed ({err}), keeping input order");
                memories.truncate(top_k);
                memories
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fakes for pipeline tests.

    use super::*;
    use crate::models::{Entity, MemoryLink};
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Deterministic embedder: hashes the text into a 768-d unit-ish vector.
    pub struct HashEmbedder;

    impl Embedder for HashEmbedder {
        fn dimension(&self) -> usize {
            EMBEDDING_DIM
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vector = vec![0.0f32; EMBEDDING_DIM];
            for (i, byte) in text.bytes().enumerate() {
                vector[(i * 31 + usize::from(byte)) % EMBEDDING_DIM] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1.0);
            for v in &mut vector {
                *v /= norm;
            }
            Ok(vector)
        }
    }

    /// Embedder with a wrong dimension, for invariant tests.
    pub struct WrongDimEmbedder;

    impl Embedder for WrongDimEmbedder {
        fn dimension(&self) -> usize {
            384
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 384])
        }
    }

    /// In-memory store with cosine search.
    #[derive(Default)]
    pub struct FakeMemoryStore {
        pub memories: Mutex<HashMap<Uuid, Memory>>,
        pub entities: Mutex<Vec<Entity>>,
        pub bm25: Mutex<Vec<(Uuid, f32)>>,
    }

    impl FakeMemoryStore {
        pub fn insert(&self, memory: Memory) {
            self.memories.lock().unwrap().insert(memory.id, memory);
        }

        fn cosine(a: &[f32], b: &[f32]) -> f32 {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 { 0.0 } else { dot / (na * nb) }
        }
    }

    impl MemoryStore for FakeMemoryStore {
        fn insert_memories(&self, memories: &[Memory]) -> Result<Vec<Uuid>> {
            let mut guard = self.memories.lock().unwrap();
            for memory in memories {
                guard.insert(memory.id, memory.clone());
            }
            Ok(memories.iter().map(|m| m.id).collect())
        }

        fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
            Ok(self.memories.lock().unwrap().get(&id).cloned())
        }

        fn get_memories_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Memory>> {
            let guard = self.memories.lock().unwrap();
            Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
        }

        fn all_memories(&self, include_archived: bool) -> Result<Vec<Memory>> {
            Ok(self
                .memories
                .lock()
                .unwrap()
                .values()
                .filter(|m| include_archived || !m.is_archived)
                .cloned()
                .collect())
        }

        fn update_text_and_embedding(
            &self,
            id: Uuid,
            text: &str,
            embedding: &[f32],
        ) -> Result<()> {
            let mut guard = self.memories.lock().unwrap();
            let memory = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("memory {id} not found")))?;
            memory.text = text.to_string();
            memory.embedding = Some(embedding.to_vec());
            memory.is_refined = true;
            memory.last_refined_at = Some(Utc::now());
            Ok(())
        }

        fn increment_rejection_count(&self, id: Uuid) -> Result<()> {
            if let Some(memory) = self.memories.lock().unwrap().get_mut(&id) {
                memory.refinement_rejection_count += 1;
            }
            Ok(())
        }

        fn archive_memories(&self, ids: &[Uuid], _reason: &str) -> Result<()> {
            let mut guard = self.memories.lock().unwrap();
            for id in ids {
                if let Some(memory) = guard.get_mut(id) {
                    memory.is_archived = true;
                    memory.archived_at = Some(Utc::now());
                }
            }
            Ok(())
        }

        fn search_similar(
            &self,
            embedding: &[f32],
            limit: usize,
            similarity_threshold: f32,
            min_importance: f32,
        ) -> Result<Vec<Memory>> {
            let guard = self.memories.lock().unwrap();
            let mut scored: Vec<Memory> = guard
                .values()
                .filter(|m| !m.is_archived && m.importance_score >= min_importance)
                .filter_map(|m| {
                    let memory_embedding = m.embedding.as_deref()?;
                    let similarity = Self::cosine(embedding, memory_embedding);
                    (similarity >= similarity_threshold).then(|| {
                        let mut hit = m.clone();
                        hit.similarity_score = Some(similarity);
                        hit
                    })
                })
                .collect();
            scored.sort_by(|a, b| {
                b.similarity_score
                    .partial_cmp(&a.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(limit);
            Ok(scored)
        }

        fn bm25_search(
            &self,
            _query_text: &str,
            limit: usize,
            min_importance: f32,
        ) -> Result<Vec<(Memory, f32)>> {
            let ranks = self.bm25.lock().unwrap();
            let guard = self.memories.lock().unwrap();
            Ok(ranks
                .iter()
                .filter_map(|(id, rank)| {
                    let memory = guard.get(id)?;
                    (!memory.is_archived && memory.importance_score >= min_importance)
                        .then(|| (memory.clone(), *rank))
                })
                .take(limit)
                .collect())
        }

        fn entities_by_names(&self, names: &[String]) -> Result<Vec<Entity>> {
            let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
            Ok(self
                .entities
                .lock()
                .unwrap()
                .iter()
                .filter(|e| !e.is_archived && lowered.contains(&e.name.to_lowercase()))
                .cloned()
                .collect())
        }

        fn top_entities(&self, limit: usize) -> Result<Vec<Entity>> {
            let mut entities: Vec<Entity> = self
                .entities
                .lock()
                .unwrap()
                .iter()
                .filter(|e| !e.is_archived)
                .cloned()
                .collect();
            entities.sort_by_key(|e| std::cmp::Reverse(e.link_count));
            entities.truncate(limit);
            Ok(entities)
        }

        fn create_links(&self, links: &[MemoryLink]) -> Result<()> {
            use crate::models::LinkRef;
            let mut guard = self.memories.lock().unwrap();
            for link in links {
                let link_type = link.link_type.canonical();
                if let Some(source) = guard.get_mut(&link.source_id) {
                    source.outbound_links.push(LinkRef {
                        uuid: link.target_id,
                        link_type: link_type.as_str().to_string(),
                        confidence: link.confidence,
                        reasoning: link.reasoning.clone(),
                    });
                }
                if let Some(target) = guard.get_mut(&link.target_id) {
                    target.inbound_links.push(LinkRef {
                        uuid: link.source_id,
                        link_type: link_type.as_str().to_string(),
                        confidence: link.confidence,
                        reasoning: link.reasoning.clone(),
                    });
                }
            }
            Ok(())
        }

        fn remove_dead_links(&self, dead_ids: &[Uuid]) -> Result<usize> {
            let mut removed = 0usize;
            let mut guard = self.memories.lock().unwrap();
            for memory in guard.values_mut() {
                let before = memory.inbound_links.len() + memory.outbound_links.len();
                memory.inbound_links.retain(|l| !dead_ids.contains(&l.uuid));
                memory.outbound_links.retain(|l| !dead_ids.contains(&l.uuid));
                removed += before - memory.inbound_links.len() - memory.outbound_links.len();
            }
            Ok(removed)
        }

        fn record_access(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
            let mut guard = self.memories.lock().unwrap();
            for id in ids {
                if let Some(memory) = guard.get_mut(id) {
                    memory.access_count += 1;
                    memory.last_accessed = Some(at);
                }
            }
            Ok(())
        }
    }
}
