//! Extraction orchestration and batch polling.
//!
//! Collapsed segments arrive here (via the [`ExtractionSink`] seam), get
//! chunked, submitted to the provider's batch API, and polled to
//! completion by a background worker. Completed batches materialize their
//! extracted memories through the vector layer. All transitions are
//! idempotent: replaying a completed batch is a no-op.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use super::vector_ops::VectorOps;
use crate::continuum::ExtractionSink;
use crate::models::{BatchStatus, ExtractedMemory, ExtractionBatch, Message, ProcessingChunk};
use crate::observability::{UserContext, enter_user_context};
use crate::Result;

/// Messages per processing chunk.
const CHUNK_MESSAGE_LIMIT: usize = 40;

/// Provider-side batch API seam (Anthropic batches or compatible).
pub trait BatchProvider: Send + Sync {
    /// Submits chunks; returns the provider batch id.
    fn submit(&self, user_id: Uuid, chunks: &[ProcessingChunk]) -> Result<String>;

    /// Polls the provider for batch status.
    fn poll(&self, provider_batch_id: &str) -> Result<BatchStatus>;

    /// Fetches extracted memories for a completed batch.
    fn results(&self, provider_batch_id: &str) -> Result<Vec<ExtractedMemory>>;
}

/// Durable bookkeeping seam for batch rows.
pub trait BatchLedger: Send + Sync {
    /// Records a newly submitted batch.
    fn record(&self, batch: &ExtractionBatch) -> Result<()>;

    /// Persists a status transition.
    fn update_status(&self, batch_id: Uuid, status: BatchStatus) -> Result<()>;
}

/// No-op ledger for deployments that keep bookkeeping in memory only.
pub struct NullLedger;

impl BatchLedger for NullLedger {
    fn record(&self, _batch: &ExtractionBatch) -> Result<()> {
        Ok(())
    }

    fn update_status(&self, _batch_id: Uuid, _status: BatchStatus) -> Result<()> {
        Ok(())
    }
}

/// Chunks segments, submits extraction batches, polls them to completion.
pub struct ExtractionOrchestrator {
    provider: Arc<dyn BatchProvider>,
    ledger: Arc<dyn BatchLedger>,
    vector_ops: Arc<VectorOps>,
    batches: Mutex<HashMap<Uuid, ExtractionBatch>>,
}

impl ExtractionOrchestrator {
    /// Creates the orchestrator.
    #[must_use]
    pub fn new(
        provider: Arc<dyn BatchProvider>,
        ledger: Arc<dyn BatchLedger>,
        vector_ops: Arc<VectorOps>,
    ) -> Self {
        Self {
            provider,
            ledger,
            vector_ops,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Splits segment messages into ordered, non-empty chunks.
    #[must_use]
    pub fn chunk_messages(messages: &[Message], memory_context: &str) -> Vec<ProcessingChunk> {
        messages
            .chunks(CHUNK_MESSAGE_LIMIT)
            .enumerate()
            .filter_map(|(index, window)| {
                let first = window.first()?;
                let last = window.last()?;
                Some(ProcessingChunk {
                    messages: window.to_vec(),
                    temporal_start: first.created_at,
                    temporal_end: last.created_at,
                    chunk_index: index,
                    memory_context: memory_context.to_string(),
                })
            })
            .collect()
    }

    /// Snapshot of tracked batches (monitoring, tests).
    #[must_use]
    pub fn tracked_batches(&self) -> Vec<ExtractionBatch> {
        self.batches
            .lock()
            .map(|batches| batches.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Runs one polling pass; returns how many batches reached completion
    /// this pass.
    pub fn poll_once(&self) -> Result<usize> {
        let pending: Vec<ExtractionBatch> = self
            .batches
            .lock()
            .map(|batches| {
                batches
                    .values()
                    .filter(|b| !b.status.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut completed = 0usize;
        for batch in pending {
            let Some(provider_id) = batch.provider_batch_id.clone() else {
                continue;
            };
            let observed = match self.provider.poll(&provider_id) {
                Ok(observed) => observed,
                Err(err) => {
                    tracing::warn!("poll failed for batch {}: {err}", batch.id);
                    continue;
                }
            };

            let effective = batch.status.advance_to(observed);
            if effective == batch.status {
                continue;
            }

            if effective == BatchStatus::Completed {
                if let Err(err) = self.harvest(&batch, &provider_id) {
                    tracing::error!("harvest failed for batch {}: {err}", batch.id);
                    continue;
                }
                completed += 1;
            }

            self.transition(batch.id, effective);
        }
        Ok(completed)
    }

    fn harvest(&self, batch: &ExtractionBatch, provider_id: &str) -> Result<()> {
        let extracted = self.provider.results(provider_id)?;
        if extracted.is_empty() {
            tracing::info!("batch {} completed with no memories", batch.id);
            return Ok(());
        }

        // Background work: set the context explicitly before user-scoped
        // storage.
        let _ctx = enter_user_context(UserContext::new(batch.user_id));
        let ids = self.vector_ops.store_memories_with_embeddings(&extracted)?;
        tracing::info!(
            "batch {} stored {} memories for segment {}",
            batch.id,
            ids.len(),
            batch.segment_id
        );
        Ok(())
    }

    fn transition(&self, batch_id: Uuid, status: BatchStatus) {
        if let Ok(mut batches) = self.batches.lock() {
            if let Some(batch) = batches.get_mut(&batch_id) {
                batch.status = status;
                if status.is_terminal() {
                    batch.completed_at = Some(Utc::now());
                }
            }
        }
        if let Err(err) = self.ledger.update_status(batch_id, status) {
            tracing::warn!("batch ledger update failed for {batch_id}: {err}");
        }
    }

    /// Spawns the polling loop on a dedicated thread.
    pub fn spawn_poller(
        self: Arc<Self>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            tracing::info!("batch poller started ({}s interval)", interval.as_secs());
            while !shutdown.load(Ordering::Acquire) {
                match self.poll_once() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("batch poller completed {n} batches"),
                    Err(err) => tracing::error!("batch polling failed: {err}"),
                }
                let mut remaining = interval;
                while !shutdown.load(Ordering::Acquire) && remaining > Duration::ZERO {
                    let slice = remaining.min(Duration::from_millis(500));
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
            tracing::info!("batch poller stopped");
        })
    }
}

impl ExtractionSink for ExtractionOrchestrator {
    fn submit_segment_extraction(
        &self,
        user_id: Uuid,
        segment_id: Uuid,
        messages: &[Message],
    ) -> Result<()> {
        let chunks = Self::chunk_messages(messages, "");
        if chunks.is_empty() {
            tracing::warn!("segment {segment_id} submitted with no messages, skipping");
            return Ok(());
        }

        let provider_batch_id = self.provider.submit(user_id, &chunks)?;
        let batch = ExtractionBatch {
            id: Uuid::new_v4(),
            provider_batch_id: Some(provider_batch_id),
            user_id,
            segment_id,
            chunk_count: chunks.len(),
            status: BatchStatus::Submitted,
            submitted_at: Utc::now(),
            completed_at: None,
            last_error: None,
        };

        self.ledger.record(&batch)?;
        if let Ok(mut batches) = self.batches.lock() {
            batches.insert(batch.id, batch.clone());
        }
        metrics::counter!("mira_extraction_batches_submitted_total").increment(1);
        tracing::info!(
            "submitted extraction batch {} for segment {segment_id} ({} chunks)",
            batch.id,
            batch.chunk_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::memory::vector_ops::test_support::{FakeMemoryStore, HashEmbedder};
    use crate::models::Role;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedProvider {
        statuses: Mutex<Vec<BatchStatus>>,
        submissions: AtomicUsize,
        results_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(statuses: Vec<BatchStatus>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                submissions: AtomicUsize::new(0),
                results_calls: AtomicUsize::new(0),
            }
        }
    }

    impl BatchProvider for ScriptedProvider {
        fn submit(&self, _user_id: Uuid, _chunks: &[ProcessingChunk]) -> Result<String> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            Ok("provider-batch-1".to_string())
        }

        fn poll(&self, _provider_batch_id: &str) -> Result<BatchStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            Ok(if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            })
        }

        fn results(&self, _provider_batch_id: &str) -> Result<Vec<ExtractedMemory>> {
            self.results_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ExtractedMemory {
                text: "User is planning a trip to Lisbon".to_string(),
                importance_score: 0.6,
                confidence: 0.9,
                expires_at: None,
                happens_at: None,
                related_memory_ids: Vec::new(),
                consolidates_memory_ids: Vec::new(),
                proposed_relationship: None,
            }])
        }
    }

    fn orchestrator(
        provider: Arc<ScriptedProvider>,
    ) -> (Arc<ExtractionOrchestrator>, Arc<FakeMemoryStore>) {
        let store = Arc::new(FakeMemoryStore::default());
        let vector_ops = Arc::new(VectorOps::new(
            Arc::new(HashEmbedder),
            None,
            Arc::clone(&store) as Arc<dyn MemoryStore>,
        ));
        (
            Arc::new(ExtractionOrchestrator::new(
                provider,
                Arc::new(NullLedger),
                vector_ops,
            )),
            store,
        )
    }

    fn messages(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| Message::new(Role::User, format!("message {i}")).unwrap())
            .collect()
    }

    #[test]
    fn test_chunking_is_ordered_and_non_empty() {
        let chunks = ExtractionOrchestrator::chunk_messages(&messages(95), "ctx");
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].messages.len(), 40);
        assert_eq!(chunks[2].messages.len(), 15);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.temporal_start <= chunk.temporal_end);
        }
        assert!(ExtractionOrchestrator::chunk_messages(&[], "ctx").is_empty());
    }

    #[test]
    fn test_submit_then_complete_stores_memories() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            BatchStatus::Processing,
            BatchStatus::Completed,
        ]));
        let (orchestrator, store) = orchestrator(Arc::clone(&provider));

        orchestrator
            .submit_segment_extraction(Uuid::new_v4(), Uuid::new_v4(), &messages(3))
            .unwrap();
        assert_eq!(provider.submissions.load(Ordering::SeqCst), 1);

        // First pass observes Processing.
        assert_eq!(orchestrator.poll_once().unwrap(), 0);
        // Second pass observes Completed and harvests.
        assert_eq!(orchestrator.poll_once().unwrap(), 1);

        let memories = store.all_memories(true).unwrap();
        assert_eq!(memories.len(), 1);
        assert!(memories[0].text.contains("Lisbon"));

        let batches = orchestrator.tracked_batches();
        assert_eq!(batches[0].status, BatchStatus::Completed);
        assert!(batches[0].completed_at.is_some());
    }

    #[test]
    fn test_replaying_completed_batch_is_noop() {
        let provider = Arc::new(ScriptedProvider::new(vec![BatchStatus::Completed]));
        let (orchestrator, store) = orchestrator(Arc::clone(&provider));

        orchestrator
            .submit_segment_extraction(Uuid::new_v4(), Uuid::new_v4(), &messages(2))
            .unwrap();
        assert_eq!(orchestrator.poll_once().unwrap(), 1);
        // Terminal batches are not polled again.
        assert_eq!(orchestrator.poll_once().unwrap(), 0);
        assert_eq!(orchestrator.poll_once().unwrap(), 0);

        assert_eq!(provider.results_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.all_memories(true).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_segment_submission_is_skipped() {
        let provider = Arc::new(ScriptedProvider::new(vec![BatchStatus::Completed]));
        let (orchestrator, _store) = orchestrator(Arc::clone(&provider));

        orchestrator
            .submit_segment_extraction(Uuid::new_v4(), Uuid::new_v4(), &[])
            .unwrap();
        assert_eq!(provider.submissions.load(Ordering::SeqCst), 0);
        assert!(orchestrator.tracked_batches().is_empty());
    }
}
