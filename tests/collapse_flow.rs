//! End-to-end segment lifecycle: timeout event → summarize → embed →
//! persist → publish → downstream extraction, all against in-memory
//! fakes of the storage and model seams.

use chrono::{DateTime, Utc};
use mira::continuum::{
    ActiveSegment, ContinuumStore, ExtractionSink, SegmentCollapseHandler, SegmentStatus,
    SegmentSummary, Summarizer, WorkingMemory, collapse_sentinel, new_sentinel, segment_id_of,
    sentinel_status,
};
use mira::events::EventBus;
use mira::models::{ContinuumEvent, Message, Role};
use mira::{EMBEDDING_DIM, Embedder};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct MemoryContinuumStore {
    sentinel: Mutex<Option<Message>>,
    messages: Mutex<Vec<Message>>,
    persisted_embedding: Mutex<Option<Vec<f32>>>,
}

impl ContinuumStore for MemoryContinuumStore {
    fn append_message(&self, _continuum_id: Uuid, message: &Message) -> mira::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn active_segments(&self) -> mira::Result<Vec<ActiveSegment>> {
        Ok(Vec::new())
    }

    fn load_sentinel(&self, _c: Uuid, _s: Uuid) -> mira::Result<Option<Message>> {
        Ok(self.sentinel.lock().unwrap().clone())
    }

    fn load_segment_messages(&self, _c: Uuid, _s: Uuid) -> mira::Result<Vec<Message>> {
        Ok(self.messages.lock().unwrap().clone())
    }

    fn last_user_message_time(&self, _c: Uuid) -> mira::Result<Option<DateTime<Utc>>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.created_at)
            .max())
    }

    fn persist_collapsed_sentinel(
        &self,
        _c: Uuid,
        sentinel: &Message,
        embedding: &[f32],
    ) -> mira::Result<()> {
        *self.sentinel.lock().unwrap() = Some(sentinel.clone());
        *self.persisted_embedding.lock().unwrap() = Some(embedding.to_vec());
        Ok(())
    }
}

struct CannedSummarizer;

impl Summarizer for CannedSummarizer {
    fn generate_summary(
        &self,
        messages: &[Message],
        _tools_used: &[String],
    ) -> mira::Result<SegmentSummary> {
        assert!(!messages.is_empty());
        Ok(SegmentSummary {
            synopsis: "Test summary".to_string(),
            display_title: "Test conversation".to_string(),
            complexity: 2,
        })
    }
}

struct UnitEmbedder;

impl Embedder for UnitEmbedder {
    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, _text: &str) -> mira::Result<Vec<f32>> {
        Ok(vec![0.05; EMBEDDING_DIM])
    }
}

struct CountingSink {
    submissions: Mutex<Vec<(Uuid, usize)>>,
}

impl ExtractionSink for CountingSink {
    fn submit_segment_extraction(
        &self,
        _user_id: Uuid,
        segment_id: Uuid,
        messages: &[Message],
    ) -> mira::Result<()> {
        self.submissions
            .lock()
            .unwrap()
            .push((segment_id, messages.len()));
        Ok(())
    }
}

#[test]
fn timeout_event_drives_full_collapse() {
    let sentinel = new_sentinel().unwrap();
    let segment_id = segment_id_of(&sentinel).unwrap();

    let store = Arc::new(MemoryContinuumStore {
        sentinel: Mutex::new(Some(sentinel)),
        messages: Mutex::new(vec![
            Message::new(Role::User, "first").unwrap(),
            Message::new(Role::Assistant, "second").unwrap(),
            Message::new(Role::User, "third").unwrap(),
        ]),
        persisted_embedding: Mutex::new(None),
    });
    let sink = Arc::new(CountingSink {
        submissions: Mutex::new(Vec::new()),
    });

    let handler = Arc::new(SegmentCollapseHandler::new(
        Arc::clone(&store) as Arc<dyn ContinuumStore>,
        Arc::new(CannedSummarizer),
        Arc::new(UnitEmbedder),
        Arc::clone(&sink) as Arc<dyn ExtractionSink>,
    ));

    let bus = Arc::new(EventBus::new());
    handler.subscribe(&bus);

    let collapsed_events = Arc::new(AtomicUsize::new(0));
    let collapsed_clone = Arc::clone(&collapsed_events);
    bus.subscribe("SegmentCollapsedEvent", move |event| {
        if let ContinuumEvent::SegmentCollapsed {
            summary,
            display_title,
            complexity,
            ..
        } = event
        {
            assert_eq!(summary, "Test summary");
            assert_eq!(display_title, "Test conversation");
            assert_eq!(*complexity, 2);
        }
        collapsed_clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    bus.publish(&ContinuumEvent::SegmentTimeout {
        continuum_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        segment_id,
        inactive_duration_minutes: 120,
        local_hour: 15,
    });

    // The sentinel collapsed in place with the synopsis as content.
    let sentinel = store.sentinel.lock().unwrap().clone().unwrap();
    assert_eq!(sentinel_status(&sentinel), Some(SegmentStatus::Collapsed));
    assert_eq!(sentinel.content.text(), "Test summary");

    // The 768-d embedding landed with it.
    let embedding = store.persisted_embedding.lock().unwrap().clone().unwrap();
    assert_eq!(embedding.len(), EMBEDDING_DIM);

    // One collapse event, one downstream submission with the same messages.
    assert_eq!(collapsed_events.load(Ordering::SeqCst), 1);
    let submissions = sink.submissions.lock().unwrap();
    assert_eq!(submissions.as_slice(), &[(segment_id, 3)]);

    // Firing the timeout again is a no-op: the sentinel is terminal.
    bus.publish(&ContinuumEvent::SegmentTimeout {
        continuum_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        segment_id,
        inactive_duration_minutes: 240,
        local_hour: 16,
    });
    assert_eq!(collapsed_events.load(Ordering::SeqCst), 1);
}

#[test]
fn postpone_collapse_bounds_and_effect() {
    let working_memory = WorkingMemory::new();
    let user = Uuid::new_v4();
    let continuum = Uuid::new_v4();

    assert!(working_memory.postpone_collapse(user, continuum, 0).is_err());
    assert!(working_memory.postpone_collapse(user, continuum, 1441).is_err());

    let until = working_memory.postpone_collapse(user, continuum, 90).unwrap();
    assert_eq!(
        working_memory.virtual_last_message_time(user, continuum),
        Some(until)
    );
}

#[test]
fn collapsed_sentinel_round_trips_through_serde() {
    let sentinel = new_sentinel().unwrap();
    let collapsed =
        collapse_sentinel(&sentinel, "We set up the garden.", "Garden setup", 1, &[]).unwrap();

    let json = serde_json::to_string(&collapsed).unwrap();
    let back: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(back, collapsed);
    assert_eq!(sentinel_status(&back), Some(SegmentStatus::Collapsed));
}
