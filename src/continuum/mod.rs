//! Continuum engine: the per-user conversation aggregate and its segment
//! lifecycle (active → timed out → collapsed → summarized → embedded →
//! submitted downstream).

mod collapse;
#[allow(clippy::module_inception)]
mod continuum;
mod segments;
mod store;
mod summary;
mod timeout;
mod working_memory;

pub use collapse::{ExtractionSink, SegmentCollapseHandler};
pub use continuum::{ApiFormatOptions, Continuum};
pub use segments::{
    SegmentStatus, active_sentinel, collapse_sentinel, format_segment_for_display, is_sentinel,
    new_sentinel, segment_id_of, segment_messages, sentinel_status,
};
pub use store::{ActiveSegment, ContinuumStore};
pub use summary::{SegmentSummary, Summarizer, SummaryGenerator};
pub use timeout::SegmentTimeoutScanner;
pub use working_memory::{WorkingMemory, WorkingMemoryState};
