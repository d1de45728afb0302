//! Domain model types.

mod batch;
mod events;
mod memory;
mod message;

pub use batch::{BatchKind, BatchStatus, ExtractionBatch, PostProcessingBatch};
pub use events::ContinuumEvent;
pub use memory::{
    ConsolidationCluster, Entity, EntityLink, ExtractedMemory, LinkRef, LinkType, Memory,
    MemoryLink, ProcessingChunk, RefinementCandidate, SearchIntent,
};
pub use message::{ContentBlock, Message, MessageContent, Role};
