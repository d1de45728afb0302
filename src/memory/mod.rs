//! LT-Memory pipeline: vector operations, hybrid retrieval with entity
//! priming, relationship linking, refinement/consolidation, and batch
//! extraction.

mod extraction;
mod hybrid;
mod linking;
mod refinement;
mod store;
mod vector_ops;

pub use extraction::{BatchLedger, BatchProvider, ExtractionOrchestrator, NullLedger};
pub use hybrid::{CapitalizedSpanExtractor, EntityExtractor, HybridSearcher};
pub use linking::{LinkStatistics, LinkingService, TraversedMemory};
pub use refinement::{RefinementAction, RefinementOutcome, RefinementService};
pub use store::{MemoryStore, PgMemoryStore};
pub use vector_ops::VectorOps;
