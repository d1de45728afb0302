//! # MIRA core
//!
//! The long-running engine behind the MIRA conversational assistant.
//!
//! MIRA keeps two correlated memories per user: a **continuum** (an
//! append-only, segmented conversation log whose inactive segments collapse
//! into summarized, embedding-indexed synopses) and an **LT-Memory** store
//! (facts extracted from collapsed segments, indexed by vector, BM25 and
//! entity links, with relationship discovery, refinement and consolidation).
//!
//! ## Architecture
//!
//! - Per-user storage: PostgreSQL (row-level security), per-user encrypted
//!   SQLite, a Valkey working-memory cache with TTL warning keys, and a
//!   Vault-backed secret cache.
//! - A synchronous typed event bus coordinates the segment lifecycle.
//! - LLM access goes through one provider-neutral facade (native Anthropic
//!   wire format, or any OpenAI-compatible endpoint via translation).
//! - Background workers (timeout scanner, batch poller, refinement pass)
//!   run on dedicated threads with cooperative shutdown.
//!
//! Transport (HTTP routes, CLI clients), concrete model providers and
//! peripheral tools live outside this crate; only their contracts are here.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use thiserror::Error as ThisError;

// Module declarations
pub mod api;
pub mod config;
pub mod continuum;
pub mod events;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod scheduler;
pub mod security;
pub mod storage;
pub mod tools;

// Re-exports for convenience
pub use config::MiraConfig;
pub use continuum::Continuum;
pub use events::EventBus;
pub use llm::{ChatModel, Embedder, LlmProvider, Reranker};
pub use models::{ContentBlock, ContinuumEvent, Memory, Message, MessageContent, Role};

/// Number of float components in every memory and segment embedding.
pub const EMBEDDING_DIM: usize = 768;

/// Number of float components in entity embeddings.
pub const ENTITY_EMBEDDING_DIM: usize = 300;

/// Error type for MIRA core operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait
/// implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Malformed input, unknown operation, empty required field |
/// | `NotFound` | Unknown id, missing segment, unknown Vault service or field |
/// | `PermissionDenied` | Auth failure, forbidden Vault path, cross-user access |
/// | `ContextOverflow` | Prompt exceeds the model's context window |
/// | `ToolNotLoaded` | Provider rejected a call to a tool absent from the request |
/// | `RateLimited` | Provider returned 429 |
/// | `OperationFailed` | I/O errors, database failures, provider 5xx |
/// | `Degraded` | A dependency is unavailable and a reduced mode was refused |
/// | `InvariantViolation` | Empty segment at collapse, embedding dimension mismatch |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Recovered locally where possible; returned as a structured error to
    /// the caller, never logged at error level unless unexpected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced entity does not exist.
    ///
    /// Surfaced to the caller; never silently substituted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication or authorization failed.
    ///
    /// Always raised, never degraded. Forbidden Vault paths use this variant
    /// without revealing whether the path exists.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The prompt exceeded the model's context window.
    ///
    /// Recoverable in segment summarization via hierarchical chunking;
    /// elsewhere surfaced.
    #[error("context overflow: prompt too large for model context")]
    ContextOverflow,

    /// The model attempted to use a tool that was not in the request.
    ///
    /// Converted by the orchestrator into a synthetic tool result that
    /// triggers lazy loading through `invokeother_tool`.
    #[error("tool '{tool_name}' not loaded")]
    ToolNotLoaded {
        /// Name of the tool the model attempted to call.
        tool_name: String,
    },

    /// The provider rate-limited the request.
    ///
    /// Surfaced so the orchestrator can back off; the retry policy is the
    /// caller's.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// A dependency is unavailable and the operation cannot run degraded.
    #[error("degraded dependency: {0}")]
    Degraded(String),

    /// A core invariant was violated.
    ///
    /// The caller either tombstones (segment collapse) or aborts.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// Builds an `OperationFailed` error from an operation name and cause.
    pub fn op(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for MIRA core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("missing field 'minutes'".to_string());
        assert_eq!(err.to_string(), "invalid input: missing field 'minutes'");

        let err = Error::ToolNotLoaded {
            tool_name: "maps_tool".to_string(),
        };
        assert_eq!(err.to_string(), "tool 'maps_tool' not loaded");

        let err = Error::op("segment_collapse", "summary generation failed");
        assert_eq!(
            err.to_string(),
            "operation 'segment_collapse' failed: summary generation failed"
        );
    }
}
