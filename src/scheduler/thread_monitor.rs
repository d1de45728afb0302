//! Long-operation monitoring.
//!
//! Records the start and end of long-running operations. A watchdog pass
//! warns when an operation crosses 30 s and errors (dumping the registry
//! to `/tmp/thread_dump_<epoch>.txt`) at 300 s, once per operation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Warn threshold for long operations.
const WARN_AFTER: Duration = Duration::from_secs(30);
/// Error-and-dump threshold for long operations.
const DUMP_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct TrackedOperation {
    name: String,
    detail: String,
    started_at: DateTime<Utc>,
    warned: bool,
    dumped: bool,
}

/// Registry of in-flight long operations.
#[derive(Default)]
pub struct ThreadMonitor {
    operations: Mutex<HashMap<u64, TrackedOperation>>,
    next_id: AtomicU64,
}

/// RAII guard that ends an operation when dropped.
pub struct OperationGuard {
    monitor: Arc<ThreadMonitor>,
    id: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.monitor.end(self.id);
    }
}

impl ThreadMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an operation; the guard ends it.
    #[must_use]
    pub fn begin(
        self: &Arc<Self>,
        name: impl Into<String>,
        detail: impl Into<String>,
    ) -> OperationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut operations) = self.operations.lock() {
            operations.insert(
                id,
                TrackedOperation {
                    name: name.into(),
                    detail: detail.into(),
                    started_at: Utc::now(),
                    warned: false,
                    dumped: false,
                },
            );
        }
        OperationGuard {
            monitor: Arc::clone(self),
            id,
        }
    }

    fn end(&self, id: u64) {
        if let Ok(mut operations) = self.operations.lock() {
            if let Some(op) = operations.remove(&id) {
                let elapsed = Utc::now() - op.started_at;
                tracing::debug!(
                    "operation '{}' finished after {}s",
                    op.name,
                    elapsed.num_seconds()
                );
            }
        }
    }

    /// Number of in-flight operations.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.operations.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    /// One watchdog pass; returns `(warned, dumped)` counts.
    ///
    /// Run periodically from the scheduler.
    pub fn check(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut warned = 0usize;
        let mut dumped = 0usize;
        let mut dump_needed: Option<String> = None;

        if let Ok(mut operations) = self.operations.lock() {
            for op in operations.values_mut() {
                let elapsed = (now - op.started_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                if elapsed >= DUMP_AFTER && !op.dumped {
                    op.dumped = true;
                    dumped += 1;
                    tracing::error!(
                        "operation '{}' running for {}s ({}), dumping thread state",
                        op.name,
                        elapsed.as_secs(),
                        op.detail
                    );
                } else if elapsed >= WARN_AFTER && !op.warned {
                    op.warned = true;
                    warned += 1;
                    tracing::warn!(
                        "operation '{}' running for {}s ({})",
                        op.name,
                        elapsed.as_secs(),
                        op.detail
                    );
                }
            }
            if dumped > 0 {
                dump_needed = Some(Self::render_dump(operations.values()));
            }
        }

        if let Some(dump) = dump_needed {
            let path = format!("/tmp/thread_dump_{}.txt", Utc::now().timestamp());
            if let Err(err) = std::fs::write(&path, dump) {
                tracing::error!("failed to write thread dump {path}: {err}");
            } else {
                tracing::error!("thread dump written to {path}");
            }
        }

        (warned, dumped)
    }

    fn render_dump<'a>(operations: impl Iterator<Item = &'a TrackedOperation>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "MIRA thread dump at {}", Utc::now().to_rfc3339());
        for op in operations {
            let _ = writeln!(
                out,
                "- {} (since {}): {}",
                op.name,
                op.started_at.to_rfc3339(),
                op.detail
            );
        }
        out
    }
}
