//! Background workers and cooperative shutdown.
//!
//! Every worker runs on a dedicated thread and checks the shared shutdown
//! signal between units of work. Nothing interrupts an in-flight LLM call;
//! it completes or times out on its own.

mod thread_monitor;

pub use thread_monitor::{OperationGuard, ThreadMonitor};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Owns worker threads and the shared shutdown signal.
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Creates an idle scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// The shared shutdown signal, for workers that spawn themselves
    /// (timeout scanner, batch poller).
    #[must_use]
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Adopts an externally spawned worker for joined shutdown.
    pub fn adopt(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.workers.push((name.into(), handle));
    }

    /// Spawns a periodic job; `job` runs once per interval until shutdown.
    pub fn spawn_periodic<F>(&mut self, name: &str, interval: Duration, job: F)
    where
        F: Fn() -> crate::Result<()> + Send + 'static,
    {
        let shutdown = Arc::clone(&self.shutdown);
        let job_name = name.to_string();
        let handle = std::thread::spawn(move || {
            tracing::info!("worker '{job_name}' started ({}s interval)", interval.as_secs());
            while !shutdown.load(Ordering::Acquire) {
                if let Err(err) = job() {
                    tracing::error!("worker '{job_name}' iteration failed: {err}");
                }
                // Sleep in short slices so shutdown stays responsive.
                let mut remaining = interval;
                while !shutdown.load(Ordering::Acquire) && remaining > Duration::ZERO {
                    let slice = remaining.min(Duration::from_millis(500));
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
            tracing::info!("worker '{job_name}' stopped");
        });
        self.workers.push((name.to_string(), handle));
    }

    /// Signals shutdown and joins every worker.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker '{name}' panicked during shutdown");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
