//! Segment inactivity scanning.
//!
//! A scheduled scan walks every continuum with an active segment, computes
//! `idle = now - (last user message | virtual last-message time)`, and
//! publishes a `SegmentTimeoutEvent` when the idle time crosses the
//! per-local-hour inactivity threshold. The collapse handler does the rest.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::store::ContinuumStore;
use super::working_memory::WorkingMemory;
use crate::config::ContinuumConfig;
use crate::events::EventBus;
use crate::models::ContinuumEvent;
use crate::Result;

/// Periodic inactivity scanner.
pub struct SegmentTimeoutScanner {
    store: Arc<dyn ContinuumStore>,
    working_memory: Arc<WorkingMemory>,
    bus: Arc<EventBus>,
    config: ContinuumConfig,
}

impl SegmentTimeoutScanner {
    /// Creates a scanner.
    #[must_use]
    pub fn new(
        store: Arc<dyn ContinuumStore>,
        working_memory: Arc<WorkingMemory>,
        bus: Arc<EventBus>,
        config: ContinuumConfig,
    ) -> Self {
        Self {
            store,
            working_memory,
            bus,
            config,
        }
    }

    /// Runs one scan pass; returns the number of timeout events published.
    pub fn scan_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0usize;

        for segment in self.store.active_segments()? {
            let last_user = self
                .store
                .last_user_message_time(segment.continuum_id)?;
            let virtual_time = self
                .working_memory
                .virtual_last_message_time(segment.user_id, segment.continuum_id);

            // The postpone override wins when it is later than the real
            // last message.
            let effective = match (last_user, virtual_time) {
                (Some(real), Some(virt)) => Some(real.max(virt)),
                (real, virt) => real.or(virt),
            };
            let Some(effective) = effective else {
                // Segment with no user messages yet; collapse would violate
                // the non-empty invariant anyway.
                continue;
            };

            let local_hour = Self::local_hour(now, segment.timezone.as_deref());
            let threshold = self.config.inactivity_threshold_minutes(local_hour);
            let idle_minutes = (now - effective).num_minutes();

            if idle_minutes >= threshold {
                tracing::info!(
                    "segment {} idle {idle_minutes}m (threshold {threshold}m at hour {local_hour})",
                    segment.segment_id
                );
                self.bus.publish(&ContinuumEvent::SegmentTimeout {
                    continuum_id: segment.continuum_id,
                    user_id: segment.user_id,
                    segment_id: segment.segment_id,
                    inactive_duration_minutes: idle_minutes,
                    local_hour,
                });
                fired += 1;
            }
        }

        Ok(fired)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn local_hour(now: DateTime<Utc>, timezone: Option<&str>) -> u8 {
        timezone
            .and_then(|name| name.parse::<Tz>().ok())
            .map_or_else(|| now.hour() as u8, |tz| now.with_timezone(&tz).hour() as u8)
    }

    /// Spawns the scan loop on a dedicated thread.
    ///
    /// The loop checks `shutdown` between passes; it never interrupts a
    /// pass in flight.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            tracing::info!("segment timeout scanner started ({}s interval)", interval.as_secs());
            while !shutdown.load(Ordering::Acquire) {
                match self.scan_once(Utc::now()) {
                    Ok(0) => {}
                    Ok(fired) => tracing::debug!("timeout scan fired {fired} events"),
                    Err(err) => tracing::error!("timeout scan failed: {err}"),
                }
                // Sleep in short slices so shutdown stays responsive.
                let mut remaining = interval;
                while !shutdown.load(Ordering::Acquire) && remaining > Duration::ZERO {
                    let slice = remaining.min(Duration::from_millis(500));
                    std::thread::sleep(slice);
                    remaining = remaining.saturating_sub(slice);
                }
            }
            tracing::info!("segment timeout scanner stopped");
        })
    }
}
