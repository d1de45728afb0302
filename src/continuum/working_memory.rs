//! Working memory: volatile per-user process state mirrored in Valkey.
//!
//! Keyed by `(user_id, continuum_id)`. Holds the pieces of persistent state
//! the reply loop touches every turn (active tools, enabled domaindocs,
//! counters) plus the virtual last-message time that `postpone_collapse`
//! manipulates. Counters are mirrored to Valkey for cross-process
//! durability; everything else dies with the process.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::events::EventBus;
use crate::models::ContinuumEvent;
use crate::storage::ValkeyClient;
use crate::{Error, Result};

/// Per-continuum working state.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemoryState {
    /// Tools currently loaded for the reply loop.
    pub active_tools: Vec<String>,
    /// Domaindoc labels included in the system context.
    pub enabled_domaindocs: Vec<String>,
    /// Named counters (turns, tool calls, ...), mirrored to Valkey.
    pub counters: HashMap<String, i64>,
    /// Override for the last-message time, set by `postpone_collapse`.
    pub virtual_last_message_time: Option<DateTime<Utc>>,
}

/// Process-wide working-memory registry.
#[derive(Default)]
pub struct WorkingMemory {
    states: Mutex<HashMap<(Uuid, Uuid), WorkingMemoryState>>,
}

impl WorkingMemory {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a snapshot of one continuum's state.
    #[must_use]
    pub fn snapshot(&self, user_id: Uuid, continuum_id: Uuid) -> WorkingMemoryState {
        self.states
            .lock()
            .map(|map| map.get(&(user_id, continuum_id)).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Mutates one continuum's state and publishes the update event.
    pub fn update<F>(
        &self,
        user_id: Uuid,
        continuum_id: Uuid,
        categories: &[&str],
        bus: Option<&EventBus>,
        mutate: F,
    ) where
        F: FnOnce(&mut WorkingMemoryState),
    {
        if let Ok(mut map) = self.states.lock() {
            mutate(map.entry((user_id, continuum_id)).or_default());
        }
        if let Some(bus) = bus {
            bus.publish(&ContinuumEvent::WorkingMemoryUpdated {
                continuum_id,
                updated_categories: categories.iter().map(ToString::to_string).collect(),
            });
        }
    }

    /// Extends the active window without requiring a new user turn.
    ///
    /// `minutes` must be within `[1, 1440]`; the bound error message names
    /// the range for the API layer to surface.
    pub fn postpone_collapse(
        &self,
        user_id: Uuid,
        continuum_id: Uuid,
        minutes: i64,
    ) -> Result<DateTime<Utc>> {
        if !(1..=1440).contains(&minutes) {
            return Err(Error::InvalidInput(
                "minutes must be between 1 and 1440".to_string(),
            ));
        }
        let until = Utc::now() + Duration::minutes(minutes);
        self.update(user_id, continuum_id, &["collapse_postponed"], None, |state| {
            state.virtual_last_message_time = Some(until);
        });
        tracing::info!("collapse for continuum {continuum_id} postponed {minutes} minutes");
        Ok(until)
    }

    /// The virtual last-message time, if a postpone is in effect.
    #[must_use]
    pub fn virtual_last_message_time(
        &self,
        user_id: Uuid,
        continuum_id: Uuid,
    ) -> Option<DateTime<Utc>> {
        self.states
            .lock()
            .ok()
            .and_then(|map| map.get(&(user_id, continuum_id))?.virtual_last_message_time)
    }

    /// Increments a counter and mirrors it to Valkey when a client is given.
    ///
    /// The Valkey write is fail-open: a cache glitch must not break the
    /// reply loop.
    pub fn increment_counter(
        &self,
        user_id: Uuid,
        continuum_id: Uuid,
        counter: &str,
        valkey: Option<&Arc<ValkeyClient>>,
    ) -> i64 {
        let mut value = 0;
        if let Ok(mut map) = self.states.lock() {
            let state = map.entry((user_id, continuum_id)).or_default();
            let entry = state.counters.entry(counter.to_string()).or_insert(0);
            *entry += 1;
            value = *entry;
        }
        if let Some(valkey) = valkey {
            let key = format!("workingmem:{user_id}:{continuum_id}:{counter}");
            if let Err(err) = valkey.hset_with_retry(&key, "value", &value.to_string()) {
                tracing::warn!("working-memory counter mirror failed for {key}: {err}");
            }
        }
        value
    }

    /// Drops all state for a user (data deletion, logout).
    pub fn forget_user(&self, user_id: Uuid) {
        if let Ok(mut map) = self.states.lock() {
            map.retain(|(owner, _), _| *owner != user_id);
        }
    }
}
