//! Synchronous typed event bus.
//!
//! Publishing runs every matching handler on the publisher's thread, in
//! registration order. A handler error is logged and does not stop later
//! handlers. No cross-publisher ordering is guaranteed; handlers must be
//! short or enqueue further work to a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Result;
use crate::models::ContinuumEvent;

type Handler = Arc<dyn Fn(&ContinuumEvent) -> Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken {
    event_type: &'static str,
    id: u64,
}

/// Synchronous in-process pub/sub keyed by event type name.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<&'static str, Vec<Subscriber>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a handler to one event type.
    ///
    /// Handlers for the same type run in registration order.
    pub fn subscribe<F>(&self, event_type: &'static str, handler: F) -> SubscriptionToken
    where
        F: Fn(&ContinuumEvent) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.subscribers.lock() {
            map.entry(event_type).or_default().push(Subscriber {
                id,
                handler: Arc::new(handler),
            });
        }
        tracing::debug!("subscribed to {event_type} events");
        SubscriptionToken { event_type, id }
    }

    /// Removes a previously registered handler.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Ok(mut map) = self.subscribers.lock() {
            if let Some(subscribers) = map.get_mut(token.event_type) {
                let before = subscribers.len();
                subscribers.retain(|s| s.id != token.id);
                if subscribers.len() == before {
                    tracing::warn!("callback not found in {} subscribers", token.event_type);
                }
            }
        }
    }

    /// Publishes an event to all subscribers of its type.
    ///
    /// Errors from individual handlers are logged and swallowed; every
    /// handler gets its turn. The subscriber list is snapshotted outside the
    /// dispatch so handlers may themselves subscribe or publish.
    pub fn publish(&self, event: &ContinuumEvent) {
        if self.shut_down.load(Ordering::Acquire) {
            tracing::warn!("event {} published after shutdown, dropped", event.event_type());
            return;
        }

        let event_type = event.event_type();
        tracing::debug!("publishing event: {event_type}");

        // Snapshot handler ids first; the handler itself runs with the
        // lock released so a handler may subscribe or publish reentrantly.
        let ids: Vec<u64> = self
            .subscribers
            .lock()
            .map(|map| {
                map.get(event_type)
                    .map(|subs| subs.iter().map(|s| s.id).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        let mut delivered = 0usize;
        for id in ids {
            let handler = {
                let guard = match self.subscribers.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                guard
                    .get(event_type)
                    .and_then(|subs| subs.iter().find(|s| s.id == id))
                    .map(|subscriber| Arc::clone(&subscriber.handler))
            };
            // A missing handler was unsubscribed between snapshot and
            // dispatch; skip it.
            let Some(handler) = handler else { continue };
            delivered += 1;
            if let Err(err) = handler(event) {
                tracing::error!("error in event subscriber for {event_type}: {err}");
            }
        }

        tracing::debug!("event {event_type} delivered to {delivered} subscribers");
    }

    /// Number of subscribers for an event type.
    #[must_use]
    pub fn get_subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .lock()
            .map(|map| map.get(event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Clears subscribers for one event type, or all when `None`.
    pub fn clear_subscribers(&self, event_type: Option<&str>) {
        if let Ok(mut map) = self.subscribers.lock() {
            match event_type {
                Some(event_type) => {
                    map.remove(event_type);
                    tracing::info!("cleared subscribers for {event_type}");
                }
                None => {
                    map.clear();
                    tracing::info!("cleared all event subscribers");
                }
            }
        }
    }

    /// Shuts the bus down: clears subscribers and drops later publishes.
    pub fn shutdown(&self) {
        tracing::info!("shutting down event bus");
        self.shut_down.store(true, Ordering::Release);
        self.clear_subscribers(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn manifest_event() -> ContinuumEvent {
        ContinuumEvent::ManifestUpdated {
            continuum_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe("ManifestUpdatedEvent", move |_| {
                order.lock().unwrap().push(label);
                Ok(())
            });
        }

        bus.publish(&manifest_event());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_handler_error_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("ManifestUpdatedEvent", |_| {
            Err(crate::Error::InvalidInput("boom".into()))
        });
        let hits_clone = Arc::clone(&hits);
        bus.subscribe("ManifestUpdatedEvent", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(&manifest_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let token = bus.subscribe("ManifestUpdatedEvent", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(&manifest_event());
        bus.unsubscribe(token);
        bus.publish(&manifest_event());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_subscriber_count("ManifestUpdatedEvent"), 0);
    }

    #[test]
    fn test_only_matching_type_receives() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.subscribe("SegmentCollapsedEvent", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(&manifest_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drops_publishes() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        bus.subscribe("ManifestUpdatedEvent", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.shutdown();
        bus.publish(&manifest_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
