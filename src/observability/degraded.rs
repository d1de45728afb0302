//! Process-wide degraded-mode registry.
//!
//! Components that fall back to a reduced mode (pattern-only injection
//! defense, reranker unavailable) record it here so health checks can
//! surface the state. Entering degraded mode is always loud.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::Mutex;

static DEGRADED: Lazy<Mutex<BTreeMap<String, String>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Records that a component entered degraded mode, with a loud warning.
pub fn enter_degraded_mode(component: &str, reason: &str) {
    tracing::warn!("{}", "=".repeat(60));
    tracing::warn!("{component}: DEGRADED MODE");
    tracing::warn!("{reason}");
    tracing::warn!("{}", "=".repeat(60));

    if let Ok(mut map) = DEGRADED.lock() {
        map.insert(component.to_string(), reason.to_string());
    }
}

/// Clears a component's degraded state (dependency recovered).
pub fn clear_degraded(component: &str) {
    if let Ok(mut map) = DEGRADED.lock() {
        if map.remove(component).is_some() {
            tracing::info!("{component}: left degraded mode");
        }
    }
}

/// Whether a component is currently degraded.
#[must_use]
pub fn is_degraded(component: &str) -> bool {
    DEGRADED.lock().map(|map| map.contains_key(component)).unwrap_or(false)
}

/// Snapshot of all degraded components for health reporting.
#[must_use]
pub fn degraded_components() -> BTreeMap<String, String> {
    DEGRADED.lock().map(|map| map.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_clear() {
        enter_degraded_mode("test_component", "llm unreachable");
        assert!(is_degraded("test_component"));
        assert!(degraded_components().contains_key("test_component"));

        clear_degraded("test_component");
        assert!(!is_degraded("test_component"));
    }
}
