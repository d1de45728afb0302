//! Tracing subscriber initialisation.

use tracing_subscriber::EnvFilter;

/// Logging options for subscriber initialisation.
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
    /// Filter directive, overriding `RUST_LOG` (e.g. `mira=debug`).
    pub filter: Option<String>,
}

/// Initialises the global tracing subscriber.
///
/// Safe to call more than once; subsequent calls are no-ops (the first
/// subscriber wins, which keeps tests that race on init quiet).
pub fn init_logging(options: &LoggingOptions) {
    let filter = options.filter.as_ref().map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        |directive| EnvFilter::new(directive.clone()),
    );

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already initialised");
    }
}
