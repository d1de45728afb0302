//! Valkey working-memory cache and TTL persistence.
//!
//! Two pieces:
//!
//! - [`ValkeyClient`]: hash and counter operations with one 0.1 s-delayed
//!   retry on transient errors (fail-open for working-memory paths; callers
//!   on auth-critical paths propagate instead).
//! - [`TtlPersistence`]: the warning-key pattern. Each main key
//!   `prefix:<id>` with TTL `T` is accompanied by `prefix:<id>:warning`
//!   with TTL `T - warning_offset`. A keyspace-notification subscriber
//!   thread fires the registered handler when the warning key expires, so
//!   the value can be persisted before the main key itself dies.

use redis::Commands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{Error, Result};

/// Delay before the single retry on transient errors.
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Suffix of warning keys.
const WARNING_SUFFIX: &str = ":warning";

/// Valkey client with retrying hash and counter operations.
pub struct ValkeyClient {
    client: redis::Client,
}

impl ValkeyClient {
    /// Connects to a Valkey instance.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::op("valkey_connect", e))?;
        Ok(Self { client })
    }

    fn connection(&self) -> Result<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| Error::op("valkey_get_connection", e))
    }

    /// Runs an operation with one delayed retry on failure.
    fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let mut conn = self.connection()?;
        match f(&mut conn) {
            Ok(value) => Ok(value),
            Err(first_err) => {
                tracing::debug!("valkey {operation} failed ({first_err}), retrying once");
                std::thread::sleep(RETRY_DELAY);
                let mut conn = self.connection()?;
                f(&mut conn).map_err(|e| Error::op(operation, e))
            }
        }
    }

    /// Sets a hash field.
    pub fn hset_with_retry(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_retry("valkey_hset", |conn| conn.hset(key, field, value))
    }

    /// Reads a hash field.
    pub fn hget_with_retry(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_retry("valkey_hget", |conn| conn.hget(key, field))
    }

    /// Reads a whole hash.
    pub fn hgetall_with_retry(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_retry("valkey_hgetall", |conn| conn.hgetall(key))
    }

    /// Deletes hash fields.
    pub fn hdel_with_retry(&self, key: &str, field: &str) -> Result<()> {
        self.with_retry("valkey_hdel", |conn| conn.hdel(key, field))
    }

    /// Deletes a key.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.with_retry("valkey_del", |conn| conn.del(key))
    }

    /// Reads a plain string key.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_retry("valkey_get", |conn| conn.get(key))
    }

    /// Sets a plain string key with a TTL.
    pub fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<()> {
        self.with_retry("valkey_setex", |conn| {
            conn.set_ex(key, value, u64::try_from(ttl_seconds).unwrap_or(0))
        })
    }

    /// Remaining TTL of a key in seconds (negative when absent/no expiry).
    pub fn ttl(&self, key: &str) -> Result<i64> {
        self.with_retry("valkey_ttl", |conn| conn.ttl(key))
    }

    /// Increments a counter, setting the expiry only on the first increment.
    ///
    /// Subsequent increments must not reset the TTL; rate-limiter windows
    /// depend on it.
    pub fn increment_with_expiry(&self, key: &str, ttl_seconds: i64) -> Result<i64> {
        self.with_retry("valkey_incr", |conn| {
            let value: i64 = conn.incr(key, 1)?;
            if value == 1 {
                let _: bool = conn.expire(key, ttl_seconds)?;
            }
            Ok(value)
        })
    }

    /// Sets a main key's TTL and writes its warning companion.
    ///
    /// The warning key expires `warning_offset` seconds before the main
    /// key, giving the persistence handler its window.
    pub fn set_ttl_with_warning(
        &self,
        main_key: &str,
        ttl_seconds: i64,
        warning_offset: i64,
    ) -> Result<()> {
        let warning_ttl = (ttl_seconds - warning_offset).max(1);
        let warning_key = format!("{main_key}{WARNING_SUFFIX}");
        self.with_retry("valkey_ttl_with_warning", |conn| {
            let _: bool = conn.expire(main_key, ttl_seconds)?;
            conn.set_ex(&warning_key, "1", u64::try_from(warning_ttl).unwrap_or(1))
        })
    }
}

/// Handler invoked when a warning key expires: `(main_key, identifier)`.
type TtlHandler = Box<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;

struct RegisteredHandler {
    handler: TtlHandler,
    description: String,
}

/// Keyspace-notification-driven TTL persistence.
pub struct TtlPersistence {
    client: Arc<ValkeyClient>,
    handlers: Arc<Mutex<HashMap<String, RegisteredHandler>>>,
    shutdown: Arc<AtomicBool>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl TtlPersistence {
    /// Creates the persistence system over a shared client.
    #[must_use]
    pub fn new(client: Arc<ValkeyClient>) -> Self {
        Self {
            client,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            subscriber: Mutex::new(None),
        }
    }

    /// Registers a persistence handler for a key prefix.
    ///
    /// The handler must be idempotent: expiry notifications are at-least-
    /// once and a main key may be re-armed while a prior warning is in
    /// flight.
    pub fn register_ttl_handler<F>(&self, prefix: &str, handler: F, description: &str)
    where
        F: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(
                prefix.to_string(),
                RegisteredHandler {
                    handler: Box::new(handler),
                    description: description.to_string(),
                },
            );
            tracing::info!("registered TTL handler for prefix '{prefix}': {description}");
        }
    }

    /// Dispatches one expired-key notification.
    ///
    /// Only warning keys are interesting; the prefix before the first `:`
    /// selects the handler and the remainder is the identifier.
    fn dispatch_expiry(handlers: &Mutex<HashMap<String, RegisteredHandler>>, expired_key: &str) {
        let Some(main_key) = expired_key.strip_suffix(WARNING_SUFFIX) else {
            return;
        };
        let Some((prefix, identifier)) = main_key.split_once(':') else {
            return;
        };

        let Ok(guard) = handlers.lock() else { return };
        if let Some(registered) = guard.get(prefix) {
            tracing::debug!(
                "warning key expired for {main_key}, running '{}'",
                registered.description
            );
            if let Err(err) = (registered.handler)(main_key, identifier) {
                tracing::error!("TTL handler for prefix '{prefix}' failed: {err}");
            }
        }
    }

    /// Starts the keyspace-notification subscriber thread.
    ///
    /// Requires `notify-keyspace-events` to include expired events (`Ex`);
    /// the subscriber enables it on connect.
    pub fn start(&self, url: &str) -> Result<()> {
        let client = redis::Client::open(url).map_err(|e| Error::op("ttl_subscriber", e))?;

        // Make sure expiry notifications are on before subscribing.
        {
            let mut conn = self.client.connection()?;
            let _: std::result::Result<String, _> = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query(&mut conn);
        }

        let handlers = Arc::clone(&self.handlers);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::spawn(move || {
            tracing::info!("TTL persistence subscriber started");
            while !shutdown.load(Ordering::Acquire) {
                let mut conn = match client.get_connection() {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!("TTL subscriber reconnect failed: {err}");
                        std::thread::sleep(Duration::from_secs(1));
                        continue;
                    }
                };
                // Bounded reads keep the shutdown check responsive.
                if conn
                    .set_read_timeout(Some(Duration::from_millis(500)))
                    .is_err()
                {
                    continue;
                }
                let mut pubsub = conn.as_pubsub();
                if let Err(err) = pubsub.psubscribe("__keyevent@*__:expired") {
                    tracing::warn!("TTL subscriber psubscribe failed: {err}");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }

                while !shutdown.load(Ordering::Acquire) {
                    match pubsub.get_message() {
                        Ok(message) => {
                            let expired_key: String = message.get_payload().unwrap_or_default();
                            if !expired_key.is_empty() {
                                Self::dispatch_expiry(&handlers, &expired_key);
                            }
                        }
                        // Read timeout: loop back to check shutdown.
                        Err(err) if err.is_timeout() => {}
                        Err(err) => {
                            tracing::warn!("TTL subscriber connection lost: {err}");
                            break;
                        }
                    }
                }
            }
            tracing::info!("TTL persistence subscriber stopped");
        });

        if let Ok(mut slot) = self.subscriber.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Stops the subscriber thread and joins it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Ok(mut slot) = self.subscriber.lock() {
            if let Some(handle) = slot.take() {
                if handle.join().is_err() {
                    tracing::error!("TTL subscriber thread panicked during shutdown");
                }
            }
        }
    }

    /// Arms a main key with its warning companion (delegates to the client).
    pub fn set_ttl_with_warning(
        &self,
        main_key: &str,
        ttl_seconds: i64,
        warning_offset: i64,
    ) -> Result<()> {
        self.client
            .set_ttl_with_warning(main_key, ttl_seconds, warning_offset)
    }
}
