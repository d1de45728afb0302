//! Transport-neutral API handlers.
//!
//! The HTTP layer (an external collaborator) calls these and maps
//! [`ApiError::status`] onto response codes. Success and failure both use
//! the envelope `{success, data|error{code,message}, meta{timestamp,
//! request_id}}`.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::continuum::WorkingMemory;
use crate::memory::MemoryStore;
use crate::observability::degraded_components;
use crate::{Error, Result};

/// Domains the actions endpoint routes.
const KNOWN_DOMAINS: &[&str] = &[
    "reminder",
    "memory",
    "user",
    "contacts",
    "continuum",
    "domain_knowledge",
];

/// A structured API failure with its HTTP status.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status the transport should use.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    /// A 400 validation failure.
    #[must_use]
    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: 400,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// A 404 failure.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: 404,
            code: "not_found".to_string(),
            message: message.into(),
        }
    }

    /// A 422 failure (unknown domain).
    #[must_use]
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: 422,
            code: "unprocessable".to_string(),
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::InvalidInput(message) => Self::bad_request("invalid_input", message.clone()),
            Error::NotFound(message) => Self::not_found(message.clone()),
            Error::PermissionDenied(message) => Self {
                status: 403,
                code: "permission_denied".to_string(),
                message: message.clone(),
            },
            Error::RateLimited(message) => Self {
                status: 429,
                code: "rate_limited".to_string(),
                message: message.clone(),
            },
            _ => Self {
                status: 500,
                code: "internal".to_string(),
                message: err.to_string(),
            },
        }
    }
}

/// Wraps a payload in the success envelope.
#[must_use]
pub fn success_envelope(data: Value, request_id: Option<&str>) -> Value {
    json!({
        "success": true,
        "data": data,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "request_id": request_id,
        }
    })
}

/// Wraps a failure in the error envelope.
#[must_use]
pub fn error_envelope(error: &ApiError, request_id: Option<&str>) -> Value {
    json!({
        "success": false,
        "error": {"code": error.code, "message": error.message},
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "request_id": request_id,
        }
    })
}

/// Shapes a reply-loop outcome for the chat endpoint:
/// `{response, metadata{tools_used}}`.
#[must_use]
pub fn chat_response(outcome: &crate::orchestrator::ChatOutcome) -> Value {
    json!({
        "response": outcome.response,
        "metadata": {"tools_used": outcome.tools_used},
    })
}

/// Handler for one action domain.
pub trait DomainHandler: Send + Sync {
    /// Handles one action; `data` is the request body.
    fn handle(&self, action: &str, data: &Value) -> std::result::Result<Value, ApiError>;
}

/// Trigger seam for explicit segment collapse.
///
/// Returns `Ok(true)` when a segment collapsed, `Ok(false)` when there was
/// no active segment.
pub trait CollapseTrigger: Send + Sync {
    /// Collapses the user's active segment, if any.
    fn collapse_active_segment(&self, user_id: Uuid) -> Result<bool>;
}

/// Built-in handler for the `continuum` domain.
pub struct ContinuumActions {
    working_memory: Arc<WorkingMemory>,
    collapse: Arc<dyn CollapseTrigger>,
    user_id: Uuid,
    continuum_id: Uuid,
}

impl ContinuumActions {
    /// Creates the handler bound to one request's user and continuum.
    #[must_use]
    pub fn new(
        working_memory: Arc<WorkingMemory>,
        collapse: Arc<dyn CollapseTrigger>,
        user_id: Uuid,
        continuum_id: Uuid,
    ) -> Self {
        Self {
            working_memory,
            collapse,
            user_id,
            continuum_id,
        }
    }
}

impl DomainHandler for ContinuumActions {
    fn handle(&self, action: &str, data: &Value) -> std::result::Result<Value, ApiError> {
        match action {
            "postpone_collapse" => {
                let Some(minutes) = data.get("minutes") else {
                    return Err(ApiError::bad_request(
                        "missing_field",
                        "missing required field 'minutes'",
                    ));
                };
                let Some(minutes) = minutes.as_i64() else {
                    return Err(ApiError::bad_request(
                        "invalid_field",
                        "'minutes' must be an integer",
                    ));
                };
                let until = self
                    .working_memory
                    .postpone_collapse(self.user_id, self.continuum_id, minutes)
                    .map_err(ApiError::from)?;
                Ok(json!({"postponed_until": until.to_rfc3339()}))
            }
            "collapse_segment" => {
                let collapsed = self
                    .collapse
                    .collapse_active_segment(self.user_id)
                    .map_err(ApiError::from)?;
                if collapsed {
                    Ok(json!({"collapsed": true}))
                } else {
                    Err(ApiError::not_found("no active segment"))
                }
            }
            _ => Err(ApiError::bad_request("unknown_action", "unknown")),
        }
    }
}

/// Routes `actions(domain, action, data)` requests.
#[derive(Default)]
pub struct ActionsRouter {
    handlers: HashMap<String, Box<dyn DomainHandler>>,
}

impl ActionsRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a domain handler.
    pub fn register(&mut self, domain: &str, handler: Box<dyn DomainHandler>) {
        self.handlers.insert(domain.to_string(), handler);
    }

    /// Dispatches one action request.
    ///
    /// Unknown domain ⇒ 422; known domain with no handler or unknown
    /// action ⇒ 400 `"unknown"`.
    pub fn dispatch(
        &self,
        domain: &str,
        action: &str,
        data: &Value,
    ) -> std::result::Result<Value, ApiError> {
        if !KNOWN_DOMAINS.contains(&domain) {
            return Err(ApiError::unprocessable(format!("unknown domain '{domain}'")));
        }
        let Some(handler) = self.handlers.get(domain) else {
            return Err(ApiError::bad_request("unknown_action", "unknown"));
        };
        handler.handle(action, data)
    }
}

/// Pagination window for data reads.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// 1-based page number.
    pub page: usize,
    /// Items per page.
    pub page_size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

fn paginate<T: serde::Serialize>(items: &[T], page: Page) -> Value {
    let total = items.len();
    let start = (page.page.saturating_sub(1)) * page.page_size;
    let window: Vec<&T> = items.iter().skip(start).take(page.page_size).collect();
    json!({
        "items": window,
        "meta": {
            "page": page.page,
            "page_size": page.page_size,
            "total": total,
        }
    })
}

/// The `data` read endpoint.
pub struct DataReader {
    memory_store: Arc<dyn MemoryStore>,
}

impl DataReader {
    /// Creates the reader.
    #[must_use]
    pub fn new(memory_store: Arc<dyn MemoryStore>) -> Self {
        Self { memory_store }
    }

    /// Reads one data type with pagination.
    pub fn read(
        &self,
        data_type: &str,
        history: &[crate::models::Message],
        user_profile: &Value,
        page: Page,
    ) -> std::result::Result<Value, ApiError> {
        match data_type {
            "history" => Ok(paginate(history, page)),
            "memories" => {
                let memories = self
                    .memory_store
                    .all_memories(false)
                    .map_err(ApiError::from)?;
                Ok(paginate(&memories, page))
            }
            "user" => Ok(json!({"items": [user_profile], "meta": {"page": 1, "page_size": 1, "total": 1}})),
            other => Err(ApiError::bad_request(
                "invalid_type",
                format!("unsupported data type '{other}'"),
            )),
        }
    }
}

/// Database latency probe for health checks.
pub trait HealthProbe: Send + Sync {
    /// Pings the database; returns latency in milliseconds.
    fn ping_database(&self) -> Result<f64>;
}

/// Builds the health payload: component latencies plus degraded modes.
#[must_use]
pub fn health(probe: Option<&dyn HealthProbe>) -> Value {
    let database = probe.map_or_else(
        || json!({"status": "unknown"}),
        |probe| match probe.ping_database() {
            Ok(latency_ms) => json!({"status": "ok", "latency_ms": latency_ms}),
            Err(err) => json!({"status": "error", "error": err.to_string()}),
        },
    );

    let degraded = degraded_components();
    let status = if database.get("status") == Some(&json!("error")) {
        "unhealthy"
    } else if degraded.is_empty() {
        "ok"
    } else {
        "degraded"
    };

    json!({
        "status": status,
        "components": {
            "database": database,
            "degraded": degraded,
        }
    })
}
