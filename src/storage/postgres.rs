//! PostgreSQL access with per-user row-level security.
//!
//! Pools are shared per database name and lazily initialized. Every
//! checked-out connection gets `app.current_user_id` set from the ambient
//! user context (or cleared for system-level work) before user-scoped
//! statements run; RLS policies restrict visibility to the matching
//! `user_id`. JSONB comes back as native values, UUIDs bind as parameters
//! directly, and `json_insert` injects `user_id` and the timestamp columns
//! for the tables that require them without mutating the caller's map.
//!
//! The crate's core is synchronous; queries run on the deadpool async pool
//! through a `block_on` bridge (current runtime handle when one exists, a
//! private fallback runtime otherwise).

use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::runtime::Handle;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::continuum::{ActiveSegment, ContinuumStore};
use crate::models::Message;
use crate::observability::current_context;
use crate::{Error, Result};

/// Tables that carry `created_at` / `updated_at` columns this layer owns.
const TIMESTAMPED_TABLES: &[&str] = &[
    "memories",
    "entities",
    "extraction_batches",
    "post_processing_batches",
];

static FALLBACK_RUNTIME: Lazy<Option<tokio::runtime::Runtime>> = Lazy::new(|| {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .ok()
});

/// Runs a future to completion from synchronous code.
fn block_on<F, T>(future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    if let Ok(handle) = Handle::try_current() {
        return tokio::task::block_in_place(|| handle.block_on(future));
    }
    FALLBACK_RUNTIME
        .as_ref()
        .ok_or_else(|| Error::op("postgres_runtime", "no tokio runtime available"))?
        .block_on(future)
}

/// A typed SQL parameter, bridging JSON values and the wire protocol.
///
/// UUIDs bind natively; JSON trees bind as JSONB; everything the protocol
/// cannot express (sets) must be turned into a list first.
#[derive(Debug, Clone)]
pub enum SqlParam {
    /// SQL NULL.
    Null,
    /// BOOL.
    Bool(bool),
    /// BIGINT.
    Int(i64),
    /// DOUBLE PRECISION.
    Float(f64),
    /// TEXT.
    Text(String),
    /// UUID.
    Uuid(Uuid),
    /// JSONB.
    Json(Value),
    /// TIMESTAMPTZ.
    Timestamp(DateTime<Utc>),
    /// TEXT[].
    TextArray(Vec<String>),
}

impl SqlParam {
    /// Converts a JSON value to a parameter, detecting UUID strings.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(0.0)), Self::Int),
            Value::String(s) => Uuid::parse_str(s).map_or_else(
                |_| Self::Text(s.clone()),
                Self::Uuid,
            ),
            other => Self::Json(other.clone()),
        }
    }

    fn as_dyn(&self) -> &(dyn ToSql + Sync) {
        static NULL: Option<String> = None;
        match self {
            Self::Null => &NULL,
            Self::Bool(b) => b,
            Self::Int(i) => i,
            Self::Float(f) => f,
            Self::Text(s) => s,
            Self::Uuid(u) => u,
            Self::Json(v) => v,
            Self::Timestamp(t) => t,
            Self::TextArray(a) => a,
        }
    }
}

fn dyn_params(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(SqlParam::as_dyn).collect()
}

/// Shared pool registry, one pool per database name.
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Pool>>,
}

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pool for a database, creating it on first use.
    pub fn pool(&self, database: &str, url: &str) -> Result<Pool> {
        if let Ok(pools) = self.pools.lock() {
            if let Some(pool) = pools.get(database) {
                return Ok(pool.clone());
            }
        }

        let pg_config: tokio_postgres::Config = url
            .parse()
            .map_err(|e| Error::op("postgres_parse_url", e))?;
        let mut cfg = PoolConfig::new();
        cfg.host = pg_config.get_hosts().first().map(|host| match host {
            tokio_postgres::config::Host::Tcp(s) => s.clone(),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
        });
        cfg.port = pg_config.get_ports().first().copied();
        cfg.user = pg_config.get_user().map(String::from);
        cfg.password = pg_config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());
        cfg.dbname = pg_config.get_dbname().map(String::from);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::op("postgres_create_pool", e))?;

        if let Ok(mut pools) = self.pools.lock() {
            pools.insert(database.to_string(), pool.clone());
        }
        tracing::info!("created postgres pool for database '{database}'");
        Ok(pool)
    }

    /// Drops every pool; cross-database test helper.
    pub fn reset_pools(&self) {
        if let Ok(mut pools) = self.pools.lock() {
            pools.clear();
        }
    }
}

/// Client bound to one database's pool.
pub struct PostgresClient {
    pool: Pool,
    database: String,
}

impl PostgresClient {
    /// Creates a client for a database through the registry.
    pub fn new(registry: &PoolRegistry, database: &str, url: &str) -> Result<Self> {
        Ok(Self {
            pool: registry.pool(database, url)?,
            database: database.to_string(),
        })
    }

    /// The database name this client is bound to.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Checks out a connection and applies the RLS session variable.
    async fn client(&self) -> Result<deadpool_postgres::Object> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::op("postgres_checkout", e))?;

        // Set the ambient user for RLS, or clear it for system-level work.
        let user_id = current_context().map(|ctx| ctx.user_id.to_string());
        client
            .execute(
                "SELECT set_config('app.current_user_id', $1, false)",
                &[&user_id.unwrap_or_default()],
            )
            .await
            .map_err(|e| Error::op("postgres_set_user", e))?;

        Ok(client)
    }

    /// Runs a query and converts rows to JSON maps.
    pub fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Map<String, Value>>> {
        block_on(async {
            let client = self.client().await?;
            let rows = client
                .query(sql, &dyn_params(params))
                .await
                .map_err(|e| Error::op("postgres_query", e))?;
            rows.iter().map(row_to_map).collect()
        })
    }

    /// Runs a statement, returning the affected row count.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        block_on(async {
            let client = self.client().await?;
            client
                .execute(sql, &dyn_params(params))
                .await
                .map_err(|e| Error::op("postgres_execute", e))
        })
    }

    /// Runs several statements in one transaction, all-or-nothing.
    pub fn transaction(&self, statements: &[(&str, Vec<SqlParam>)]) -> Result<()> {
        block_on(async {
            let mut client = self.client().await?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| Error::op("postgres_begin", e))?;
            for (sql, params) in statements {
                tx.execute(*sql, &dyn_params(params))
                    .await
                    .map_err(|e| Error::op("postgres_tx", e))?;
            }
            tx.commit().await.map_err(|e| Error::op("postgres_commit", e))
        })
    }

    /// Inserts a JSON map as a row.
    ///
    /// `user_id` is injected only when an ambient user context is set;
    /// `created_at` / `updated_at` only for tables that carry them. The
    /// caller's map is never mutated.
    pub fn json_insert(&self, table: &str, data: &Map<String, Value>) -> Result<u64> {
        let mut row: Vec<(String, SqlParam)> = data
            .iter()
            .map(|(column, value)| (column.clone(), SqlParam::from_value(value)))
            .collect();

        if !data.contains_key("user_id") {
            if let Some(ctx) = current_context() {
                row.push(("user_id".to_string(), SqlParam::Uuid(ctx.user_id)));
            }
        }
        if TIMESTAMPED_TABLES.contains(&table) {
            let now = Utc::now();
            if !data.contains_key("created_at") {
                row.push(("created_at".to_string(), SqlParam::Timestamp(now)));
            }
            if !data.contains_key("updated_at") {
                row.push(("updated_at".to_string(), SqlParam::Timestamp(now)));
            }
        }

        let columns: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let params: Vec<SqlParam> = row.into_iter().map(|(_, p)| p).collect();
        self.execute(&sql, &params)
    }

    /// Selects rows matching equality filters.
    ///
    /// RLS already scopes visibility; the filters are plain conjuncts.
    pub fn json_select(
        &self,
        table: &str,
        filters: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>> {
        if filters.is_empty() {
            return self.query(&format!("SELECT * FROM {table}"), &[]);
        }
        let mut clauses = Vec::with_capacity(filters.len());
        let mut params = Vec::with_capacity(filters.len());
        for (column, value) in filters {
            params.push(SqlParam::from_value(value));
            clauses.push(format!("{column} = ${}", params.len()));
        }
        let sql = format!("SELECT * FROM {table} WHERE {}", clauses.join(" AND "));
        self.query(&sql, &params)
    }
}

/// Converts a wire row into a JSON map.
fn row_to_map(row: &tokio_postgres::Row) -> Result<Map<String, Value>> {
    let mut map = Map::new();

    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match column.type_().name() {
            "bool" => row
                .try_get::<_, Option<bool>>(index)
                .map(|v| v.map_or(Value::Null, Value::Bool)),
            "int2" => row
                .try_get::<_, Option<i16>>(index)
                .map(|v| v.map_or(Value::Null, |i| Value::from(i64::from(i)))),
            "int4" => row
                .try_get::<_, Option<i32>>(index)
                .map(|v| v.map_or(Value::Null, |i| Value::from(i64::from(i)))),
            "int8" => row
                .try_get::<_, Option<i64>>(index)
                .map(|v| v.map_or(Value::Null, Value::from)),
            "float4" => row
                .try_get::<_, Option<f32>>(index)
                .map(|v| v.map_or(Value::Null, |f| Value::from(f64::from(f)))),
            "float8" => row
                .try_get::<_, Option<f64>>(index)
                .map(|v| v.map_or(Value::Null, Value::from)),
            "uuid" => row
                .try_get::<_, Option<Uuid>>(index)
                .map(|v| v.map_or(Value::Null, |u| Value::String(u.to_string()))),
            "timestamptz" => row
                .try_get::<_, Option<DateTime<Utc>>>(index)
                .map(|v| v.map_or(Value::Null, |t| Value::String(t.to_rfc3339()))),
            "json" | "jsonb" => row
                .try_get::<_, Option<Value>>(index)
                .map(|v| v.unwrap_or(Value::Null)),
            // vector and other extension types come back in text form.
            _ => row
                .try_get::<_, Option<String>>(index)
                .map(|v| v.map_or(Value::Null, Value::String)),
        };

        match value {
            Ok(value) => {
                map.insert(name.to_string(), value);
            }
            Err(err) => {
                tracing::warn!("column '{name}' conversion failed: {err}");
                map.insert(name.to_string(), Value::Null);
            }
        }
    }

    Ok(map)
}

/// Formats an embedding as a pgvector literal.
fn vector_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 10 + 2);
    out.push('[');
    for (i, component) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&component.to_string());
    }
    out.push(']');
    out
}

/// Postgres-backed continuum persistence (`mira_service.messages`).
pub struct PgContinuumStore {
    client: PostgresClient,
}

impl PgContinuumStore {
    /// Creates the store over a service-database client.
    #[must_use]
    pub const fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    fn row_to_message(row: &Map<String, Value>) -> Result<Message> {
        let content_raw = row
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        // Block content persists as a JSON array; plain text as-is.
        let content = serde_json::from_str::<Value>(content_raw).map_or_else(
            |_| Value::String(content_raw.to_string()),
            |parsed| {
                if parsed.is_array() {
                    parsed
                } else {
                    Value::String(content_raw.to_string())
                }
            },
        );

        let message = serde_json::json!({
            "id": row.get("id").cloned().unwrap_or(Value::Null),
            "role": row.get("role").cloned().unwrap_or(Value::Null),
            "content": content,
            "created_at": row.get("created_at").cloned().unwrap_or(Value::Null),
            "metadata": row.get("metadata").cloned().unwrap_or(Value::Object(Map::new())),
        });
        serde_json::from_value(message).map_err(|e| Error::op("message_decode", e))
    }
}

impl ContinuumStore for PgContinuumStore {
    fn append_message(&self, continuum_id: Uuid, message: &Message) -> Result<()> {
        let content = match serde_json::to_value(&message.content) {
            Ok(Value::String(text)) => text,
            Ok(other) => other.to_string(),
            Err(e) => return Err(Error::op("message_encode", e)),
        };
        self.client.execute(
            "INSERT INTO messages (id, continuum_id, user_id, role, content, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                SqlParam::Uuid(message.id),
                SqlParam::Uuid(continuum_id),
                SqlParam::Uuid(crate::observability::current_user_id()?),
                SqlParam::Text(message.role.to_string()),
                SqlParam::Text(content),
                SqlParam::Json(Value::Object(message.metadata.clone())),
                SqlParam::Timestamp(message.created_at),
            ],
        )?;
        Ok(())
    }

    fn active_segments(&self) -> Result<Vec<ActiveSegment>> {
        let rows = self.client.query(
            "SELECT m.continuum_id, m.user_id, m.metadata->>'segment_id' AS segment_id, \
                    u.timezone \
             FROM messages m JOIN users u ON u.id = m.user_id \
             WHERE (m.metadata->>'is_segment_boundary')::boolean IS TRUE \
               AND m.metadata->>'status' = 'active'",
            &[],
        )?;

        let mut segments = Vec::with_capacity(rows.len());
        for row in rows {
            let parse = |key: &str| -> Option<Uuid> {
                row.get(key).and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
            };
            let (Some(continuum_id), Some(user_id), Some(segment_id)) =
                (parse("continuum_id"), parse("user_id"), parse("segment_id"))
            else {
                continue;
            };
            segments.push(ActiveSegment {
                continuum_id,
                user_id,
                segment_id,
                timezone: row.get("timezone").and_then(Value::as_str).map(String::from),
            });
        }
        Ok(segments)
    }

    fn load_sentinel(&self, continuum_id: Uuid, segment_id: Uuid) -> Result<Option<Message>> {
        let rows = self.client.query(
            "SELECT * FROM messages \
             WHERE continuum_id = $1 \
               AND (metadata->>'is_segment_boundary')::boolean IS TRUE \
               AND metadata->>'segment_id' = $2",
            &[
                SqlParam::Uuid(continuum_id),
                SqlParam::Text(segment_id.to_string()),
            ],
        )?;
        rows.first().map(Self::row_to_message).transpose()
    }

    fn load_segment_messages(
        &self,
        continuum_id: Uuid,
        segment_id: Uuid,
    ) -> Result<Vec<Message>> {
        let Some(sentinel) = self.load_sentinel(continuum_id, segment_id)? else {
            return Ok(Vec::new());
        };

        let rows = self.client.query(
            "SELECT * FROM messages \
             WHERE continuum_id = $1 AND created_at > $2 \
             ORDER BY created_at ASC",
            &[
                SqlParam::Uuid(continuum_id),
                SqlParam::Timestamp(sentinel.created_at),
            ],
        )?;

        let mut messages = Vec::new();
        for row in &rows {
            let message = Self::row_to_message(row)?;
            if message.meta_flag("is_segment_boundary") {
                break;
            }
            if message.is_system_notification() {
                continue;
            }
            messages.push(message);
        }
        Ok(messages)
    }

    fn last_user_message_time(&self, continuum_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let rows = self.client.query(
            "SELECT MAX(created_at) AS last_time FROM messages \
             WHERE continuum_id = $1 AND role = 'user' \
               AND (metadata->>'is_segment_boundary') IS NULL",
            &[SqlParam::Uuid(continuum_id)],
        )?;
        Ok(rows
            .first()
            .and_then(|row| row.get("last_time"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    fn persist_collapsed_sentinel(
        &self,
        continuum_id: Uuid,
        sentinel: &Message,
        embedding: &[f32],
    ) -> Result<()> {
        // One statement: the sentinel row and its embedding land together.
        let count = self.client.execute(
            "UPDATE messages \
             SET content = $1, metadata = $2, segment_embedding = $3::vector \
             WHERE id = $4 AND continuum_id = $5",
            &[
                SqlParam::Text(sentinel.content.text()),
                SqlParam::Json(Value::Object(sentinel.metadata.clone())),
                SqlParam::Text(vector_literal(embedding)),
                SqlParam::Uuid(sentinel.id),
                SqlParam::Uuid(continuum_id),
            ],
        )?;
        if count == 0 {
            return Err(Error::NotFound(format!(
                "sentinel {} not found in continuum {continuum_id}",
                sentinel.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_param_from_value_detects_uuid() {
        let id = Uuid::new_v4();
        assert!(matches!(
            SqlParam::from_value(&json!(id.to_string())),
            SqlParam::Uuid(u) if u == id
        ));
        assert!(matches!(
            SqlParam::from_value(&json!("plain text")),
            SqlParam::Text(_)
        ));
        assert!(matches!(SqlParam::from_value(&json!(42)), SqlParam::Int(42)));
        assert!(matches!(SqlParam::from_value(&json!(true)), SqlParam::Bool(true)));
        assert!(matches!(
            SqlParam::from_value(&json!({"k": "v"})),
            SqlParam::Json(_)
        ));
    }

    #[test]
    fn test_vector_literal_format() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.0]), "[0.5,-1,2]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn test_row_to_message_round_trip() {
        let original = Message::new(crate::models::Role::User, "hello").unwrap();
        let mut row = Map::new();
        row.insert("id".into(), json!(original.id.to_string()));
        row.insert("role".into(), json!("user"));
        row.insert("content".into(), json!("hello"));
        row.insert("created_at".into(), json!(original.created_at.to_rfc3339()));
        row.insert("metadata".into(), json!({}));

        let decoded = PgContinuumStore::row_to_message(&row).unwrap();
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.role, original.role);
        assert_eq!(decoded.content.text(), "hello");
    }

    #[test]
    fn test_row_to_message_block_content() {
        let mut row = Map::new();
        row.insert("id".into(), json!(Uuid::new_v4().to_string()));
        row.insert("role".into(), json!("user"));
        row.insert(
            "content".into(),
            json!(r#"[{"type":"text","text":"caption"}]"#),
        );
        row.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
        row.insert("metadata".into(), json!({}));

        let decoded = PgContinuumStore::row_to_message(&row).unwrap();
        assert_eq!(decoded.content.text(), "caption");
    }
}
