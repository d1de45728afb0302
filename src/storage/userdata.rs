//! Per-user SQLite databases with field-level encryption.
//!
//! One `userdata.db` per user under `data/users/<user_id>/`. Each
//! [`UserDataManager`] owns a single lazy persistent connection (WAL mode,
//! reused across threads); instances are cached per user in
//! [`UserDataRegistry`], which also closes connections when a user's
//! segment collapses.
//!
//! There is no RLS here: user scoping is enforced in code. `json_insert`
//! adds `user_id` automatically and `json_select` / `json_update` /
//! `json_delete` always filter on it. Columns prefixed `encrypted__` are
//! ciphertext at rest via the per-user derived key.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::events::EventBus;
use crate::security::{FieldEncryptor, is_encrypted_column};
use crate::{Error, Result};

/// Manages one user's SQLite database.
pub struct UserDataManager {
    user_id: Uuid,
    db_path: PathBuf,
    encryptor: FieldEncryptor,
    conn: Mutex<Option<Connection>>,
}

impl UserDataManager {
    /// Opens (or creates) the user's database under `base_dir`.
    pub fn new(user_id: Uuid, base_dir: &Path) -> Result<Self> {
        let user_dir = base_dir.join(user_id.to_string());
        std::fs::create_dir_all(&user_dir)
            .map_err(|e| Error::op("userdata_mkdir", format!("{}: {e}", user_dir.display())))?;

        let manager = Self {
            user_id,
            db_path: user_dir.join("userdata.db"),
            encryptor: FieldEncryptor::for_user(user_id),
            conn: Mutex::new(None),
        };
        manager.with_connection(Self::initialize_schemas)?;
        Ok(manager)
    }

    /// The owning user.
    #[must_use]
    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Runs a closure against the lazy persistent connection.
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::op("userdata_lock", "connection mutex poisoned"))?;
        if guard.is_none() {
            let conn = Connection::open(&self.db_path)
                .map_err(|e| Error::op("userdata_open", e))?;
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| Error::op("userdata_wal", e))?;
            *guard = Some(conn);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::op("userdata_open", "connection vanished")),
        }
    }

    /// Closes the persistent connection; it reopens lazily on next use.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                tracing::debug!("closed SQLite connection for user {}", self.user_id);
            }
        }
    }

    fn initialize_schemas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS pager_devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                encrypted__device_secret TEXT NOT NULL,
                device_fingerprint TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pager_trust (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                trusting_device_id TEXT NOT NULL,
                trusted_device_id TEXT NOT NULL,
                trusted_fingerprint TEXT NOT NULL,
                trusted_name TEXT,
                trust_status TEXT NOT NULL DEFAULT 'trusted',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(trusting_device_id, trusted_device_id)
            );
            CREATE TABLE IF NOT EXISTS pager_messages (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                encrypted__content TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS domaindocs (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                label TEXT NOT NULL,
                encrypted__description TEXT,
                enabled INTEGER DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, label)
            );
            CREATE TABLE IF NOT EXISTS domaindoc_sections (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                domaindoc_id INTEGER NOT NULL REFERENCES domaindocs(id) ON DELETE CASCADE,
                parent_section_id INTEGER DEFAULT NULL
                    REFERENCES domaindoc_sections(id) ON DELETE CASCADE,
                header TEXT NOT NULL,
                encrypted__content TEXT NOT NULL,
                sort_order INTEGER NOT NULL,
                collapsed INTEGER DEFAULT 0,
                expanded_by_default INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(domaindoc_id, parent_section_id, header)
            );
            CREATE TABLE IF NOT EXISTS domaindoc_versions (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                domaindoc_id INTEGER NOT NULL REFERENCES domaindocs(id) ON DELETE CASCADE,
                section_id INTEGER REFERENCES domaindoc_sections(id) ON DELETE SET NULL,
                version_num INTEGER NOT NULL,
                operation TEXT NOT NULL,
                encrypted__diff_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(domaindoc_id, version_num)
            );
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                service TEXT NOT NULL,
                encrypted__value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, service)
            );
            CREATE INDEX IF NOT EXISTS idx_pager_messages_recipient
                ON pager_messages(recipient_id);
            CREATE INDEX IF NOT EXISTS idx_domaindocs_enabled ON domaindocs(enabled);
            CREATE INDEX IF NOT EXISTS idx_sections_domaindoc
                ON domaindoc_sections(domaindoc_id);
            ",
        )
        .map_err(|e| Error::op("userdata_schema", e))
    }

    fn storage_value(&self, column: &str, value: &Value) -> Result<rusqlite::types::Value> {
        use rusqlite::types::Value as Sql;

        if is_encrypted_column(column) {
            let plaintext = match value {
                Value::String(s) => s.clone(),
                Value::Null => return Ok(Sql::Null),
                other => other.to_string(),
            };
            return Ok(Sql::Text(self.encryptor.encrypt(&plaintext)?));
        }

        Ok(match value {
            Value::Null => Sql::Null,
            Value::Bool(b) => Sql::Integer(i64::from(*b)),
            Value::Number(n) => n.as_i64().map_or_else(
                || Sql::Real(n.as_f64().unwrap_or(0.0)),
                Sql::Integer,
            ),
            Value::String(s) => Sql::Text(s.clone()),
            other => Sql::Text(other.to_string()),
        })
    }

    fn loaded_value(&self, column: &str, value: rusqlite::types::Value) -> Result<Value> {
        use rusqlite::types::Value as Sql;

        Ok(match value {
            Sql::Null => Value::Null,
            Sql::Integer(i) => Value::from(i),
            Sql::Real(f) => Value::from(f),
            Sql::Text(text) => {
                if is_encrypted_column(column) {
                    Value::String(self.encryptor.decrypt_raw(&text)?)
                } else {
                    Value::String(text)
                }
            }
            Sql::Blob(_) => {
                return Err(Error::op("userdata_read", format!("blob column {column}")));
            }
        })
    }

    /// Inserts a row, auto-adding `user_id`, `created_at` and `updated_at`.
    ///
    /// The caller's map is not mutated. Returns the caller-provided `id`
    /// or, for rowid tables, the id SQLite assigned.
    pub fn json_insert(&self, table: &str, data: &Map<String, Value>) -> Result<String> {
        let now = Utc::now().to_rfc3339();
        let mut row = data.clone();
        row.insert("user_id".into(), Value::String(self.user_id.to_string()));
        row.entry("created_at".to_string())
            .or_insert_with(|| Value::String(now.clone()));
        row.insert("updated_at".into(), Value::String(now));
        let provided_id = row.get("id").cloned();

        let columns: Vec<&String> = row.keys().collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );

        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(row.len());
        for (column, value) in &row {
            params.push(self.storage_value(column, value)?);
        }

        let assigned = self.with_connection(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(params))
                .map_err(|e| Error::op("userdata_insert", e))?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(match provided_id {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => assigned.to_string(),
        })
    }

    /// Selects rows matching equality filters, always scoped to the user.
    pub fn json_select(
        &self,
        table: &str,
        filters: &Map<String, Value>,
    ) -> Result<Vec<Map<String, Value>>> {
        let mut clauses = vec!["user_id = ?1".to_string()];
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(self.user_id.to_string())];

        for (column, value) in filters {
            params.push(self.storage_value_for_filter(column, value)?);
            clauses.push(format!("{column} = ?{}", params.len()));
        }

        let sql = format!("SELECT * FROM {table} WHERE {}", clauses.join(" AND "));

        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::op("userdata_select", e))?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(ToString::to_string).collect();

            let mut rows = stmt
                .query(rusqlite::params_from_iter(params))
                .map_err(|e| Error::op("userdata_select", e))?;

            let mut results = Vec::new();
            while let Some(row) = rows.next().map_err(|e| Error::op("userdata_select", e))? {
                let mut object = Map::new();
                for (index, column) in column_names.iter().enumerate() {
                    let raw: rusqlite::types::Value = row
                        .get(index)
                        .map_err(|e| Error::op("userdata_select", e))?;
                    object.insert(column.clone(), self.loaded_value(column, raw)?);
                }
                results.push(object);
            }
            Ok(results)
        })
    }

    /// Filters never decrypt, so encrypted columns cannot be filtered on.
    fn storage_value_for_filter(
        &self,
        column: &str,
        value: &Value,
    ) -> Result<rusqlite::types::Value> {
        if is_encrypted_column(column) {
            return Err(Error::InvalidInput(format!(
                "cannot filter on encrypted column '{column}'"
            )));
        }
        self.storage_value(column, value)
    }

    /// Updates rows matching the filters, always scoped to the user.
    ///
    /// `updated_at` is refreshed automatically; `created_at` and `user_id`
    /// never change. Returns the affected row count.
    pub fn json_update(
        &self,
        table: &str,
        updates: &Map<String, Value>,
        filters: &Map<String, Value>,
    ) -> Result<usize> {
        let mut assignments = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        for (column, value) in updates {
            if column == "user_id" || column == "created_at" || column == "id" {
                continue;
            }
            params.push(self.storage_value(column, value)?);
            assignments.push(format!("{column} = ?{}", params.len()));
        }
        params.push(rusqlite::types::Value::Text(Utc::now().to_rfc3339()));
        assignments.push(format!("updated_at = ?{}", params.len()));

        params.push(rusqlite::types::Value::Text(self.user_id.to_string()));
        let mut clauses = vec![format!("user_id = ?{}", params.len())];
        for (column, value) in filters {
            params.push(self.storage_value_for_filter(column, value)?);
            clauses.push(format!("{column} = ?{}", params.len()));
        }

        let sql = format!(
            "UPDATE {table} SET {} WHERE {}",
            assignments.join(", "),
            clauses.join(" AND ")
        );

        self.with_connection(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(params))
                .map_err(|e| Error::op("userdata_update", e))
        })
    }

    /// Deletes rows matching the filters, always scoped to the user.
    pub fn json_delete(&self, table: &str, filters: &Map<String, Value>) -> Result<usize> {
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(self.user_id.to_string())];
        let mut clauses = vec!["user_id = ?1".to_string()];
        for (column, value) in filters {
            params.push(self.storage_value_for_filter(column, value)?);
            clauses.push(format!("{column} = ?{}", params.len()));
        }

        let sql = format!("DELETE FROM {table} WHERE {}", clauses.join(" AND "));
        self.with_connection(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(params))
                .map_err(|e| Error::op("userdata_delete", e))
        })
    }
}

/// Per-user manager cache with collapse-driven connection cleanup.
pub struct UserDataRegistry {
    base_dir: PathBuf,
    managers: Mutex<HashMap<Uuid, Arc<UserDataManager>>>,
}

impl UserDataRegistry {
    /// Creates a registry rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Gets (or creates) the manager for a user.
    pub fn manager_for(&self, user_id: Uuid) -> Result<Arc<UserDataManager>> {
        if let Ok(managers) = self.managers.lock() {
            if let Some(manager) = managers.get(&user_id) {
                return Ok(Arc::clone(manager));
            }
        }
        let manager = Arc::new(UserDataManager::new(user_id, &self.base_dir)?);
        if let Ok(mut managers) = self.managers.lock() {
            managers.insert(user_id, Arc::clone(&manager));
        }
        Ok(manager)
    }

    /// Closes the cached connection for a user, keeping the manager.
    pub fn close_user(&self, user_id: Uuid) {
        if let Ok(managers) = self.managers.lock() {
            if let Some(manager) = managers.get(&user_id) {
                manager.close();
            }
        }
    }

    /// Subscribes the registry to `SegmentCollapsedEvent`: the user's
    /// SQLite connection closes when their segment collapses.
    pub fn attach_to_bus(self: &Arc<Self>, bus: &EventBus) {
        let registry = Arc::clone(self);
        bus.subscribe("SegmentCollapsedEvent", move |event| {
            if let Some(user_id) = event.user_id() {
                registry.close_user(user_id);
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager() -> (TempDir, UserDataManager) {
        let dir = TempDir::new().unwrap();
        let manager = UserDataManager::new(Uuid::new_v4(), dir.path()).unwrap();
        (dir, manager)
    }

    fn doc_row(label: &str) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("label".into(), json!(label));
        row.insert("encrypted__description".into(), json!("private notes"));
        row.insert("enabled".into(), json!(true));
        row
    }

    #[test]
    fn test_insert_scopes_to_user_and_timestamps() {
        let (_dir, manager) = manager();
        manager.json_insert("domaindocs", &doc_row("health")).unwrap();

        let rows = manager.json_select("domaindocs", &Map::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0]["user_id"],
            json!(manager.user_id().to_string())
        );
        assert!(rows[0]["created_at"].as_str().is_some());
        assert!(rows[0]["updated_at"].as_str().is_some());
    }

    #[test]
    fn test_encrypted_field_round_trips() {
        let (_dir, manager) = manager();
        manager.json_insert("domaindocs", &doc_row("work")).unwrap();

        let rows = manager.json_select("domaindocs", &Map::new()).unwrap();
        assert_eq!(rows[0]["encrypted__description"], json!("private notes"));
    }

    #[test]
    fn test_encrypted_at_rest() {
        let (dir, manager) = manager();
        manager.json_insert("domaindocs", &doc_row("work")).unwrap();
        drop(manager);

        // Read the raw file bytes; the plaintext must not appear.
        let mut db_bytes = Vec::new();
        for entry in walk(dir.path()) {
            if entry.file_name().is_some_and(|n| n == "userdata.db") {
                db_bytes = std::fs::read(&entry).unwrap();
            }
        }
        assert!(!db_bytes.is_empty());
        assert!(
            !db_bytes
                .windows(b"private notes".len())
                .any(|w| w == b"private notes")
        );
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    files.extend(walk(&path));
                } else {
                    files.push(path);
                }
            }
        }
        files
    }

    #[test]
    fn test_cross_user_isolation() {
        let dir = TempDir::new().unwrap();
        let alice = UserDataManager::new(Uuid::new_v4(), dir.path()).unwrap();
        let bob = UserDataManager::new(Uuid::new_v4(), dir.path()).unwrap();

        alice.json_insert("domaindocs", &doc_row("alice-doc")).unwrap();

        assert!(bob.json_select("domaindocs", &Map::new()).unwrap().is_empty());
        // A blanket update from bob touches nothing of alice's.
        let mut updates = Map::new();
        updates.insert("enabled".into(), json!(false));
        assert_eq!(bob.json_update("domaindocs", &updates, &Map::new()).unwrap(), 0);
    }

    #[test]
    fn test_update_refreshes_updated_at_only() {
        let (_dir, manager) = manager();
        manager.json_insert("domaindocs", &doc_row("doc")).unwrap();
        let before = manager.json_select("domaindocs", &Map::new()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut updates = Map::new();
        updates.insert("enabled".into(), json!(false));
        updates.insert("created_at".into(), json!("1999-01-01T00:00:00Z"));
        let count = manager.json_update("domaindocs", &updates, &Map::new()).unwrap();
        assert_eq!(count, 1);

        let after = manager.json_select("domaindocs", &Map::new()).unwrap();
        assert_eq!(after[0]["created_at"], before[0]["created_at"]);
        assert_ne!(after[0]["updated_at"], before[0]["updated_at"]);
        assert_eq!(after[0]["enabled"], json!(0));
    }

    #[test]
    fn test_delete_scoped() {
        let (_dir, manager) = manager();
        manager.json_insert("domaindocs", &doc_row("a")).unwrap();
        manager.json_insert("domaindocs", &doc_row("b")).unwrap();

        let mut filters = Map::new();
        filters.insert("label".into(), json!("a"));
        assert_eq!(manager.json_delete("domaindocs", &filters).unwrap(), 1);
        assert_eq!(manager.json_select("domaindocs", &Map::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_filter_on_encrypted_column_rejected() {
        let (_dir, manager) = manager();
        let mut filters = Map::new();
        filters.insert("encrypted__description".into(), json!("x"));
        assert!(manager.json_select("domaindocs", &filters).is_err());
    }

    #[test]
    fn test_registry_caches_and_closes_on_collapse() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(UserDataRegistry::new(dir.path()));
        let user = Uuid::new_v4();

        let first = registry.manager_for(user).unwrap();
        let second = registry.manager_for(user).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let bus = EventBus::new();
        registry.attach_to_bus(&bus);
        bus.publish(&crate::models::ContinuumEvent::SegmentCollapsed {
            continuum_id: Uuid::new_v4(),
            user_id: user,
            segment_id: Uuid::new_v4(),
            summary: String::new(),
            display_title: String::new(),
            complexity: 1,
            tools_used: Vec::new(),
        });

        // Connection closed but manager still usable (reopens lazily).
        assert!(first.json_select("domaindocs", &Map::new()).unwrap().is_empty());
    }
}
