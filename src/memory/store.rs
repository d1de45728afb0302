//! Memory persistence seam and its pgvector-backed implementation.
//!
//! The trait is what the pipeline services program against; tests use
//! in-memory fakes. [`PgMemoryStore`] runs on the `mira_memory` database
//! (pgvector registered, RLS by `user_id`), with links materialized
//! bidirectionally as JSONB arrays on both endpoint rows.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::models::{Entity, LinkRef, Memory, MemoryLink};
use crate::storage::{PostgresClient, SqlParam};
use crate::{Error, Result};

/// Persistence operations of the LT-Memory pipeline.
pub trait MemoryStore: Send + Sync {
    /// Inserts memories (embeddings included), returning their ids.
    fn insert_memories(&self, memories: &[Memory]) -> Result<Vec<Uuid>>;

    /// Loads one memory.
    fn get_memory(&self, id: Uuid) -> Result<Option<Memory>>;

    /// Loads memories by id, silently skipping unknown ids.
    fn get_memories_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Memory>>;

    /// Loads all of the user's memories.
    fn all_memories(&self, include_archived: bool) -> Result<Vec<Memory>>;

    /// Rewrites a memory's text and embedding, marking it refined.
    fn update_text_and_embedding(&self, id: Uuid, text: &str, embedding: &[f32]) -> Result<()>;

    /// Increments a memory's refinement rejection counter.
    fn increment_rejection_count(&self, id: Uuid) -> Result<()>;

    /// Archives memories (consolidation, supersession). Never deletes.
    fn archive_memories(&self, ids: &[Uuid], reason: &str) -> Result<()>;

    /// Cosine-similarity search; populates `similarity_score` on results.
    fn search_similar(
        &self,
        embedding: &[f32],
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>>;

    /// BM25 full-text search; returns `(memory, rank)` pairs.
    fn bm25_search(
        &self,
        query_text: &str,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<(Memory, f32)>>;

    /// Case-insensitive exact entity lookup by name.
    fn entities_by_names(&self, names: &[String]) -> Result<Vec<Entity>>;

    /// The user's most-linked entities, for fuzzy matching.
    fn top_entities(&self, limit: usize) -> Result<Vec<Entity>>;

    /// Persists links on both endpoints (bidirectional materialization).
    fn create_links(&self, links: &[MemoryLink]) -> Result<()>;

    /// Removes link references to the given dead memory ids; returns the
    /// number of references removed (heal-on-read support).
    fn remove_dead_links(&self, dead_ids: &[Uuid]) -> Result<usize>;

    /// Bumps access counters for returned memories.
    fn record_access(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()>;
}

/// pgvector-backed memory store on `mira_memory`.
pub struct PgMemoryStore {
    client: PostgresClient,
}

impl PgMemoryStore {
    /// Creates the store over a memory-database client.
    #[must_use]
    pub const fn new(client: PostgresClient) -> Self {
        Self { client }
    }

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

    #[allow(clippy::cast_possible_truncation)]
    fn row_to_memory(row: &Map<String, Value>) -> Result<Memory> {
        let parse_links = |key: &str| -> Vec<LinkRef> {
            row.get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default()
        };
        let parse_time = |key: &str| -> Option<DateTime<Utc>> {
            row.get(key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::op("memory_decode", "missing id"))?;
        let user_id = row
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::op("memory_decode", "missing user_id"))?;

        Ok(Memory {
            id,
            user_id,
            text: row
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            embedding: row.get("embedding").and_then(Value::as_str).map(|text| {
                text.trim_matches(['[', ']'])
                    .split(',')
                    .filter_map(|c| c.trim().parse::<f32>().ok())
                    .collect()
            }),
            importance_score: row
                .get("importance_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0) as f32,
            confidence: row.get("confidence").and_then(Value::as_f64).unwrap_or(0.0) as f32,
            created_at: parse_time("created_at").unwrap_or_else(Utc::now),
            updated_at: parse_time("updated_at").unwrap_or_else(Utc::now),
            expires_at: parse_time("expires_at"),
            happens_at: parse_time("happens_at"),
            access_count: row.get("access_count").and_then(Value::as_i64).unwrap_or(0),
            last_accessed: parse_time("last_accessed"),
            inbound_links: parse_links("inbound_links"),
            outbound_links: parse_links("outbound_links"),
            entity_links: row
                .get("entity_links")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            is_archived: row
                .get("is_archived")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            archived_at: parse_time("archived_at"),
            is_refined: row
                .get("is_refined")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            last_refined_at: parse_time("last_refined_at"),
            refinement_rejection_count: row
                .get("refinement_rejection_count")
                .and_then(Value::as_i64)
                .unwrap_or(0) as i32,
            active_days_count: row
                .get("active_days_count")
                .and_then(Value::as_i64)
                .unwrap_or(0) as i32,
            last_active_day: parse_time("last_active_day"),
            similarity_score: row
                .get("similarity_score")
                .and_then(Value::as_f64)
                .map(|f| f as f32),
            raw_rrf_score: None,
        })
    }
}

impl MemoryStore for PgMemoryStore {
    fn insert_memories(&self, memories: &[Memory]) -> Result<Vec<Uuid>> {
        let mut statements: Vec<(&str, Vec<SqlParam>)> = Vec::with_capacity(memories.len());
        const SQL: &str = "INSERT INTO memories \
            (id, user_id, text, embedding, importance_score, confidence, created_at, \
             updated_at, expires_at, happens_at, inbound_links, outbound_links, entity_links) \
            VALUES ($1, $2, $3, $4::vector, $5, $6, $7, $8, $9, $10, $11, $12, $13)";

        for memory in memories {
            let embedding = memory.embedding.as_deref().ok_or_else(|| {
                Error::InvariantViolation(format!("memory {} has no embedding", memory.id))
            })?;
            statements.push((
                SQL,
                vec![
                    SqlParam::Uuid(memory.id),
                    SqlParam::Uuid(memory.user_id),
                    SqlParam::Text(memory.text.clone()),
                    SqlParam::Text(Self::vector_literal(embedding)),
                    SqlParam::Float(f64::from(memory.importance_score)),
                    SqlParam::Float(f64::from(memory.confidence)),
                    SqlParam::Timestamp(memory.created_at),
                    SqlParam::Timestamp(memory.updated_at),
                    memory
                        .expires_at
                        .map_or(SqlParam::Null, SqlParam::Timestamp),
                    memory
                        .happens_at
                        .map_or(SqlParam::Null, SqlParam::Timestamp),
                    SqlParam::Json(json!(memory.inbound_links)),
                    SqlParam::Json(json!(memory.outbound_links)),
                    SqlParam::Json(json!(memory.entity_links)),
                ],
            ));
        }

        self.client.transaction(&statements)?;
        Ok(memories.iter().map(|m| m.id).collect())
    }

    fn get_memory(&self, id: Uuid) -> Result<Option<Memory>> {
        let rows = self.client.query(
            "SELECT *, embedding::text AS embedding FROM memories WHERE id = $1",
            &[SqlParam::Uuid(id)],
        )?;
        rows.first().map(Self::row_to_memory).transpose()
    }

    fn get_memories_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_strings: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let rows = self.client.query(
            "SELECT *, embedding::text AS embedding FROM memories \
             WHERE id = ANY($1::uuid[])",
            &[SqlParam::TextArray(id_strings)],
        )?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    fn all_memories(&self, include_archived: bool) -> Result<Vec<Memory>> {
        let sql = if include_archived {
            "SELECT *, embedding::text AS embedding FROM memories"
        } else {
            "SELECT *, embedding::text AS embedding FROM memories WHERE is_archived = FALSE"
        };
        let rows = self.client.query(sql, &[])?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    fn update_text_and_embedding(&self, id: Uuid, text: &str, embedding: &[f32]) -> Result<()> {
        let count = self.client.execute(
            "UPDATE memories \
             SET text = $1, embedding = $2::vector, is_refined = TRUE, \
                 last_refined_at = NOW(), updated_at = NOW() \
             WHERE id = $3",
            &[
                SqlParam::Text(text.to_string()),
                SqlParam::Text(Self::vector_literal(embedding)),
                SqlParam::Uuid(id),
            ],
        )?;
        if count == 0 {
            return Err(Error::NotFound(format!("memory {id} not found")));
        }
        Ok(())
    }

    fn increment_rejection_count(&self, id: Uuid) -> Result<()> {
        self.client.execute(
            "UPDATE memories \
             SET refinement_rejection_count = refinement_rejection_count + 1, \
                 updated_at = NOW() \
             WHERE id = $1",
            &[SqlParam::Uuid(id)],
        )?;
        Ok(())
    }

    fn archive_memories(&self, ids: &[Uuid], reason: &str) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_strings: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.client.execute(
            "UPDATE memories SET is_archived = TRUE, archived_at = NOW(), updated_at = NOW() \
             WHERE id = ANY($1::uuid[])",
            &[SqlParam::TextArray(id_strings)],
        )?;
        tracing::info!("archived {} memories ({reason})", ids.len());
        Ok(())
    }

    fn search_similar(
        &self,
        embedding: &[f32],
        limit: usize,
        similarity_threshold: f32,
        min_importance: f32,
    ) -> Result<Vec<Memory>> {
        let rows = self.client.query(
            "SELECT *, embedding::text AS embedding, \
                    1 - (embedding <=> $1::vector) AS similarity_score \
             FROM memories \
             WHERE is_archived = FALSE \
               AND importance_score >= $2 \
               AND (expires_at IS NULL OR expires_at > NOW()) \
               AND 1 - (embedding <=> $1::vector) >= $3 \
             ORDER BY embedding <=> $1::vector \
             LIMIT $4",
            &[
                SqlParam::Text(Self::vector_literal(embedding)),
                SqlParam::Float(f64::from(min_importance)),
                SqlParam::Float(f64::from(similarity_threshold)),
                SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX)),
            ],
        )?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    fn bm25_search(
        &self,
        query_text: &str,
        limit: usize,
        min_importance: f32,
    ) -> Result<Vec<(Memory, f32)>> {
        let rows = self.client.query(
            "SELECT *, embedding::text AS embedding, \
                    ts_rank(search_vector, plainto_tsquery('english', $1)) AS rank \
             FROM memories \
             WHERE search_vector @@ plainto_tsquery('english', $1) \
               AND importance_score >= $2 \
               AND (expires_at IS NULL OR expires_at > NOW()) \
               AND is_archived = FALSE \
             ORDER BY rank DESC \
             LIMIT $3",
            &[
                SqlParam::Text(query_text.to_string()),
                SqlParam::Float(f64::from(min_importance)),
                SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX)),
            ],
        )?;

        rows.iter()
            .map(|row| {
                #[allow(clippy::cast_possible_truncation)]
                let rank = row.get("rank").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Self::row_to_memory(row).map(|memory| (memory, rank))
            })
            .collect()
    }

    fn entities_by_names(&self, names: &[String]) -> Result<Vec<Entity>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
        let rows = self.client.query(
            "SELECT * FROM entities \
             WHERE LOWER(name) = ANY($1) AND is_archived = FALSE \
             ORDER BY link_count DESC",
            &[SqlParam::TextArray(lowered)],
        )?;
        rows.iter().map(Self::row_to_entity).collect()
    }

    fn top_entities(&self, limit: usize) -> Result<Vec<Entity>> {
        let rows = self.client.query(
            "SELECT * FROM entities WHERE is_archived = FALSE \
             ORDER BY link_count DESC LIMIT $1",
            &[SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX))],
        )?;
        rows.iter().map(Self::row_to_entity).collect()
    }

    fn create_links(&self, links: &[MemoryLink]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }

        // Both endpoints land in one transaction: the link exists on both
        // rows or on neither.
        let mut statements: Vec<(&str, Vec<SqlParam>)> = Vec::with_capacity(links.len() * 2);
        const OUTBOUND: &str = "UPDATE memories \
            SET outbound_links = outbound_links || $1::jsonb, updated_at = NOW() \
            WHERE id = $2";
        const INBOUND: &str = "UPDATE memories \
            SET inbound_links = inbound_links || $1::jsonb, updated_at = NOW() \
            WHERE id = $2";

        for link in links {
            let link_type = link.link_type.canonical();
            let outbound_entry = json!([{
                "uuid": link.target_id.to_string(),
                "type": link_type.as_str(),
                "confidence": link.confidence,
                "reasoning": link.reasoning,
            }]);
            let inbound_entry = json!([{
                "uuid": link.source_id.to_string(),
                "type": link_type.as_str(),
                "confidence": link.confidence,
                "reasoning": link.reasoning,
            }]);
            statements.push((
                OUTBOUND,
                vec![SqlParam::Json(outbound_entry), SqlParam::Uuid(link.source_id)],
            ));
            statements.push((
                INBOUND,
                vec![SqlParam::Json(inbound_entry), SqlParam::Uuid(link.target_id)],
            ));
        }

        self.client.transaction(&statements)
    }

    fn remove_dead_links(&self, dead_ids: &[Uuid]) -> Result<usize> {
        if dead_ids.is_empty() {
            return Ok(0);
        }
        let dead_strings: Vec<String> = dead_ids.iter().map(ToString::to_string).collect();
        let count = self.client.execute(
            "UPDATE memories SET \
                inbound_links = (SELECT COALESCE(jsonb_agg(l), '[]'::jsonb) \
                    FROM jsonb_array_elements(inbound_links) l \
                    WHERE NOT (l->>'uuid' = ANY($1))), \
                outbound_links = (SELECT COALESCE(jsonb_agg(l), '[]'::jsonb) \
                    FROM jsonb_array_elements(outbound_links) l \
                    WHERE NOT (l->>'uuid' = ANY($1))), \
                updated_at = NOW() \
             WHERE inbound_links::text LIKE ANY($2) OR outbound_links::text LIKE ANY($2)",
            &[
                SqlParam::TextArray(dead_strings.clone()),
                SqlParam::TextArray(
                    dead_strings.iter().map(|id| format!("%{id}%")).collect(),
                ),
            ],
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn record_access(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_strings: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.client.execute(
            "UPDATE memories SET \
                access_count = access_count + 1, \
                last_accessed = $2, \
                active_days_count = active_days_count + \
                    CASE WHEN last_active_day IS NULL \
                              OR date_trunc('day', last_active_day) < date_trunc('day', $2) \
                         THEN 1 ELSE 0 END, \
                last_active_day = $2 \
             WHERE id = ANY($1::uuid[])",
            &[SqlParam::TextArray(id_strings), SqlParam::Timestamp(at)],
        )?;
        Ok(())
    }
}

impl PgMemoryStore {
    #[allow(clippy::cast_possible_truncation)]
    fn row_to_entity(row: &Map<String, Value>) -> Result<Entity> {
        Ok(Entity {
            id: row
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| Error::op("entity_decode", "missing id"))?,
            user_id: row
                .get("user_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| Error::op("entity_decode", "missing user_id"))?,
            name: row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            entity_type: row
                .get("entity_type")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string(),
            embedding: None,
            link_count: row.get("link_count").and_then(Value::as_i64).unwrap_or(0),
            last_linked_at: row
                .get("last_linked_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            is_archived: row
                .get("is_archived")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}
