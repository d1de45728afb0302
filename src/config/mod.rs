//! Configuration management.
//!
//! One aggregate [`MiraConfig`] of per-component sections, deserializable
//! from TOML with `${VAR}` environment-variable expansion applied to string
//! values on load. Every field has a sensible default so the core can boot
//! from an empty file.

use serde::Deserialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Expands environment variable references in a string.
///
/// Supports `${VAR_NAME}` syntax. If the variable is not set, the original
/// reference is preserved (e.g., `${MISSING_VAR}` stays as-is).
///
/// Uses `Cow<str>` to avoid allocation when no expansion is needed.
#[must_use]
pub fn expand_env_vars(input: &str) -> Cow<'_, str> {
    if !input.contains("${") {
        return Cow::Borrowed(input);
    }

    let mut result = input.to_string();
    let mut start = 0;

    while let Some(var_start) = result[start..].find("${") {
        let var_start = start + var_start;
        if let Some(var_end) = result[var_start..].find('}') {
            let var_end = var_start + var_end;
            let var_name = &result[var_start + 2..var_end];
            if let Ok(value) = std::env::var(var_name) {
                result.replace_range(var_start..=var_end, &value);
                start = var_start + value.len();
            } else {
                start = var_end + 1;
            }
        } else {
            break;
        }
    }

    Cow::Owned(result)
}

/// Loads `.env` into the process environment, once, before config parsing.
///
/// Missing files are fine; explicit environment always wins.
pub fn init_env() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("loaded environment from {}", path.display()),
        Err(err) if err.not_found() => {}
        Err(err) => tracing::warn!("failed to load .env: {err}"),
    }
}

/// Main configuration aggregate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MiraConfig {
    /// Continuum engine settings.
    pub continuum: ContinuumConfig,
    /// Hybrid search and entity priming settings.
    pub search: SearchConfig,
    /// Memory linking settings.
    pub linking: LinkingConfig,
    /// Refinement and consolidation settings.
    pub refinement: RefinementConfig,
    /// LLM endpoints per internal role.
    pub llm: LlmConfig,
    /// Storage endpoints.
    pub storage: StorageConfig,
    /// Prompt-injection defense settings.
    pub defense: DefenseConfig,
    /// Background worker cadence.
    pub scheduler: SchedulerConfig,
}

impl MiraConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::op("config_read", format!("{}: {e}", path.display())))?;
        let expanded = expand_env_vars(&raw);
        toml::from_str(&expanded).map_err(|e| Error::InvalidInput(format!("config parse: {e}")))
    }
}

/// Continuum engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContinuumConfig {
    /// Hot cache window (recent messages kept in memory).
    pub hot_cache_window: usize,
    /// Inactivity threshold in minutes for night hours (local 0-6).
    pub night_inactivity_minutes: i64,
    /// Inactivity threshold in minutes for day hours.
    pub day_inactivity_minutes: i64,
    /// Per-local-hour overrides, `(hour, minutes)` pairs.
    pub hourly_overrides: Vec<(u8, i64)>,
    /// Max tokens for segment summaries.
    pub summary_max_tokens: u32,
    /// Summary sampling temperature.
    pub summary_temperature: f32,
}

impl Default for ContinuumConfig {
    fn default() -> Self {
        Self {
            hot_cache_window: 200,
            night_inactivity_minutes: 180,
            day_inactivity_minutes: 90,
            hourly_overrides: Vec::new(),
            summary_max_tokens: 600,
            summary_temperature: 1.0,
        }
    }
}

impl ContinuumConfig {
    /// Inactivity threshold for a given local hour.
    #[must_use]
    pub fn inactivity_threshold_minutes(&self, local_hour: u8) -> i64 {
        if let Some(&(_, minutes)) = self
            .hourly_overrides
            .iter()
            .find(|(hour, _)| *hour == local_hour)
        {
            return minutes;
        }
        if local_hour <= 6 {
            self.night_inactivity_minutes
        } else {
            self.day_inactivity_minutes
        }
    }
}

/// Hybrid search and entity priming settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default result limit.
    pub limit: usize,
    /// Minimum cosine similarity for the vector leg.
    pub similarity_threshold: f32,
    /// Importance floor for search (cold storage stays out).
    pub min_importance: f32,
    /// Additive boost per matched entity link.
    pub entity_boost_coefficient: f32,
    /// Cap on the total entity boost.
    pub max_entity_boost: f32,
    /// Minimum normalized similarity for fuzzy entity matches.
    pub fuzzy_match_threshold: f64,
    /// How many top entities (by link count) to consider for fuzzy matching.
    pub fuzzy_candidate_pool: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            similarity_threshold: 0.5,
            min_importance: 0.1,
            entity_boost_coefficient: 0.15,
            max_entity_boost: 0.5,
            fuzzy_match_threshold: 0.85,
            fuzzy_candidate_pool: 100,
        }
    }
}

impl SearchConfig {
    /// Priming weight for an entity type.
    #[must_use]
    pub fn entity_type_weight(entity_type: &str) -> f32 {
        match entity_type {
            "PERSON" => 1.0,
            "ORG" => 0.9,
            "PRODUCT" => 0.8,
            "GPE" | "EVENT" => 0.7,
            _ => 0.5,
        }
    }
}

/// Memory linking settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Similarity threshold for link candidates.
    pub similarity_threshold_for_linking: f32,
    /// Minimum classifier confidence to persist a link.
    pub link_confidence_threshold: f32,
    /// Candidate cap per memory.
    pub max_candidates_per_memory: usize,
    /// BFS depth cap for traversal.
    pub max_link_traversal_depth: usize,
    /// Max tokens for the classification call.
    pub classification_max_tokens: u32,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            similarity_threshold_for_linking: 0.7,
            link_confidence_threshold: 0.7,
            max_candidates_per_memory: 5,
            max_link_traversal_depth: 2,
            classification_max_tokens: 300,
        }
    }
}

/// Refinement and consolidation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Character threshold above which a memory is verbose.
    pub verbose_threshold_chars: usize,
    /// Minimum accesses before a memory is considered stable enough to trim.
    pub min_access_count_for_refinement: i64,
    /// Minimum age before refinement.
    pub min_age_for_refinement_days: i64,
    /// Cooldown after a refinement.
    pub refinement_cooldown_days: i64,
    /// Max times the model may decline before we stop asking.
    pub max_rejection_count: i32,
    /// How many verbose candidates one pass returns.
    pub verbose_candidates_limit: usize,
    /// Similarity threshold for cluster expansion.
    pub consolidation_similarity_threshold: f32,
    /// Confidence threshold for keeping a cluster.
    pub consolidation_confidence_threshold: f32,
    /// Minimum cluster size.
    pub min_cluster_size: usize,
    /// Maximum cluster size.
    pub max_cluster_size: usize,
    /// Max tokens for the refinement call.
    pub refinement_max_tokens: u32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            verbose_threshold_chars: 500,
            min_access_count_for_refinement: 3,
            min_age_for_refinement_days: 7,
            refinement_cooldown_days: 30,
            max_rejection_count: 3,
            verbose_candidates_limit: 10,
            consolidation_similarity_threshold: 0.85,
            consolidation_confidence_threshold: 0.85,
            min_cluster_size: 2,
            max_cluster_size: 5,
            refinement_max_tokens: 800,
        }
    }
}

/// One internal LLM role (summary, classifier, injection defense, reply).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmRole {
    /// Model identifier.
    pub model: Option<String>,
    /// OpenAI-compatible endpoint; `None` routes to native Anthropic.
    pub endpoint_url: Option<String>,
    /// Vault api-key name; `None` for local providers.
    pub api_key_name: Option<String>,
}

/// LLM endpoints per internal role.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Main reply loop.
    pub reply: LlmRole,
    /// Segment summaries.
    pub summary: LlmRole,
    /// Relationship classification and refinement.
    pub classifier: LlmRole,
    /// Prompt-injection detection.
    pub injection_defense: LlmRole,
    /// Request timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Storage endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `mira_service` database URL.
    pub service_database_url: String,
    /// `mira_memory` database URL.
    pub memory_database_url: String,
    /// Valkey URL.
    pub valkey_url: String,
    /// Vault address.
    pub vault_addr: String,
    /// Root of per-user data directories.
    pub user_data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            service_database_url: "postgres://localhost/mira_service".to_string(),
            memory_database_url: "postgres://localhost/mira_memory".to_string(),
            valkey_url: "redis://127.0.0.1:6379".to_string(),
            vault_addr: "http://127.0.0.1:8200".to_string(),
            user_data_dir: PathBuf::from("data/users"),
        }
    }
}

/// Prompt-injection defense settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    /// LLM-layer rejection threshold.
    pub llm_rejection_threshold: f32,
    /// Content length above which the LLM layer always runs.
    pub llm_scan_min_chars: usize,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            llm_rejection_threshold: 0.85,
            llm_scan_min_chars: 500,
        }
    }
}

/// Background worker cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Segment timeout scan interval in seconds.
    pub timeout_scan_interval_secs: u64,
    /// Batch polling interval in seconds.
    pub batch_poll_interval_secs: u64,
    /// Warning-key offset for TTL persistence in seconds.
    pub ttl_warning_offset_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_scan_interval_secs: 60,
            batch_poll_interval_secs: 30,
            ttl_warning_offset_secs: 10,
        }
    }
}
