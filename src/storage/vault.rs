//! Vault-backed secret retrieval with a process-wide cache.
//!
//! First read of a path/field hits Vault; later reads come from the cache.
//! Authentication is AppRole (`VAULT_ROLE_ID` + `VAULT_SECRET_ID`) or a
//! pre-issued token. Auth failures and forbidden paths raise
//! [`Error::PermissionDenied`] without revealing whether a path exists.
//! Unknown services and missing fields produce errors that list the valid
//! options instead of a bare 404.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::{Error, Result};

/// Services with API keys under `mira/api_keys/<service>`.
const KNOWN_API_SERVICES: &[&str] = &[
    "anthropic",
    "openrouter",
    "groq",
    "openai",
    "google_maps",
    "brave_search",
];

/// Vault KV v2 client with a process-wide secret cache.
pub struct VaultClient {
    addr: String,
    http: reqwest::blocking::Client,
    token: Mutex<Option<SecretString>>,
    cache: Mutex<HashMap<(String, String), SecretString>>,
}

impl VaultClient {
    /// Creates an unauthenticated client; call [`Self::login_approle`] or
    /// [`Self::with_token`] before reading secrets.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            http: reqwest::blocking::Client::new(),
            token: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Uses a pre-issued token.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(SecretString::from(token.into()));
        }
        self
    }

    /// Authenticates via AppRole.
    pub fn login_approle(&self, role_id: &str, secret_id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/auth/approle/login", self.addr))
            .json(&serde_json::json!({"role_id": role_id, "secret_id": secret_id}))
            .send()
            .map_err(|e| Error::op("vault_login", e))?;

        let status = response.status().as_u16();
        if status == 400 || status == 403 {
            return Err(Error::PermissionDenied(
                "vault AppRole authentication failed".to_string(),
            ));
        }
        if status >= 400 {
            return Err(Error::op("vault_login", format!("status {status}")));
        }

        let body: Value = response.json().map_err(|e| Error::op("vault_login", e))?;
        let client_token = body
            .pointer("/auth/client_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::op("vault_login", "no client_token in auth response"))?;

        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(SecretString::from(client_token.to_string()));
        }
        tracing::info!("vault AppRole login succeeded");
        Ok(())
    }

    fn current_token(&self) -> Result<String> {
        self.token
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|t| t.expose_secret().to_string()))
            .ok_or_else(|| {
                Error::PermissionDenied("vault client is not authenticated".to_string())
            })
    }

    /// Reads one field of a KV v2 secret, cache-first.
    pub fn get_secret(&self, path: &str, field: &str) -> Result<SecretString> {
        let cache_key = (path.to_string(), field.to_string());
        if let Ok(cache) = self.cache.lock() {
            if let Some(secret) = cache.get(&cache_key) {
                return Ok(secret.clone());
            }
        }

        let token = self.current_token()?;
        let response = self
            .http
            .get(format!("{}/v1/secret/data/{path}", self.addr))
            .header("X-Vault-Token", token)
            .send()
            .map_err(|e| Error::op("vault_read", e))?;

        match response.status().as_u16() {
            200 => {}
            401 | 403 => {
                // Same error whether the path exists or not.
                return Err(Error::PermissionDenied(format!(
                    "access denied reading vault secret (path redacted, field '{field}')"
                )));
            }
            404 => {
                return Err(Error::NotFound(format!("vault secret '{path}' not found")));
            }
            status => {
                return Err(Error::op("vault_read", format!("status {status}")));
            }
        }

        let body: Value = response.json().map_err(|e| Error::op("vault_read", e))?;
        let data = body
            .pointer("/data/data")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::op("vault_read", "malformed KV v2 response"))?;

        let Some(value) = data.get(field).and_then(Value::as_str) else {
            let mut available: Vec<&str> = data.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(Error::NotFound(format!(
                "field '{field}' not in vault secret '{path}'; available fields: {}",
                available.join(", ")
            )));
        };

        let secret = SecretString::from(value.to_string());
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(cache_key, secret.clone());
        }
        Ok(secret)
    }

    /// Reads an API key for a known service (`mira/api_keys/<service>`).
    pub fn get_api_key(&self, service: &str) -> Result<SecretString> {
        if !KNOWN_API_SERVICES.contains(&service) {
            return Err(Error::NotFound(format!(
                "unknown API key service '{service}'; valid services: {}",
                KNOWN_API_SERVICES.join(", ")
            )));
        }
        self.get_secret(&format!("mira/api_keys/{service}"), "key")
    }

    /// Reads the database URL for a service (`mira/database/<service>_url`).
    pub fn get_database_url(&self, service: &str) -> Result<SecretString> {
        self.get_secret("mira/database", &format!("{service}_url"))
    }

    /// Drops the cached secrets (tests, credential rotation).
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Seeds the cache directly; test helper.
    #[cfg(test)]
    pub(crate) fn seed_cache(&self, path: &str, field: &str, value: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                (path.to_string(), field.to_string()),
                SecretString::from(value.to_string()),
            );
        }
    }
}
