//! Provider-neutral generation facade.
//!
//! One entry point, [`LlmProvider::generate_response`]. When the call
//! carries an `endpoint_url`, the generic OpenAI-compatible path is used;
//! otherwise the native Anthropic client. Clients are constructed per call
//! (cheap, no shared mutable state), so per-role overrides in config never
//! leak between callers.

use serde_json::Value;

use super::anthropic::AnthropicClient;
use super::openai_compat::OpenAiCompatClient;
use super::types::{ChatRequest, LlmResponse};
use super::{ChatModel, HttpConfig};
use crate::config::LlmRole;
use crate::{Error, Result};

/// Per-call routing parameters layered over [`ChatRequest`].
#[derive(Debug, Clone, Default)]
pub struct GenerateParams {
    /// OpenAI-compatible endpoint; `None` routes to native Anthropic.
    pub endpoint_url: Option<String>,
    /// Model override.
    pub model_override: Option<String>,
    /// API key override (from Vault for third-party providers).
    pub api_key_override: Option<String>,
}

impl GenerateParams {
    /// Builds routing params from a configured internal role.
    #[must_use]
    pub fn for_role(role: &LlmRole, api_key: Option<String>) -> Self {
        Self {
            endpoint_url: role.endpoint_url.clone(),
            model_override: role.model.clone(),
            api_key_override: api_key,
        }
    }
}

/// The facade the rest of the core calls for LLM generation.
pub struct LlmProvider {
    anthropic_api_key: Option<String>,
    default_model: String,
    http: HttpConfig,
}

impl LlmProvider {
    /// Creates a provider with the Anthropic default path configured.
    #[must_use]
    pub fn new(anthropic_api_key: Option<String>, default_model: impl Into<String>) -> Self {
        Self {
            anthropic_api_key,
            default_model: default_model.into(),
            http: HttpConfig::default(),
        }
    }

    /// Overrides HTTP timeouts for all constructed clients.
    #[must_use]
    pub const fn with_http_config(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }

    /// Generates a response, routing on `params.endpoint_url`.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextOverflow`] when the prompt exceeds the window;
    /// - [`Error::ToolNotLoaded`] when the provider rejected a tool call;
    /// - [`Error::PermissionDenied`] / [`Error::RateLimited`] /
    ///   [`Error::OperationFailed`] per the wire error mapping.
    pub fn generate_response(
        &self,
        request: &ChatRequest,
        params: &GenerateParams,
    ) -> Result<LlmResponse> {
        if let Some(endpoint) = &params.endpoint_url {
            let model = params
                .model_override
                .clone()
                .unwrap_or_else(|| self.default_model.clone());
            let client =
                OpenAiCompatClient::new(endpoint.clone(), model, params.api_key_override.clone())
                    .with_http_config(self.http);
            tracing::debug!("routing generation to {}", client.name());
            return client.generate(request);
        }

        let api_key = params
            .api_key_override
            .clone()
            .or_else(|| self.anthropic_api_key.clone())
            .ok_or_else(|| {
                Error::PermissionDenied("no Anthropic API key configured".to_string())
            })?;
        let model = params
            .model_override
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let client = AnthropicClient::new(api_key, model).with_http_config(self.http);
        tracing::debug!("routing generation to {}", client.name());
        client.generate(request)
    }

    /// Returns the concatenated text blocks of a response.
    #[must_use]
    pub fn extract_text_content(response: &LlmResponse) -> String {
        response.text_content()
    }
}

/// A `cache_control` marker value for prompt caching.
#[must_use]
pub fn ephemeral_cache_control() -> Value {
    serde_json::json!({"type": "ephemeral"})
}

/// A provider facade pinned to one routing configuration.
///
/// This is the [`super::ChatModel`] the orchestrator and internal services
/// consume; swapping providers means swapping params, not call sites.
pub struct RoutedChatModel {
    provider: LlmProvider,
    params: GenerateParams,
}

impl RoutedChatModel {
    /// Pins a provider to routing params.
    #[must_use]
    pub const fn new(provider: LlmProvider, params: GenerateParams) -> Self {
        Self { provider, params }
    }
}

impl super::ChatModel for RoutedChatModel {
    fn name(&self) -> &'static str {
        "routed"
    }

    fn generate(&self, request: &ChatRequest) -> Result<LlmResponse> {
        self.provider.generate_response(request, &self.params)
    }
}
