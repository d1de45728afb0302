//! Tool repository and invocation protocol.
//!
//! Tools are objects with a stable name, an Anthropic-style JSON schema,
//! a per-user availability predicate, and a `run` that executes under the
//! ambient user context. Tools never take `user_id` as a parameter and
//! never print; they log.

mod invoke_other;

pub use invoke_other::InvokeOtherTool;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::llm::ToolDefinition;
use crate::{Error, Result};

/// A tool invocable by the LLM loop.
pub trait Tool: Send + Sync {
    /// Stable tool name.
    fn name(&self) -> &'static str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// Anthropic-style JSON schema of the arguments.
    fn input_schema(&self) -> Value;

    /// Whether the tool is available for this user (may be gated on DB
    /// state).
    fn is_available(&self, _user_id: Uuid) -> bool {
        true
    }

    /// Executes the tool under the ambient user context.
    fn run(&self, args: &Value) -> Result<Value>;
}

/// Registry of tools with per-request availability and validation.
#[derive(Default)]
pub struct ToolRepository {
    tools: RwLock<HashMap<&'static str, Arc<dyn Tool>>>,
}

impl ToolRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool; the name must be unique.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name();
        let Ok(mut tools) = self.tools.write() else {
            return Err(Error::op("tool_register", "registry lock poisoned"));
        };
        if tools.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "tool '{name}' is already registered"
            )));
        }
        tools.insert(name, tool);
        tracing::debug!("registered tool '{name}'");
        Ok(())
    }

    /// Looks a tool up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok().and_then(|tools| tools.get(name).cloned())
    }

    /// All registered tool names.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools
            .read()
            .map(|tools| tools.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Tool definitions available to this user, restricted to `loaded`
    /// when the caller trims the per-request tool set.
    #[must_use]
    pub fn definitions_for(
        &self,
        user_id: Uuid,
        loaded: Option<&[String]>,
    ) -> Vec<ToolDefinition> {
        let Ok(tools) = self.tools.read() else {
            return Vec::new();
        };
        let mut definitions: Vec<ToolDefinition> = tools
            .values()
            .filter(|tool| tool.is_available(user_id))
            .filter(|tool| {
                loaded.is_none_or(|names| names.iter().any(|n| n.as_str() == tool.name()))
            })
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Validates arguments against a tool's schema `required` list.
    fn validate_args(tool: &dyn Tool, args: &Value) -> Result<()> {
        let schema = tool.input_schema();
        let Some(required) = schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };
        for field in required.iter().filter_map(Value::as_str) {
            let present = args.get(field).is_some_and(|v| !v.is_null());
            if !present {
                return Err(Error::InvalidInput(format!(
                    "tool '{}' missing required argument '{field}'",
                    tool.name()
                )));
            }
        }
        Ok(())
    }

    /// Resolves and executes a tool call for the ambient user.
    ///
    /// # Errors
    ///
    /// [`Error::ToolNotLoaded`] for unknown or unavailable tools (the
    /// orchestrator converts this into `invokeother_tool` lazy loading);
    /// [`Error::InvalidInput`] when required arguments are missing.
    pub fn execute(&self, name: &str, args: &Value) -> Result<Value> {
        let user_id = crate::observability::current_user_id()?;
        let Some(tool) = self.get(name) else {
            return Err(Error::ToolNotLoaded {
                tool_name: name.to_string(),
            });
        };
        if !tool.is_available(user_id) {
            return Err(Error::ToolNotLoaded {
                tool_name: name.to_string(),
            });
        }

        Self::validate_args(tool.as_ref(), args)?;
        tracing::info!("executing tool '{name}'");
        metrics::counter!("mira_tool_invocations_total").increment(1);
        tool.run(args)
    }
}
