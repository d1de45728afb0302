//! Deferred tool loading.
//!
//! Some providers reject calls to tools that were not in the request's
//! tool list. When that happens, the orchestrator synthesizes a tool
//! result that routes the desired call through `invokeother_tool`; on the
//! next turn the model's call resolves against the full repository.

use serde_json::{Value, json};
use std::sync::{Arc, Weak};

use super::{Tool, ToolRepository};
use crate::{Error, Result};

/// The distinguished lazy-loading tool.
pub struct InvokeOtherTool {
    repository: Weak<ToolRepository>,
}

impl InvokeOtherTool {
    /// Name of the distinguished tool.
    pub const NAME: &'static str = "invokeother_tool";

    /// Creates the tool over a weak repository handle (the repository owns
    /// the tool, so a strong handle would cycle).
    #[must_use]
    pub const fn new(repository: Weak<ToolRepository>) -> Self {
        Self { repository }
    }

    /// Registers a repository-backed instance into the repository itself.
    pub fn install(repository: &Arc<ToolRepository>) -> Result<()> {
        repository.register(Arc::new(Self::new(Arc::downgrade(repository))))
    }

    /// Builds the synthetic tool-result content the orchestrator feeds
    /// back when a provider rejected a call to `tool_name`.
    #[must_use]
    pub fn synthetic_result(tool_call_id: &str, tool_name: &str, arguments: &Value) -> Value {
        json!([{
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": format!(
                "Tool '{tool_name}' was not loaded for this turn. Call {} with \
                 tool_name=\"{tool_name}\" and the same arguments to run it: {arguments}",
                Self::NAME
            ),
        }])
    }
}

impl Tool for InvokeOtherTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Invokes a tool that is not currently loaded. Use when a direct call to a \
         tool was rejected because it was unavailable."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tool_name": {
                    "type": "string",
                    "description": "Name of the tool to invoke"
                },
                "arguments": {
                    "type": "object",
                    "description": "Arguments to pass through to the tool"
                }
            },
            "required": ["tool_name"]
        })
    }

    fn run(&self, args: &Value) -> Result<Value> {
        let tool_name = args
            .get("tool_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidInput("missing 'tool_name'".to_string()))?;
        if tool_name == Self::NAME {
            return Err(Error::InvalidInput(
                "invokeother_tool cannot invoke itself".to_string(),
            ));
        }
        let arguments = args.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let repository = self.repository.upgrade().ok_or_else(|| {
            Error::op("invokeother_tool", "tool repository no longer alive")
        })?;
        tracing::info!("lazy-loading tool '{tool_name}' via {}", Self::NAME);
        repository.execute(tool_name, &arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{UserContext, enter_user_context};
    use crate::tools::test_support::EchoTool;
    use uuid::Uuid;

    #[test]
    fn test_invoke_other_routes_to_target_tool() {
        let repo = Arc::new(ToolRepository::new());
        InvokeOtherTool::install(&repo).unwrap();
        repo.register(Arc::new(EchoTool::new("maps_tool"))).unwrap();

        let _ctx = enter_user_context(UserContext::new(Uuid::new_v4()));
        let result = repo
            .execute(
                InvokeOtherTool::NAME,
                &json!({"tool_name": "maps_tool", "arguments": {"query": "cafe"}}),
            )
            .unwrap();
        assert_eq!(result["echo"]["query"], "cafe");
    }

    #[test]
    fn test_invoke_other_rejects_self_invocation() {
        let repo = Arc::new(ToolRepository::new());
        InvokeOtherTool::install(&repo).unwrap();
        let _ctx = enter_user_context(UserContext::new(Uuid::new_v4()));

        let err = repo
            .execute(
                InvokeOtherTool::NAME,
                &json!({"tool_name": InvokeOtherTool::NAME}),
            )
            .unwrap_err();
        assert!(err.to_string().contains("cannot invoke itself"));
    }

    #[test]
    fn test_unknown_target_surfaces_tool_not_loaded() {
        let repo = Arc::new(ToolRepository::new());
        InvokeOtherTool::install(&repo).unwrap();
        let _ctx = enter_user_context(UserContext::new(Uuid::new_v4()));

        let err = repo
            .execute(
                InvokeOtherTool::NAME,
                &json!({"tool_name": "nonexistent_tool"}),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotLoaded { .. }));
    }

    #[test]
    fn test_synthetic_result_shape() {
        let result = InvokeOtherTool::synthetic_result(
            "call_7",
            "maps_tool",
            &json!({"query": "cafe"}),
        );
        assert_eq!(result[0]["type"], "tool_result");
        assert_eq!(result[0]["tool_use_id"], "call_7");
        let content = result[0]["content"].as_str().unwrap();
        assert!(content.contains("maps_tool"));
        assert!(content.contains(InvokeOtherTool::NAME));
    }
}
