//! The reply loop.
//!
//! Drives one user turn to completion: append the user message, call the
//! model with the continuum context and the available tools, execute
//! requested tools, feed results back, repeat until the model ends its
//! turn. Within one continuum only one reply runs at a time; distinct
//! continuums proceed in parallel.

use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::continuum::{ApiFormatOptions, Continuum, ContinuumStore};
use crate::llm::{ChatModel, ChatRequest, LlmBlock, StopReason};
use crate::models::{ContentBlock, MessageContent};
use crate::tools::{InvokeOtherTool, ToolRepository};
use crate::{Error, Result};

/// Iteration cap for one reply; a loop that needs more is stuck.
const MAX_TOOL_ITERATIONS: usize = 16;

/// Outcome of one user turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// The assistant's final text.
    pub response: String,
    /// Tools executed during the turn, in call order.
    pub tools_used: Vec<String>,
}

/// Per-user continuum registry with per-continuum locking.
#[derive(Default)]
pub struct ContinuumPool {
    continuums: Mutex<HashMap<Uuid, Arc<Mutex<Continuum>>>>,
}

impl ContinuumPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets (or creates) a user's continuum handle.
    ///
    /// Holding the returned lock for the whole turn is what sequences
    /// replies within a continuum.
    pub fn continuum_for(&self, user_id: Uuid) -> Arc<Mutex<Continuum>> {
        let mut guard = match self.continuums.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            guard
                .entry(user_id)
                .or_insert_with(|| Arc::new(Mutex::new(Continuum::create_new(user_id)))),
        )
    }
}

/// Drives the model/tool loop for user turns.
pub struct ReplyOrchestrator {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRepository>,
    store: Option<Arc<dyn ContinuumStore>>,
    system_prompt: Option<Value>,
}

impl ReplyOrchestrator {
    /// Creates the orchestrator.
    #[must_use]
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRepository>,
        store: Option<Arc<dyn ContinuumStore>>,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            system_prompt: None,
        }
    }

    /// Sets the system prompt (string or block array with cache markers).
    #[must_use]
    pub fn with_system_prompt(mut self, system: Value) -> Self {
        self.system_prompt = Some(system);
        self
    }

    fn persist(&self, continuum: &Continuum) {
        let Some(store) = &self.store else { return };
        if let Some(message) = continuum.messages().last() {
            if let Err(err) = store.append_message(continuum.id(), message) {
                tracing::error!("message persistence failed: {err}");
            }
        }
    }

    /// Handles one user turn.
    pub fn chat(
        &self,
        continuum: &mut Continuum,
        user_text: &str,
        options: &ApiFormatOptions,
    ) -> Result<ChatOutcome> {
        let user_id = continuum.user_id();
        continuum.add_user_message(user_text)?;
        self.persist(continuum);

        let mut tools_used: Vec<String> = Vec::new();

        for _ in 0..MAX_TOOL_ITERATIONS {
            let request = ChatRequest {
                messages: continuum.get_messages_for_api(options),
                system: self.system_prompt.clone(),
                tools: self.tools.definitions_for(user_id, None),
                ..ChatRequest::default()
            };

            let response = match self.model.generate(&request) {
                Ok(response) => response,
                Err(Error::ToolNotLoaded { tool_name }) => {
                    // The provider refused a call to an unloaded tool.
                    // Feed back a synthetic result that routes the call
                    // through invokeother_tool on the next turn.
                    self.synthesize_lazy_load(continuum, &tool_name)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match response.stop_reason {
                StopReason::ToolUse => {
                    self.run_requested_tools(continuum, &response.content, &mut tools_used)?;
                }
                StopReason::EndTurn | StopReason::MaxTokens => {
                    let text = response.text_content();
                    let mut metadata = Map::new();
                    if let Some(details) = response.reasoning_details {
                        metadata.insert("reasoning_details".into(), details);
                    }
                    continuum.add_assistant_message(text.clone(), Some(metadata))?;
                    self.persist(continuum);
                    return Ok(ChatOutcome {
                        response: text,
                        tools_used,
                    });
                }
            }
        }

        Err(Error::op(
            "reply_loop",
            format!("no end_turn after {MAX_TOOL_ITERATIONS} tool iterations"),
        ))
    }

    /// Appends the assistant's tool-use turn and the tool results.
    fn run_requested_tools(
        &self,
        continuum: &mut Continuum,
        blocks: &[LlmBlock],
        tools_used: &mut Vec<String>,
    ) -> Result<()> {
        let mut content_blocks: Vec<ContentBlock> = Vec::new();
        let mut calls: Vec<(String, String, Value)> = Vec::new();

        for block in blocks {
            match block {
                LlmBlock::Text { text } => {
                    if !text.is_empty() {
                        content_blocks.push(ContentBlock::text(text.clone()));
                    }
                }
                LlmBlock::ToolUse { id, name, input } => {
                    content_blocks.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    calls.push((id.clone(), name.clone(), input.clone()));
                }
                LlmBlock::Thinking { .. } => {}
            }
        }

        let mut metadata = Map::new();
        metadata.insert("has_tool_calls".into(), json!(true));
        continuum
            .add_assistant_message(MessageContent::Blocks(content_blocks), Some(metadata))?;
        self.persist(continuum);

        for (call_id, name, input) in calls {
            let result_text = match self.tools.execute(&name, &input) {
                Ok(result) => result.to_string(),
                Err(Error::ToolNotLoaded { tool_name }) => {
                    // Unknown at execution time: same lazy-load guidance.
                    InvokeOtherTool::synthetic_result(&call_id, &tool_name, &input)[0]
                        ["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string()
                }
                Err(err) => {
                    tracing::warn!("tool '{name}' failed: {err}");
                    json!({"error": err.to_string()}).to_string()
                }
            };
            tools_used.push(name);
            continuum.add_tool_message(result_text, &call_id)?;
            self.persist(continuum);
        }
        Ok(())
    }

    /// Appends a synthetic tool turn after a provider-side rejection.
    fn synthesize_lazy_load(&self, continuum: &mut Continuum, tool_name: &str) -> Result<()> {
        let call_id = format!("toolu_{}", Uuid::new_v4().simple());
        let mut metadata = Map::new();
        metadata.insert("has_tool_calls".into(), json!(true));
        continuum.add_assistant_message(
            MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: call_id.clone(),
                name: tool_name.to_string(),
                input: json!({}),
            }]),
            Some(metadata),
        )?;
        self.persist(continuum);

        let guidance = InvokeOtherTool::synthetic_result(&call_id, tool_name, &json!({}));
        let content = guidance[0]["content"].as_str().unwrap_or_default().to_string();
        continuum.add_tool_message(content, &call_id)?;
        self.persist(continuum);
        tracing::info!("tool '{tool_name}' not loaded, synthesized invokeother guidance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, Usage};
    use crate::observability::{UserContext, enter_user_context};
    use crate::tools::test_support::EchoTool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model: pops one canned result per call.
    struct ScriptedModel {
        script: Mutex<Vec<Result<LlmResponse>>>,
        calls: AtomicUsize,
        last_request_tools: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<LlmResponse>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                last_request_tools: Mutex::new(Vec::new()),
            }
        }
    }

    impl ChatModel for ScriptedModel {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn generate(&self, request: &ChatRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request_tools.lock().unwrap() =
                request.tools.iter().map(|t| t.name.clone()).collect();
            self.script.lock().unwrap().remove(0)
        }
    }

    fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            content: vec![LlmBlock::Text { text: text.into() }],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
            reasoning_details: None,
        }
    }

    fn tool_response(id: &str, name: &str, input: Value) -> LlmResponse {
        LlmResponse {
            content: vec![LlmBlock::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
            reasoning_details: None,
        }
    }

    #[test]
    fn test_plain_turn() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(text_response("Hello!"))]));
        let orchestrator =
            ReplyOrchestrator::new(Arc::clone(&model) as Arc<dyn ChatModel>,
                Arc::new(ToolRepository::new()), None);

        let mut continuum = Continuum::create_new(Uuid::new_v4());
        let _ctx = enter_user_context(UserContext::new(continuum.user_id()));
        let outcome = orchestrator
            .chat(&mut continuum, "hi", &ApiFormatOptions::default())
            .unwrap();

        assert_eq!(outcome.response, "Hello!");
        assert!(outcome.tools_used.is_empty());
        // Sentinel + user + assistant in the hot cache.
        assert_eq!(continuum.messages().len(), 3);
    }

    #[test]
    fn test_tool_loop_executes_and_feeds_back() {
        let repo = Arc::new(ToolRepository::new());
        let echo = Arc::new(EchoTool::new("maps_tool"));
        repo.register(Arc::clone(&echo) as Arc<dyn crate::tools::Tool>).unwrap();

        let model = Arc::new(ScriptedModel::new(vec![
            Ok(tool_response("call_1", "maps_tool", json!({"query": "cafe"}))),
            Ok(text_response("Found a cafe nearby.")),
        ]));
        let orchestrator = ReplyOrchestrator::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            repo,
            None,
        );

        let mut continuum = Continuum::create_new(Uuid::new_v4());
        let _ctx = enter_user_context(UserContext::new(continuum.user_id()));
        let outcome = orchestrator
            .chat(&mut continuum, "any cafes?", &ApiFormatOptions::default())
            .unwrap();

        assert_eq!(outcome.response, "Found a cafe nearby.");
        assert_eq!(outcome.tools_used, vec!["maps_tool".to_string()]);
        assert_eq!(echo.calls.lock().unwrap().len(), 1);

        // The tool result round-tripped into the context of call 2.
        let roles: Vec<String> = continuum
            .messages()
            .iter()
            .map(|m| m.role.to_string())
            .collect();
        assert!(roles.contains(&"tool".to_string()));
    }

    #[test]
    fn test_provider_tool_rejection_recovers_via_invokeother() {
        let repo = Arc::new(ToolRepository::new());
        InvokeOtherTool::install(&repo).unwrap();
        let echo = Arc::new(EchoTool::new("maps_tool"));
        repo.register(Arc::clone(&echo) as Arc<dyn crate::tools::Tool>).unwrap();

        let model = Arc::new(ScriptedModel::new(vec![
            // Provider rejects: maps_tool was not in request.tools.
            Err(Error::ToolNotLoaded {
                tool_name: "maps_tool".into(),
            }),
            // Next turn the model uses invokeother_tool.
            Ok(tool_response(
                "call_2",
                InvokeOtherTool::NAME,
                json!({"tool_name": "maps_tool", "arguments": {"query": "cafe"}}),
            )),
            Ok(text_response("Done.")),
        ]));
        let orchestrator = ReplyOrchestrator::new(
            Arc::clone(&model) as Arc<dyn ChatModel>,
            repo,
            None,
        );

        let mut continuum = Continuum::create_new(Uuid::new_v4());
        let _ctx = enter_user_context(UserContext::new(continuum.user_id()));
        let outcome = orchestrator
            .chat(&mut continuum, "any cafes?", &ApiFormatOptions::default())
            .unwrap();

        assert_eq!(outcome.response, "Done.");
        // The target tool ran, through the lazy-loading path.
        assert_eq!(echo.calls.lock().unwrap().len(), 1);
        assert_eq!(echo.calls.lock().unwrap()[0]["query"], "cafe");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_runaway_tool_loop_errors() {
        let repo = Arc::new(ToolRepository::new());
        let echo = Arc::new(EchoTool::new("maps_tool"));
        repo.register(echo as Arc<dyn crate::tools::Tool>).unwrap();

        let script: Vec<Result<LlmResponse>> = (0..MAX_TOOL_ITERATIONS)
            .map(|i| Ok(tool_response(&format!("call_{i}"), "maps_tool", json!({"query": "x"}))))
            .collect();
        let model = Arc::new(ScriptedModel::new(script));
        let orchestrator = ReplyOrchestrator::new(
            model as Arc<dyn ChatModel>,
            repo,
            None,
        );

        let mut continuum = Continuum::create_new(Uuid::new_v4());
        let _ctx = enter_user_context(UserContext::new(continuum.user_id()));
        assert!(
            orchestrator
                .chat(&mut continuum, "loop forever", &ApiFormatOptions::default())
                .is_err()
        );
    }

    #[test]
    fn test_continuum_pool_reuses_per_user() {
        let pool = ContinuumPool::new();
        let user = Uuid::new_v4();
        let first = pool.continuum_for(user);
        let second = pool.continuum_for(user);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &pool.continuum_for(Uuid::new_v4())));
    }
}
