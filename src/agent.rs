//! Conversation state machine.
//!
//! One call to [`Agent::run_turn`] processes one human input to completion:
//! assistant steps alternate with capability dispatch until the model
//! produces a final text reply (or the step limit is hit). Each assistant
//! step computes the conversation phase, gates the capability set through
//! [`allowed_capabilities`], invokes the model, and reconciles the
//! confirmation flags. A confirmation request never reaches the
//! confirmation capability directly — the router sends the draft through
//! the refinement pipeline first.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gate::{allowed_capabilities, ConversationPhase};
use crate::history::{ToolInvocation, Transcript, TurnEvent};
use crate::llm_client::ChatModel;
use crate::prompts::{ASSISTANT_FEW_SHOT, DEFAULT_SYSTEM_PROMPT};
use crate::refine::{Refinement, RefinementPipeline};
use crate::tools::{confirm, execute, DispatchContext, ToolCall, ToolRegistry};

pub const DEFAULT_TEMPERATURE: f32 = 0.4;
pub const DEFAULT_MAX_TURN_STEPS: usize = 10;

/// Per-session conversation state. Sessions are independent; nothing here
/// is shared across session identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub transcript: Transcript,
    /// Current draft query, set when the model requests confirmation and
    /// possibly replaced by the optimizer's rewrite.
    pub generated_sql: Option<String>,
    /// True exactly while a draft is proposed but neither affirmed nor
    /// executed.
    pub awaiting_confirmation: bool,
    /// Latest critic verdict; delivered into exactly one model turn.
    pub feedback: Option<String>,
}

impl SessionState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transcript: Transcript::new(),
            generated_sql: None,
            awaiting_confirmation: false,
            feedback: None,
        }
    }
}

enum StepOutcome {
    /// No capability requests: the turn ends with this text.
    Final(String),
    /// Capability requests to route, under the gate that produced them.
    Requests {
        calls: Vec<ToolCall>,
        ctx: DispatchContext,
    },
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    pipeline: RefinementPipeline,
    system_prompt: String,
    temperature: f32,
    max_turn_steps: usize,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        pipeline: RefinementPipeline,
    ) -> Self {
        Self {
            model,
            registry,
            pipeline,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_turn_steps: DEFAULT_MAX_TURN_STEPS,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_turn_steps(mut self, max_turn_steps: usize) -> Self {
        self.max_turn_steps = max_turn_steps.max(1);
        self
    }

    /// Process one human input: state in, new state + final reply out.
    ///
    /// Model-backend failures propagate as errors; the returned state is
    /// then discarded by the caller, so retrying the same turn is safe.
    pub async fn run_turn(
        &self,
        mut state: SessionState,
        user_message: &str,
    ) -> Result<(SessionState, String)> {
        state.transcript.push(TurnEvent::human(user_message));

        for step in 0..self.max_turn_steps {
            tracing::debug!(session = %state.id, step, "assistant step");
            match self.assistant_step(&mut state).await? {
                StepOutcome::Final(text) => return Ok((state, text)),
                StepOutcome::Requests { calls, ctx } => {
                    for call in &calls {
                        if call.name == confirm::NAME {
                            self.handle_confirmation_request(&mut state, call, &ctx)
                                .await?;
                        } else {
                            let result = self.registry.execute_call(call, &ctx).await;
                            state.transcript.push(TurnEvent::tool_result(
                                result.call_id,
                                result.name,
                                result.output.to_llm_string(),
                            ));
                        }
                    }
                }
            }
        }

        tracing::warn!(
            session = %state.id,
            "turn hit the {}-step capability limit",
            self.max_turn_steps
        );
        let notice = format!(
            "[Reached maximum of {} capability-calling steps]",
            self.max_turn_steps
        );
        Ok((state, notice))
    }

    /// One model invocation plus flag reconciliation: compute the phase,
    /// gate the capabilities, invoke, then fold the requested calls and
    /// any observed affirmation back into the state.
    async fn assistant_step(&self, state: &mut SessionState) -> Result<StepOutcome> {
        // 1. Was an affirmative confirmation observed since the last human input?
        let is_confirmed = state.transcript.confirmation_since_last_human();
        let phase = ConversationPhase::of(is_confirmed, state.generated_sql.is_some());
        let allowed = allowed_capabilities(phase);

        // 2–3. Assemble instructions; history normalization happens inside to_wire.
        let instructions = self.build_instructions(state, is_confirmed);
        let wire = state.transcript.to_wire(&instructions);
        let tool_defs = self.registry.definitions_for(allowed).await;

        // 4. Invoke the model with the gated capability set.
        let reply = self
            .model
            .invoke(&wire, &tool_defs, self.temperature)
            .await
            .context("model invocation failed")?;

        // 5. Interpret requested capability calls.
        let calls = parse_tool_calls(&reply);
        let invocations: Vec<ToolInvocation> = calls
            .iter()
            .map(|call| ToolInvocation {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .collect();
        state
            .transcript
            .push(TurnEvent::assistant(reply.content.clone(), invocations));

        if calls.is_empty() {
            // No active proposal this step.
            state.awaiting_confirmation = false;
        } else {
            for call in &calls {
                if call.name == confirm::NAME {
                    if let Some(query) = query_argument(&call.arguments) {
                        state.generated_sql = Some(query);
                    }
                    // Invariant: awaiting only with a draft present.
                    if state.generated_sql.is_some() {
                        state.awaiting_confirmation = true;
                    }
                } else if call.name == execute::NAME {
                    // Requesting execution closes the window; the draft is
                    // spent and must not leak into the next question.
                    state.awaiting_confirmation = false;
                    state.generated_sql = None;
                }
            }
        }

        // 6. User affirmation always closes the window.
        if is_confirmed {
            state.awaiting_confirmation = false;
        }

        // 7. Feedback is single-use.
        state.feedback = None;

        if calls.is_empty() {
            Ok(StepOutcome::Final(reply.content.unwrap_or_default()))
        } else {
            Ok(StepOutcome::Requests {
                calls,
                ctx: DispatchContext::for_session(&state.id, allowed),
            })
        }
    }

    /// Route a confirmation request through the refinement pipeline. Only
    /// an approved (possibly rewritten) draft reaches the confirmation
    /// capability.
    async fn handle_confirmation_request(
        &self,
        state: &mut SessionState,
        call: &ToolCall,
        ctx: &DispatchContext,
    ) -> Result<()> {
        let draft = query_argument(&call.arguments).or_else(|| state.generated_sql.clone());
        let Some(draft) = draft else {
            // Malformed confirmation without any draft: no-op on state.
            state.transcript.push(TurnEvent::tool_result(
                call.call_id.clone(),
                confirm::NAME,
                "No draft query to confirm.",
            ));
            return Ok(());
        };

        match self.pipeline.refine(&draft).await? {
            Refinement::Rejected { verdict } => {
                state.feedback = Some(verdict.clone());
                state.transcript.push(TurnEvent::tool_result(
                    call.call_id.clone(),
                    confirm::NAME,
                    format!("Validation failed: {}", verdict),
                ));
            }
            Refinement::Approved { query, advisory } => {
                state.generated_sql = Some(query.clone());
                if advisory.is_some() {
                    state.feedback = advisory;
                }
                let refined_call = ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    arguments: serde_json::json!({ "query": query }),
                };
                let result = self.registry.execute_call(&refined_call, ctx).await;
                state.transcript.push(TurnEvent::tool_result(
                    result.call_id,
                    result.name,
                    result.output.to_llm_string(),
                ));
            }
        }
        Ok(())
    }

    fn build_instructions(&self, state: &SessionState, is_confirmed: bool) -> String {
        let mut parts = vec![self.system_prompt.clone(), ASSISTANT_FEW_SHOT.to_string()];
        if let Some(feedback) = &state.feedback {
            parts.push(format!(
                "Reviewer feedback on your last proposed query:\n{}",
                feedback
            ));
        }
        if !is_confirmed {
            if let Some(sql) = &state.generated_sql {
                parts.push(format!(
                    "A draft query is awaiting user confirmation:\n{}",
                    sql
                ));
            }
        }
        parts.join("\n\n")
    }
}

fn parse_tool_calls(reply: &crate::llm_client::ChatMessage) -> Vec<ToolCall> {
    let Some(raw_calls) = reply.tool_calls.as_ref() else {
        return Vec::new();
    };
    raw_calls
        .iter()
        .map(|tc| {
            let arguments: serde_json::Value = serde_json::from_str(&tc.function.arguments)
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse capability arguments as JSON: {}", e);
                    serde_json::json!({})
                });
            ToolCall {
                call_id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments,
            }
        })
        .collect()
}

fn query_argument(arguments: &serde_json::Value) -> Option<String> {
    arguments
        .get("query")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::history::TurnEvent;
    use crate::llm_client::{ChatMessage, LlmFunctionCall, LlmToolCall, ToolDef};
    use crate::tools::execute::ExecuteSqlTool;
    use crate::tools::schema::SchemaTool;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted assistant messages and records what each
    /// invocation was allowed to call and instructed with.
    struct ScriptedModel {
        replies: Mutex<VecDeque<ChatMessage>>,
        seen_tools: Mutex<Vec<Vec<String>>>,
        seen_instructions: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen_tools: Mutex::new(Vec::new()),
                seen_instructions: Mutex::new(Vec::new()),
            })
        }

        fn tools_seen(&self) -> Vec<Vec<String>> {
            self.seen_tools.lock().unwrap().clone()
        }

        fn instructions_seen(&self) -> Vec<String> {
            self.seen_instructions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn invoke(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDef],
            _temperature: f32,
        ) -> Result<ChatMessage> {
            self.seen_tools
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.function.name.clone()).collect());
            self.seen_instructions
                .lock()
                .unwrap()
                .push(messages[0].content.clone().unwrap_or_default());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .map(Ok)
                .unwrap_or_else(|| anyhow::bail!("model invoked more times than scripted"))
        }
    }

    struct OkCritic;

    #[async_trait]
    impl ChatModel for OkCritic {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDef],
            _temperature: f32,
        ) -> Result<ChatMessage> {
            Ok(ChatMessage::assistant("OK"))
        }
    }

    struct RejectingCritic;

    #[async_trait]
    impl ChatModel for RejectingCritic {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDef],
            _temperature: f32,
        ) -> Result<ChatMessage> {
            Ok(ChatMessage::assistant(
                "Table 'workers' does not exist in the schema.",
            ))
        }
    }

    fn calling(name: &str, arguments: serde_json::Value) -> ChatMessage {
        ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![LlmToolCall {
                id: format!("call_{}", name),
                call_type: "function".to_string(),
                function: LlmFunctionCall {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }]),
            tool_call_id: None,
        }
    }

    async fn registry_with_demo_db() -> Arc<ToolRegistry> {
        let db = Arc::new(Database::in_memory().unwrap());
        db.seed_demo_data().unwrap();
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SchemaTool::new(db.clone()))).await;
        registry
            .register(Arc::new(ExecuteSqlTool::new(db.clone())))
            .await;
        registry
            .register(Arc::new(crate::tools::confirm::ConfirmQueryTool::new()))
            .await;
        registry
    }

    fn agent(
        model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        critic: Arc<dyn ChatModel>,
    ) -> Agent {
        Agent::new(model, registry, RefinementPipeline::new(critic))
    }

    fn confirm_results(state: &SessionState) -> Vec<String> {
        state
            .transcript
            .events()
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolResult { tool, content, .. } if tool == confirm::NAME => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect()
    }

    const DRAFT: &str = "SELECT name FROM employees WHERE dep_id = 5";

    #[tokio::test]
    async fn fresh_turn_routes_schema_call_through_dispatcher() {
        let model = ScriptedModel::new(vec![
            calling("get_database_schema", serde_json::json!({})),
            ChatMessage::assistant("The database has five tables."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(OkCritic));

        let (state, reply) = agent
            .run_turn(SessionState::new("s1"), "what tables are there?")
            .await
            .unwrap();

        assert_eq!(reply, "The database has five tables.");
        // The gate for the fresh first step included schema introspection
        // but not execution.
        let first_step_tools = &model.tools_seen()[0];
        assert!(first_step_tools.contains(&"get_database_schema".to_string()));
        assert!(!first_step_tools.contains(&"execute_sql".to_string()));
        // The dispatcher produced a result event for the call.
        assert!(state.transcript.events().iter().any(|e| matches!(
            e,
            TurnEvent::ToolResult { tool, content, .. }
                if tool == "get_database_schema" && content.contains("Table: departments")
        )));
        assert!(!state.awaiting_confirmation);
    }

    #[tokio::test]
    async fn confirmed_proposal_unlocks_execution_and_runs_query() {
        let model = ScriptedModel::new(vec![
            calling("confirm_query", serde_json::json!({ "query": DRAFT })),
            calling("execute_sql", serde_json::json!({ "query": DRAFT })),
            ChatMessage::assistant("Maria and Ivan work in Data Science."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(OkCritic));

        let (state, reply) = agent
            .run_turn(SessionState::new("s1"), "yes, run it")
            .await
            .unwrap();

        assert_eq!(reply, "Maria and Ivan work in Data Science.");
        // After the confirmation result, the next step had full access.
        assert!(model.tools_seen()[1].contains(&"execute_sql".to_string()));
        // Confirmation capability affirmed.
        assert_eq!(confirm_results(&state), vec!["true".to_string()]);
        // Execution results landed in the transcript.
        assert!(state.transcript.events().iter().any(|e| matches!(
            e,
            TurnEvent::ToolResult { tool, content, .. }
                if tool == "execute_sql" && content.contains("Maria")
        )));
        // Affirmation closed the window and the draft is spent.
        assert!(!state.awaiting_confirmation);
        assert!(state.generated_sql.is_none());
    }

    #[tokio::test]
    async fn validator_rejection_feeds_back_and_blocks_confirmation() {
        let model = ScriptedModel::new(vec![
            calling(
                "confirm_query",
                serde_json::json!({ "query": "SELECT * FROM workers" }),
            ),
            ChatMessage::assistant("That table does not exist; let me look at the schema."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(RejectingCritic));

        let (state, _reply) = agent
            .run_turn(SessionState::new("s1"), "show me all workers")
            .await
            .unwrap();

        // The verdict reached the next model step as feedback...
        assert!(model.instructions_seen()[1].contains("does not exist"));
        // ...and was consumed by it.
        assert!(state.feedback.is_none());
        // The confirmation capability never affirmed anything.
        let results = confirm_results(&state);
        assert_eq!(results.len(), 1);
        assert!(results[0].starts_with("Validation failed:"));
        // The rejected draft stayed as proposed (unchanged by the pipeline).
        assert_eq!(state.generated_sql.as_deref(), Some("SELECT * FROM workers"));
    }

    #[tokio::test]
    async fn optimizer_rewrite_reaches_confirmation_with_new_text() {
        struct RewritingCritic;

        #[async_trait]
        impl ChatModel for RewritingCritic {
            async fn invoke(
                &self,
                messages: &[ChatMessage],
                _tools: &[ToolDef],
                _temperature: f32,
            ) -> Result<ChatMessage> {
                let is_validator = messages[0]
                    .content
                    .as_deref()
                    .unwrap_or_default()
                    .contains("strict technical reviewer");
                Ok(if is_validator {
                    ChatMessage::assistant("OK")
                } else {
                    ChatMessage::assistant(
                        "Add a LIMIT.\n```sql\nSELECT name FROM employees LIMIT 10\n```",
                    )
                })
            }
        }

        let model = ScriptedModel::new(vec![
            calling(
                "confirm_query",
                serde_json::json!({ "query": "SELECT name FROM employees" }),
            ),
            ChatMessage::assistant("Confirmed, ready to execute."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(RewritingCritic));

        let (state, _reply) = agent
            .run_turn(SessionState::new("s1"), "yes")
            .await
            .unwrap();

        // The rewritten text became the draft that was confirmed.
        assert_eq!(
            state.generated_sql.as_deref(),
            Some("SELECT name FROM employees LIMIT 10")
        );
        assert_eq!(confirm_results(&state), vec!["true".to_string()]);
        // Advisory feedback was delivered to the following step.
        assert!(model.instructions_seen()[1].contains("Add a LIMIT."));
    }

    #[tokio::test]
    async fn affirmation_closes_window_even_without_execution() {
        let model = ScriptedModel::new(vec![
            calling("confirm_query", serde_json::json!({ "query": DRAFT })),
            ChatMessage::assistant("Confirmed. Say the word and I will run it."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(OkCritic));

        let (state, _reply) = agent
            .run_turn(SessionState::new("s1"), "yes")
            .await
            .unwrap();

        // Confirmation observed, second step produced no calls: window closed.
        assert!(!state.awaiting_confirmation);
    }

    #[tokio::test]
    async fn malformed_confirmation_without_draft_is_a_no_op() {
        let model = ScriptedModel::new(vec![
            calling("confirm_query", serde_json::json!({})),
            ChatMessage::assistant("There is nothing to confirm yet."),
        ]);
        let registry = registry_with_demo_db().await;
        let agent = agent(model.clone(), registry, Arc::new(OkCritic));

        let (state, _reply) = agent
            .run_turn(SessionState::new("s1"), "yes")
            .await
            .unwrap();

        assert!(state.generated_sql.is_none());
        assert!(!state.awaiting_confirmation);
        let results = confirm_results(&state);
        assert_eq!(results, vec!["No draft query to confirm.".to_string()]);
    }

    #[tokio::test]
    async fn runaway_capability_loop_hits_step_limit() {
        let model = ScriptedModel::new(vec![
            calling("get_database_schema", serde_json::json!({})),
            calling("get_database_schema", serde_json::json!({})),
            calling("get_database_schema", serde_json::json!({})),
        ]);
        let registry = registry_with_demo_db().await;
        let agent =
            agent(model.clone(), registry, Arc::new(OkCritic)).with_max_turn_steps(3);

        let (_state, reply) = agent
            .run_turn(SessionState::new("s1"), "loop please")
            .await
            .unwrap();
        assert!(reply.contains("maximum of 3"));
    }

    #[tokio::test]
    async fn model_failure_propagates_and_turn_ends() {
        struct BrokenModel;

        #[async_trait]
        impl ChatModel for BrokenModel {
            async fn invoke(
                &self,
                _messages: &[ChatMessage],
                _tools: &[ToolDef],
                _temperature: f32,
            ) -> Result<ChatMessage> {
                anyhow::bail!("backend unreachable")
            }
        }

        let registry = registry_with_demo_db().await;
        let agent = agent(Arc::new(BrokenModel), registry, Arc::new(OkCritic));
        let err = agent
            .run_turn(SessionState::new("s1"), "hello")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model invocation failed"));
    }
}
