//! Capability system: the external-effect primitives the model may invoke.
//!
//! Each capability declares a JSON Schema for its parameters, enabling LLM
//! function-calling, and is registered in a thread-safe [`ToolRegistry`].
//! The registry is the dispatcher of the system: it executes requested
//! calls one by one, isolates failures per call (an error becomes a result
//! text, never a raised error), and filters both execution and the
//! advertised definitions through the capability gate's allowed set.

pub mod confirm;
pub mod execute;
pub mod knowledge;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::llm_client::{FunctionDef, ToolDef};

/// The result of executing a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolOutput {
    /// Successful text output
    Text(String),
    /// Successful structured output
    Json(serde_json::Value),
    /// Execution failed; the model sees this text and may self-correct
    Error(String),
}

impl ToolOutput {
    /// String representation suitable for feeding back to the model.
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Text(_) | ToolOutput::Json(_))
    }
}

/// Per-dispatch policy context. The allowed list comes from the capability
/// gate; `None` means unrestricted (used only in tests).
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub session_id: String,
    pub allowed_tools: Option<Vec<String>>,
}

impl DispatchContext {
    pub fn for_session(session_id: impl Into<String>, allowed: &[&str]) -> Self {
        Self {
            session_id: session_id.into(),
            allowed_tools: Some(allowed.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed
                .iter()
                .any(|name| name.eq_ignore_ascii_case(tool_name)),
            None => true,
        }
    }
}

/// A capability the model can request during a turn.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g. "execute_sql")
    fn name(&self) -> &str;

    /// Human-readable description shown to the model
    fn description(&self) -> &str;

    /// JSON Schema describing the capability's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &DispatchContext)
        -> Result<ToolOutput>;
}

/// A capability-call request parsed from model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of one call, ready to append to the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub output: ToolOutput,
}

/// Thread-safe registry of the capabilities available to the agent.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a capability. Overwrites any existing one with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!("Registered capability: {}", name);
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// OpenAI-format tool definitions for the capabilities the gate allows
    /// this turn. Order follows the allowed list so prompts are stable.
    pub async fn definitions_for(&self, allowed: &[&str]) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        allowed
            .iter()
            .filter_map(|name| tools.get(*name))
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Execute one capability call.
    ///
    /// Unknown names and internal errors are converted to error results;
    /// nothing raised here ever aborts the remaining calls of a turn.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &DispatchContext) -> ToolCallResult {
        if !ctx.allows_tool(&call.name) {
            return ToolCallResult {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                output: ToolOutput::Error(format!(
                    "Capability '{}' is not available in this turn",
                    call.name
                )),
            };
        }

        let tool = match self.get(&call.name).await {
            Some(t) => t,
            None => {
                return ToolCallResult {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Capability '{}' not found", call.name)),
                };
            }
        };

        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(output) => ToolCallResult {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                output,
            },
            Err(e) => {
                tracing::warn!(capability = %call.name, "Capability execution failed: {}", e);
                ToolCallResult {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!("Capability execution failed: {}", e)),
                }
            }
        }
    }

}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
