//! Confirmation-registration capability.
//!
//! Records that the user agreed to run a specific query. There is no
//! negative path: the model is instructed to call this only after an
//! explicit user "yes", so the capability always affirms. A declined
//! proposal simply never produces this call.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::{DispatchContext, Tool, ToolOutput};

pub const NAME: &str = "confirm_query";

/// The affirmative value the transcript scanner looks for.
pub const AFFIRMED: &str = "true";

pub struct ConfirmQueryTool;

impl ConfirmQueryTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConfirmQueryTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ConfirmQueryTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Registers that the user agreed to execute a specific SQL query. Call \
         this ONLY after the user explicitly answered 'yes' or 'run it' to the \
         proposed query text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The exact query text the user agreed to"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &DispatchContext) -> Result<ToolOutput> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::info!(
            session = %ctx.session_id,
            "User confirmation registered for query: {}",
            query
        );
        Ok(ToolOutput::Text(AFFIRMED.to_string()))
    }
}
