//! Read-only query execution capability.
//!
//! The syntactic `SELECT` prefix check is the only hard safety boundary on
//! this path; the check runs before the database is contacted, and every
//! failure comes back as an error result rather than a raised error.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::database::Database;

use super::{DispatchContext, Tool, ToolOutput};

pub const NAME: &str = "execute_sql";

pub const READ_ONLY_ERROR: &str = "Only SELECT queries are allowed.";
pub const NO_DATA_MESSAGE: &str = "Query completed, but no data was found.";

pub struct ExecuteSqlTool {
    db: Arc<Database>,
}

impl ExecuteSqlTool {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for ExecuteSqlTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Executes a SQL query against the database and returns the result. \
         Only SELECT queries are accepted."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The SELECT statement to execute"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &DispatchContext) -> Result<ToolOutput> {
        let raw = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let query = strip_code_fences(raw);

        if !is_read_only(&query) {
            return Ok(ToolOutput::Error(READ_ONLY_ERROR.to_string()));
        }

        match self.db.run_select(&query) {
            Ok(rows) if rows.is_empty() => Ok(ToolOutput::Text(NO_DATA_MESSAGE.to_string())),
            Ok(rows) => Ok(ToolOutput::Json(Value::Array(
                rows.into_iter().map(Value::Object).collect(),
            ))),
            Err(e) => Ok(ToolOutput::Error(format!("SQL error: {}", e))),
        }
    }
}

/// Remove markdown code-fence artifacts models like to wrap queries in.
pub fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the language tag on the opening fence line, if any.
    let rest = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    rest.trim_end_matches('`').trim().to_string()
}

fn is_read_only(query: &str) -> bool {
    query
        .trim_start()
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
}
