//! Schema introspection capability.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::database::Database;

use super::{DispatchContext, Tool, ToolOutput};

pub const NAME: &str = "get_database_schema";

pub struct SchemaTool {
    db: Arc<Database>,
}

impl SchemaTool {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for SchemaTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Returns the database schema (list of tables and columns). Use this \
         before writing a SQL query to learn the exact table and field names."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &DispatchContext,
    ) -> Result<ToolOutput> {
        match self.db.schema_summary() {
            Ok(summary) if summary.is_empty() => {
                Ok(ToolOutput::Text("The database contains no tables.".to_string()))
            }
            Ok(summary) => Ok(ToolOutput::Text(summary)),
            Err(e) => Ok(ToolOutput::Error(format!("Schema introspection failed: {}", e))),
        }
    }
}
