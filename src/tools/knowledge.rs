//! Knowledge-search capability over the document index.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::knowledge::KnowledgeIndex;

use super::{DispatchContext, Tool, ToolOutput};

pub const NAME: &str = "search_knowledge";

pub const NOTHING_FOUND: &str = "No relevant documents found.";

pub struct KnowledgeSearchTool {
    index: Arc<KnowledgeIndex>,
}

impl KnowledgeSearchTool {
    pub fn new(index: Arc<KnowledgeIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Searches the company knowledge base for documents related to the \
         query. Use this to resolve company-specific terminology before \
         writing SQL."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language search text"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &DispatchContext) -> Result<ToolOutput> {
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if query.is_empty() {
            return Ok(ToolOutput::Error(
                "Missing required 'query' parameter".to_string(),
            ));
        }

        let matches = match self.index.search(query).await {
            Ok(matches) => matches,
            Err(e) => return Ok(ToolOutput::Error(format!("Knowledge search failed: {}", e))),
        };

        if matches.is_empty() {
            return Ok(ToolOutput::Text(NOTHING_FOUND.to_string()));
        }

        let snippets: Vec<String> = matches.into_iter().map(|m| m.text).collect();
        Ok(ToolOutput::Text(snippets.join("\n\n")))
    }
}
