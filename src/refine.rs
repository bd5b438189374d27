//! Refinement pipeline: validator then optimizer.
//!
//! A draft query only enters this pipeline when the model requests the
//! confirmation capability. Validation is a hard gate: a rejected draft
//! never reaches the optimizer or the confirmation capability, the verdict
//! goes back to the proposal loop as feedback. Optimization is advisory:
//! a non-OK verdict rewrites the draft and attaches feedback, but never
//! blocks.

use std::sync::Arc;

use anyhow::Result;

use crate::llm_client::{ChatMessage, ChatModel};
use crate::prompts::{is_affirmative_verdict, OPTIMIZER_PROMPT, VALIDATOR_PROMPT};

/// Critique passes run at zero temperature so verdicts are reproducible.
const CRITIC_TEMPERATURE: f32 = 0.0;

/// Outcome of running a draft through both stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refinement {
    /// Validator said no. The draft must not advance; the verdict becomes
    /// feedback for the next proposal round.
    Rejected { verdict: String },
    /// Validator passed. `query` is the draft to hand to the confirmation
    /// capability — the original text, or the optimizer's rewrite.
    /// `advisory` carries the optimizer's verdict when it rewrote.
    Approved {
        query: String,
        advisory: Option<String>,
    },
}

pub struct RefinementPipeline {
    critic: Arc<dyn ChatModel>,
}

impl RefinementPipeline {
    pub fn new(critic: Arc<dyn ChatModel>) -> Self {
        Self { critic }
    }

    pub async fn refine(&self, draft: &str) -> Result<Refinement> {
        let verdict = self.critique(VALIDATOR_PROMPT, draft).await?;
        if !is_affirmative_verdict(&verdict) {
            tracing::info!("Validator rejected draft: {}", verdict);
            return Ok(Refinement::Rejected { verdict });
        }

        let verdict = self.critique(OPTIMIZER_PROMPT, draft).await?;
        if is_affirmative_verdict(&verdict) {
            return Ok(Refinement::Approved {
                query: draft.to_string(),
                advisory: None,
            });
        }

        // The optimizer critiqued the draft; take its rewrite when one is
        // recognizable, otherwise keep the original text.
        let query = extract_rewritten_query(&verdict).unwrap_or_else(|| draft.to_string());
        tracing::info!("Optimizer rewrote draft: {}", query);
        Ok(Refinement::Approved {
            query,
            advisory: Some(verdict),
        })
    }

    async fn critique(&self, prompt: &str, draft: &str) -> Result<String> {
        let messages = [
            ChatMessage::system(prompt),
            ChatMessage::user(format!("Query: {}", draft)),
        ];
        let reply = self
            .critic
            .invoke(&messages, &[], CRITIC_TEMPERATURE)
            .await?;
        Ok(reply.content.unwrap_or_default())
    }
}

/// Pull a rewritten query out of an optimizer verdict: prefer a ```sql
/// fence, fall back to the first line that starts with SELECT.
fn extract_rewritten_query(verdict: &str) -> Option<String> {
    if let Some(start) = verdict.find("```") {
        let after = &verdict[start + 3..];
        let after = after.strip_prefix("sql").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let fenced = after[..end].trim();
            if !fenced.is_empty() {
                return Some(fenced.to_string());
            }
        }
    }

    verdict
        .lines()
        .map(str::trim)
        .find(|line| {
            line.get(..6)
                .map(|head| head.eq_ignore_ascii_case("select"))
                .unwrap_or(false)
        })
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::ToolDef;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted critique verdicts in order.
    struct ScriptedCritic {
        replies: Mutex<VecDeque<String>>,
        temperatures: Mutex<Vec<f32>>,
    }

    impl ScriptedCritic {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                temperatures: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedCritic {
        async fn invoke(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDef],
            temperature: f32,
        ) -> Result<ChatMessage> {
            self.temperatures.lock().unwrap().push(temperature);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("critic invoked more times than scripted");
            Ok(ChatMessage::assistant(reply))
        }
    }

    const DRAFT: &str = "SELECT name FROM employees WHERE dep_id = 5;";

    #[tokio::test]
    async fn validator_rejection_blocks_before_the_optimizer() {
        let critic = ScriptedCritic::new(&["Table 'workers' does not exist in the schema."]);
        let pipeline = RefinementPipeline::new(critic.clone());

        let outcome = pipeline.refine("SELECT * FROM workers").await.unwrap();
        assert_eq!(
            outcome,
            Refinement::Rejected {
                verdict: "Table 'workers' does not exist in the schema.".to_string()
            }
        );
        // The optimizer was never consulted.
        assert_eq!(critic.temperatures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn double_ok_forwards_draft_unchanged() {
        let critic = ScriptedCritic::new(&["OK", "OK (already optimal)"]);
        let pipeline = RefinementPipeline::new(critic);

        let outcome = pipeline.refine(DRAFT).await.unwrap();
        assert_eq!(
            outcome,
            Refinement::Approved {
                query: DRAFT.to_string(),
                advisory: None,
            }
        );
    }

    #[tokio::test]
    async fn optimizer_rewrite_replaces_draft_and_attaches_advisory() {
        let critic = ScriptedCritic::new(&[
            "OK",
            "Use a LEFT JOIN instead.\n```sql\nSELECT e.name FROM employees e LEFT JOIN salaries s ON e.id = s.emp_id;\n```",
        ]);
        let pipeline = RefinementPipeline::new(critic);

        match pipeline.refine(DRAFT).await.unwrap() {
            Refinement::Approved { query, advisory } => {
                assert!(query.starts_with("SELECT e.name FROM employees e LEFT JOIN"));
                assert!(advisory.unwrap().contains("LEFT JOIN"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unparseable_optimizer_critique_keeps_original_draft() {
        let critic = ScriptedCritic::new(&["OK", "Consider adding an index on dep_id."]);
        let pipeline = RefinementPipeline::new(critic);

        match pipeline.refine(DRAFT).await.unwrap() {
            Refinement::Approved { query, advisory } => {
                assert_eq!(query, DRAFT);
                assert!(advisory.is_some());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn critic_runs_at_zero_temperature() {
        let critic = ScriptedCritic::new(&["OK", "OK"]);
        let pipeline = RefinementPipeline::new(critic.clone());
        pipeline.refine(DRAFT).await.unwrap();
        assert!(critic
            .temperatures
            .lock()
            .unwrap()
            .iter()
            .all(|t| *t == 0.0));
    }

    #[test]
    fn rewrite_extraction_falls_back_to_select_line() {
        let verdict = "Better:\nSELECT 1;\nend";
        assert_eq!(extract_rewritten_query(verdict).unwrap(), "SELECT 1;");
        assert!(extract_rewritten_query("no query here").is_none());
    }
}
