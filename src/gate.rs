//! Capability gate: which tools the model may call this turn.
//!
//! A pure policy function over a small enumerated phase. The same allowed
//! set drives both the tool definitions advertised to the model and the
//! dispatcher-side [`DispatchContext`](crate::tools::DispatchContext)
//! filter, so a capability the gate withholds is unreachable even if the
//! model hallucinates a call to it.

use serde::{Deserialize, Serialize};

use crate::tools::{confirm, execute, knowledge, schema};

/// Where the conversation stands with respect to the current draft query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationPhase {
    /// No draft proposed.
    Fresh,
    /// A draft exists but the user has not affirmed it.
    Proposed,
    /// An affirmative confirmation was observed since the last human input.
    Confirmed,
}

impl ConversationPhase {
    pub fn of(is_confirmed: bool, has_draft: bool) -> Self {
        if is_confirmed {
            ConversationPhase::Confirmed
        } else if has_draft {
            ConversationPhase::Proposed
        } else {
            ConversationPhase::Fresh
        }
    }
}

/// Capability set for a phase. First matching rule wins:
/// confirmed → full access; draft pending → re-propose or execute (execute
/// is advisory here, rule 1 still gates trusted execution); fresh → no
/// direct execution.
pub fn allowed_capabilities(phase: ConversationPhase) -> &'static [&'static str] {
    match phase {
        ConversationPhase::Confirmed => &[
            schema::NAME,
            execute::NAME,
            confirm::NAME,
            knowledge::NAME,
        ],
        ConversationPhase::Proposed => &[confirm::NAME, knowledge::NAME, execute::NAME],
        ConversationPhase::Fresh => &[schema::NAME, knowledge::NAME, confirm::NAME],
    }
}
