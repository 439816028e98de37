use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Provenance of a single buffer mutation. Downstream consumers use this to
/// decide whether an edit counts as agent output, a user interaction, or one
/// of the engine's own convergence operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditSource {
    /// Typed or dispatched by the user through the editor surface.
    Cursor,
    /// Streamed in by an agent response.
    AgentEdits { request_id: Arc<str> },
    /// Content rolled back by rejecting agent edits.
    AgentUndo,
    /// Internal convergence of an original/modified buffer pair. Excluded
    /// from both "user edit" and "agent edit" classification.
    Reset,
}

impl EditSource {
    pub fn is_agent_edit(&self) -> bool {
        matches!(self, EditSource::AgentEdits { .. })
    }

    pub fn is_user_edit(&self) -> bool {
        matches!(self, EditSource::Cursor)
    }
}
