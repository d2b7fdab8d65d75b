use serde::{Deserialize, Serialize};

/// One unit of LLM-driven extraction, with its own prompt template,
/// validator, and result slot.
///
/// The canonical order below is the order a full pipeline runs them in.
/// Pipelines may be built over any ordered subset (e.g. `meta`, `roles`,
/// `state` for a quick pass), but the relative order must be preserved so
/// that a stage's prompt context only ever references earlier stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Game name, description, and any seed prompt partials.
    Meta,
    /// Role declarations plus the phase table (numbers, actionable flags,
    /// per-role task lists).
    Roles,
    /// State fields partitioned into meta/private/public categories.
    State,
    /// Named prompt slots, validated against a closed expected-name set
    /// computed from the roles stage.
    Prompts,
    /// Per-role, per-phase system/user prompt texts.
    RolePrompts,
    /// Agent-to-role bindings.
    Agents,
    /// Manager type and event handlers.
    Manager,
    /// Runner connection settings, delay bounds, and phase-transition keys.
    Runner,
}

impl Stage {
    /// All stages in canonical order.
    pub const ALL: [Stage; 8] = [
        Stage::Meta,
        Stage::Roles,
        Stage::State,
        Stage::Prompts,
        Stage::RolePrompts,
        Stage::Agents,
        Stage::Manager,
        Stage::Runner,
    ];

    /// Stable string identifier, used for prompts, snapshots, and the
    /// response-unwrapping step.
    pub fn id(&self) -> &'static str {
        match self {
            Stage::Meta => "meta",
            Stage::Roles => "roles",
            Stage::State => "state",
            Stage::Prompts => "prompts",
            Stage::RolePrompts => "role_prompts",
            Stage::Agents => "agents",
            Stage::Manager => "manager",
            Stage::Runner => "runner",
        }
    }

    /// Resolve a stage from its string identifier.
    pub fn from_id(id: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.id() == id)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// The pipeline's current lifecycle phase. Exactly one pipeline owns exactly
/// one run-state value at a time; it is the single source of truth for
/// "what is happening now."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Nothing in progress.
    Idle,
    /// A source document was just selected and the pipeline was reset.
    SelectingSource,
    /// A stage prompt has been dispatched; the model has not responded yet.
    WaitingForModel,
    /// A response arrived and is being parsed/validated.
    ProcessingResponse,
    /// A retry prompt is being composed from the previous attempt.
    ReadyForFeedback,
    /// The current stage validated successfully, or the whole run finished.
    Success,
    /// The current stage failed; see the stage's error.
    Error,
    /// The assembled document is being written out.
    WritingOutput,
}

impl RunState {
    /// Whether a stage attempt is currently in flight. At most one attempt
    /// may be in flight per pipeline instance.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunState::WaitingForModel | RunState::ProcessingResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ids_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_id(stage.id()), Some(stage));
        }
        assert_eq!(Stage::from_id("nope"), None);
    }

    #[test]
    fn test_canonical_order() {
        assert_eq!(Stage::ALL[0], Stage::Meta);
        assert_eq!(Stage::ALL[1], Stage::Roles);
        assert_eq!(Stage::ALL.len(), 8);
    }

    #[test]
    fn test_display_matches_id() {
        assert_eq!(Stage::RolePrompts.to_string(), "role_prompts");
    }

    #[test]
    fn test_in_flight_states() {
        assert!(RunState::WaitingForModel.is_in_flight());
        assert!(RunState::ProcessingResponse.is_in_flight());
        assert!(!RunState::Idle.is_in_flight());
        assert!(!RunState::Error.is_in_flight());
        assert!(!RunState::Success.is_in_flight());
    }

    #[test]
    fn test_serde_snake_case() {
        let s = serde_json::to_string(&Stage::RolePrompts).unwrap();
        assert_eq!(s, "\"role_prompts\"");
    }
}
