//! Typed per-stage payloads.
//!
//! Each stage's expected payload is an explicit tagged structure, produced
//! by the schema validation step. Once validation succeeds, downstream code
//! (prompt context assembly, the assembler) works with these types and never
//! inspects untyped JSON maps again.
//!
//! Fields the model may answer with the `cannot infer` sentinel are modelled
//! as `Option`; the sentinel is converted to `None` at the validation
//! boundary and defaults are substituted only at final assembly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stage::Stage;

/// Game identity plus any seed prompt partials the meta stage surfaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaPayload {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub partials: Vec<PromptSlot>,
}

/// A role as declared by the roles stage. `raw_id` is the stage-local
/// identifier later stages reference; the stable numeric id is assigned
/// during assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDecl {
    pub raw_id: String,
    pub name: String,
    pub llm_type: Option<String>,
    #[serde(default)]
    pub llm_params: Map<String, Value>,
    #[serde(default)]
    pub task_phases: Vec<u32>,
    #[serde(default)]
    pub task_phases_excluded: Vec<u32>,
}

/// A phase row: name, number, whether any role acts in it, and the per-role
/// task lists. `role_tasks` is keyed by role name as written in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDecl {
    pub name: String,
    pub number: u32,
    pub actionable: bool,
    #[serde(default)]
    pub role_tasks: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolesPayload {
    pub roles: Vec<RoleDecl>,
    pub phases: Vec<PhaseDecl>,
}

/// One state field: name, declared type, and default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub kind: Option<String>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    pub meta_information: Vec<FieldDecl>,
    pub private_information: Vec<FieldDecl>,
    pub public_information: Vec<FieldDecl>,
}

/// A named prompt slot. The prompts stage produces exactly the closed set
/// of slot names computed from the roles stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSlot {
    pub name: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsPayload {
    pub slots: Vec<PromptSlot>,
}

/// Whether a role prompt is a system or a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    System,
    User,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::System => "system",
            PromptKind::User => "user",
        }
    }
}

/// A per-role prompt text. `role` is the raw role identifier from the roles
/// stage; `phase` 0 means the prompt applies to every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePromptDecl {
    pub role: String,
    pub phase: u32,
    pub kind: PromptKind,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolePromptsPayload {
    pub prompts: Vec<RolePromptDecl>,
}

/// An agent bound to a role by its raw identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDecl {
    pub id: u64,
    pub role: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsPayload {
    pub agents: Vec<AgentDecl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandlerDecl {
    pub event: String,
    pub custom_code: Option<String>,
    pub custom_module: Option<String>,
    pub custom_function: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerPayload {
    pub kind: Option<String>,
    #[serde(default)]
    pub event_handlers: Vec<EventHandlerDecl>,
}

/// Runner settings as extracted. All fields optional; defaults are applied
/// during assembly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerPayload {
    pub kind: Option<String>,
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub path: Option<String>,
    pub port: Option<u16>,
    pub game_id: Option<u64>,
    pub logs_dir: Option<String>,
    pub log_level: Option<String>,
    pub prompts_dir: Option<String>,
    pub phase_transition_event: Option<String>,
    pub phase_identifier_key: Option<String>,
    #[serde(default)]
    pub continuous_phases: Vec<u32>,
    pub min_action_delay: Option<u64>,
    pub max_action_delay: Option<u64>,
}

/// The validated structured payload produced by a stage. One variant per
/// stage; `stage()` recovers which.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "snake_case")]
pub enum StagePayload {
    Meta(MetaPayload),
    Roles(RolesPayload),
    State(StatePayload),
    Prompts(PromptsPayload),
    RolePrompts(RolePromptsPayload),
    Agents(AgentsPayload),
    Manager(ManagerPayload),
    Runner(RunnerPayload),
}

impl StagePayload {
    /// The stage this payload belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Meta(_) => Stage::Meta,
            StagePayload::Roles(_) => Stage::Roles,
            StagePayload::State(_) => Stage::State,
            StagePayload::Prompts(_) => Stage::Prompts,
            StagePayload::RolePrompts(_) => Stage::RolePrompts,
            StagePayload::Agents(_) => Stage::Agents,
            StagePayload::Manager(_) => Stage::Manager,
            StagePayload::Runner(_) => Stage::Runner,
        }
    }

    pub fn as_meta(&self) -> Option<&MetaPayload> {
        match self {
            StagePayload::Meta(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_roles(&self) -> Option<&RolesPayload> {
        match self {
            StagePayload::Roles(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<&StatePayload> {
        match self {
            StagePayload::State(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_prompts(&self) -> Option<&PromptsPayload> {
        match self {
            StagePayload::Prompts(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_role_prompts(&self) -> Option<&RolePromptsPayload> {
        match self {
            StagePayload::RolePrompts(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_agents(&self) -> Option<&AgentsPayload> {
        match self {
            StagePayload::Agents(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_manager(&self) -> Option<&ManagerPayload> {
        match self {
            StagePayload::Manager(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_runner(&self) -> Option<&RunnerPayload> {
        match self {
            StagePayload::Runner(p) => Some(p),
            _ => None,
        }
    }
}
