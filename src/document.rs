//! The assembled output document.
//!
//! This structure is the stable contract with the downstream game runner;
//! field names are preserved exactly. It is created only after every
//! configured stage succeeded and is immutable once written.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A reusable named prompt fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptPartial {
    pub name: String,
    pub content: String,
}

/// A prompt attached to a role, keyed `system`/`user`, optionally suffixed
/// with the phase it applies to (e.g. `user_phase_2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePrompt {
    pub key: String,
    pub value: String,
}

/// A role with its stable numeric identifier and attached prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRole {
    pub role_id: u32,
    pub name: String,
    pub llm_type: Option<String>,
    pub llm_params: Map<String, Value>,
    pub prompts: Vec<RolePrompt>,
    pub task_phases: Vec<u32>,
    pub task_phases_excluded: Vec<u32>,
}

/// One agent bound to a role, both by numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBinding {
    pub id: u64,
    pub role_id: u32,
}

/// One state field with its declared type and default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: Value,
}

/// State fields partitioned into meta/private/public categories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    pub meta_information: Vec<StateField>,
    pub private_information: Vec<StateField>,
    pub public_information: Vec<StateField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandler {
    pub event: String,
    pub custom_code: Option<String>,
    pub custom_module: Option<String>,
    pub custom_function: Option<String>,
}

/// The phase manager block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub event_handlers: Vec<EventHandler>,
}

impl Default for ManagerBlock {
    fn default() -> Self {
        Self {
            kind: "TurnBasedPhaseManager".to_string(),
            event_handlers: Vec::new(),
        }
    }
}

/// The runner block: connection settings, delay bounds, and phase-transition
/// event naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub hostname: String,
    pub path: String,
    pub port: u16,
    pub game_id: u64,
    pub logs_dir: String,
    pub log_level: String,
    pub prompts_dir: String,
    pub phase_transition_event: String,
    pub phase_identifier_key: String,
    pub continuous_phases: Vec<u32>,
    pub min_action_delay: u64,
    pub max_action_delay: u64,
}

impl Default for RunnerBlock {
    fn default() -> Self {
        Self {
            kind: "GameRunner".to_string(),
            protocol: "ws".to_string(),
            hostname: "localhost".to_string(),
            path: "wss".to_string(),
            port: 0,
            game_id: 0,
            logs_dir: "logs".to_string(),
            log_level: "INFO".to_string(),
            prompts_dir: "prompts".to_string(),
            phase_transition_event: "phase-transition".to_string(),
            phase_identifier_key: "phase".to_string(),
            continuous_phases: Vec::new(),
            min_action_delay: 5,
            max_action_delay: 10,
        }
    }
}

/// The final merged configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    pub name: String,
    pub description: String,
    pub prompt_partials: Vec<PromptPartial>,
    pub agent_roles: Vec<AgentRole>,
    pub agents: Vec<AgentBinding>,
    pub state: StateSection,
    pub manager: ManagerBlock,
    pub runner: RunnerBlock,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            prompt_partials: Vec::new(),
            agent_roles: Vec::new(),
            agents: Vec::new(),
            state: StateSection::default(),
            manager: ManagerBlock::default(),
            runner: RunnerBlock::default(),
        }
    }
}

impl GameConfig {
    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serialize as YAML.
    #[cfg(feature = "yaml")]
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| crate::error::PipelineError::Other(e.to_string()))
    }
}
