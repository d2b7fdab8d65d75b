//! Stage-keyed schema validation.
//!
//! Each stage defines its own required keys and element shapes. Validation
//! is a pure function from a parsed JSON value to the stage's typed payload,
//! and every rejection carries a specific, actionable reason (the named
//! missing key, the indexed list element, the exact unexpected slot) so it
//! can be surfaced to a human or embedded in a retry prompt.
//!
//! The reserved literal `cannot infer` stands in for "the model could not
//! determine this field". It is converted to an explicit `None` here, at the
//! validation boundary; defaults are substituted only at final assembly.

use serde_json::{Map, Value};

use crate::payload::{
    AgentDecl, AgentsPayload, EventHandlerDecl, FieldDecl, ManagerPayload, MetaPayload, PhaseDecl,
    PromptKind, PromptSlot, PromptsPayload, RoleDecl, RolePromptDecl, RolePromptsPayload,
    RolesPayload, RunnerPayload, StagePayload, StatePayload,
};
use crate::stage::Stage;

/// The reserved marker the model uses for fields it cannot determine.
pub const SENTINEL: &str = "cannot infer";

/// Prompt slots every game gets regardless of its phase table.
pub const BASE_PROMPT_SLOTS: [&str; 3] = ["game_description", "game_information", "game_history"];

/// Validate a parsed payload against the given stage's shape, producing the
/// stage's typed payload.
///
/// `expected_slots` is only consulted for [`Stage::Prompts`], whose slot
/// names must exactly match the closed set computed by
/// [`expected_prompt_slots`] before the prompt was sent.
pub fn validate_stage(
    stage: Stage,
    value: &Value,
    expected_slots: Option<&[String]>,
) -> Result<StagePayload, String> {
    match stage {
        Stage::Meta => validate_meta(value).map(StagePayload::Meta),
        Stage::Roles => validate_roles(value).map(StagePayload::Roles),
        Stage::State => validate_state(value).map(StagePayload::State),
        Stage::Prompts => validate_prompts(value, expected_slots).map(StagePayload::Prompts),
        Stage::RolePrompts => validate_role_prompts(value).map(StagePayload::RolePrompts),
        Stage::Agents => validate_agents(value).map(StagePayload::Agents),
        Stage::Manager => validate_manager(value).map(StagePayload::Manager),
        Stage::Runner => validate_runner(value).map(StagePayload::Runner),
    }
}

/// Compute the exact set of prompt slot names the prompts stage must
/// produce: the base slots, then `system_<role>_<n>` and `user_<role>_<n>`
/// for every actionable phase and every role with a non-empty task list in
/// that phase.
pub fn expected_prompt_slots(roles: &RolesPayload) -> Vec<String> {
    let mut slots: Vec<String> = BASE_PROMPT_SLOTS.iter().map(|s| s.to_string()).collect();
    for phase in &roles.phases {
        if !phase.actionable {
            continue;
        }
        for (role, tasks) in &phase.role_tasks {
            if tasks.is_empty() {
                continue;
            }
            let slug = slot_slug(role);
            slots.push(format!("system_{}_{}", slug, phase.number));
            slots.push(format!("user_{}_{}", slug, phase.number));
        }
    }
    slots
}

/// Normalize a role name into its slot-name form: lowercase, whitespace
/// collapsed to underscores.
fn slot_slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

// --- shared helpers ---

fn is_sentinel(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.trim() == SENTINEL)
}

/// A string field that may be absent, null, or the sentinel.
fn opt_text(value: Option<&Value>) -> Option<String> {
    let v = value?;
    if v.is_null() || is_sentinel(v) {
        return None;
    }
    v.as_str().map(|s| s.to_string())
}

/// An unsigned field that may be absent, null, or the sentinel.
fn opt_u64(value: Option<&Value>) -> Option<u64> {
    let v = value?;
    if v.is_null() || is_sentinel(v) {
        return None;
    }
    v.as_u64()
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{} must be an object", what))
}

fn req_key<'a>(obj: &'a Map<String, Value>, key: &str, what: &str) -> Result<&'a Value, String> {
    obj.get(key)
        .ok_or_else(|| format!("{} missing required key \"{}\"", what, key))
}

fn req_list<'a>(obj: &'a Map<String, Value>, key: &str, what: &str) -> Result<&'a [Value], String> {
    req_key(obj, key, what)?
        .as_array()
        .map(|a| a.as_slice())
        .ok_or_else(|| format!("{}.{} must be a list", what, key))
}

fn req_str(obj: &Map<String, Value>, key: &str, what: &str) -> Result<String, String> {
    req_key(obj, key, what)?
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| format!("{}.{} must be a string", what, key))
}

/// A list of phase numbers; non-lists and sentinels degrade to empty.
fn phase_numbers(value: Option<&Value>) -> Vec<u32> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .filter_map(|n| u32::try_from(n).ok())
                .collect()
        })
        .unwrap_or_default()
}

// --- per-stage validators ---

fn validate_meta(value: &Value) -> Result<MetaPayload, String> {
    let obj = as_object(value, "meta payload")?;
    req_key(obj, "name", "meta")?;
    req_key(obj, "description", "meta")?;
    let name = opt_text(obj.get("name"));
    let description = opt_text(obj.get("description"));

    let mut partials = Vec::new();
    if let Some(raw) = obj.get("prompt_partials") {
        let list = raw
            .as_array()
            .ok_or_else(|| "meta.prompt_partials must be a list".to_string())?;
        for (i, entry) in list.iter().enumerate() {
            let what = format!("prompt_partials[{}]", i);
            let entry = as_object(entry, &what)?;
            partials.push(PromptSlot {
                name: req_str(entry, "name", &what)?,
                content: {
                    req_key(entry, "content", &what)?;
                    opt_text(entry.get("content"))
                },
            });
        }
    }

    Ok(MetaPayload {
        name,
        description,
        partials,
    })
}

fn validate_roles(value: &Value) -> Result<RolesPayload, String> {
    let obj = as_object(value, "roles payload")?;

    let mut roles = Vec::new();
    for (i, entry) in req_list(obj, "roles", "roles payload")?.iter().enumerate() {
        let what = format!("roles[{}]", i);
        let entry = as_object(entry, &what)?;
        roles.push(RoleDecl {
            raw_id: req_str(entry, "raw_id", &what)?,
            name: req_str(entry, "name", &what)?,
            llm_type: opt_text(entry.get("llm_type")),
            llm_params: entry
                .get("llm_params")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            task_phases: phase_numbers(entry.get("task_phases")),
            task_phases_excluded: phase_numbers(entry.get("task_phases_excluded")),
        });
    }

    let mut phases = Vec::new();
    for (i, entry) in req_list(obj, "phases", "roles payload")?.iter().enumerate() {
        let what = format!("phases[{}]", i);
        let entry = as_object(entry, &what)?;
        let number = req_key(entry, "phase_number", &what)?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("{}.phase_number must be a non-negative integer", what))?;
        let actionable = req_key(entry, "actionable", &what)?
            .as_bool()
            .ok_or_else(|| format!("{}.actionable must be a boolean", what))?;

        let mut role_tasks = std::collections::BTreeMap::new();
        if let Some(raw) = entry.get("role_tasks") {
            let map = raw
                .as_object()
                .ok_or_else(|| format!("{}.role_tasks must be an object", what))?;
            for (role, tasks) in map {
                let tasks = tasks.as_array().ok_or_else(|| {
                    format!("{}.role_tasks[\"{}\"] must be a list of tasks", what, role)
                })?;
                let tasks: Vec<String> = tasks
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_string())
                    .collect();
                role_tasks.insert(role.clone(), tasks);
            }
        }

        phases.push(PhaseDecl {
            name: req_str(entry, "phase", &what)?,
            number,
            actionable,
            role_tasks,
        });
    }

    Ok(RolesPayload { roles, phases })
}

fn validate_state(value: &Value) -> Result<StatePayload, String> {
    let obj = as_object(value, "state payload")?;
    let mut payload = StatePayload::default();
    for (section, out) in [
        ("meta_information", &mut payload.meta_information),
        ("private_information", &mut payload.private_information),
        ("public_information", &mut payload.public_information),
    ] {
        for (i, entry) in req_list(obj, section, "state")?.iter().enumerate() {
            let what = format!("state.{}[{}]", section, i);
            let entry = as_object(entry, &what)?;
            // Accept either "name" or "id" for the field name.
            let name = opt_text(entry.get("name"))
                .or_else(|| opt_text(entry.get("id")))
                .ok_or_else(|| format!("{} missing required key \"name\"", what))?;
            let default = entry
                .get("default")
                .filter(|v| !v.is_null() && !is_sentinel(v))
                .cloned();
            out.push(FieldDecl {
                name,
                kind: opt_text(entry.get("type")),
                default,
            });
        }
    }
    Ok(payload)
}

fn validate_prompts(
    value: &Value,
    expected_slots: Option<&[String]>,
) -> Result<PromptsPayload, String> {
    // The stage answers with a list of slots, possibly wrapped in an object
    // under a "prompts" key.
    let list = match value {
        Value::Array(list) => list.as_slice(),
        Value::Object(obj) => req_list(obj, "prompts", "prompts payload")?,
        _ => return Err("prompts payload must be a list of prompt slots".to_string()),
    };

    let mut slots = Vec::new();
    for (i, entry) in list.iter().enumerate() {
        let what = format!("prompts[{}]", i);
        let entry = as_object(entry, &what)?;
        let name = req_str(entry, "name", &what)?;
        req_key(entry, "content", &what)?;
        slots.push(PromptSlot {
            name,
            content: opt_text(entry.get("content")),
        });
    }

    if let Some(expected) = expected_slots {
        let produced: Vec<&str> = slots.iter().map(|s| s.name.as_str()).collect();
        let missing: Vec<&str> = expected
            .iter()
            .map(String::as_str)
            .filter(|name| !produced.contains(name))
            .collect();
        let unexpected: Vec<&str> = produced
            .iter()
            .copied()
            .filter(|name| !expected.iter().any(|e| e == name))
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            let mut parts = Vec::new();
            if !missing.is_empty() {
                parts.push(format!("missing expected prompt slot(s): {}", missing.join(", ")));
            }
            if !unexpected.is_empty() {
                parts.push(format!("unexpected prompt slot(s): {}", unexpected.join(", ")));
            }
            return Err(parts.join("; "));
        }
    }

    Ok(PromptsPayload { slots })
}

fn validate_role_prompts(value: &Value) -> Result<RolePromptsPayload, String> {
    let list = match value {
        Value::Array(list) => list.as_slice(),
        Value::Object(obj) => req_list(obj, "role_prompts", "role_prompts payload")?,
        _ => return Err("role_prompts payload must be a list".to_string()),
    };

    let mut prompts = Vec::new();
    for (i, entry) in list.iter().enumerate() {
        let what = format!("role_prompts[{}]", i);
        let entry = as_object(entry, &what)?;
        let kind = match req_str(entry, "kind", &what)?.as_str() {
            "system" => PromptKind::System,
            "user" => PromptKind::User,
            other => {
                return Err(format!(
                    "{}.kind must be \"system\" or \"user\", got \"{}\"",
                    what, other
                ))
            }
        };
        let phase = req_key(entry, "phase", &what)?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("{}.phase must be a non-negative integer", what))?;
        req_key(entry, "text", &what)?;
        prompts.push(RolePromptDecl {
            role: req_str(entry, "role", &what)?,
            phase,
            kind,
            text: opt_text(entry.get("text")),
        });
    }

    Ok(RolePromptsPayload { prompts })
}

fn validate_agents(value: &Value) -> Result<AgentsPayload, String> {
    let list = match value {
        Value::Array(list) => list.as_slice(),
        Value::Object(obj) => req_list(obj, "agents", "agents payload")?,
        _ => return Err("agents payload must be a list".to_string()),
    };

    let mut agents = Vec::new();
    for (i, entry) in list.iter().enumerate() {
        let what = format!("agents[{}]", i);
        let entry = as_object(entry, &what)?;
        let id = req_key(entry, "id", &what)?
            .as_u64()
            .ok_or_else(|| format!("{}.id must be a non-negative integer", what))?;
        agents.push(AgentDecl {
            id,
            role: req_str(entry, "role", &what)?,
        });
    }

    Ok(AgentsPayload { agents })
}

fn validate_manager(value: &Value) -> Result<ManagerPayload, String> {
    let obj = as_object(value, "manager payload")?;
    req_key(obj, "type", "manager")?;
    let kind = opt_text(obj.get("type"));

    let mut event_handlers = Vec::new();
    for (i, entry) in req_list(obj, "event_handlers", "manager")?.iter().enumerate() {
        let what = format!("event_handlers[{}]", i);
        let entry = as_object(entry, &what)?;
        event_handlers.push(EventHandlerDecl {
            event: req_str(entry, "event", &what)?,
            custom_code: opt_text(entry.get("custom_code")),
            custom_module: opt_text(entry.get("custom_module")),
            custom_function: opt_text(entry.get("custom_function")),
        });
    }

    Ok(ManagerPayload {
        kind,
        event_handlers,
    })
}

fn validate_runner(value: &Value) -> Result<RunnerPayload, String> {
    let obj = as_object(value, "runner payload")?;
    for key in [
        "type",
        "protocol",
        "hostname",
        "path",
        "port",
        "game_id",
        "phase_transition_event",
        "phase_identifier_key",
        "min_action_delay",
        "max_action_delay",
    ] {
        req_key(obj, key, "runner")?;
    }

    let port = match opt_u64(obj.get("port")) {
        Some(n) => Some(
            u16::try_from(n).map_err(|_| format!("runner.port {} out of range", n))?,
        ),
        None => None,
    };

    Ok(RunnerPayload {
        kind: opt_text(obj.get("type")),
        protocol: opt_text(obj.get("protocol")),
        hostname: opt_text(obj.get("hostname")),
        path: opt_text(obj.get("path")),
        port,
        game_id: opt_u64(obj.get("game_id")),
        logs_dir: opt_text(obj.get("logs_dir")),
        log_level: opt_text(obj.get("log_level")),
        prompts_dir: opt_text(obj.get("prompts_dir")),
        phase_transition_event: opt_text(obj.get("phase_transition_event")),
        phase_identifier_key: opt_text(obj.get("phase_identifier_key")),
        continuous_phases: phase_numbers(obj.get("continuous_phases")),
        min_action_delay: opt_u64(obj.get("min_action_delay")),
        max_action_delay: opt_u64(obj.get("max_action_delay")),
    })
}
