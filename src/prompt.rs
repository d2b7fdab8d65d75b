//! Prompt composition.
//!
//! Builds the text prompt for a stage from the stage's instruction template,
//! the raw rules document, and a context block summarizing the relevant
//! outputs of already-completed stages. A stage's context serializes only
//! the prior-stage fields that stage needs, never the entire accumulated
//! state, which keeps prompt size bounded and irrelevant stage data out of
//! the model's view.
//!
//! Retry prompts wrap the standard render with the previous response, the
//! recorded error, and any human feedback, each under its own labeled
//! section.

use std::collections::HashMap;

use serde::Serialize;

use crate::payload::StagePayload;
use crate::schema;
use crate::stage::Stage;

/// Sentinel that should never appear in real templates.
const ESCAPE_SENTINEL: &str = "\x00LBRACE\x00";
/// Sentinel for escaped closing brace.
const ESCAPE_SENTINEL_CLOSE: &str = "\x00RBRACE\x00";

/// Build a prompt string with variable substitution.
///
/// Replaces `{key}` placeholders in the template with the given values.
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}` (needed
/// for the JSON shape examples embedded in the stage templates).
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    // Pass 1: protect escaped braces
    let mut rendered = template.replace("{{", ESCAPE_SENTINEL);
    rendered = rendered.replace("}}", ESCAPE_SENTINEL_CLOSE);

    // Pass 2: substitute placeholders
    for (key, value) in vars {
        let placeholder = format!("{{{}}}", key);
        rendered = rendered.replace(&placeholder, value);
    }

    // Pass 3: restore escaped braces
    rendered = rendered.replace(ESCAPE_SENTINEL, "{");
    rendered = rendered.replace(ESCAPE_SENTINEL_CLOSE, "}");
    rendered
}

/// Wrap text in a labeled section for structured prompts.
pub fn section(label: &str, content: &str) -> String {
    format!("## {}\n{}", label, content)
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Fixed system instruction sent as the first chat message of every stage.
pub const SYSTEM_INSTRUCTION: &str =
    "You are a structured data extractor. Respond with valid JSON only, no explanations. \
     Use the literal string \"cannot infer\" for any requested field the document does not determine.";

const META_TEMPLATE: &str = "\
Extract the game's identity from the rules document below.

Respond with a JSON object:
{{\"name\": \"<game name>\", \"description\": \"<one-paragraph summary>\",
 \"prompt_partials\": [{{\"name\": \"<slot>\", \"content\": \"<text>\"}}]}}

`prompt_partials` may be an empty list; include an entry only when the
document itself contains reusable prompt text.

## RULES DOCUMENT
{instructions}";

const ROLES_TEMPLATE: &str = "\
Extract every player role and every phase of play from the rules document below.

Respond with a JSON object:
{{\"roles\": [{{\"raw_id\": \"<identifier as written>\", \"name\": \"<display name>\",
   \"llm_type\": \"<model type>\", \"llm_params\": {{}},
   \"task_phases\": [<phase numbers>], \"task_phases_excluded\": []}}],
 \"phases\": [{{\"phase\": \"<phase name>\", \"phase_number\": <n>, \"actionable\": <bool>,
   \"role_tasks\": {{\"<role>\": [\"<task>\"]}}}}]}}

Number phases from 1 in play order. A phase is actionable when at least one
role makes a decision in it.

## RULES DOCUMENT
{instructions}";

const STATE_TEMPLATE: &str = "\
Extract the game's state fields from the rules document below, using the
roles and phases already extracted as context.

Respond with a JSON object:
{{\"meta_information\": [{{\"name\": \"<field>\", \"type\": \"<type>\", \"default\": <value>}}],
 \"private_information\": [...], \"public_information\": [...]}}

`meta_information` holds bookkeeping fields (round counters, phase markers),
`private_information` what a single role sees, `public_information` what all
roles see.

## RULES DOCUMENT
{instructions}";

const PROMPTS_TEMPLATE: &str = "\
Write the content of each prompt slot named in the EXPECTED PROMPT SLOTS
section, using the rules document and the extracted context. Produce exactly
those slots: no omissions, no additions.

Respond with a JSON list:
[{{\"name\": \"<slot>\", \"content\": \"<text>\"}}]

## RULES DOCUMENT
{instructions}";

const ROLE_PROMPTS_TEMPLATE: &str = "\
Write per-role prompt texts for the game described below. For each role and
each phase where it acts, produce one system entry and one user entry. Use
phase 0 for a prompt that applies to every phase.

Respond with a JSON list:
[{{\"role\": \"<raw role id>\", \"phase\": <n>, \"kind\": \"system\"|\"user\", \"text\": \"<text>\"}}]

## RULES DOCUMENT
{instructions}";

const AGENTS_TEMPLATE: &str = "\
Decide how many agents play the game described below and which role each is
bound to.

Respond with a JSON list:
[{{\"id\": <agent number starting at 1>, \"role\": \"<raw role id>\"}}]

## RULES DOCUMENT
{instructions}";

const MANAGER_TEMPLATE: &str = "\
Determine the phase manager for the game described below: its type and any
event handlers the rules imply.

Respond with a JSON object:
{{\"type\": \"<manager type>\", \"event_handlers\": [{{\"event\": \"<event name>\"}}]}}

## RULES DOCUMENT
{instructions}";

const RUNNER_TEMPLATE: &str = "\
Determine the runner settings for the game described below: connection
parameters, phase-transition event naming, and action delay bounds.

Respond with a JSON object:
{{\"type\": \"...\", \"protocol\": \"...\", \"hostname\": \"...\", \"path\": \"...\",
 \"port\": <n>, \"game_id\": <n>, \"logs_dir\": \"...\", \"log_level\": \"...\",
 \"prompts_dir\": \"...\", \"phase_transition_event\": \"...\",
 \"phase_identifier_key\": \"...\", \"continuous_phases\": [<n>],
 \"min_action_delay\": <seconds>, \"max_action_delay\": <seconds>}}

## RULES DOCUMENT
{instructions}";

fn instruction_template(stage: Stage) -> &'static str {
    match stage {
        Stage::Meta => META_TEMPLATE,
        Stage::Roles => ROLES_TEMPLATE,
        Stage::State => STATE_TEMPLATE,
        Stage::Prompts => PROMPTS_TEMPLATE,
        Stage::RolePrompts => ROLE_PROMPTS_TEMPLATE,
        Stage::Agents => AGENTS_TEMPLATE,
        Stage::Manager => MANAGER_TEMPLATE,
        Stage::Runner => RUNNER_TEMPLATE,
    }
}

/// Assemble the context block for a stage from prior validated results.
///
/// Returns `None` for stages without data dependencies. Only results that
/// are actually present contribute; a stage never sees a later stage's
/// output because the cursor cannot reach it first.
fn compose_context(stage: Stage, results: &HashMap<Stage, StagePayload>) -> Option<String> {
    let roles = results.get(&Stage::Roles).and_then(StagePayload::as_roles);
    let mut sections = Vec::new();

    match stage {
        Stage::Meta | Stage::Roles => {}
        Stage::State | Stage::RolePrompts => {
            if let Some(r) = roles {
                sections.push(section("ROLES", &pretty(&r.roles)));
                sections.push(section("PHASES", &pretty(&r.phases)));
            }
        }
        Stage::Prompts => {
            if let Some(r) = roles {
                sections.push(section("ROLES", &pretty(&r.roles)));
                sections.push(section("PHASES", &pretty(&r.phases)));
                let skeleton = schema::expected_prompt_slots(r);
                sections.push(section("EXPECTED PROMPT SLOTS", &pretty(&skeleton)));
            }
            if let Some(s) = results.get(&Stage::State).and_then(StagePayload::as_state) {
                let names = [
                    ("meta_information", &s.meta_information),
                    ("private_information", &s.private_information),
                    ("public_information", &s.public_information),
                ]
                .iter()
                .map(|(label, fields)| {
                    let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
                    format!("{}: {}", label, names.join(", "))
                })
                .collect::<Vec<_>>()
                .join("\n");
                sections.push(section("STATE FIELDS", &names));
            }
        }
        Stage::Agents => {
            if let Some(r) = roles {
                let listing: Vec<String> = r
                    .roles
                    .iter()
                    .map(|role| format!("{} ({})", role.raw_id, role.name))
                    .collect();
                sections.push(section("ROLES", &listing.join("\n")));
            }
        }
        Stage::Manager => {
            if let Some(r) = roles {
                sections.push(section("PHASES", &pretty(&r.phases)));
            }
        }
        Stage::Runner => {
            if let Some(m) = results.get(&Stage::Meta).and_then(StagePayload::as_meta) {
                sections.push(section("META", &pretty(m)));
            }
            if let Some(r) = roles {
                let numbers: Vec<String> =
                    r.phases.iter().map(|p| p.number.to_string()).collect();
                sections.push(section("PHASE NUMBERS", &numbers.join(", ")));
            }
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Render the standard prompt for a stage: header, context block, then the
/// stage's instruction template with the rules document substituted in.
pub fn stage_prompt(
    stage: Stage,
    source: &str,
    results: &HashMap<Stage, StagePayload>,
) -> String {
    let mut parts = vec![format!("You are extracting stage: {}.", stage.id())];
    if let Some(context) = compose_context(stage, results) {
        parts.push(context);
    }
    parts.push(render(instruction_template(stage), &[("instructions", source)]));
    parts.join("\n\n")
}

/// Build a retry prompt from a failed attempt.
///
/// Embeds, in this fixed order: the stage's standard prompt, the previous
/// raw model response, the previous error message, and the human feedback.
/// Absent sections are omitted.
pub fn retry_prompt(
    standard_prompt: &str,
    previous_response: Option<&str>,
    error: Option<&str>,
    feedback: Option<&str>,
) -> String {
    let mut parts = vec![section("STANDARD PROMPT", standard_prompt)];
    if let Some(response) = previous_response {
        parts.push(section("PREVIOUS RESPONSE", response));
    }
    if let Some(error) = error {
        parts.push(section("VALIDATION ERROR", error));
    }
    if let Some(feedback) = feedback {
        parts.push(section("HUMAN FEEDBACK", feedback));
    }
    parts.join("\n\n")
}
