//! Final assembly: N validated stage results → one output document.
//!
//! Pure and synchronous; no model calls. Roles get stable numeric
//! identifiers in first-seen order, later-stage references resolve through
//! the cross-reference table, absent values (the model's `cannot infer`,
//! already normalized to `None`) fall back to each field's declared default,
//! and prompt partials contributed by multiple stages merge by name.

use std::collections::HashMap;

use tracing::debug;

use crate::document::{
    AgentBinding, AgentRole, EventHandler, GameConfig, ManagerBlock, PromptPartial, RolePrompt,
    RunnerBlock, StateField, StateSection,
};
use crate::payload::{FieldDecl, PromptKind, PromptSlot, RoleDecl, StagePayload};
use crate::stage::Stage;

/// Mapping from a raw, stage-local role identifier to the stable numeric
/// identifier assigned during assembly. Built once per assembly pass and
/// consumed by the merge steps; never exposed to the model.
#[derive(Debug, Clone)]
pub struct CrossReferenceTable {
    ids: HashMap<String, u32>,
}

impl CrossReferenceTable {
    /// Assign each distinct raw identifier an integer in first-seen order,
    /// starting at 1. A duplicate raw identifier keeps its first assignment.
    pub fn from_roles(roles: &[RoleDecl]) -> Self {
        let mut ids = HashMap::new();
        let mut next = 1u32;
        for role in roles {
            if !ids.contains_key(&role.raw_id) {
                ids.insert(role.raw_id.clone(), next);
            }
            next += 1;
        }
        Self { ids }
    }

    /// Resolve a raw identifier to its numeric id.
    pub fn resolve(&self, raw: &str) -> Option<u32> {
        self.ids.get(raw).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The key a role prompt is attached under: bare kind for phase 0
/// (all phases), phase-suffixed otherwise.
fn prompt_key(kind: PromptKind, phase: u32) -> String {
    if phase == 0 {
        kind.as_str().to_string()
    } else {
        format!("{}_phase_{}", kind.as_str(), phase)
    }
}

/// Merge prompt slots contributed by multiple stages, by name.
///
/// Contributions arrive in stage order. The earliest substantive (non-empty)
/// content wins on true duplicates; an empty/absent value never overrides a
/// substantive one, and a later substantive value replaces an earlier empty
/// one.
fn merge_partials<'a>(contributions: impl Iterator<Item = &'a PromptSlot>) -> Vec<PromptPartial> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for slot in contributions {
        let content = slot.content.clone().unwrap_or_default();
        match merged.iter_mut().find(|(name, _)| *name == slot.name) {
            None => merged.push((slot.name.clone(), content)),
            Some((_, existing)) => {
                if existing.is_empty() && !content.is_empty() {
                    *existing = content;
                }
            }
        }
    }
    merged
        .into_iter()
        .map(|(name, content)| PromptPartial { name, content })
        .collect()
}

fn convert_fields(fields: &[FieldDecl]) -> Vec<StateField> {
    fields
        .iter()
        .map(|f| StateField {
            name: f.name.clone(),
            kind: f.kind.clone().unwrap_or_default(),
            default: f.default.clone().unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

/// Assemble the output document from validated stage results.
///
/// Results for stages the pipeline was not configured with simply
/// contribute their section defaults; the caller is responsible for
/// refusing to assemble while a *configured* stage is still incomplete.
pub fn assemble(results: &HashMap<Stage, StagePayload>) -> GameConfig {
    let meta = results.get(&Stage::Meta).and_then(StagePayload::as_meta);
    let roles = results.get(&Stage::Roles).and_then(StagePayload::as_roles);
    let state = results.get(&Stage::State).and_then(StagePayload::as_state);
    let prompts = results
        .get(&Stage::Prompts)
        .and_then(StagePayload::as_prompts);
    let role_prompts = results
        .get(&Stage::RolePrompts)
        .and_then(StagePayload::as_role_prompts);
    let agents = results
        .get(&Stage::Agents)
        .and_then(StagePayload::as_agents);
    let manager = results
        .get(&Stage::Manager)
        .and_then(StagePayload::as_manager);
    let runner = results
        .get(&Stage::Runner)
        .and_then(StagePayload::as_runner);

    // Roles: stable ids in first-seen order, starting at 1.
    let role_decls: &[RoleDecl] = roles.map(|r| r.roles.as_slice()).unwrap_or(&[]);
    let xref = CrossReferenceTable::from_roles(role_decls);
    let mut agent_roles: Vec<AgentRole> = role_decls
        .iter()
        .enumerate()
        .map(|(idx, role)| AgentRole {
            role_id: idx as u32 + 1,
            name: role.name.clone(),
            llm_type: role.llm_type.clone(),
            llm_params: role.llm_params.clone(),
            prompts: Vec::new(),
            task_phases: role.task_phases.clone(),
            task_phases_excluded: role.task_phases_excluded.clone(),
        })
        .collect();

    // Attach per-role prompts, resolving raw role references. Unresolvable
    // references are stale data, dropped rather than fatal.
    if let Some(rp) = role_prompts {
        for decl in &rp.prompts {
            let Some(text) = decl.text.clone() else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            match xref.resolve(&decl.role) {
                Some(role_id) => {
                    if let Some(role) = agent_roles.get_mut(role_id as usize - 1) {
                        role.prompts.push(RolePrompt {
                            key: prompt_key(decl.kind, decl.phase),
                            value: text,
                        });
                    }
                }
                None => debug!(role = %decl.role, "dropping prompt for unknown role"),
            }
        }
    }

    // Prompt partials: meta-stage seeds first, then the prompts stage.
    let empty = Vec::new();
    let meta_partials = meta.map(|m| &m.partials).unwrap_or(&empty);
    let slot_partials = prompts.map(|p| &p.slots).unwrap_or(&empty);
    let prompt_partials = merge_partials(meta_partials.iter().chain(slot_partials.iter()));

    // Agent-to-role bindings.
    let mut bindings = Vec::new();
    if let Some(agents) = agents {
        for agent in &agents.agents {
            match xref.resolve(&agent.role) {
                Some(role_id) => bindings.push(AgentBinding {
                    id: agent.id,
                    role_id,
                }),
                None => debug!(role = %agent.role, "dropping agent bound to unknown role"),
            }
        }
    }

    let state_section = state
        .map(|s| StateSection {
            meta_information: convert_fields(&s.meta_information),
            private_information: convert_fields(&s.private_information),
            public_information: convert_fields(&s.public_information),
        })
        .unwrap_or_default();

    let manager_block = manager
        .map(|m| {
            let defaults = ManagerBlock::default();
            ManagerBlock {
                kind: m.kind.clone().unwrap_or(defaults.kind),
                event_handlers: m
                    .event_handlers
                    .iter()
                    .map(|h| EventHandler {
                        event: h.event.clone(),
                        custom_code: h.custom_code.clone(),
                        custom_module: h.custom_module.clone(),
                        custom_function: h.custom_function.clone(),
                    })
                    .collect(),
            }
        })
        .unwrap_or_default();

    let runner_block = runner
        .map(|r| {
            let defaults = RunnerBlock::default();
            RunnerBlock {
                kind: r.kind.clone().unwrap_or(defaults.kind),
                protocol: r.protocol.clone().unwrap_or(defaults.protocol),
                hostname: r.hostname.clone().unwrap_or(defaults.hostname),
                path: r.path.clone().unwrap_or(defaults.path),
                port: r.port.unwrap_or(defaults.port),
                game_id: r.game_id.unwrap_or(defaults.game_id),
                logs_dir: r.logs_dir.clone().unwrap_or(defaults.logs_dir),
                log_level: r.log_level.clone().unwrap_or(defaults.log_level),
                prompts_dir: r.prompts_dir.clone().unwrap_or(defaults.prompts_dir),
                phase_transition_event: r
                    .phase_transition_event
                    .clone()
                    .unwrap_or(defaults.phase_transition_event),
                phase_identifier_key: r
                    .phase_identifier_key
                    .clone()
                    .unwrap_or(defaults.phase_identifier_key),
                continuous_phases: r.continuous_phases.clone(),
                min_action_delay: r.min_action_delay.unwrap_or(defaults.min_action_delay),
                max_action_delay: r.max_action_delay.unwrap_or(defaults.max_action_delay),
            }
        })
        .unwrap_or_default();

    GameConfig {
        name: meta.and_then(|m| m.name.clone()).unwrap_or_default(),
        description: meta.and_then(|m| m.description.clone()).unwrap_or_default(),
        prompt_partials,
        agent_roles,
        agents: bindings,
        state: state_section,
        manager: manager_block,
        runner: runner_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{
        AgentDecl, AgentsPayload, MetaPayload, PromptsPayload, RolePromptDecl, RolePromptsPayload,
        RolesPayload, StatePayload,
    };
    use serde_json::Value;

    fn role(raw_id: &str) -> RoleDecl {
        RoleDecl {
            raw_id: raw_id.to_string(),
            name: raw_id.to_string(),
            llm_type: None,
            llm_params: Default::default(),
            task_phases: vec![],
            task_phases_excluded: vec![],
        }
    }

    fn buyer_seller_results() -> HashMap<Stage, StagePayload> {
        HashMap::from([(
            Stage::Roles,
            StagePayload::Roles(RolesPayload {
                roles: vec![role("Buyer"), role("Seller")],
                phases: vec![],
            }),
        )])
    }

    #[test]
    fn test_cross_reference_first_seen_order() {
        let roles = [role("Buyer"), role("Seller")];
        let xref = CrossReferenceTable::from_roles(&roles);
        assert_eq!(xref.resolve("Buyer"), Some(1));
        assert_eq!(xref.resolve("Seller"), Some(2));
        assert_eq!(xref.resolve("Auctioneer"), None);
        assert_eq!(xref.len(), 2);
    }

    #[test]
    fn test_seller_resolves_to_two_regardless_of_mention_order() {
        let mut results = buyer_seller_results();
        results.insert(
            Stage::Agents,
            StagePayload::Agents(AgentsPayload {
                agents: vec![
                    AgentDecl {
                        id: 1,
                        role: "Seller".into(),
                    },
                    AgentDecl {
                        id: 2,
                        role: "Buyer".into(),
                    },
                ],
            }),
        );
        let config = assemble(&results);
        assert_eq!(config.agents[0], AgentBinding { id: 1, role_id: 2 });
        assert_eq!(config.agents[1], AgentBinding { id: 2, role_id: 1 });
    }

    #[test]
    fn test_stale_references_silently_dropped() {
        let mut results = buyer_seller_results();
        results.insert(
            Stage::Agents,
            StagePayload::Agents(AgentsPayload {
                agents: vec![AgentDecl {
                    id: 1,
                    role: "Auctioneer".into(),
                }],
            }),
        );
        results.insert(
            Stage::RolePrompts,
            StagePayload::RolePrompts(RolePromptsPayload {
                prompts: vec![RolePromptDecl {
                    role: "Auctioneer".into(),
                    phase: 1,
                    kind: PromptKind::System,
                    text: Some("gone".into()),
                }],
            }),
        );
        let config = assemble(&results);
        assert!(config.agents.is_empty());
        assert!(config.agent_roles.iter().all(|r| r.prompts.is_empty()));
    }

    #[test]
    fn test_role_prompts_attach_with_phase_keys() {
        let mut results = buyer_seller_results();
        results.insert(
            Stage::RolePrompts,
            StagePayload::RolePrompts(RolePromptsPayload {
                prompts: vec![
                    RolePromptDecl {
                        role: "Buyer".into(),
                        phase: 0,
                        kind: PromptKind::System,
                        text: Some("you are the buyer".into()),
                    },
                    RolePromptDecl {
                        role: "Buyer".into(),
                        phase: 2,
                        kind: PromptKind::User,
                        text: Some("bid now".into()),
                    },
                    RolePromptDecl {
                        role: "Buyer".into(),
                        phase: 3,
                        kind: PromptKind::User,
                        text: None, // model could not infer: dropped
                    },
                ],
            }),
        );
        let config = assemble(&results);
        let buyer = &config.agent_roles[0];
        assert_eq!(buyer.prompts.len(), 2);
        assert_eq!(buyer.prompts[0].key, "system");
        assert_eq!(buyer.prompts[1].key, "user_phase_2");
    }

    #[test]
    fn test_merge_earliest_substantive_wins() {
        let meta = [
            PromptSlot {
                name: "game_description".into(),
                content: Some("from meta".into()),
            },
            PromptSlot {
                name: "game_history".into(),
                content: None,
            },
        ];
        let generated = [
            PromptSlot {
                name: "game_description".into(),
                content: Some("from prompts".into()),
            },
            PromptSlot {
                name: "game_history".into(),
                content: Some("filled later".into()),
            },
        ];
        let merged = merge_partials(meta.iter().chain(generated.iter()));
        assert_eq!(merged.len(), 2);
        // Earliest substantive value wins on true duplicates.
        assert_eq!(merged[0].content, "from meta");
        // A later substantive value replaces an earlier empty one.
        assert_eq!(merged[1].content, "filled later");
    }

    #[test]
    fn test_merge_empty_never_overrides_substantive() {
        let first = [PromptSlot {
            name: "game_information".into(),
            content: Some("real".into()),
        }];
        let second = [PromptSlot {
            name: "game_information".into(),
            content: None,
        }];
        let merged = merge_partials(first.iter().chain(second.iter()));
        assert_eq!(merged[0].content, "real");
    }

    #[test]
    fn test_sentinel_normalized_to_defaults() {
        let mut results = buyer_seller_results();
        results.insert(
            Stage::Meta,
            StagePayload::Meta(MetaPayload {
                name: None, // was "cannot infer"
                description: Some("a market game".into()),
                partials: vec![PromptSlot {
                    name: "game_description".into(),
                    content: None,
                }],
            }),
        );
        results.insert(
            Stage::State,
            StagePayload::State(StatePayload {
                meta_information: vec![FieldDecl {
                    name: "round".into(),
                    kind: None,
                    default: None,
                }],
                private_information: vec![],
                public_information: vec![],
            }),
        );
        let config = assemble(&results);
        assert_eq!(config.name, "");
        assert_eq!(config.description, "a market game");
        assert_eq!(config.prompt_partials[0].content, "");
        assert_eq!(config.state.meta_information[0].kind, "");
        assert_eq!(config.state.meta_information[0].default, Value::Null);
        let rendered = config.to_json().unwrap();
        assert!(!rendered.contains("cannot infer"));
    }

    #[test]
    fn test_assemble_is_deterministic_and_idempotent() {
        let mut results = buyer_seller_results();
        results.insert(
            Stage::Meta,
            StagePayload::Meta(MetaPayload {
                name: Some("Auction".into()),
                description: Some("d".into()),
                partials: vec![],
            }),
        );
        results.insert(
            Stage::Prompts,
            StagePayload::Prompts(PromptsPayload {
                slots: vec![PromptSlot {
                    name: "game_description".into(),
                    content: Some("an auction".into()),
                }],
            }),
        );
        let once = assemble(&results);
        let twice = assemble(&results);
        assert_eq!(once, twice);

        // Substituting the document's values back into the originating
        // results reconstructs an observationally equal document.
        results.insert(
            Stage::Meta,
            StagePayload::Meta(MetaPayload {
                name: Some(once.name.clone()),
                description: Some(once.description.clone()),
                partials: vec![],
            }),
        );
        results.insert(
            Stage::Prompts,
            StagePayload::Prompts(PromptsPayload {
                slots: once
                    .prompt_partials
                    .iter()
                    .map(|p| PromptSlot {
                        name: p.name.clone(),
                        content: Some(p.content.clone()),
                    })
                    .collect(),
            }),
        );
        let again = assemble(&results);
        assert_eq!(again, once);
    }

    #[test]
    fn test_missing_stages_yield_section_defaults() {
        let config = assemble(&buyer_seller_results());
        assert_eq!(config.manager, ManagerBlock::default());
        assert_eq!(config.runner, RunnerBlock::default());
        assert!(config.state.meta_information.is_empty());
        assert_eq!(config.agent_roles.len(), 2);
        assert_eq!(config.agent_roles[0].role_id, 1);
        assert_eq!(config.agent_roles[1].role_id, 2);
    }
}
