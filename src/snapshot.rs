//! Persisted intermediate artifacts.
//!
//! Each stage's validated payload can be written out as JSON keyed by stage
//! id, so a run can be inspected offline or resumed from a specific stage
//! without re-querying the model for the stages that already succeeded.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::payload::StagePayload;
use crate::stage::Stage;

fn payload_value(payload: &StagePayload) -> Result<Value> {
    let value = match payload {
        StagePayload::Meta(p) => serde_json::to_value(p)?,
        StagePayload::Roles(p) => serde_json::to_value(p)?,
        StagePayload::State(p) => serde_json::to_value(p)?,
        StagePayload::Prompts(p) => serde_json::to_value(p)?,
        StagePayload::RolePrompts(p) => serde_json::to_value(p)?,
        StagePayload::Agents(p) => serde_json::to_value(p)?,
        StagePayload::Manager(p) => serde_json::to_value(p)?,
        StagePayload::Runner(p) => serde_json::to_value(p)?,
    };
    Ok(value)
}

fn payload_from_value(stage: Stage, value: Value) -> Result<StagePayload> {
    let payload = match stage {
        Stage::Meta => StagePayload::Meta(serde_json::from_value(value)?),
        Stage::Roles => StagePayload::Roles(serde_json::from_value(value)?),
        Stage::State => StagePayload::State(serde_json::from_value(value)?),
        Stage::Prompts => StagePayload::Prompts(serde_json::from_value(value)?),
        Stage::RolePrompts => StagePayload::RolePrompts(serde_json::from_value(value)?),
        Stage::Agents => StagePayload::Agents(serde_json::from_value(value)?),
        Stage::Manager => StagePayload::Manager(serde_json::from_value(value)?),
        Stage::Runner => StagePayload::Runner(serde_json::from_value(value)?),
    };
    Ok(payload)
}

/// Write validated stage results to `path` as a JSON object keyed by stage
/// id, in canonical stage order.
pub fn save(path: impl AsRef<Path>, results: &HashMap<Stage, StagePayload>) -> Result<()> {
    let mut map = Map::new();
    for stage in Stage::ALL {
        if let Some(payload) = results.get(&stage) {
            map.insert(stage.id().to_string(), payload_value(payload)?);
        }
    }
    let text = serde_json::to_string_pretty(&Value::Object(map))?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Load stage results previously written by [`save`].
///
/// Unknown keys are skipped with a warning; a payload that no longer matches
/// its stage's shape is an error.
pub fn load(path: impl AsRef<Path>) -> Result<HashMap<Stage, StagePayload>> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    let Value::Object(map) = value else {
        return Err(PipelineError::Other(
            "snapshot must be a JSON object keyed by stage id".to_string(),
        ));
    };

    let mut results = HashMap::new();
    for (key, raw) in map {
        match Stage::from_id(&key) {
            Some(stage) => {
                results.insert(stage, payload_from_value(stage, raw)?);
            }
            None => warn!(key = %key, "skipping unknown stage key in snapshot"),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{MetaPayload, RolesPayload};

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let results = HashMap::from([
            (
                Stage::Meta,
                StagePayload::Meta(MetaPayload {
                    name: Some("Auction".into()),
                    description: None,
                    partials: vec![],
                }),
            ),
            (Stage::Roles, StagePayload::Roles(RolesPayload::default())),
        ]);

        save(&path, &results).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, results);
    }

    #[test]
    fn test_snapshot_keyed_by_stage_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let results = HashMap::from([(
            Stage::Meta,
            StagePayload::Meta(MetaPayload::default()),
        )]);
        save(&path, &results).unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("meta").is_some());
        assert!(raw.get("roles").is_none());
    }

    #[test]
    fn test_load_skips_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"mystery": {}, "roles": {"roles": [], "phases": []}}"#).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&Stage::Roles));
    }

    #[test]
    fn test_load_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(load(&path).is_err());
    }
}
