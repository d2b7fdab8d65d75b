//! Stage execution: one attempt of one stage.
//!
//! The attempt is split into the transport half ([`call_model`]) and the
//! pure processing half ([`process_response`]): parse the response text as
//! JSON, unwrap a payload nested under the stage's own identifier, and
//! validate it into the stage's typed payload. The pipeline controller runs
//! both halves on a background task and records the outcome; failures here
//! become the stage's error, never a panic or an unhandled error on the
//! background path.

use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::gateway::{self, BackoffConfig, CompletionRequest, Gateway, GatewayResponse};
use crate::payload::StagePayload;
use crate::schema;
use crate::stage::Stage;

/// Invoke the gateway with transport-level backoff.
pub async fn call_model(
    gateway: &Arc<dyn Gateway>,
    client: &Client,
    base_url: &str,
    request: &CompletionRequest,
    backoff: &BackoffConfig,
) -> Result<GatewayResponse> {
    gateway::with_backoff(gateway, client, base_url, request, backoff).await
}

/// If the payload is an object whose only key is the stage's identifier,
/// unwrap to the nested value. Tolerates models that either wrap the answer
/// under a named key or answer directly. Multi-key objects are left intact
/// so a stage id that doubles as a payload key (e.g. `roles`) does not
/// swallow its sibling keys.
fn unwrap_stage_key(stage: Stage, value: Value) -> Value {
    match value {
        Value::Object(mut obj) => {
            if obj.len() == 1 {
                if let Some(inner) = obj.remove(stage.id()) {
                    debug!(stage = %stage, "unwrapping payload nested under stage key");
                    return inner;
                }
            }
            Value::Object(obj)
        }
        other => other,
    }
}

/// Parse and validate a raw model response into the stage's typed payload.
///
/// Returns the human-readable failure reason on error; the caller records it
/// as the stage's error.
pub fn process_response(
    stage: Stage,
    text: &str,
    expected_slots: Option<&[String]>,
) -> std::result::Result<StagePayload, String> {
    let parsed = match crate::parsing::parse_response(text) {
        Ok(value) => value,
        Err(e) => return Err(e.to_string()),
    };

    let unwrapped = unwrap_stage_key(stage, parsed);

    schema::validate_stage(stage, &unwrapped, expected_slots).map_err(|reason| {
        PipelineError::SchemaViolation { stage, reason }.to_string()
    })
}
