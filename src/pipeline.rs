//! Pipeline controller: the staged-extraction state machine.
//!
//! One [`Pipeline`] owns the ordered stage list, the current-stage cursor,
//! per-stage results and errors, the prompt record, and the run-state. All
//! mutation happens under a single lock, inside the controller's methods or
//! the one background task it spawned; at most one stage attempt is in
//! flight per pipeline instance.
//!
//! `run_current_stage` dispatches the attempt onto a tokio task and returns
//! immediately; callers observe completion through the [`watch`] channel
//! ([`Pipeline::subscribe`], [`Pipeline::wait_until_settled`]) or by polling
//! [`Pipeline::run_state`]. Each dispatch carries a generation token so a
//! superseded attempt (a cancel, a retry raced with a reset) can never
//! overwrite results out of order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::assembler;
use crate::document::GameConfig;
use crate::error::{PipelineError, Result};
use crate::executor;
use crate::gateway::{
    BackoffConfig, ChatGateway, ChatMessage, CompletionRequest, Gateway,
};
use crate::payload::StagePayload;
use crate::prompt;
use crate::schema;
use crate::snapshot;
use crate::stage::{RunState, Stage};

/// The selected rules document, read in full into memory. Any stage's
/// prompt may embed the entire text verbatim.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub text: String,
}

/// Mutable per-run state, guarded by the pipeline's lock.
struct Shared {
    cursor: usize,
    source: Option<SourceDocument>,
    results: HashMap<Stage, StagePayload>,
    errors: HashMap<Stage, String>,
    /// Last prompt sent and last raw response, kept for retry composition.
    /// Overwritten on every stage invocation; not cumulative history.
    last_prompt: Option<String>,
    last_response: Option<String>,
    /// Bumped on every dispatch, cancel, and reset. A background task whose
    /// token no longer matches discards its outcome.
    generation: u64,
}

/// Staged extraction pipeline over an LLM gateway.
///
/// # Example
///
/// ```no_run
/// use gamespec_pipeline::{Pipeline, Stage};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = Pipeline::builder("http://localhost:11434")
///         .stages(vec![Stage::Meta, Stage::Roles, Stage::State])
///         .build()?;
///
///     pipeline.select_source("rules/auction.txt")?;
///     loop {
///         pipeline.run_current_stage()?;
///         pipeline.wait_until_settled().await;
///         if let Some(error) = pipeline.current_stage_error() {
///             eprintln!("stage failed: {error}");
///             pipeline.retry_with_feedback(None)?;
///             pipeline.wait_until_settled().await;
///         }
///         if pipeline.advance()?.is_none() {
///             break;
///         }
///     }
///     let config = pipeline.assemble()?;
///     println!("{}", config.to_json()?);
///     Ok(())
/// }
/// ```
pub struct Pipeline {
    stages: Vec<Stage>,
    gateway: Arc<dyn Gateway>,
    client: Client,
    base_url: String,
    model: String,
    backoff: BackoffConfig,
    system_instruction: String,
    temperature: f64,
    max_tokens: u32,
    shared: Arc<Mutex<Shared>>,
    state_tx: watch::Sender<RunState>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("gateway", &self.gateway.name())
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("run_state", &self.run_state())
            .finish()
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_state(tx: &watch::Sender<RunState>, state: RunState) {
    // send_replace updates the value even when no receiver is subscribed;
    // the run-state stays readable through the sender.
    tx.send_replace(state);
}

impl Pipeline {
    /// Create a new pipeline builder targeting the given provider base URL.
    pub fn builder(base_url: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(base_url)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    /// The configured stage list, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The stage at the current cursor.
    pub fn current_stage(&self) -> Stage {
        self.stages[self.lock().cursor]
    }

    /// The pipeline's current run-state.
    pub fn run_state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// Subscribe to run-state changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Wait until the run-state leaves the in-flight states
    /// (`WaitingForModel` / `ProcessingResponse`) and return it.
    pub async fn wait_until_settled(&self) -> RunState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if !state.is_in_flight() {
                return state;
            }
            if rx.changed().await.is_err() {
                return state;
            }
        }
    }

    /// Select the rules document to extract from.
    ///
    /// Fails with [`PipelineError::SourceNotFound`] if the path does not
    /// exist. Otherwise resets the cursor to the first stage, clears all
    /// results, errors, and the prompt record, and supersedes any in-flight
    /// attempt.
    pub fn select_source(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::SourceNotFound(path.to_path_buf()),
            _ => PipelineError::Io(e),
        })?;

        let mut shared = self.lock();
        shared.generation += 1; // strand any in-flight attempt
        shared.cursor = 0;
        shared.results.clear();
        shared.errors.clear();
        shared.last_prompt = None;
        shared.last_response = None;
        shared.source = Some(SourceDocument {
            path: path.to_path_buf(),
            text,
        });
        set_state(&self.state_tx, RunState::SelectingSource);
        info!(path = %path.display(), "source document selected");
        Ok(())
    }

    /// The selected source document, if any.
    pub fn source(&self) -> Option<SourceDocument> {
        self.lock().source.clone()
    }

    /// Render the current stage's prompt without dispatching it.
    pub fn preview_prompt(&self) -> Result<String> {
        let shared = self.lock();
        let stage = self.stages[shared.cursor];
        let source = shared.source.as_ref().ok_or(PipelineError::NoSource)?;
        Ok(prompt::stage_prompt(stage, &source.text, &shared.results))
    }

    /// The expected closed slot set for the prompts stage, computed from the
    /// roles result present at dispatch time.
    fn expected_slots(&self, stage: Stage, results: &HashMap<Stage, StagePayload>) -> Option<Vec<String>> {
        if stage != Stage::Prompts {
            return None;
        }
        results
            .get(&Stage::Roles)
            .and_then(StagePayload::as_roles)
            .map(schema::expected_prompt_slots)
    }

    /// Run the stage at the cursor.
    ///
    /// Composes the stage prompt, transitions to `WaitingForModel`, and
    /// schedules the attempt on a background task, returning the stage
    /// immediately. Rejected with [`PipelineError::StageInFlight`] while a
    /// prior attempt is still running.
    pub fn run_current_stage(&self) -> Result<Stage> {
        let (stage, rendered, expected, generation) = {
            let mut shared = self.lock();
            let stage = self.stages[shared.cursor];
            if self.run_state().is_in_flight() {
                return Err(PipelineError::StageInFlight { stage });
            }
            let source = shared.source.as_ref().ok_or(PipelineError::NoSource)?;
            let rendered = prompt::stage_prompt(stage, &source.text, &shared.results);
            let expected = self.expected_slots(stage, &shared.results);
            shared.last_prompt = Some(rendered.clone());
            shared.last_response = None;
            shared.generation += 1;
            set_state(&self.state_tx, RunState::WaitingForModel);
            (stage, rendered, expected, shared.generation)
        };
        self.spawn_attempt(stage, rendered, expected, generation);
        Ok(stage)
    }

    /// Retry the current stage with a prompt that embeds the previous
    /// attempt.
    ///
    /// The retry prompt contains, in fixed order: the stage's standard
    /// prompt, the previous raw response (if any), the recorded error (if
    /// any), and `feedback` (if any), each under its own labeled section.
    pub fn retry_with_feedback(&self, feedback: Option<&str>) -> Result<Stage> {
        let (stage, rendered, expected, generation) = {
            let mut shared = self.lock();
            let stage = self.stages[shared.cursor];
            if self.run_state().is_in_flight() {
                return Err(PipelineError::StageInFlight { stage });
            }
            let source = shared.source.as_ref().ok_or(PipelineError::NoSource)?;
            set_state(&self.state_tx, RunState::ReadyForFeedback);
            let standard = prompt::stage_prompt(stage, &source.text, &shared.results);
            let rendered = prompt::retry_prompt(
                &standard,
                shared.last_response.as_deref(),
                shared.errors.get(&stage).map(String::as_str),
                feedback,
            );
            let expected = self.expected_slots(stage, &shared.results);
            shared.last_prompt = Some(rendered.clone());
            shared.last_response = None;
            shared.generation += 1;
            set_state(&self.state_tx, RunState::WaitingForModel);
            (stage, rendered, expected, shared.generation)
        };
        debug!(stage = %stage, "dispatching retry prompt");
        self.spawn_attempt(stage, rendered, expected, generation);
        Ok(stage)
    }

    fn spawn_attempt(
        &self,
        stage: Stage,
        rendered: String,
        expected: Option<Vec<String>>,
        generation: u64,
    ) {
        let gateway = Arc::clone(&self.gateway);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let backoff = self.backoff.clone();
        let shared = Arc::clone(&self.shared);
        let state_tx = self.state_tx.clone();
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(self.system_instruction.clone()),
                ChatMessage::user(rendered),
            ],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens)
        .with_json_mode(true);

        tokio::spawn(async move {
            debug!(stage = %stage, "stage dispatched to model");
            let response =
                executor::call_model(&gateway, &client, &base_url, &request, &backoff).await;

            let text = match response {
                Ok(resp) => {
                    let mut guard = lock_shared(&shared);
                    if guard.generation != generation {
                        debug!(stage = %stage, "stale attempt discarded");
                        return;
                    }
                    guard.last_response = Some(resp.text.clone());
                    set_state(&state_tx, RunState::ProcessingResponse);
                    resp.text
                }
                Err(e) => {
                    let mut guard = lock_shared(&shared);
                    if guard.generation != generation {
                        debug!(stage = %stage, "stale attempt discarded");
                        return;
                    }
                    error!(stage = %stage, error = %e, "model call failed");
                    guard.errors.insert(stage, e.to_string());
                    guard.results.remove(&stage);
                    set_state(&state_tx, RunState::Error);
                    return;
                }
            };

            let outcome = executor::process_response(stage, &text, expected.as_deref());

            let mut guard = lock_shared(&shared);
            if guard.generation != generation {
                debug!(stage = %stage, "stale attempt discarded");
                return;
            }
            match outcome {
                Ok(payload) => {
                    info!(stage = %stage, "stage validated");
                    guard.results.insert(stage, payload);
                    guard.errors.remove(&stage);
                    set_state(&state_tx, RunState::Success);
                }
                Err(reason) => {
                    warn!(stage = %stage, error = %reason, "stage rejected");
                    guard.errors.insert(stage, reason);
                    guard.results.remove(&stage);
                    set_state(&state_tx, RunState::Error);
                }
            }
        });
    }

    /// Supersede the in-flight attempt, if any. The background task keeps
    /// running but its outcome is discarded; the run-state returns to
    /// `Idle`.
    pub fn cancel(&self) {
        let mut shared = self.lock();
        if self.run_state().is_in_flight() {
            shared.generation += 1;
            set_state(&self.state_tx, RunState::Idle);
            info!("in-flight attempt cancelled");
        }
    }

    /// Move the cursor to the next stage.
    ///
    /// Returns the new stage, or `None` once past the last stage (run-state
    /// becomes `Success`). The cursor never advances past a stage without a
    /// validated result, and never regresses except through
    /// [`select_source`](Self::select_source).
    pub fn advance(&self) -> Result<Option<Stage>> {
        let mut shared = self.lock();
        let stage = self.stages[shared.cursor];
        if self.run_state().is_in_flight() {
            return Err(PipelineError::StageInFlight { stage });
        }
        if !shared.results.contains_key(&stage) {
            return Err(PipelineError::StageIncomplete { stage });
        }
        if shared.cursor < self.stages.len() - 1 {
            shared.cursor += 1;
            set_state(&self.state_tx, RunState::Idle);
            Ok(Some(self.stages[shared.cursor]))
        } else {
            set_state(&self.state_tx, RunState::Success);
            Ok(None)
        }
    }

    /// True iff every configured stage has a validated result.
    pub fn all_stages_successful(&self) -> bool {
        let shared = self.lock();
        self.stages.iter().all(|s| shared.results.contains_key(s))
    }

    /// The validated result of the stage at the cursor, if any.
    pub fn current_stage_result(&self) -> Option<StagePayload> {
        let shared = self.lock();
        shared.results.get(&self.stages[shared.cursor]).cloned()
    }

    /// The recorded error of the stage at the cursor, if any.
    pub fn current_stage_error(&self) -> Option<String> {
        let shared = self.lock();
        shared.errors.get(&self.stages[shared.cursor]).cloned()
    }

    /// The validated result for a specific stage, if any.
    pub fn stage_result(&self, stage: Stage) -> Option<StagePayload> {
        self.lock().results.get(&stage).cloned()
    }

    /// The recorded error for a specific stage, if any.
    pub fn stage_error(&self, stage: Stage) -> Option<String> {
        self.lock().errors.get(&stage).cloned()
    }

    /// The last prompt sent, if any.
    pub fn last_prompt(&self) -> Option<String> {
        self.lock().last_prompt.clone()
    }

    /// The last raw model response, if any.
    pub fn last_response(&self) -> Option<String> {
        self.lock().last_response.clone()
    }

    /// Merge all validated stage results into the output document.
    ///
    /// Fails with [`PipelineError::PrematureFinalization`] naming the first
    /// incomplete stage if any configured stage has not succeeded yet.
    pub fn assemble(&self) -> Result<GameConfig> {
        let shared = self.lock();
        for stage in &self.stages {
            if !shared.results.contains_key(stage) {
                return Err(PipelineError::PrematureFinalization { stage: *stage });
            }
        }
        Ok(assembler::assemble(&shared.results))
    }

    /// Assemble and write the output document to `path` as JSON.
    pub fn write_output(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let config = self.assemble()?;
        set_state(&self.state_tx, RunState::WritingOutput);
        let text = config.to_json()?;
        std::fs::write(path.as_ref(), text)?;
        set_state(&self.state_tx, RunState::Success);
        info!(path = %path.as_ref().display(), "output document written");
        Ok(path.as_ref().to_path_buf())
    }

    /// Assemble and write the output document to `path` as YAML.
    #[cfg(feature = "yaml")]
    pub fn write_output_yaml(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let config = self.assemble()?;
        set_state(&self.state_tx, RunState::WritingOutput);
        let text = config.to_yaml()?;
        std::fs::write(path.as_ref(), text)?;
        set_state(&self.state_tx, RunState::Success);
        Ok(path.as_ref().to_path_buf())
    }

    /// Persist the validated stage results to `path`, keyed by stage id.
    pub fn snapshot_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let shared = self.lock();
        snapshot::save(path, &shared.results)
    }

    /// Restore stage results from a snapshot written by
    /// [`snapshot_to`](Self::snapshot_to).
    ///
    /// Call after `select_source` (which clears results). Only stages the
    /// pipeline is configured with are restored; the cursor moves to the
    /// first stage without a result. Returns the restored stages.
    pub fn restore_from(&self, path: impl AsRef<Path>) -> Result<Vec<Stage>> {
        let loaded = snapshot::load(path)?;
        let mut shared = self.lock();
        if self.run_state().is_in_flight() {
            return Err(PipelineError::StageInFlight {
                stage: self.stages[shared.cursor],
            });
        }
        let mut restored = Vec::new();
        for stage in &self.stages {
            if let Some(payload) = loaded.get(stage) {
                shared.results.insert(*stage, payload.clone());
                shared.errors.remove(stage);
                restored.push(*stage);
            }
        }
        shared.cursor = self
            .stages
            .iter()
            .position(|s| !shared.results.contains_key(s))
            .unwrap_or(self.stages.len() - 1);
        set_state(&self.state_tx, RunState::Idle);
        info!(restored = restored.len(), "stage results restored from snapshot");
        Ok(restored)
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    base_url: String,
    stages: Vec<Stage>,
    gateway: Option<Arc<dyn Gateway>>,
    client: Option<Client>,
    model: String,
    backoff: BackoffConfig,
    system_instruction: String,
    temperature: f64,
    max_tokens: u32,
    timeout: std::time::Duration,
}

impl PipelineBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stages: Stage::ALL.to_vec(),
            gateway: None,
            client: None,
            model: "gpt-4o-mini".to_string(),
            backoff: BackoffConfig::none(),
            system_instruction: prompt::SYSTEM_INSTRUCTION.to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            timeout: std::time::Duration::from_secs(60),
        }
    }

    /// Set the stage list. Defaults to all stages in canonical order.
    pub fn stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    /// Set the gateway. Defaults to [`ChatGateway`] without authentication.
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the HTTP client. If not set, a default client with the configured
    /// timeout is created.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the model identifier.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the transport retry configuration.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the fixed system instruction.
    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the maximum tokens per completion.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the request timeout for the default HTTP client.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the pipeline, validating configuration.
    pub fn build(self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline must have at least one stage".to_string(),
            ));
        }
        // Stages must be distinct and keep their canonical relative order so
        // prompt context only ever references earlier stages.
        let positions: Vec<usize> = self
            .stages
            .iter()
            .filter_map(|s| Stage::ALL.iter().position(|c| c == s))
            .collect();
        if positions.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PipelineError::InvalidConfig(
                "stages must be distinct and in canonical order".to_string(),
            ));
        }

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(PipelineError::Request)?,
        };

        let (state_tx, _state_rx) = watch::channel(RunState::Idle);

        Ok(Pipeline {
            stages: self.stages,
            gateway: self
                .gateway
                .unwrap_or_else(|| Arc::new(ChatGateway::new())),
            client,
            base_url: self.base_url,
            model: self.model,
            backoff: self.backoff,
            system_instruction: self.system_instruction,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            shared: Arc::new(Mutex::new(Shared {
                cursor: 0,
                source: None,
                results: HashMap::new(),
                errors: HashMap::new(),
                last_prompt: None,
                last_response: None,
                generation: 0,
            })),
            state_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use std::io::Write;
    use std::time::Duration;

    fn write_rules(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("auction.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "Two players, a Buyer and a Seller, trade one good over a single Bid phase."
        )
        .unwrap();
        path
    }

    fn meta_response() -> String {
        r#"{"meta": {"name": "Auction", "description": "A two-player trading game."}}"#.into()
    }

    fn roles_response() -> String {
        r#"{
            "roles": [
                {"raw_id": "Buyer", "name": "Buyer", "llm_type": "cannot infer",
                 "llm_params": {}, "task_phases": [1], "task_phases_excluded": []},
                {"raw_id": "Seller", "name": "Seller", "llm_type": "cannot infer",
                 "llm_params": {}, "task_phases": [1], "task_phases_excluded": []}
            ],
            "phases": [
                {"phase": "Bid", "phase_number": 1, "actionable": true,
                 "role_tasks": {"Buyer": ["submit bid"], "Seller": ["set price"]}}
            ]
        }"#
        .into()
    }

    fn state_response() -> String {
        r#"{"state": {
            "meta_information": [{"name": "round", "type": "int", "default": 0}],
            "private_information": [{"name": "valuation", "type": "int", "default": "cannot infer"}],
            "public_information": []
        }}"#
        .into()
    }

    fn three_stage_pipeline(responses: Vec<String>) -> (Pipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta, Stage::Roles, Stage::State])
            .gateway(Arc::new(MockGateway::new(responses)))
            .build()
            .unwrap();
        let rules = write_rules(&dir);
        pipeline.select_source(rules).unwrap();
        (pipeline, dir)
    }

    #[test]
    fn test_builder_rejects_empty_stages() {
        let result = Pipeline::builder("http://unused").stages(vec![]).build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_out_of_order_stages() {
        let result = Pipeline::builder("http://unused")
            .stages(vec![Stage::State, Stage::Meta])
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_rejects_duplicate_stages() {
        let result = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta, Stage::Meta])
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_select_source_missing_file() {
        let pipeline = Pipeline::builder("http://unused").build().unwrap();
        let err = pipeline.select_source("/definitely/not/here.txt").unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_without_source_rejected() {
        let pipeline = Pipeline::builder("http://unused")
            .gateway(Arc::new(MockGateway::fixed("{}")))
            .build()
            .unwrap();
        assert!(matches!(
            pipeline.run_current_stage(),
            Err(PipelineError::NoSource)
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_three_stage_run() {
        let (pipeline, _dir) = three_stage_pipeline(vec![
            meta_response(),
            roles_response(),
            state_response(),
        ]);

        loop {
            let stage = pipeline.run_current_stage().unwrap();
            let settled = pipeline.wait_until_settled().await;
            assert_eq!(settled, RunState::Success, "stage {stage} failed");
            if pipeline.advance().unwrap().is_none() {
                break;
            }
        }

        assert!(pipeline.all_stages_successful());
        let config = pipeline.assemble().unwrap();
        assert_eq!(config.name, "Auction");
        assert_eq!(config.description, "A two-player trading game.");
        assert_eq!(config.agent_roles.len(), 2);
        assert_eq!(config.agent_roles[0].role_id, 1);
        assert_eq!(config.agent_roles[1].role_id, 2);
        // Sentinel never survives into the document.
        assert!(!config.to_json().unwrap().contains("cannot infer"));
    }

    #[tokio::test]
    async fn test_malformed_response_recorded_with_excerpt() {
        let (pipeline, _dir) = three_stage_pipeline(vec!["{not valid json".into()]);

        pipeline.run_current_stage().unwrap();
        let settled = pipeline.wait_until_settled().await;
        assert_eq!(settled, RunState::Error);

        let error = pipeline.current_stage_error().unwrap();
        assert!(error.contains("not valid JSON"), "{error}");
        assert!(error.contains("{not valid json"), "{error}");
        assert!(pipeline.current_stage_result().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_recorded_not_thrown() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta])
            .gateway(Arc::new(MockGateway::failing("connection refused")))
            .build()
            .unwrap();
        pipeline.select_source(write_rules(&dir)).unwrap();

        pipeline.run_current_stage().unwrap();
        assert_eq!(pipeline.wait_until_settled().await, RunState::Error);
        let error = pipeline.current_stage_error().unwrap();
        assert!(error.contains("connection refused"), "{error}");
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta])
            .gateway(Arc::new(
                MockGateway::fixed(meta_response()).with_delay(Duration::from_millis(200)),
            ))
            .build()
            .unwrap();
        pipeline.select_source(write_rules(&dir)).unwrap();

        pipeline.run_current_stage().unwrap();
        let err = pipeline.run_current_stage().unwrap_err();
        assert!(matches!(err, PipelineError::StageInFlight { stage: Stage::Meta }));
        assert_eq!(pipeline.wait_until_settled().await, RunState::Success);
    }

    #[tokio::test]
    async fn test_cancel_discards_stale_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta])
            .gateway(Arc::new(
                MockGateway::fixed(meta_response()).with_delay(Duration::from_millis(50)),
            ))
            .build()
            .unwrap();
        pipeline.select_source(write_rules(&dir)).unwrap();

        pipeline.run_current_stage().unwrap();
        pipeline.cancel();
        assert_eq!(pipeline.run_state(), RunState::Idle);

        // Let the superseded task complete; its result must be discarded.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pipeline.current_stage_result().is_none());
        assert_eq!(pipeline.run_state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_advance_requires_validated_result() {
        let (pipeline, _dir) = three_stage_pipeline(vec![meta_response()]);
        let err = pipeline.advance().unwrap_err();
        assert!(matches!(err, PipelineError::StageIncomplete { stage: Stage::Meta }));

        pipeline.run_current_stage().unwrap();
        pipeline.wait_until_settled().await;
        assert_eq!(pipeline.advance().unwrap(), Some(Stage::Roles));
    }

    #[tokio::test]
    async fn test_cursor_never_skips_or_regresses() {
        let (pipeline, _dir) = three_stage_pipeline(vec![
            meta_response(),
            roles_response(),
            state_response(),
        ]);

        let mut visited = vec![pipeline.current_stage()];
        loop {
            pipeline.run_current_stage().unwrap();
            pipeline.wait_until_settled().await;
            match pipeline.advance().unwrap() {
                Some(stage) => visited.push(stage),
                None => break,
            }
        }
        assert_eq!(visited, vec![Stage::Meta, Stage::Roles, Stage::State]);
        assert_eq!(pipeline.run_state(), RunState::Success);
    }

    #[tokio::test]
    async fn test_retry_prompt_embeds_previous_attempt() {
        let (pipeline, _dir) = three_stage_pipeline(vec![
            "{not valid json".into(),
            meta_response(),
        ]);

        pipeline.run_current_stage().unwrap();
        assert_eq!(pipeline.wait_until_settled().await, RunState::Error);

        pipeline.retry_with_feedback(Some("stick to the schema")).unwrap();
        assert_eq!(pipeline.wait_until_settled().await, RunState::Success);

        let retry = pipeline.last_prompt().unwrap();
        assert!(retry.contains("## STANDARD PROMPT"));
        assert!(retry.contains("## PREVIOUS RESPONSE"));
        assert!(retry.contains("{not valid json"));
        assert!(retry.contains("## VALIDATION ERROR"));
        assert!(retry.contains("## HUMAN FEEDBACK"));
        assert!(retry.contains("stick to the schema"));
        assert!(pipeline.current_stage_result().is_some());
        assert!(pipeline.current_stage_error().is_none());
    }

    #[tokio::test]
    async fn test_premature_assembly_rejected() {
        let (pipeline, _dir) = three_stage_pipeline(vec![meta_response()]);
        pipeline.run_current_stage().unwrap();
        pipeline.wait_until_settled().await;

        let err = pipeline.assemble().unwrap_err();
        assert!(matches!(err, PipelineError::PrematureFinalization { stage: Stage::Roles }));
    }

    #[tokio::test]
    async fn test_select_source_resets_everything() {
        let (pipeline, dir) = three_stage_pipeline(vec![meta_response()]);
        pipeline.run_current_stage().unwrap();
        pipeline.wait_until_settled().await;
        pipeline.advance().unwrap();
        assert_eq!(pipeline.current_stage(), Stage::Roles);

        pipeline.select_source(write_rules(&dir)).unwrap();
        assert_eq!(pipeline.current_stage(), Stage::Meta);
        assert!(pipeline.current_stage_result().is_none());
        assert_eq!(pipeline.run_state(), RunState::SelectingSource);
        assert!(pipeline.last_prompt().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_and_restore_resume_position() {
        let (pipeline, dir) = three_stage_pipeline(vec![meta_response(), roles_response()]);

        for _ in 0..2 {
            pipeline.run_current_stage().unwrap();
            pipeline.wait_until_settled().await;
            pipeline.advance().unwrap();
        }
        let snapshot_path = dir.path().join("run.json");
        pipeline.snapshot_to(&snapshot_path).unwrap();

        // A fresh pipeline over the same source resumes at the state stage.
        let resumed = Pipeline::builder("http://unused")
            .stages(vec![Stage::Meta, Stage::Roles, Stage::State])
            .gateway(Arc::new(MockGateway::fixed(state_response())))
            .build()
            .unwrap();
        resumed.select_source(write_rules(&dir)).unwrap();
        let restored = resumed.restore_from(&snapshot_path).unwrap();
        assert_eq!(restored, vec![Stage::Meta, Stage::Roles]);
        assert_eq!(resumed.current_stage(), Stage::State);

        resumed.run_current_stage().unwrap();
        resumed.wait_until_settled().await;
        assert!(resumed.all_stages_successful());
    }

    #[tokio::test]
    async fn test_preview_prompt_does_not_dispatch() {
        let (pipeline, _dir) = three_stage_pipeline(vec![meta_response()]);
        let preview = pipeline.preview_prompt().unwrap();
        assert!(preview.contains("You are extracting stage: meta."));
        assert_eq!(pipeline.run_state(), RunState::SelectingSource);
        assert!(pipeline.last_prompt().is_none());
    }

    #[tokio::test]
    async fn test_write_output(){
        let (pipeline, dir) = three_stage_pipeline(vec![
            meta_response(),
            roles_response(),
            state_response(),
        ]);
        loop {
            pipeline.run_current_stage().unwrap();
            pipeline.wait_until_settled().await;
            if pipeline.advance().unwrap().is_none() {
                break;
            }
        }
        let out = dir.path().join("config.json");
        pipeline.write_output(&out).unwrap();
        let written: crate::document::GameConfig =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written.name, "Auction");
        assert_eq!(pipeline.run_state(), RunState::Success);
    }
}
