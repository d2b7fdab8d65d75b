use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::stage::Stage;

/// Errors produced by the pipeline and its components.
///
/// Per-stage failures (transport, malformed responses, schema violations)
/// are caught on the background execution path and recorded as the stage's
/// error; they never escape as panics or unhandled errors. The variants here
/// surface through the synchronous entry points and accessors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The selected rules document does not exist.
    #[error("source document not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// An operation that needs a source document was called before
    /// `select_source`.
    #[error("no source document selected")]
    NoSource,

    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Gateway`](crate::gateway::Gateway) implementations when
    /// the provider returns a non-success status code. The `retry_after`
    /// field is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The model's response text could not be parsed as JSON. Carries a
    /// bounded excerpt of the offending text for diagnosis and retry prompts.
    #[error("response is not valid JSON: {reason}. Raw text (truncated): {excerpt}")]
    MalformedResponse { reason: String, excerpt: String },

    /// The parsed payload failed the stage's structural checks.
    #[error("stage '{stage}' payload rejected: {reason}")]
    SchemaViolation { stage: Stage, reason: String },

    /// `run_current_stage` was called while a run for this pipeline was
    /// still in flight.
    #[error("stage '{stage}' is already in flight")]
    StageInFlight { stage: Stage },

    /// `advance` was called before the current stage produced a validated
    /// result.
    #[error("stage '{stage}' has not produced a validated result")]
    StageIncomplete { stage: Stage },

    /// Assembly or output writing was requested before every configured
    /// stage succeeded.
    #[error("cannot assemble: stage '{stage}' has no validated result")]
    PrematureFinalization { stage: Stage },

    /// JSON serialization failed at the serde level.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure while reading or writing artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The in-flight run was superseded via `cancel`.
    #[error("run was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
