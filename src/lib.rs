//! # Gamespec Pipeline
//!
//! Staged LLM extraction of structured game specifications from
//! natural-language rules text.
//!
//! A [`Pipeline`] drives a model through an ordered sequence of extraction
//! stages. Each stage renders its own prompt (embedding the outputs of
//! earlier stages it depends on), dispatches it to the model on a background
//! task, parses the response defensively, and validates it against the
//! stage's schema into a typed payload. Failed stages record a precise error
//! and can be retried with a prompt that embeds the previous response, the
//! error, and optional human feedback. Once every stage succeeded, the
//! [`assembler`] merges the per-stage fragments into one [`GameConfig`],
//! resolving human-readable role references to stable numeric identifiers.
//!
//! ## Core Concepts
//!
//! - **[`Stage`]** — one unit of extraction with its own prompt template,
//!   validator, and result slot.
//! - **[`Pipeline`]** — the state machine: cursor, per-stage results/errors,
//!   and the run lifecycle ([`RunState`]).
//! - **[`Gateway`]** — object-safe trait over completion providers;
//!   [`ChatGateway`] for OpenAI-compatible APIs, [`MockGateway`] for tests.
//! - **[`StagePayload`]** — tagged, typed per-stage results produced by the
//!   schema validator.
//! - **[`GameConfig`]** — the final merged document, the stable contract
//!   with the downstream game runner.
//!
//! ## Quick Start
//!
//! ```no_run
//! use gamespec_pipeline::{Pipeline, Stage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder("https://api.openai.com")
//!         .model("gpt-4o-mini")
//!         .stages(vec![Stage::Meta, Stage::Roles, Stage::State])
//!         .build()?;
//!
//!     pipeline.select_source("rules/auction.txt")?;
//!     loop {
//!         let stage = pipeline.run_current_stage()?;
//!         pipeline.wait_until_settled().await;
//!         if let Some(error) = pipeline.current_stage_error() {
//!             eprintln!("stage {stage} failed: {error}");
//!             pipeline.retry_with_feedback(None)?;
//!             pipeline.wait_until_settled().await;
//!         }
//!         if pipeline.advance()?.is_none() {
//!             break;
//!         }
//!     }
//!     let config = pipeline.assemble()?;
//!     println!("{}", config.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod assembler;
pub mod document;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod parsing;
pub mod payload;
pub mod pipeline;
pub mod prompt;
pub mod schema;
pub mod snapshot;
pub mod stage;

pub use assembler::CrossReferenceTable;
pub use document::GameConfig;
pub use error::{PipelineError, Result};
pub use gateway::{BackoffConfig, ChatGateway, Gateway, MockGateway};
pub use payload::StagePayload;
pub use pipeline::{Pipeline, PipelineBuilder, SourceDocument};
pub use stage::{RunState, Stage};
