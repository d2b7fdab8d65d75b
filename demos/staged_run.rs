//! Full staged run against the mock gateway.
//!
//! Runs every stage over a small rules document with canned model
//! responses, retrying once on failure, then prints the assembled
//! configuration document.
//!
//! ```bash
//! cargo run --example staged_run
//! ```

use std::io::Write;
use std::sync::Arc;

use gamespec_pipeline::{MockGateway, Pipeline};

const RULES: &str = "\
The Haggle Game. Two players, a Buyer and a Seller, trade one good.
In the Bid phase the Buyer submits a bid and the Seller sets an asking
price. Trade happens when the bid meets the ask.";

fn canned_responses() -> Vec<String> {
    vec![
        // meta
        r#"{"meta": {"name": "The Haggle Game",
            "description": "Two players trade one good through a single bid phase.",
            "prompt_partials": []}}"#
            .into(),
        // roles
        r#"{
            "roles": [
                {"raw_id": "Buyer", "name": "Buyer", "llm_type": "cannot infer",
                 "llm_params": {}, "task_phases": [1], "task_phases_excluded": []},
                {"raw_id": "Seller", "name": "Seller", "llm_type": "cannot infer",
                 "llm_params": {}, "task_phases": [1], "task_phases_excluded": []}
            ],
            "phases": [
                {"phase": "Bid", "phase_number": 1, "actionable": true,
                 "role_tasks": {"Buyer": ["submit bid"], "Seller": ["set asking price"]}}
            ]
        }"#
        .into(),
        // state
        r#"{"state": {
            "meta_information": [{"name": "round", "type": "int", "default": 0}],
            "private_information": [
                {"name": "valuation", "type": "int", "default": "cannot infer"}],
            "public_information": [{"name": "last_bid", "type": "int", "default": null}]
        }}"#
        .into(),
        // prompts (exactly the expected closed set)
        r#"[
            {"name": "game_description", "content": "Two players trade one good."},
            {"name": "game_information", "content": "Bids and asks are integers."},
            {"name": "game_history", "content": "cannot infer"},
            {"name": "system_buyer_1", "content": "You are the Buyer."},
            {"name": "user_buyer_1", "content": "Submit your bid."},
            {"name": "system_seller_1", "content": "You are the Seller."},
            {"name": "user_seller_1", "content": "Set your asking price."}
        ]"#
        .into(),
        // role prompts
        r#"[
            {"role": "Buyer", "phase": 0, "kind": "system", "text": "Play to maximize surplus."},
            {"role": "Buyer", "phase": 1, "kind": "user", "text": "Bid now."},
            {"role": "Seller", "phase": 1, "kind": "user", "text": "Price now."}
        ]"#
        .into(),
        // agents
        r#"[{"id": 1, "role": "Buyer"}, {"id": 2, "role": "Seller"}]"#.into(),
        // manager
        r#"{"manager": {"type": "TurnBasedPhaseManager", "event_handlers": []}}"#.into(),
        // runner
        r#"{"runner": {"type": "GameRunner", "protocol": "ws", "hostname": "localhost",
            "path": "wss", "port": 8765, "game_id": 1,
            "phase_transition_event": "phase-transition", "phase_identifier_key": "phase",
            "min_action_delay": 5, "max_action_delay": 10}}"#
            .into(),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let rules_path = dir.path().join("haggle.txt");
    std::fs::File::create(&rules_path)?.write_all(RULES.as_bytes())?;

    let pipeline = Pipeline::builder("http://unused")
        .gateway(Arc::new(MockGateway::new(canned_responses())))
        .build()?;

    pipeline.select_source(&rules_path)?;

    loop {
        let stage = pipeline.run_current_stage()?;
        pipeline.wait_until_settled().await;
        if let Some(error) = pipeline.current_stage_error() {
            eprintln!("stage {stage} failed: {error}; retrying");
            pipeline.retry_with_feedback(Some("Follow the JSON schema exactly."))?;
            pipeline.wait_until_settled().await;
        }
        println!("stage {stage}: ok");
        if pipeline.advance()?.is_none() {
            break;
        }
    }

    let config = pipeline.assemble()?;
    println!("{}", config.to_json()?);
    Ok(())
}
