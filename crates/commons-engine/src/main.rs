//! Engine binary for the Commons simulation.
//!
//! This is the main entry point that wires together configuration, the
//! scripted decision policies, the round orchestrator, and the JSON-lines
//! output writer, then plays every configured round.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `commons-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Load scripted policies from the `agents` section
//! 4. Create the environment (ledger accounts, history)
//! 5. Create the decision gateway
//! 6. Open the output files
//! 7. Run the simulation
//! 8. Log the result and flush output

mod error;
mod output;
mod policy;

use std::path::Path;

use commons_core::config::SimulationConfig;
use commons_core::gateway::DecisionGateway;
use commons_core::round::Environment;
use commons_core::runner;
use commons_types::AgentId;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::output::OutputWriter;
use crate::policy::{PolicyConfig, PolicyProvider};

const CONFIG_FILE: &str = "commons-config.yaml";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any initialization step or the simulation itself fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let (config, from_file) = load_config()?;

    // 2. Initialize structured logging. RUST_LOG wins over the config level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!("commons-engine starting");
    if !from_file {
        info!("Config file not found, using defaults");
    }
    info!(
        num_agents = config.game.num_agents,
        num_rounds = config.game.num_rounds,
        multiplier = %config.game.public_good_multiplier,
        endowment_mode = ?config.game.endowment_mode,
        reselection_interval = config.institutions.reselection_interval,
        decision_timeout_ms = config.gateway.decision_timeout_ms,
        "Configuration loaded"
    );

    // 3. Load scripted policies.
    let policy_config = load_policy_config()?;
    let provider = PolicyProvider::new(policy_config, config.game.seed)?;
    for agent in (0..config.game.num_agents).map(AgentId) {
        debug!(%agent, strategy = ?provider.strategy_for(agent), "Policy assigned");
    }
    info!(seed = config.game.seed, "Decision policies loaded");

    // 4. Create the environment.
    let gateway_config = config.gateway.clone();
    let output_config = config.output.clone();
    let mut env = Environment::new(config)?;
    info!(run_id = %env.run_id(), "Environment initialized");

    // 5. Create the decision gateway.
    let gateway = DecisionGateway::new(provider, &gateway_config);
    info!(
        parallelism = gateway_config.parallelism,
        history_window = gateway_config.history_window,
        anonymize_peers = gateway_config.anonymize_peers,
        "Decision gateway ready"
    );

    // 6. Open the output files.
    let mut writer = OutputWriter::create(&output_config)?;
    info!(
        path = %output_config.path,
        include_ledger = output_config.include_ledger,
        "Output writer opened"
    );

    // 7. Run the simulation.
    let outcome = runner::run_simulation(&mut env, &gateway, &mut writer).await;

    // 8. Log the result and flush output, even when the run failed.
    let records_written = writer.records_written();
    writer.finish()?;
    let result = outcome?;
    runner::log_simulation_end(&result);

    info!(
        end_reason = ?result.end_reason,
        rounds_committed = result.rounds_committed,
        records_written,
        "commons-engine shutdown complete"
    );

    Ok(())
}

/// Load the main simulation configuration from `commons-config.yaml`.
///
/// Looks for the config file relative to the current working directory.
/// The flag reports whether the file was found.
fn load_config() -> Result<(SimulationConfig, bool), EngineError> {
    let config_path = Path::new(CONFIG_FILE);
    if config_path.exists() {
        let config = SimulationConfig::from_file(config_path)?;
        Ok((config, true))
    } else {
        let mut config = SimulationConfig::default();
        config.game.apply_env_overrides()?;
        config.validate()?;
        Ok((config, false))
    }
}

/// Load policy configuration from `commons-config.yaml`.
///
/// Reads the `agents` section from the YAML config file. If the file
/// does not exist or lacks the `agents` key, defaults are used.
fn load_policy_config() -> Result<PolicyConfig, EngineError> {
    let config_path = Path::new(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(PolicyConfig::default());
    }
    let contents = std::fs::read_to_string(config_path).map_err(|e| EngineError::Policy {
        message: format!("failed to read config file: {e}"),
    })?;
    parse_policy_config(&contents)
}

/// Extract the `agents` section from a full config document.
fn parse_policy_config(contents: &str) -> Result<PolicyConfig, EngineError> {
    let raw: serde_yml::Value = serde_yml::from_str(contents).map_err(|e| EngineError::Policy {
        message: format!("failed to parse config YAML: {e}"),
    })?;

    raw.get("agents").map_or_else(
        || Ok(PolicyConfig::default()),
        |agents| {
            serde_yml::from_value(agents.clone()).map_err(|e| EngineError::Policy {
                message: format!("failed to parse agents config: {e}"),
            })
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::Strategy;

    #[test]
    fn policy_section_is_optional() {
        let config = parse_policy_config("game:\n  num_agents: 4\n").unwrap();
        assert_eq!(config, PolicyConfig::default());
    }

    #[test]
    fn policy_section_is_extracted() {
        let yaml = "game:\n  num_agents: 4\nagents:\n  default_strategy: random\n  assignments:\n    2: free_rider\n";
        let config = parse_policy_config(yaml).unwrap();
        assert_eq!(config.default_strategy, Strategy::Random);
        assert_eq!(config.assignments.get(&2), Some(&Strategy::FreeRider));
    }

    #[test]
    fn project_config_file_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join(CONFIG_FILE);
        if path.exists() {
            let contents = std::fs::read_to_string(&path).unwrap();
            let config = parse_policy_config(&contents);
            assert!(config.is_ok(), "Failed to parse agents section: {config:?}");
            assert!(config.unwrap().validate().is_ok());
        }
    }
}
