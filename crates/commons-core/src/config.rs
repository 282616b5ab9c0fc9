//! Configuration loading and typed config structures for the Commons engine.
//!
//! The canonical configuration lives in `commons-config.yaml` at the project
//! root. Every section and field has a default matching the classic
//! sanctioning-institution experiment (7 agents, 15 rounds, multiplier 1.6),
//! so an empty file is a valid configuration.

use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use commons_types::InstitutionKind;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is outside its allowed range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How per-round endowments are funded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndowmentMode {
    /// Endowments are credited every round; contributions and sanction
    /// spending are paid out of them.
    #[default]
    Granted,
    /// Endowments are spending limits only; contributions and sanction
    /// spending come out of the existing balance.
    FromBalance,
}

/// What happens when an agent's sanctions exceed its budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionBudgetPolicy {
    /// Clamp sanctions to the remaining budget in submission order.
    ///
    /// Parsed text replies submit every punishment before any reward, each
    /// kind in ascending target order, whatever order the reply listed them
    /// in. Typed replies keep the provider's own order.
    #[default]
    Clamp,
    /// Discard the agent's whole sanction decision for the round.
    RejectDecision,
}

/// Order in which leftover pool tokens are handed out after the equal split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// One token each to the lowest agent ids.
    #[default]
    AgentIdAscending,
    /// Like `AgentIdAscending`, starting at offset `(round - 1) mod group_size`.
    RotateByRound,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level simulation configuration.
///
/// Mirrors the structure of `commons-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SimulationConfig {
    /// Population, rounds, and token economics.
    #[serde(default)]
    pub game: GameConfig,

    /// Institution rules.
    #[serde(default)]
    pub institutions: InstitutionConfig,

    /// Decision gateway behavior.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Run-level limits.
    #[serde(default)]
    pub run: RunConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Output record destination.
    #[serde(default)]
    pub output: OutputConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `COMMONS_NUM_AGENTS` overrides `game.num_agents`
    /// - `COMMONS_NUM_ROUNDS` overrides `game.num_rounds`
    /// - `COMMONS_ALPHA` overrides `game.public_good_multiplier`
    ///
    /// The result is validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.game.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game.num_agents == 0 {
            return Err(invalid("game.num_agents", "must be at least 1"));
        }
        if self.game.num_rounds == 0 {
            return Err(invalid("game.num_rounds", "must be at least 1"));
        }
        if self.game.public_good_multiplier.is_sign_negative() {
            return Err(invalid(
                "game.public_good_multiplier",
                format!("must not be negative, got {}", self.game.public_good_multiplier),
            ));
        }
        if self.gateway.parallelism == 0 {
            return Err(invalid("gateway.parallelism", "must be at least 1"));
        }
        if self.gateway.decision_timeout_ms == 0 {
            return Err(invalid("gateway.decision_timeout_ms", "must be at least 1"));
        }
        if self.run.run_timeout_ms == Some(0) {
            return Err(invalid("run.run_timeout_ms", "must be at least 1 when set"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Population, rounds, and token economics.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameConfig {
    /// Number of agents in the run.
    #[serde(default = "default_num_agents")]
    pub num_agents: u32,

    /// Number of rounds to play.
    #[serde(default = "default_num_rounds")]
    pub num_rounds: u32,

    /// Seed for scripted policies that draw random numbers.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Tokens each agent holds when the run starts.
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: u64,

    /// Stage-1 (contribution) endowment per round.
    #[serde(default = "default_endowment")]
    pub endowment_stage_1: u64,

    /// Stage-2 (sanctioning) endowment per round.
    #[serde(default = "default_endowment")]
    pub endowment_stage_2: u64,

    /// Multiplier applied to each group's total contribution (alpha).
    #[serde(default = "default_multiplier")]
    pub public_good_multiplier: Decimal,

    /// How endowments are funded.
    #[serde(default)]
    pub endowment_mode: EndowmentMode,
}

impl GameConfig {
    /// Override population and multiplier with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but unparseable.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("COMMONS_NUM_AGENTS") {
            self.num_agents = val
                .trim()
                .parse()
                .map_err(|e| invalid("COMMONS_NUM_AGENTS", format!("{e}")))?;
        }
        if let Ok(val) = std::env::var("COMMONS_NUM_ROUNDS") {
            self.num_rounds = val
                .trim()
                .parse()
                .map_err(|e| invalid("COMMONS_NUM_ROUNDS", format!("{e}")))?;
        }
        if let Ok(val) = std::env::var("COMMONS_ALPHA") {
            self.public_good_multiplier = Decimal::from_str(val.trim())
                .map_err(|e| invalid("COMMONS_ALPHA", format!("{e}")))?;
        }
        Ok(())
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            num_agents: default_num_agents(),
            num_rounds: default_num_rounds(),
            seed: default_seed(),
            initial_tokens: default_initial_tokens(),
            endowment_stage_1: default_endowment(),
            endowment_stage_2: default_endowment(),
            public_good_multiplier: default_multiplier(),
            endowment_mode: EndowmentMode::default(),
        }
    }
}

/// Institution rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstitutionConfig {
    /// Payoff change per punishment token. Only the magnitude is used.
    #[serde(default = "default_punishment_effect")]
    pub punishment_effect: i64,

    /// Payoff change per reward token.
    #[serde(default = "default_reward_effect")]
    pub reward_effect: u64,

    /// Institutions are re-chosen every this many rounds. Zero means only
    /// in round 1.
    #[serde(default = "default_reselection_interval")]
    pub reselection_interval: u32,

    /// Optional cap on sanction spending below the stage-2 endowment.
    #[serde(default)]
    pub max_sanction_tokens: Option<u64>,

    /// Handling of sanctions over budget.
    #[serde(default)]
    pub sanction_budget_policy: SanctionBudgetPolicy,

    /// Allocation order for leftover pool tokens.
    #[serde(default)]
    pub remainder_policy: RemainderPolicy,

    /// Also pay the stage-2 endowment to sanction-free members.
    #[serde(default)]
    pub sanction_free_stage2_endowment: bool,
}

impl Default for InstitutionConfig {
    fn default() -> Self {
        Self {
            punishment_effect: default_punishment_effect(),
            reward_effect: default_reward_effect(),
            reselection_interval: default_reselection_interval(),
            max_sanction_tokens: None,
            sanction_budget_policy: SanctionBudgetPolicy::default(),
            remainder_policy: RemainderPolicy::default(),
            sanction_free_stage2_endowment: false,
        }
    }
}

/// Decision gateway behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayConfig {
    /// Milliseconds a provider has to answer one request.
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,

    /// Maximum concurrent provider requests within a phase.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Past rounds included in each agent's decision context.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Institution substituted when a provider fails.
    #[serde(default = "default_institution")]
    pub default_institution: InstitutionKind,

    /// Contribution substituted when a provider fails.
    #[serde(default)]
    pub default_contribution: u64,

    /// Show group members as `1..=n` instead of their ids. Sanction targets
    /// in replies are then read as these labels.
    #[serde(default)]
    pub anonymize_peers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            decision_timeout_ms: default_decision_timeout_ms(),
            parallelism: default_parallelism(),
            history_window: default_history_window(),
            default_institution: default_institution(),
            default_contribution: 0,
            anonymize_peers: false,
        }
    }
}

/// Run-level limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunConfig {
    /// Wall-clock budget for the whole run. The round in progress when it
    /// expires is aborted.
    #[serde(default)]
    pub run_timeout_ms: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Output record destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputConfig {
    /// Path of the JSON-lines file receiving one record per agent per round.
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Also write the full ledger log next to the output file.
    #[serde(default)]
    pub include_ledger: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            include_ledger: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const fn default_num_agents() -> u32 {
    7
}

const fn default_num_rounds() -> u32 {
    15
}

const fn default_seed() -> u64 {
    42
}

const fn default_initial_tokens() -> u64 {
    1000
}

const fn default_endowment() -> u64 {
    20
}

fn default_multiplier() -> Decimal {
    Decimal::new(16, 1)
}

const fn default_punishment_effect() -> i64 {
    -3
}

const fn default_reward_effect() -> u64 {
    1
}

const fn default_reselection_interval() -> u32 {
    1
}

const fn default_decision_timeout_ms() -> u64 {
    30_000
}

const fn default_parallelism() -> usize {
    8
}

const fn default_history_window() -> usize {
    5
}

const fn default_institution() -> InstitutionKind {
    InstitutionKind::SanctionFree
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_output_path() -> String {
    "output/commons-rounds.jsonl".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_classic_experiment() {
        let config = SimulationConfig::default();
        assert_eq!(config.game.num_agents, 7);
        assert_eq!(config.game.num_rounds, 15);
        assert_eq!(config.game.initial_tokens, 1000);
        assert_eq!(config.game.endowment_stage_1, 20);
        assert_eq!(config.game.public_good_multiplier, Decimal::new(16, 1));
        assert_eq!(config.institutions.punishment_effect, -3);
        assert_eq!(config.gateway.default_institution, InstitutionKind::SanctionFree);
        assert_eq!(config.gateway.history_window, 5);
        assert!(!config.gateway.anonymize_peers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
game:
  num_agents: 4
  num_rounds: 3
  seed: 9
  initial_tokens: 500
  endowment_stage_1: 10
  endowment_stage_2: 5
  public_good_multiplier: 2.5
  endowment_mode: from_balance

institutions:
  punishment_effect: -2
  reward_effect: 2
  reselection_interval: 3
  max_sanction_tokens: 4
  sanction_budget_policy: reject_decision
  remainder_policy: rotate_by_round
  sanction_free_stage2_endowment: true

gateway:
  decision_timeout_ms: 1500
  parallelism: 2
  history_window: 3
  default_institution: SI
  default_contribution: 5
  anonymize_peers: true

run:
  run_timeout_ms: 60000

logging:
  level: debug
  json: true

output:
  path: "out.jsonl"
  include_ledger: true
"#;
        let config = SimulationConfig::parse(yaml).unwrap();
        assert_eq!(config.game.num_agents, 4);
        assert_eq!(config.game.public_good_multiplier, Decimal::new(25, 1));
        assert_eq!(config.game.endowment_mode, EndowmentMode::FromBalance);
        assert_eq!(config.institutions.max_sanction_tokens, Some(4));
        assert_eq!(
            config.institutions.sanction_budget_policy,
            SanctionBudgetPolicy::RejectDecision
        );
        assert_eq!(
            config.institutions.remainder_policy,
            RemainderPolicy::RotateByRound
        );
        assert_eq!(config.gateway.default_institution, InstitutionKind::Sanctioning);
        assert!(config.gateway.anonymize_peers);
        assert_eq!(config.run.run_timeout_ms, Some(60_000));
        assert!(config.logging.json);
        assert_eq!(config.output.path, "out.jsonl");
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = SimulationConfig::parse("game:\n  num_rounds: 2\n").unwrap();
        assert_eq!(config.game.num_rounds, 2);
        assert_eq!(config.game.num_agents, 7);
        assert_eq!(config.gateway.parallelism, 8);
    }

    #[test]
    fn parse_empty_yaml() {
        assert!(SimulationConfig::parse("").is_ok());
    }

    #[test]
    fn rejects_negative_multiplier() {
        let result = SimulationConfig::parse("game:\n  public_good_multiplier: -1.0\n");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "game.public_good_multiplier",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_parallelism() {
        let result = SimulationConfig::parse("gateway:\n  parallelism: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let result = SimulationConfig::parse("game: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("commons-config.yaml");
        if path.exists() {
            let config = SimulationConfig::from_file(&path);
            assert!(config.is_ok(), "Failed to load project config: {config:?}");
        }
    }
}
