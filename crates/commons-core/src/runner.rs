//! Simulation runner.
//!
//! [`run_simulation`] drives [`Environment::run_round`] until every
//! configured round is committed, adding:
//!
//! - **Run timeout**: `run.run_timeout_ms` bounds the whole run; the round
//!   in progress when it expires is aborted, never partially committed.
//! - **Round callback**: a [`RoundCallback`] sees every committed round
//!   (output writers, progress logging).
//! - **Fatal errors**: a ledger or reconciliation failure aborts the round
//!   in progress and ends the run with an error.

use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use crate::gateway::{DecisionGateway, DecisionProvider};
use crate::round::{Environment, RoundError, RoundSummary};

/// Errors that end a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A round failed unrecoverably.
    #[error("round {round} failed: {source}")]
    Round {
        /// The round that failed.
        round: u32,
        /// The underlying round error.
        source: RoundError,
    },
}

/// Why a simulation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationEndReason {
    /// Every configured round was committed.
    Completed,
    /// The run-level timeout expired.
    RunTimeout,
}

/// Result of a simulation run.
#[derive(Debug)]
pub struct SimulationResult {
    /// The reason the simulation ended.
    pub end_reason: SimulationEndReason,
    /// The last round summary, if any round was committed.
    pub final_summary: Option<RoundSummary>,
    /// Number of committed rounds.
    pub rounds_committed: u32,
    /// Number of committed rounds flagged degraded.
    pub degraded_rounds: u32,
}

/// Callback invoked after each committed round.
///
/// Implementations can use this to write output records, report progress,
/// etc. The callback receives the round summary and the environment, whose
/// history ends with the committed round.
pub trait RoundCallback: Send {
    /// Called after a round commits.
    fn on_round(&mut self, summary: &RoundSummary, env: &Environment);
}

/// A no-op round callback for testing.
pub struct NoOpCallback;

impl RoundCallback for NoOpCallback {
    fn on_round(&mut self, _summary: &RoundSummary, _env: &Environment) {}
}

/// Run the simulation until every round is committed or the run times out.
///
/// # Errors
///
/// Returns [`RunnerError`] if a round fails unrecoverably. The failed round
/// is recorded as aborted in the environment's history first.
pub async fn run_simulation<P: DecisionProvider>(
    env: &mut Environment,
    gateway: &DecisionGateway<P>,
    callback: &mut dyn RoundCallback,
) -> Result<SimulationResult, RunnerError> {
    let run_timeout = env.config().run.run_timeout_ms.map(Duration::from_millis);
    let deadline = run_timeout.and_then(|t| Instant::now().checked_add(t));

    let mut final_summary: Option<RoundSummary> = None;
    let mut rounds_committed: u32 = 0;
    let mut degraded_rounds: u32 = 0;

    info!(
        run_id = %env.run_id(),
        num_rounds = env.config().game.num_rounds,
        run_timeout_ms = env.config().run.run_timeout_ms,
        "simulation starting"
    );

    while !env.is_finished() {
        let round = env.next_round();
        let outcome = match deadline {
            Some(deadline) => match timeout_at(deadline, env.run_round(gateway)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(round, "run timeout reached");
                    abort(env, round, "run timeout reached")?;
                    return Ok(SimulationResult {
                        end_reason: SimulationEndReason::RunTimeout,
                        final_summary,
                        rounds_committed,
                        degraded_rounds,
                    });
                }
            },
            None => env.run_round(gateway).await,
        };

        let summary = match outcome {
            Ok(summary) => summary,
            Err(source) => {
                error!(round, error = %source, "round failed, aborting run");
                abort(env, round, &source.to_string())?;
                return Err(RunnerError::Round { round, source });
            }
        };

        rounds_committed = rounds_committed.saturating_add(1);
        if summary.degraded {
            degraded_rounds = degraded_rounds.saturating_add(1);
        }
        callback.on_round(&summary, env);
        final_summary = Some(summary);
    }

    Ok(SimulationResult {
        end_reason: SimulationEndReason::Completed,
        final_summary,
        rounds_committed,
        degraded_rounds,
    })
}

fn abort(env: &mut Environment, round: u32, reason: &str) -> Result<(), RunnerError> {
    env.abort_round(reason)
        .map_err(|source| RunnerError::Round { round, source })
}

/// Log the simulation end sequence.
pub fn log_simulation_end(result: &SimulationResult) {
    info!(
        reason = ?result.end_reason,
        rounds_committed = result.rounds_committed,
        degraded_rounds = result.degraded_rounds,
        final_round = result.final_summary.as_ref().map(|s| s.round),
        "simulation ended"
    );

    if let Some(ref summary) = result.final_summary {
        for group in &summary.groups {
            info!(
                round = summary.round,
                institution = %group.institution,
                members = group.members.len(),
                average_contribution = %group.average_contribution,
                average_payoff = %group.average_payoff,
                "final round group"
            );
        }
        info!(
            round = summary.round,
            total_supply = summary.total_supply,
            "final token supply"
        );
    } else {
        warn!("simulation ended with no rounds committed");
    }
}
