//! Append-only round history and output-record replay.
//!
//! [`RoundHistory`] stores one [`RoundRecord`] per round in strictly
//! increasing order. It serves the decision contexts (an agent's own recent
//! rounds, its peers' rounds without their identities, the previous round's
//! aggregates, the agent's standing) and the output writer.

use std::collections::BTreeMap;

use commons_types::{
    AgentId, GroupSummary, InstitutionKind, OutputRecord, PeerRound, PeerRoundEntry, RoundRecord,
    RoundStatus, RunId, Standing,
};

/// Errors raised by the history store.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// A round was appended out of sequence.
    #[error("round {got} appended out of order (expected round {expected})")]
    OutOfOrder {
        /// The next round the history accepts.
        expected: u32,
        /// The round that was offered.
        got: u32,
    },

    /// A round from another run was appended.
    #[error("round {round} belongs to run {got}, history is for run {expected}")]
    RunMismatch {
        /// The round that was offered.
        round: u32,
        /// This history's run.
        expected: RunId,
        /// The offered record's run.
        got: RunId,
    },

    /// Replaying output records did not reproduce a recorded balance.
    #[error(
        "replay of agent {agent} diverged at round {round}: recorded {recorded}, replayed {replayed}"
    )]
    ReplayMismatch {
        /// The round where replay diverged.
        round: u32,
        /// The agent whose balance diverged.
        agent: AgentId,
        /// Balance stored in the output record.
        recorded: u64,
        /// Balance obtained by replay.
        replayed: u64,
    },

    /// A replayed balance left the integer range.
    #[error("replay of agent {agent} overflowed at round {round}")]
    ReplayOverflow {
        /// The round being replayed.
        round: u32,
        /// The agent being replayed.
        agent: AgentId,
    },
}

/// Ordered record of every round played in one run.
#[derive(Debug, Clone)]
pub struct RoundHistory {
    run_id: RunId,
    rounds: Vec<RoundRecord>,
}

impl RoundHistory {
    /// Create an empty history for a run.
    pub const fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            rounds: Vec::new(),
        }
    }

    /// The run this history belongs to.
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Append the next round.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] if the record is not the next round of this
    /// run.
    pub fn append(&mut self, record: RoundRecord) -> Result<(), HistoryError> {
        if record.run_id != self.run_id {
            return Err(HistoryError::RunMismatch {
                round: record.round,
                expected: self.run_id,
                got: record.run_id,
            });
        }
        let expected = self
            .rounds
            .last()
            .map_or(1, |last| last.round.saturating_add(1));
        if record.round != expected {
            return Err(HistoryError::OutOfOrder {
                expected,
                got: record.round,
            });
        }
        self.rounds.push(record);
        Ok(())
    }

    /// Every stored round, oldest first.
    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    /// The most recent round, committed or aborted.
    pub fn last(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// Number of stored rounds.
    pub const fn len(&self) -> usize {
        self.rounds.len()
    }

    /// Whether no round has been stored.
    pub const fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    fn last_committed(&self) -> Option<&RoundRecord> {
        self.rounds
            .iter()
            .rev()
            .find(|r| r.status == RoundStatus::Committed)
    }

    /// The agent's own output records from the last `window` committed
    /// rounds, oldest first.
    pub fn agent_history(&self, agent: AgentId, window: usize) -> Vec<OutputRecord> {
        let mut recent: Vec<OutputRecord> = self
            .rounds
            .iter()
            .rev()
            .filter(|r| r.status == RoundStatus::Committed)
            .take(window)
            .filter_map(|r| output_record(r, agent))
            .collect();
        recent.reverse();
        recent
    }

    /// Every other agent's last `window` committed rounds, oldest first.
    ///
    /// Peers are labelled `1..` in ascending id order within each round,
    /// so labels carry no identity across the decision boundary.
    pub fn peer_history(&self, agent: AgentId, window: usize) -> Vec<PeerRound> {
        let mut recent: Vec<PeerRound> = self
            .rounds
            .iter()
            .rev()
            .filter(|r| r.status == RoundStatus::Committed)
            .take(window)
            .map(|r| PeerRound {
                round: r.round,
                peers: r
                    .payoffs
                    .iter()
                    .filter(|p| p.agent != agent)
                    .zip(1_u32..)
                    .filter_map(|(p, label)| {
                        Some(PeerRoundEntry {
                            label,
                            institution: p.institution,
                            contribution: p.contributed,
                            punishment_received: p.punishment_received,
                            reward_received: p.reward_received,
                            stage1_payoff: p.stage1_payoff()?,
                            stage2_payoff: p.stage2_payoff()?,
                            round_payoff: p.final_delta,
                        })
                    })
                    .collect(),
            })
            .collect();
        recent.reverse();
        recent
    }

    /// The agent's standing after the last committed round.
    pub fn last_standing(&self, agent: AgentId) -> Option<Standing> {
        self.last_committed()
            .and_then(|r| r.standing(agent))
            .copied()
    }

    /// Per-institution aggregates of the last committed round.
    pub fn last_aggregates(&self) -> Vec<GroupSummary> {
        self.last_committed()
            .map(|r| r.groups.clone())
            .unwrap_or_default()
    }

    /// Institution membership in the last committed round.
    pub fn last_membership(&self) -> BTreeMap<AgentId, InstitutionKind> {
        self.last_committed()
            .map(|r| r.payoffs.iter().map(|p| (p.agent, p.institution)).collect())
            .unwrap_or_default()
    }

    /// Output records for every committed round, in round then agent order.
    pub fn output_records(&self) -> Vec<OutputRecord> {
        self.rounds.iter().flat_map(output_records).collect()
    }
}

/// One output record per agent of a committed round. Aborted rounds
/// produce none.
pub fn output_records(record: &RoundRecord) -> Vec<OutputRecord> {
    if record.status != RoundStatus::Committed {
        return Vec::new();
    }
    record
        .payoffs
        .iter()
        .filter_map(|p| output_record(record, p.agent))
        .collect()
}

fn output_record(record: &RoundRecord, agent: AgentId) -> Option<OutputRecord> {
    let payoff = record.payoff(agent)?;
    Some(OutputRecord {
        run_id: record.run_id,
        round: record.round,
        agent,
        institution: payoff.institution,
        contribution: payoff.contributed,
        sanctions_sent: record
            .sanctions
            .iter()
            .filter(|s| s.from == agent)
            .cloned()
            .collect(),
        sanctions_received: record
            .sanctions
            .iter()
            .filter(|s| s.to == agent)
            .cloned()
            .collect(),
        payoff: payoff.clone(),
        standing: *record.standing(agent)?,
        degraded: record.degraded,
        incidents: record
            .incidents
            .iter()
            .filter(|i| i.agent() == agent)
            .cloned()
            .collect(),
    })
}

/// Rebuild every agent's balance from output records alone.
///
/// Each agent starts at `initial_tokens` and `payoff.final_delta` is applied
/// in record order. Every intermediate balance is checked against the one
/// the record stores.
///
/// # Errors
///
/// Returns [`HistoryError::ReplayMismatch`] if a replayed balance differs
/// from the recorded one, or [`HistoryError::ReplayOverflow`] on overflow.
pub fn replay_balances(
    initial_tokens: u64,
    records: &[OutputRecord],
) -> Result<BTreeMap<AgentId, u64>, HistoryError> {
    let mut balances: BTreeMap<AgentId, u64> = BTreeMap::new();
    for record in records {
        let balance = balances.entry(record.agent).or_insert(initial_tokens);
        let replayed = balance
            .checked_add_signed(record.payoff.final_delta)
            .ok_or(HistoryError::ReplayOverflow {
                round: record.round,
                agent: record.agent,
            })?;
        if replayed != record.payoff.balance {
            return Err(HistoryError::ReplayMismatch {
                round: record.round,
                agent: record.agent,
                recorded: record.payoff.balance,
                replayed,
            });
        }
        *balance = replayed;
    }
    Ok(balances)
}
