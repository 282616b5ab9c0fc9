//! Per-round reconciliation of ledger entries against computed payoffs.
//!
//! After settlement the orchestrator states what it believes happened in a
//! [`RoundExpectation`]. [`verify_round`] recomputes the same figures from
//! the round's ledger entries:
//!
//! ```text
//! for every agent A:  sum(credits to A) - sum(debits from A) == expected_delta(A)
//! sum(PublicGoodShare)                   == pool distributed
//! sum(SanctionSpend)                     == sanction spend
//! ```
//!
//! Any difference is a [`ReconciliationMismatch`], which is fatal for the run.

use std::collections::{BTreeMap, BTreeSet};

use commons_types::{AgentId, EntryDirection, LedgerEntry, LedgerEntryType};

use crate::ReconciliationMismatch;

/// What the orchestrator expects the ledger to show for one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundExpectation {
    /// The round being reconciled.
    pub round: u32,
    /// Net balance change per agent.
    pub per_agent_delta: BTreeMap<AgentId, i64>,
    /// Total integer pool distributed across all groups.
    pub pool_total: u64,
    /// Total tokens spent on sanctions.
    pub sanction_spend_total: u64,
}

/// The result of reconciling one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationResult {
    /// Ledger and payoffs agree.
    Balanced,
    /// Ledger and payoffs disagree.
    Mismatch(ReconciliationMismatch),
}

impl ReconciliationResult {
    /// Whether the round reconciled cleanly.
    pub const fn is_balanced(&self) -> bool {
        matches!(self, Self::Balanced)
    }
}

/// Reconcile the entries of `expected.round` in `entries`.
pub fn verify_round(expected: &RoundExpectation, entries: &[LedgerEntry]) -> ReconciliationResult {
    let round = expected.round;
    let mut actual: BTreeMap<AgentId, i64> = BTreeMap::new();
    let mut pool: u64 = 0;
    let mut spend: u64 = 0;

    for entry in entries.iter().filter(|e| e.round == round) {
        let Ok(amount) = i64::try_from(entry.amount) else {
            return overflow_mismatch(round, entry.agent);
        };
        let delta = actual.entry(entry.agent).or_insert(0);
        let next = match entry.entry_type.direction() {
            EntryDirection::Credit => delta.checked_add(amount),
            EntryDirection::Debit => delta.checked_sub(amount),
        };
        let Some(next) = next else {
            return overflow_mismatch(round, entry.agent);
        };
        *delta = next;

        let total = match entry.entry_type {
            LedgerEntryType::PublicGoodShare => &mut pool,
            LedgerEntryType::SanctionSpend => &mut spend,
            _ => continue,
        };
        let Some(next) = total.checked_add(entry.amount) else {
            return overflow_mismatch(round, entry.agent);
        };
        *total = next;
    }

    let agents: BTreeSet<AgentId> = actual
        .keys()
        .chain(expected.per_agent_delta.keys())
        .copied()
        .collect();

    let mut agent_deltas = BTreeMap::new();
    for agent in agents {
        let want = expected.per_agent_delta.get(&agent).copied().unwrap_or(0);
        let got = actual.get(&agent).copied().unwrap_or(0);
        if want != got {
            agent_deltas.insert(agent, (want, got));
        }
    }

    let pool_diff = (pool != expected.pool_total).then_some((expected.pool_total, pool));
    let spend_diff =
        (spend != expected.sanction_spend_total).then_some((expected.sanction_spend_total, spend));

    if agent_deltas.is_empty() && pool_diff.is_none() && spend_diff.is_none() {
        return ReconciliationResult::Balanced;
    }

    let count = agent_deltas.len();
    ReconciliationResult::Mismatch(ReconciliationMismatch {
        round,
        agent_deltas,
        pool: pool_diff,
        sanction_spend: spend_diff,
        message: format!(
            "ledger reconciliation failed for round {round}: {count} agent delta(s) differ, \
             pool {}, sanction spend {}",
            if pool_diff.is_some() { "differs" } else { "ok" },
            if spend_diff.is_some() { "differs" } else { "ok" },
        ),
    })
}

fn overflow_mismatch(round: u32, agent: AgentId) -> ReconciliationResult {
    ReconciliationResult::Mismatch(ReconciliationMismatch {
        round,
        agent_deltas: BTreeMap::new(),
        pool: None,
        sanction_spend: None,
        message: format!(
            "ledger reconciliation failed for round {round}: arithmetic overflow on agent {agent}"
        ),
    })
}
