//! Round, payoff, and ledger records.
//!
//! Everything here is produced by the engine and consumed by history,
//! output writers, and external analysis. All token quantities are
//! integers; only group averages and the fractional pool residue use
//! [`Decimal`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::decisions::{DecisionRecord, Incident};
use crate::enums::{InstitutionKind, LedgerEntryType, RoundStatus, SanctionKind};
use crate::ids::{AgentId, LedgerEntryId, RunId};

// ---------------------------------------------------------------------------
// Payoffs
// ---------------------------------------------------------------------------

/// Per-agent payoff breakdown for one committed round.
///
/// The fields satisfy
///
/// ```text
/// final_delta = endowment_stage1 + endowment_stage2 - contributed
///             - sanction_cost_paid + public_good_return
///             + sanction_effect_received + floor_adjustment
/// ```
///
/// and `final_delta` equals the net of the agent's ledger entries for the
/// round. See [`PayoffRecord::identity_delta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PayoffRecord {
    /// The agent this record describes.
    pub agent: AgentId,
    /// Institution the agent belonged to this round.
    pub institution: InstitutionKind,
    /// Stage-1 tokens credited this round (zero when endowments are budgets only).
    pub endowment_stage1: u64,
    /// Stage-2 tokens credited this round (zero when not granted).
    pub endowment_stage2: u64,
    /// Tokens contributed to the group pool.
    pub contributed: u64,
    /// Stage-1 budget not contributed.
    pub kept: u64,
    /// This agent's share of the multiplied pool.
    pub public_good_return: u64,
    /// Tokens spent on punishments and rewards.
    pub sanction_cost_paid: u64,
    /// Nominal punishment effect received, before the balance floor.
    pub punishment_received: u64,
    /// Reward effect received.
    pub reward_received: u64,
    /// `reward_received - punishment_received`.
    pub sanction_effect_received: i64,
    /// Punishment tokens not applied because the balance hit zero.
    pub floor_adjustment: u64,
    /// Net balance change for the round.
    pub final_delta: i64,
    /// Balance after settlement.
    pub balance: u64,
}

impl PayoffRecord {
    /// Recompute the balance delta from the breakdown fields.
    ///
    /// Returns `None` on overflow. A consistent record has
    /// `identity_delta() == Some(final_delta)`.
    pub fn identity_delta(&self) -> Option<i64> {
        let credits = i64::try_from(self.endowment_stage1)
            .ok()?
            .checked_add(i64::try_from(self.endowment_stage2).ok()?)?
            .checked_add(i64::try_from(self.public_good_return).ok()?)?
            .checked_add(i64::try_from(self.floor_adjustment).ok()?)?
            .checked_add(self.sanction_effect_received)?;
        credits
            .checked_sub(i64::try_from(self.contributed).ok()?)?
            .checked_sub(i64::try_from(self.sanction_cost_paid).ok()?)
    }

    /// Net effect of the contribution stage: endowment kept plus pool share.
    pub fn stage1_payoff(&self) -> Option<i64> {
        i64::try_from(self.endowment_stage1)
            .ok()?
            .checked_add(i64::try_from(self.public_good_return).ok()?)?
            .checked_sub(i64::try_from(self.contributed).ok()?)
    }

    /// Net effect of the sanction stage. `stage1_payoff + stage2_payoff`
    /// equals `final_delta` for a consistent record.
    pub fn stage2_payoff(&self) -> Option<i64> {
        i64::try_from(self.endowment_stage2)
            .ok()?
            .checked_add(self.sanction_effect_received)?
            .checked_add(i64::try_from(self.floor_adjustment).ok()?)?
            .checked_sub(i64::try_from(self.sanction_cost_paid).ok()?)
    }
}

/// An agent's running total and place after a committed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Standing {
    /// The agent.
    pub agent: AgentId,
    /// Sum of `final_delta` over every committed round so far.
    pub cumulative_payoff: i64,
    /// One-based place by cumulative payoff, highest first. Ties keep
    /// ascending agent order.
    pub rank: u32,
    /// Number of agents ranked.
    pub out_of: u32,
}

/// What one agent sees of another agent's round, without its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PeerRoundEntry {
    /// Position among the viewer's peers, starting at 1.
    pub label: u32,
    /// Institution the peer belonged to.
    pub institution: InstitutionKind,
    /// Tokens the peer contributed.
    pub contribution: u64,
    /// Punishment effect the peer received.
    pub punishment_received: u64,
    /// Reward effect the peer received.
    pub reward_received: u64,
    /// Net effect of the contribution stage.
    pub stage1_payoff: i64,
    /// Net effect of the sanction stage.
    pub stage2_payoff: i64,
    /// Net balance change for the round.
    pub round_payoff: i64,
}

/// Every other agent's round, as seen by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PeerRound {
    /// The round described.
    pub round: u32,
    /// One entry per peer, in label order.
    pub peers: Vec<PeerRoundEntry>,
}

/// A sanction as it was applied during settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SanctionRecord {
    /// Sender, who pays `amount`.
    pub from: AgentId,
    /// Target, who receives `effect`.
    pub to: AgentId,
    /// Punish or reward.
    pub kind: SanctionKind,
    /// Tokens spent by the sender.
    pub amount: u64,
    /// Nominal effect on the target (amount times the configured effect).
    pub effect: u64,
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

/// Aggregates for one institution group in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GroupSummary {
    /// The institution.
    pub institution: InstitutionKind,
    /// Members in ascending id order.
    pub members: Vec<AgentId>,
    /// Sum of member contributions.
    pub total_contribution: u64,
    /// Mean contribution (zero for an empty group).
    #[ts(as = "String")]
    pub average_contribution: Decimal,
    /// Integer pool distributed back to members.
    pub pool: u64,
    /// Fractional part of `total_contribution * multiplier` not distributed.
    #[ts(as = "String")]
    pub residue: Decimal,
    /// Equal share every member received.
    pub base_share: u64,
    /// Tokens handed out one-by-one after the equal split.
    pub remainder: u64,
    /// Tokens members spent on sanctions.
    pub sanction_spend: u64,
    /// Mean `final_delta` across members (zero for an empty group).
    #[ts(as = "String")]
    pub average_payoff: Decimal,
}

/// The stored outcome of one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct RoundRecord {
    /// Run this round belongs to.
    pub run_id: RunId,
    /// One-based round index.
    pub round: u32,
    /// Whether the round was committed or aborted.
    pub status: RoundStatus,
    /// Whether institutions were (re)chosen this round.
    pub choice_round: bool,
    /// Whether any decision was replaced by a default.
    pub degraded: bool,
    /// Per-institution aggregates. Empty for aborted rounds.
    pub groups: Vec<GroupSummary>,
    /// Every decision as applied.
    pub decisions: Vec<DecisionRecord>,
    /// Per-agent payoffs in ascending agent order.
    pub payoffs: Vec<PayoffRecord>,
    /// Sanctions as applied.
    pub sanctions: Vec<SanctionRecord>,
    /// Clamps, rejections, and fallbacks observed during the round.
    pub incidents: Vec<Incident>,
    /// Cumulative payoff and rank per agent, in ascending agent order.
    pub standings: Vec<Standing>,
    /// Why the round was aborted, if it was.
    pub abort_reason: Option<String>,
}

impl RoundRecord {
    /// Payoff of one agent, if the round was committed.
    pub fn payoff(&self, agent: AgentId) -> Option<&PayoffRecord> {
        self.payoffs.iter().find(|p| p.agent == agent)
    }

    /// Standing of one agent after this round, if it was committed.
    pub fn standing(&self, agent: AgentId) -> Option<&Standing> {
        self.standings.iter().find(|s| s.agent == agent)
    }

    /// Group summary for one institution, if it had members.
    pub fn group(&self, institution: InstitutionKind) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.institution == institution)
    }
}

/// One output line: a single agent's view of one committed round.
///
/// The sequence of these records for a run is enough to rebuild every
/// agent's balance by replaying `payoff.final_delta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct OutputRecord {
    /// Run identifier.
    pub run_id: RunId,
    /// One-based round index.
    pub round: u32,
    /// The agent.
    pub agent: AgentId,
    /// Institution membership this round.
    pub institution: InstitutionKind,
    /// Tokens contributed.
    pub contribution: u64,
    /// Sanctions this agent issued.
    pub sanctions_sent: Vec<SanctionRecord>,
    /// Sanctions this agent received.
    pub sanctions_received: Vec<SanctionRecord>,
    /// Full payoff breakdown, including the resulting balance.
    pub payoff: PayoffRecord,
    /// Cumulative payoff and rank after this round.
    pub standing: Standing,
    /// Whether the round was degraded.
    pub degraded: bool,
    /// Incidents concerning this agent.
    pub incidents: Vec<Incident>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// A single append-only entry in the token ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct LedgerEntry {
    /// Unique entry identifier.
    pub id: LedgerEntryId,
    /// Round the entry was posted in (zero for the initial grant).
    pub round: u32,
    /// Account the entry moves.
    pub agent: AgentId,
    /// Entry category; determines the direction.
    pub entry_type: LedgerEntryType,
    /// Tokens moved. Always positive.
    pub amount: u64,
    /// Human-readable reason.
    pub reason: String,
    /// Wall-clock time of posting.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payoff() -> PayoffRecord {
        PayoffRecord {
            agent: AgentId(1),
            institution: InstitutionKind::Sanctioning,
            endowment_stage1: 20,
            endowment_stage2: 20,
            contributed: 20,
            kept: 0,
            public_good_return: 32,
            sanction_cost_paid: 5,
            punishment_received: 6,
            reward_received: 1,
            sanction_effect_received: -5,
            floor_adjustment: 0,
            final_delta: 42,
            balance: 1042,
        }
    }

    #[test]
    fn identity_matches_consistent_record() {
        let record = payoff();
        assert_eq!(record.identity_delta(), Some(record.final_delta));
    }

    #[test]
    fn identity_detects_drift() {
        let mut record = payoff();
        record.public_good_return = 31;
        assert_ne!(record.identity_delta(), Some(record.final_delta));
    }

    #[test]
    fn stage_payoffs_sum_to_final_delta() {
        let record = payoff();
        // 20 - 20 + 32 and 20 - 5 - 5
        assert_eq!(record.stage1_payoff(), Some(32));
        assert_eq!(record.stage2_payoff(), Some(10));
        let total = record
            .stage1_payoff()
            .zip(record.stage2_payoff())
            .and_then(|(a, b)| a.checked_add(b));
        assert_eq!(total, Some(record.final_delta));
    }

    #[test]
    fn round_record_lookups() {
        let record = RoundRecord {
            run_id: RunId::new(),
            round: 1,
            status: RoundStatus::Committed,
            choice_round: true,
            degraded: false,
            groups: Vec::new(),
            decisions: Vec::new(),
            payoffs: vec![payoff()],
            sanctions: Vec::new(),
            incidents: Vec::new(),
            standings: vec![Standing {
                agent: AgentId(1),
                cumulative_payoff: 42,
                rank: 1,
                out_of: 1,
            }],
            abort_reason: None,
        };
        assert!(record.payoff(AgentId(1)).is_some());
        assert!(record.payoff(AgentId(2)).is_none());
        assert_eq!(record.standing(AgentId(1)).map(|s| s.rank), Some(1));
        assert!(record.group(InstitutionKind::SanctionFree).is_none());
    }
}
