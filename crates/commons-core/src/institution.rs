//! Institution semantics: groups, public-good pooling, and sanctions.
//!
//! The two institutions form a closed set. [`Institution`] pairs an
//! [`InstitutionKind`] with the [`InstitutionRules`] of the run and exposes
//! the capability surface the orchestrator drives:
//!
//! - [`Institution::phases`] -- which decision phases run for members.
//! - [`Institution::apply_contribution_phase`] -- pool, multiply, divide.
//! - [`Institution::admit_sanctions`] -- target and budget validation.
//! - [`Institution::apply_sanction_phase`] -- sanction costs and effects
//!   (always empty for the sanction-free institution).
//!
//! All computation is over the complete set of decisions for a group, so
//! the processing order of same-phase decisions never changes the outcome.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use commons_types::{AgentId, Incident, InstitutionKind, PhaseKind, SanctionKind, SanctionRecord};

use crate::config::{RemainderPolicy, SanctionBudgetPolicy, SimulationConfig};

/// Errors raised while applying institution rules.
///
/// These indicate inputs the gateway should already have rejected.
#[derive(Debug, thiserror::Error)]
pub enum InstitutionError {
    /// A member's contribution was not supplied.
    #[error("no contribution recorded for agent {agent}")]
    MissingContribution {
        /// The member without a contribution.
        agent: AgentId,
    },

    /// A contribution exceeds the stage-1 endowment.
    #[error("contribution {amount} from agent {agent} exceeds maximum {max}")]
    ContributionOutOfRange {
        /// The contributing agent.
        agent: AgentId,
        /// The contribution.
        amount: u64,
        /// The stage-1 endowment.
        max: u64,
    },

    /// Token arithmetic left the integer range.
    #[error("arithmetic overflow computing {context}")]
    Overflow {
        /// What was being computed.
        context: &'static str,
    },
}

fn overflow(context: &'static str) -> InstitutionError {
    InstitutionError::Overflow { context }
}

// ---------------------------------------------------------------------------
// Rules and groups
// ---------------------------------------------------------------------------

/// Run-wide parameters shared by both institutions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstitutionRules {
    /// Multiplier applied to a group's total contribution.
    pub multiplier: Decimal,
    /// Stage-1 endowment (maximum contribution).
    pub endowment_stage_1: u64,
    /// Stage-2 endowment.
    pub endowment_stage_2: u64,
    /// Payoff reduction per punishment token.
    pub punishment_effect: u64,
    /// Payoff increase per reward token.
    pub reward_effect: u64,
    /// Optional cap on sanction spending.
    pub max_sanction_tokens: Option<u64>,
    /// Handling of sanctions over budget.
    pub budget_policy: SanctionBudgetPolicy,
    /// Allocation order for leftover pool tokens.
    pub remainder_policy: RemainderPolicy,
    /// Whether sanction-free members also receive the stage-2 endowment.
    pub sanction_free_stage2_endowment: bool,
}

impl InstitutionRules {
    /// Derive the rules from a loaded configuration.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            multiplier: config.game.public_good_multiplier,
            endowment_stage_1: config.game.endowment_stage_1,
            endowment_stage_2: config.game.endowment_stage_2,
            punishment_effect: config.institutions.punishment_effect.unsigned_abs(),
            reward_effect: config.institutions.reward_effect,
            max_sanction_tokens: config.institutions.max_sanction_tokens,
            budget_policy: config.institutions.sanction_budget_policy,
            remainder_policy: config.institutions.remainder_policy,
            sanction_free_stage2_endowment: config.institutions.sanction_free_stage2_endowment,
        }
    }

    /// Per-round sanction budget of an SI member.
    pub fn sanction_budget(&self) -> u64 {
        self.max_sanction_tokens
            .map_or(self.endowment_stage_2, |cap| cap.min(self.endowment_stage_2))
    }
}

/// The agents that chose one institution this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// The institution.
    pub institution: InstitutionKind,
    /// Members in ascending id order.
    pub members: Vec<AgentId>,
}

impl Group {
    /// Build one group per institution that has members, in
    /// [`InstitutionKind::ALL`] order. The groups partition the agents.
    pub fn partition(memberships: &BTreeMap<AgentId, InstitutionKind>) -> Vec<Self> {
        InstitutionKind::ALL
            .iter()
            .map(|kind| Self {
                institution: *kind,
                members: memberships
                    .iter()
                    .filter(|(_, k)| *k == kind)
                    .map(|(a, _)| *a)
                    .collect(),
            })
            .filter(|g| !g.members.is_empty())
            .collect()
    }

    /// Whether `agent` belongs to this group.
    pub fn contains(&self, agent: AgentId) -> bool {
        self.members.binary_search(&agent).is_ok()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of the contribution phase for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicGoodOutcome {
    /// Sum of member contributions.
    pub total: u64,
    /// Integer pool distributed (`total * multiplier`, truncated).
    pub pool: u64,
    /// Fractional part of `total * multiplier` not distributed.
    pub residue: Decimal,
    /// Equal share every member receives.
    pub base_share: u64,
    /// Tokens handed out one-by-one after the equal split.
    pub remainder: u64,
    /// Share per member; sums exactly to `pool`.
    pub shares: BTreeMap<AgentId, u64>,
}

impl PublicGoodOutcome {
    /// Share of one member (zero for non-members).
    pub fn share(&self, agent: AgentId) -> u64 {
        self.shares.get(&agent).copied().unwrap_or(0)
    }
}

/// One sanction that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanctionOrder {
    /// Sender, who pays `amount`.
    pub from: AgentId,
    /// Target.
    pub to: AgentId,
    /// Punish or reward.
    pub kind: SanctionKind,
    /// Tokens spent.
    pub amount: u64,
}

/// Sanctions kept after admission, plus what was corrected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    /// Sanctions to apply, in submission order.
    pub orders: Vec<SanctionOrder>,
    /// Dropped targets and budget corrections.
    pub incidents: Vec<Incident>,
}

/// Result of the sanction phase for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanctionOutcome {
    /// Tokens each sender spent.
    pub spend: BTreeMap<AgentId, u64>,
    /// Nominal punishment effect each target received.
    pub punishment: BTreeMap<AgentId, u64>,
    /// Reward effect each target received.
    pub reward: BTreeMap<AgentId, u64>,
    /// Every applied sanction.
    pub records: Vec<SanctionRecord>,
}

impl SanctionOutcome {
    /// Tokens `agent` spent.
    pub fn spend_of(&self, agent: AgentId) -> u64 {
        self.spend.get(&agent).copied().unwrap_or(0)
    }

    /// Punishment effect `agent` received.
    pub fn punishment_of(&self, agent: AgentId) -> u64 {
        self.punishment.get(&agent).copied().unwrap_or(0)
    }

    /// Reward effect `agent` received.
    pub fn reward_of(&self, agent: AgentId) -> u64 {
        self.reward.get(&agent).copied().unwrap_or(0)
    }

    /// `reward - punishment` for `agent`, or `None` on overflow.
    pub fn net_effect(&self, agent: AgentId) -> Option<i64> {
        i64::try_from(self.reward_of(agent))
            .ok()?
            .checked_sub(i64::try_from(self.punishment_of(agent)).ok()?)
    }

    /// Total tokens spent by all senders.
    pub fn total_spend(&self) -> Option<u64> {
        self.spend.values().try_fold(0_u64, |acc, v| acc.checked_add(*v))
    }
}

// ---------------------------------------------------------------------------
// Institution
// ---------------------------------------------------------------------------

const SI_PHASES: [PhaseKind; 2] = [PhaseKind::Contribution, PhaseKind::Sanctioning];
const SFI_PHASES: [PhaseKind; 1] = [PhaseKind::Contribution];

/// An institution bound to the rules of the run.
#[derive(Debug, Clone, Copy)]
pub struct Institution<'a> {
    kind: InstitutionKind,
    rules: &'a InstitutionRules,
}

impl<'a> Institution<'a> {
    /// Bind `kind` to `rules`.
    pub const fn new(kind: InstitutionKind, rules: &'a InstitutionRules) -> Self {
        Self { kind, rules }
    }

    /// Which institution this is.
    pub const fn kind(&self) -> InstitutionKind {
        self.kind
    }

    /// Decision phases members go through after institution choice.
    pub const fn phases(&self) -> &'static [PhaseKind] {
        match self.kind {
            InstitutionKind::Sanctioning => &SI_PHASES,
            InstitutionKind::SanctionFree => &SFI_PHASES,
        }
    }

    /// Whether members may punish and reward each other.
    pub const fn allows_sanctions(&self) -> bool {
        matches!(self.kind, InstitutionKind::Sanctioning)
    }

    /// Stage-2 tokens credited to each member (before funding mode).
    pub const fn stage2_endowment(&self) -> u64 {
        if self.allows_sanctions() || self.rules.sanction_free_stage2_endowment {
            self.rules.endowment_stage_2
        } else {
            0
        }
    }

    /// Pool the group's contributions, multiply, and divide across all
    /// members.
    ///
    /// The product is truncated to an integer pool and the fractional
    /// residue reported. The pool is split equally, truncating, and the
    /// leftover tokens go one each to members in the order given by the
    /// remainder policy.
    ///
    /// # Errors
    ///
    /// Returns [`InstitutionError`] if a member has no contribution, a
    /// contribution exceeds the stage-1 endowment, or arithmetic overflows.
    pub fn apply_contribution_phase(
        &self,
        group: &Group,
        contributions: &BTreeMap<AgentId, u64>,
        round: u32,
    ) -> Result<PublicGoodOutcome, InstitutionError> {
        let mut total: u64 = 0;
        for agent in &group.members {
            let amount = contributions
                .get(agent)
                .copied()
                .ok_or(InstitutionError::MissingContribution { agent: *agent })?;
            if amount > self.rules.endowment_stage_1 {
                return Err(InstitutionError::ContributionOutOfRange {
                    agent: *agent,
                    amount,
                    max: self.rules.endowment_stage_1,
                });
            }
            total = total
                .checked_add(amount)
                .ok_or_else(|| overflow("group total"))?;
        }

        let product = Decimal::from(total)
            .checked_mul(self.rules.multiplier)
            .ok_or_else(|| overflow("multiplied pool"))?;
        let truncated = product.trunc();
        let pool = truncated.to_u64().ok_or_else(|| overflow("integer pool"))?;
        let residue = product
            .checked_sub(truncated)
            .ok_or_else(|| overflow("pool residue"))?;

        let size = u64::try_from(group.len())
            .ok()
            .ok_or_else(|| overflow("group size"))?;
        let (base_share, remainder) = if size == 0 {
            (0, 0)
        } else {
            (
                pool.checked_div(size).ok_or_else(|| overflow("base share"))?,
                pool.checked_rem(size).ok_or_else(|| overflow("remainder"))?,
            )
        };

        let mut shares: BTreeMap<AgentId, u64> =
            group.members.iter().map(|a| (*a, base_share)).collect();

        let offset = match self.rules.remainder_policy {
            RemainderPolicy::AgentIdAscending => 0,
            RemainderPolicy::RotateByRound => {
                let steps = u64::from(round.saturating_sub(1));
                let offset = steps.checked_rem(size).unwrap_or(0);
                usize::try_from(offset)
                    .ok()
                    .ok_or_else(|| overflow("remainder offset"))?
            }
        };
        let extra = usize::try_from(remainder)
            .ok()
            .ok_or_else(|| overflow("remainder count"))?;
        for agent in group.members.iter().cycle().skip(offset).take(extra) {
            if let Some(share) = shares.get_mut(agent) {
                *share = share.checked_add(1).ok_or_else(|| overflow("share"))?;
            }
        }

        Ok(PublicGoodOutcome {
            total,
            pool,
            residue,
            base_share,
            remainder,
            shares,
        })
    }

    /// Validate one sender's sanctions against the group and the budget.
    ///
    /// Self-targets and targets outside the group are dropped with a
    /// [`Incident::Rejected`]. Spending is cumulative per sender: under
    /// [`SanctionBudgetPolicy::Clamp`] sanctions are clamped to the remaining
    /// budget in submission order, under
    /// [`SanctionBudgetPolicy::RejectDecision`] an over-budget decision is
    /// discarded entirely. Sanction-free groups admit nothing.
    pub fn admit_sanctions(
        &self,
        group: &Group,
        sender: AgentId,
        requested: &[SanctionOrder],
        budget: u64,
    ) -> Admission {
        let mut admission = Admission::default();
        if !self.allows_sanctions() || requested.is_empty() {
            return admission;
        }

        let mut valid: Vec<SanctionOrder> = Vec::with_capacity(requested.len());
        for order in requested {
            if order.to == sender {
                admission
                    .incidents
                    .push(rejected(sender, "self-targeted sanction dropped".to_owned()));
            } else if !group.contains(order.to) {
                admission.incidents.push(rejected(
                    sender,
                    format!("sanction target {} is not a group member", order.to),
                ));
            } else if order.amount > 0 {
                valid.push(SanctionOrder {
                    from: sender,
                    ..*order
                });
            }
        }

        match self.rules.budget_policy {
            SanctionBudgetPolicy::RejectDecision => {
                let requested_total = valid
                    .iter()
                    .try_fold(0_u64, |acc, o| acc.checked_add(o.amount));
                if requested_total.is_none_or(|t| t > budget) {
                    admission.incidents.push(rejected(
                        sender,
                        format!(
                            "sanctions totalling {} exceed budget {budget}",
                            requested_total.map_or_else(|| "overflow".to_owned(), |t| t.to_string())
                        ),
                    ));
                    return admission;
                }
                admission.orders = valid;
            }
            SanctionBudgetPolicy::Clamp => {
                let mut remaining = budget;
                for order in valid {
                    let applied = order.amount.min(remaining);
                    if applied < order.amount {
                        admission.incidents.push(Incident::Clamped {
                            agent: sender,
                            phase: PhaseKind::Sanctioning,
                            field: format!("sanction:{}", order.to),
                            requested: i64::try_from(order.amount).unwrap_or(i64::MAX),
                            applied,
                        });
                    }
                    remaining = remaining.saturating_sub(applied);
                    if applied > 0 {
                        admission.orders.push(SanctionOrder {
                            amount: applied,
                            ..order
                        });
                    }
                }
            }
        }
        admission
    }

    /// Compute sanction costs and effects for the whole group at once.
    ///
    /// Punishment effect is `punishment_effect * amount`, reward effect is
    /// `reward_effect * amount`, and the sender pays `amount`. Returns an
    /// empty outcome for the sanction-free institution.
    ///
    /// # Errors
    ///
    /// Returns [`InstitutionError::Overflow`] if a total overflows.
    pub fn apply_sanction_phase(
        &self,
        orders: &[SanctionOrder],
    ) -> Result<SanctionOutcome, InstitutionError> {
        let mut outcome = SanctionOutcome::default();
        if !self.allows_sanctions() {
            return Ok(outcome);
        }

        for order in orders {
            let spend = outcome.spend.entry(order.from).or_insert(0);
            *spend = spend
                .checked_add(order.amount)
                .ok_or_else(|| overflow("sanction spend"))?;

            let (per_token, totals) = match order.kind {
                SanctionKind::Punish => (self.rules.punishment_effect, &mut outcome.punishment),
                SanctionKind::Reward => (self.rules.reward_effect, &mut outcome.reward),
            };
            let effect = order
                .amount
                .checked_mul(per_token)
                .ok_or_else(|| overflow("sanction effect"))?;
            let received = totals.entry(order.to).or_insert(0);
            *received = received
                .checked_add(effect)
                .ok_or_else(|| overflow("sanction effect total"))?;

            outcome.records.push(SanctionRecord {
                from: order.from,
                to: order.to,
                kind: order.kind,
                amount: order.amount,
                effect,
            });
        }
        Ok(outcome)
    }
}

fn rejected(agent: AgentId, reason: String) -> Incident {
    Incident::Rejected {
        agent,
        phase: PhaseKind::Sanctioning,
        reason,
    }
}
