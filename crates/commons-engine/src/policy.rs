//! Scripted decision policies.
//!
//! [`PolicyProvider`] answers every decision request from a fixed
//! per-agent [`Strategy`]. It stands in for language-model or human
//! providers so runs are reproducible: the only randomness comes from a
//! [`StdRng`] seeded by the run seed, the agent, the round, and the phase.

use std::collections::BTreeMap;

use commons_core::gateway::{
    DecisionContext, DecisionProvider, DecisionRequest, LegalRange, ProviderError,
};
use commons_types::{
    AgentId, InstitutionKind, PhaseKind, ProviderDecision, ProviderResponse, SanctionIntent,
    SanctionKind,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;

use crate::error::EngineError;

// -----------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------

/// Behavior of one scripted agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Joins SI, contributes everything, rewards full contributors.
    FullCooperator,
    /// Joins SFI, contributes nothing, never sanctions.
    FreeRider,
    /// Follows the group: cooperates while the group does, punishes
    /// peers who fall short of its own contribution.
    #[default]
    ConditionalCooperator,
    /// Uniformly random choices.
    Random,
}

/// Scripted policy configuration, loaded from the `agents` section of
/// `commons-config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyConfig {
    /// Strategy for agents without an explicit assignment.
    #[serde(default)]
    pub default_strategy: Strategy,

    /// Share of the stage-1 endowment the group must average for a
    /// conditional cooperator to contribute fully.
    #[serde(default = "default_threshold_cooperation")]
    pub threshold_cooperation: Decimal,

    /// Shortfall, as a share of its own contribution, a conditional
    /// cooperator tolerates before punishing.
    #[serde(default = "default_punishment_tolerance")]
    pub punishment_tolerance: Decimal,

    /// Per-agent strategy overrides keyed by agent id.
    #[serde(default)]
    pub assignments: BTreeMap<u32, Strategy>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::default(),
            threshold_cooperation: default_threshold_cooperation(),
            punishment_tolerance: default_punishment_tolerance(),
            assignments: BTreeMap::new(),
        }
    }
}

impl PolicyConfig {
    /// Reject shares outside `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Policy`] naming the offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (field, value) in [
            ("threshold_cooperation", self.threshold_cooperation),
            ("punishment_tolerance", self.punishment_tolerance),
        ] {
            if value.is_sign_negative() || value > Decimal::ONE {
                return Err(EngineError::Policy {
                    message: format!("agents.{field} must be within [0, 1], got {value}"),
                });
            }
        }
        Ok(())
    }
}

fn default_threshold_cooperation() -> Decimal {
    Decimal::new(5, 1)
}

fn default_punishment_tolerance() -> Decimal {
    Decimal::new(1, 1)
}

// -----------------------------------------------------------------------
// Provider
// -----------------------------------------------------------------------

/// A [`DecisionProvider`] backed by scripted strategies.
#[derive(Debug, Clone)]
pub struct PolicyProvider {
    config: PolicyConfig,
    seed: u64,
}

impl PolicyProvider {
    /// Create a provider from a validated policy configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Policy`] if the configuration is invalid.
    pub fn new(config: PolicyConfig, seed: u64) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self { config, seed })
    }

    /// The strategy an agent plays.
    pub fn strategy_for(&self, agent: AgentId) -> Strategy {
        self.config
            .assignments
            .get(&agent.0)
            .copied()
            .unwrap_or(self.config.default_strategy)
    }

    fn answer(&self, request: &DecisionRequest) -> ProviderResponse {
        let strategy = self.strategy_for(request.agent);
        match strategy {
            Strategy::FullCooperator => full_cooperator(request),
            Strategy::FreeRider => free_rider(request),
            Strategy::ConditionalCooperator => self.conditional_cooperator(request),
            Strategy::Random => {
                let mut rng = StdRng::seed_from_u64(self.rng_seed(request));
                random(request, &mut rng)
            }
        }
    }

    fn rng_seed(&self, request: &DecisionRequest) -> u64 {
        let phase: u64 = match request.phase {
            PhaseKind::InstitutionChoice => 0,
            PhaseKind::Contribution => 1,
            PhaseKind::Sanctioning => 2,
        };
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(u64::from(request.agent.0).wrapping_mul(1_000_003))
            .wrapping_add(u64::from(request.round).wrapping_mul(1_009))
            .wrapping_add(phase)
    }

    fn conditional_cooperator(&self, request: &DecisionRequest) -> ProviderResponse {
        let ctx = &request.context;
        match request.phase {
            PhaseKind::InstitutionChoice => {
                let choice = better_institution(ctx).unwrap_or(InstitutionKind::Sanctioning);
                ProviderResponse::new(
                    ProviderDecision::InstitutionChoice(choice),
                    "joining the institution that paid more last round",
                )
            }
            PhaseKind::Contribution => {
                let range = contribution_range(request);
                let group_average = ctx.institution.and_then(|kind| {
                    ctx.previous_round
                        .iter()
                        .find(|g| g.institution == kind && !g.members.is_empty())
                        .map(|g| g.average_contribution)
                });
                let (amount, reasoning) = match group_average {
                    None => (range.max, "no group history yet, cooperating"),
                    Some(average) if self.group_cooperated(average, ctx) => {
                        (range.max, "group cooperated last round")
                    }
                    Some(average) => (
                        range.clamp_u64(average.floor().to_u64().unwrap_or(0)),
                        "matching the group's average contribution",
                    ),
                };
                ProviderResponse::new(ProviderDecision::Contribution(signed(amount)), reasoning)
            }
            PhaseKind::Sanctioning => {
                let own = ctx
                    .group_contributions
                    .get(&request.own_label())
                    .copied()
                    .unwrap_or(0);
                let tolerated = Decimal::ONE
                    .checked_sub(self.config.punishment_tolerance)
                    .and_then(|share| Decimal::from(own).checked_mul(share))
                    .unwrap_or(Decimal::ZERO);
                let effect = ctx.punishment_effect.max(1);
                let per_target = request.legal_range.map_or(0, |r| r.max);
                let sanctions = peers(request)
                    .filter_map(|(target, contributed)| {
                        if Decimal::from(contributed) < tolerated {
                            let shortfall = own.saturating_sub(contributed);
                            Some(SanctionIntent {
                                target,
                                kind: SanctionKind::Punish,
                                amount: signed(shortfall.div_ceil(effect).min(per_target)),
                            })
                        } else if contributed >= own && contributed > 0 && per_target > 0 {
                            Some(SanctionIntent {
                                target,
                                kind: SanctionKind::Reward,
                                amount: 1,
                            })
                        } else {
                            None
                        }
                    })
                    .collect();
                ProviderResponse::new(
                    ProviderDecision::Sanctions(sanctions),
                    "punishing shortfalls beyond tolerance, rewarding matches",
                )
            }
        }
    }

    fn group_cooperated(&self, average: Decimal, ctx: &DecisionContext) -> bool {
        if ctx.endowment_stage_1 == 0 {
            return true;
        }
        average
            .checked_div(Decimal::from(ctx.endowment_stage_1))
            .is_some_and(|share| share >= self.config.threshold_cooperation)
    }
}

impl DecisionProvider for PolicyProvider {
    async fn decide(&self, request: &DecisionRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(self.answer(request))
    }
}

// -----------------------------------------------------------------------
// Strategies
// -----------------------------------------------------------------------

fn full_cooperator(request: &DecisionRequest) -> ProviderResponse {
    match request.phase {
        PhaseKind::InstitutionChoice => ProviderResponse::new(
            ProviderDecision::InstitutionChoice(InstitutionKind::Sanctioning),
            "sanctions keep the group honest",
        ),
        PhaseKind::Contribution => ProviderResponse::new(
            ProviderDecision::Contribution(signed(contribution_range(request).max)),
            "contributing everything",
        ),
        PhaseKind::Sanctioning => {
            let full = request.context.endowment_stage_1;
            let can_spend = request.legal_range.is_some_and(|r| r.max > 0);
            let sanctions = peers(request)
                .filter(|(_, contributed)| can_spend && full > 0 && *contributed >= full)
                .map(|(target, _)| SanctionIntent {
                    target,
                    kind: SanctionKind::Reward,
                    amount: 1,
                })
                .collect();
            ProviderResponse::new(
                ProviderDecision::Sanctions(sanctions),
                "rewarding full contributors",
            )
        }
    }
}

fn free_rider(request: &DecisionRequest) -> ProviderResponse {
    let decision = match request.phase {
        PhaseKind::InstitutionChoice => {
            ProviderDecision::InstitutionChoice(InstitutionKind::SanctionFree)
        }
        PhaseKind::Contribution => {
            ProviderDecision::Contribution(signed(contribution_range(request).min))
        }
        PhaseKind::Sanctioning => ProviderDecision::Sanctions(Vec::new()),
    };
    ProviderResponse::new(decision, "keeping every token")
}

fn random(request: &DecisionRequest, rng: &mut impl Rng) -> ProviderResponse {
    let decision = match request.phase {
        PhaseKind::InstitutionChoice => {
            let kind = if rng.random_bool(0.5) {
                InstitutionKind::Sanctioning
            } else {
                InstitutionKind::SanctionFree
            };
            ProviderDecision::InstitutionChoice(kind)
        }
        PhaseKind::Contribution => {
            let range = contribution_range(request);
            ProviderDecision::Contribution(signed(rng.random_range(range.min..=range.max)))
        }
        PhaseKind::Sanctioning => {
            let per_target = request.legal_range.map_or(0, |r| r.max);
            let mut sanctions = Vec::new();
            if per_target > 0 {
                for (target, _) in peers(request) {
                    if !rng.random_ratio(1, 4) {
                        continue;
                    }
                    let kind = if rng.random_bool(0.5) {
                        SanctionKind::Punish
                    } else {
                        SanctionKind::Reward
                    };
                    sanctions.push(SanctionIntent {
                        target,
                        kind,
                        amount: signed(rng.random_range(1..=per_target)),
                    });
                }
            }
            ProviderDecision::Sanctions(sanctions)
        }
    };
    ProviderResponse::new(decision, "random")
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

/// The institution whose members earned more on average last round.
/// Ties and one-sided rounds keep the agent's current institution.
fn better_institution(ctx: &DecisionContext) -> Option<InstitutionKind> {
    let average = |kind: InstitutionKind| {
        ctx.previous_round
            .iter()
            .find(|g| g.institution == kind && !g.members.is_empty())
            .map(|g| g.average_payoff)
    };
    match (
        average(InstitutionKind::Sanctioning),
        average(InstitutionKind::SanctionFree),
    ) {
        (Some(si), Some(sfi)) if si > sfi => Some(InstitutionKind::Sanctioning),
        (Some(si), Some(sfi)) if sfi > si => Some(InstitutionKind::SanctionFree),
        _ => ctx.institution,
    }
}

fn contribution_range(request: &DecisionRequest) -> LegalRange {
    request
        .legal_range
        .unwrap_or_else(|| LegalRange::new(0, request.context.endowment_stage_1))
}

/// Other group members, as the context names them, with their
/// contribution this round.
fn peers(request: &DecisionRequest) -> impl Iterator<Item = (AgentId, u64)> + '_ {
    let own = request.own_label();
    request
        .context
        .group_contributions
        .iter()
        .filter(move |(agent, _)| **agent != own)
        .map(|(agent, amount)| (*agent, *amount))
}

fn signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
