//! Round orchestration: the state machine that drives one round.
//!
//! Each round runs through these states, strictly in order:
//!
//! 1. **Init** -- the previous round is committed.
//! 2. **`InstitutionChoice`** (choice rounds only) -- every agent picks SI or
//!    SFI through the [`DecisionGateway`].
//! 3. **Contribution** -- every agent decides how much of the stage-1
//!    endowment to contribute.
//! 4. **Sanctioning** (only if an SI group has at least two members) -- SI
//!    members spend their sanction budget on peers.
//! 5. **Settlement** -- institutions compute pools and sanction effects from
//!    the complete decision set, the ledger applies the round atomically on a
//!    staged copy, and the staged ledger is reconciled against the payoffs.
//! 6. **Committed** -- the staged ledger replaces the live one and the round
//!    is appended to history.
//!
//! Decisions are collected by [`Environment::collect_round`] and applied by
//! [`Environment::settle`]; nothing in the environment changes until
//! settlement succeeds, so an abort discards every partial decision.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use commons_ledger::{
    LedgerError, Posting, PostingBuilder, ReconciliationMismatch, ReconciliationResult,
    RoundExpectation, TokenLedger,
};
use commons_types::{
    AgentId, DecisionRecord, GroupSummary, Incident, InstitutionKind, LedgerEntryType,
    PayoffRecord, PhaseKind, RoundRecord, RoundState, RoundStatus, RunId, Standing,
};

use crate::config::{ConfigError, EndowmentMode, SimulationConfig};
use crate::gateway::{
    DecisionContext, DecisionGateway, DecisionProvider, DecisionRequest, GatewayDecision,
    LegalRange, PeerLabels,
};
use crate::history::{HistoryError, RoundHistory};
use crate::institution::{
    Group, Institution, InstitutionError, InstitutionRules, PublicGoodOutcome, SanctionOutcome,
};

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    /// Configuration was invalid.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The ledger refused a posting.
    #[error("ledger error: {source}")]
    Ledger {
        /// The underlying ledger error.
        #[from]
        source: LedgerError,
    },

    /// The ledger disagrees with the computed payoffs.
    #[error("reconciliation error: {source}")]
    Reconciliation {
        /// The mismatch report.
        source: Box<ReconciliationMismatch>,
    },

    /// The ledger clamped a punishment differently than settlement expected.
    #[error(
        "round {round}: floor adjustment for agent {agent} was {applied}, expected {expected}"
    )]
    FloorAdjustment {
        /// The round being settled.
        round: u32,
        /// The punished agent.
        agent: AgentId,
        /// Adjustment computed by settlement.
        expected: u64,
        /// Adjustment applied by the ledger.
        applied: u64,
    },

    /// An institution rejected its inputs.
    #[error("institution error: {source}")]
    Institution {
        /// The underlying institution error.
        #[from]
        source: InstitutionError,
    },

    /// The history store rejected a round.
    #[error("history error: {source}")]
    History {
        /// The underlying history error.
        #[from]
        source: HistoryError,
    },

    /// The state machine was driven out of order.
    #[error("invalid round transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: RoundState,
        /// Requested state.
        to: RoundState,
    },

    /// Every configured round has been played.
    #[error("all {num_rounds} rounds have been played")]
    RoundLimit {
        /// Configured number of rounds.
        num_rounds: u32,
    },

    /// Token arithmetic left the integer range.
    #[error("arithmetic overflow computing {context}")]
    Overflow {
        /// What was being computed.
        context: &'static str,
    },
}

impl From<ReconciliationMismatch> for RoundError {
    fn from(mismatch: ReconciliationMismatch) -> Self {
        Self::Reconciliation {
            source: Box::new(mismatch),
        }
    }
}

const fn overflow(context: &'static str) -> RoundError {
    RoundError::Overflow { context }
}

fn signed(value: u64, context: &'static str) -> Result<i64, RoundError> {
    i64::try_from(value).ok().ok_or_else(|| overflow(context))
}

/// Whether the state machine may move from `from` to `to`.
const fn can_transition(from: RoundState, to: RoundState) -> bool {
    matches!(
        (from, to),
        (
            RoundState::Init,
            RoundState::InstitutionChoice | RoundState::Contribution
        ) | (RoundState::InstitutionChoice, RoundState::Contribution)
            | (
                RoundState::Contribution,
                RoundState::Sanctioning | RoundState::Settlement
            )
            | (RoundState::Sanctioning, RoundState::Settlement)
            | (RoundState::Settlement, RoundState::Committed)
            | (RoundState::Committed, RoundState::Init)
            | (
                RoundState::Init
                    | RoundState::InstitutionChoice
                    | RoundState::Contribution
                    | RoundState::Sanctioning
                    | RoundState::Settlement,
                RoundState::Aborted
            )
    )
}

// ---------------------------------------------------------------------------
// Round products
// ---------------------------------------------------------------------------

/// Every decision gathered for one round, not yet applied.
#[derive(Debug, Clone)]
pub struct CollectedRound {
    /// The round these decisions belong to.
    pub round: u32,
    /// Whether institutions were chosen this round.
    pub choice_round: bool,
    /// Institution membership in effect for this round.
    pub memberships: BTreeMap<AgentId, InstitutionKind>,
    /// Institution choices (empty outside choice rounds).
    pub choices: BTreeMap<AgentId, GatewayDecision>,
    /// Contribution decisions.
    pub contributions: BTreeMap<AgentId, GatewayDecision>,
    /// Sanction decisions of SI members.
    pub sanctions: BTreeMap<AgentId, GatewayDecision>,
    /// Sanction budget offered to each SI member.
    pub budgets: BTreeMap<AgentId, u64>,
}

/// Summary of a committed round.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    /// The round that was committed.
    pub round: u32,
    /// Whether institutions were chosen this round.
    pub choice_round: bool,
    /// Whether any decision was replaced by a default.
    pub degraded: bool,
    /// Per-institution aggregates.
    pub groups: Vec<GroupSummary>,
    /// Number of incidents recorded.
    pub incidents: usize,
    /// Tokens held by all agents after settlement.
    pub total_supply: Option<u64>,
}

/// One group's institution outcomes.
struct SettledGroup {
    group: Group,
    stage2: u64,
    public_good: PublicGoodOutcome,
    sanctions: SanctionOutcome,
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The state of one run: ledger, history, memberships, and the round
/// state machine.
#[derive(Debug)]
pub struct Environment {
    run_id: RunId,
    config: SimulationConfig,
    rules: InstitutionRules,
    ledger: TokenLedger,
    history: RoundHistory,
    agents: Vec<AgentId>,
    memberships: BTreeMap<AgentId, InstitutionKind>,
    next_round: u32,
    state: RoundState,
}

impl Environment {
    /// Validate the config and open an account for every agent.
    ///
    /// Agents are numbered `0..num_agents` and each starts with
    /// `initial_tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::Config`] if the config is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self, RoundError> {
        config.validate()?;
        let run_id = RunId::new();
        let agents: Vec<AgentId> = (0..config.game.num_agents).map(AgentId).collect();
        let mut ledger = TokenLedger::new();
        for agent in &agents {
            ledger.open_account(*agent, config.game.initial_tokens)?;
        }

        info!(
            run_id = %run_id,
            agents = agents.len(),
            rounds = config.game.num_rounds,
            multiplier = %config.game.public_good_multiplier,
            endowment_mode = ?config.game.endowment_mode,
            "environment created"
        );

        Ok(Self {
            run_id,
            rules: InstitutionRules::from_config(&config),
            config,
            ledger,
            history: RoundHistory::new(run_id),
            agents,
            memberships: BTreeMap::new(),
            next_round: 1,
            state: RoundState::Init,
        })
    }

    /// Run identifier.
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The configuration this run was created with.
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The live ledger.
    pub const fn ledger(&self) -> &TokenLedger {
        &self.ledger
    }

    /// Rounds played so far.
    pub const fn history(&self) -> &RoundHistory {
        &self.history
    }

    /// All agents, ascending.
    pub fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    /// Membership of the last committed round.
    pub const fn memberships(&self) -> &BTreeMap<AgentId, InstitutionKind> {
        &self.memberships
    }

    /// The round that will be played next.
    pub const fn next_round(&self) -> u32 {
        self.next_round
    }

    /// Current state machine state.
    pub const fn state(&self) -> RoundState {
        self.state
    }

    /// Whether every configured round has been played or the run aborted.
    pub const fn is_finished(&self) -> bool {
        self.next_round > self.config.game.num_rounds
            || matches!(self.state, RoundState::Aborted)
    }

    /// Whether institutions are (re)chosen in `round`.
    ///
    /// Round 1 always is. After that, every `reselection_interval` rounds;
    /// an interval of zero keeps the round-1 choice for the whole run.
    pub fn is_choice_round(&self, round: u32) -> bool {
        if round <= 1 {
            return true;
        }
        let interval = self.config.institutions.reselection_interval;
        round
            .saturating_sub(1)
            .checked_rem(interval)
            .is_some_and(|r| r == 0)
    }

    fn transition(&mut self, to: RoundState) -> Result<(), RoundError> {
        if !can_transition(self.state, to) {
            return Err(RoundError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(round = self.next_round, from = ?self.state, to = ?to, "round state transition");
        self.state = to;
        Ok(())
    }

    fn base_context(&self, agent: AgentId) -> Result<DecisionContext, RoundError> {
        let window = self.config.gateway.history_window;
        Ok(DecisionContext {
            balance: self.ledger.balance(agent)?,
            institution: self.memberships.get(&agent).copied(),
            self_label: None,
            group_members: Vec::new(),
            own_history: self.history.agent_history(agent, window),
            peer_history: self.history.peer_history(agent, window),
            standing: self.history.last_standing(agent),
            previous_round: self.history.last_aggregates(),
            group_contributions: BTreeMap::new(),
            endowment_stage_1: self.rules.endowment_stage_1,
            endowment_stage_2: self.rules.endowment_stage_2,
            multiplier: self.rules.multiplier,
            punishment_effect: self.rules.punishment_effect,
            reward_effect: self.rules.reward_effect,
            total_rounds: self.config.game.num_rounds,
        })
    }

    /// How `group` is named in its members' requests.
    fn peer_labels(&self, group: &Group) -> PeerLabels {
        if self.config.gateway.anonymize_peers {
            PeerLabels::anonymous(&group.members)
        } else {
            PeerLabels::identity()
        }
    }

    const fn from_balance(&self) -> bool {
        matches!(self.config.game.endowment_mode, EndowmentMode::FromBalance)
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    /// Gather every decision for the next round.
    ///
    /// Advances the state machine through the decision phases but leaves
    /// ledger, history, and memberships untouched.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::RoundLimit`] when the run is complete, or
    /// [`RoundError::InvalidTransition`] if a round is already in progress.
    pub async fn collect_round<P: DecisionProvider>(
        &mut self,
        gateway: &DecisionGateway<P>,
    ) -> Result<CollectedRound, RoundError> {
        let round = self.next_round;
        if round > self.config.game.num_rounds {
            return Err(RoundError::RoundLimit {
                num_rounds: self.config.game.num_rounds,
            });
        }
        if self.state == RoundState::Committed {
            self.transition(RoundState::Init)?;
        }
        if self.state != RoundState::Init {
            return Err(RoundError::InvalidTransition {
                from: self.state,
                to: RoundState::Init,
            });
        }

        let choice_round = self.is_choice_round(round);
        info!(round, choice_round, "round started");

        // --- Institution choice ---
        let mut choices = BTreeMap::new();
        let memberships = if choice_round {
            self.transition(RoundState::InstitutionChoice)?;
            let requests = self
                .agents
                .iter()
                .map(|agent| {
                    Ok(DecisionRequest {
                        agent: *agent,
                        round,
                        phase: PhaseKind::InstitutionChoice,
                        legal_range: None,
                        context: self.base_context(*agent)?,
                        peer_labels: PeerLabels::identity(),
                    })
                })
                .collect::<Result<Vec<_>, RoundError>>()?;
            choices = gateway.collect(&requests).await;
            choices
                .values()
                .filter_map(|d| d.institution().map(|kind| (d.agent, kind)))
                .collect()
        } else {
            self.memberships.clone()
        };

        // --- Contribution ---
        self.transition(RoundState::Contribution)?;
        let groups = Group::partition(&memberships);
        for group in &groups {
            debug!(round, institution = %group.institution, members = group.len(), "group formed");
        }

        let mut requests = Vec::with_capacity(self.agents.len());
        for group in &groups {
            let labels = self.peer_labels(group);
            for agent in &group.members {
                let mut context = self.base_context(*agent)?;
                context.institution = Some(group.institution);
                context.self_label = Some(labels.label_of(*agent));
                context.group_members =
                    group.members.iter().map(|a| labels.label_of(*a)).collect();
                let max = if self.from_balance() {
                    self.rules.endowment_stage_1.min(context.balance)
                } else {
                    self.rules.endowment_stage_1
                };
                requests.push(DecisionRequest {
                    agent: *agent,
                    round,
                    phase: PhaseKind::Contribution,
                    legal_range: Some(LegalRange::new(0, max)),
                    context,
                    peer_labels: labels.clone(),
                });
            }
        }
        let contributions = gateway.collect(&requests).await;

        // --- Sanctioning ---
        let mut sanctions = BTreeMap::new();
        let mut budgets = BTreeMap::new();
        let sanctioning_groups: Vec<&Group> = groups
            .iter()
            .filter(|g| {
                Institution::new(g.institution, &self.rules).allows_sanctions() && g.len() >= 2
            })
            .collect();

        if sanctioning_groups.is_empty() {
            debug!(round, "no sanctioning group, skipping sanction phase");
        } else {
            self.transition(RoundState::Sanctioning)?;
            let contributed: BTreeMap<AgentId, u64> = contributions
                .values()
                .filter_map(|d| d.contribution().map(|c| (d.agent, c)))
                .collect();

            let mut requests = Vec::new();
            for group in sanctioning_groups {
                let group_contributions: BTreeMap<AgentId, u64> = group
                    .members
                    .iter()
                    .map(|a| (*a, contributed.get(a).copied().unwrap_or(0)))
                    .collect();
                let labels = self.peer_labels(group);
                let labelled_contributions: BTreeMap<AgentId, u64> = group_contributions
                    .iter()
                    .map(|(a, c)| (labels.label_of(*a), *c))
                    .collect();
                for agent in &group.members {
                    let mut context = self.base_context(*agent)?;
                    let own = group_contributions.get(agent).copied().unwrap_or(0);
                    let budget = if self.from_balance() {
                        self.rules
                            .sanction_budget()
                            .min(context.balance.saturating_sub(own))
                    } else {
                        self.rules.sanction_budget()
                    };
                    budgets.insert(*agent, budget);
                    if budget == 0 {
                        continue;
                    }
                    context.institution = Some(group.institution);
                    context.self_label = Some(labels.label_of(*agent));
                    context.group_members =
                        group.members.iter().map(|a| labels.label_of(*a)).collect();
                    context.group_contributions.clone_from(&labelled_contributions);
                    requests.push(DecisionRequest {
                        agent: *agent,
                        round,
                        phase: PhaseKind::Sanctioning,
                        legal_range: Some(LegalRange::new(0, budget)),
                        context,
                        peer_labels: labels.clone(),
                    });
                }
            }
            sanctions = gateway.collect(&requests).await;
        }

        Ok(CollectedRound {
            round,
            choice_round,
            memberships,
            choices,
            contributions,
            sanctions,
            budgets,
        })
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Apply a collected round: compute outcomes, post them to a staged
    /// ledger, reconcile, and commit.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError`] on any ledger, reconciliation, or arithmetic
    /// failure. Nothing is committed in that case.
    pub fn settle(&mut self, collected: CollectedRound) -> Result<RoundSummary, RoundError> {
        self.transition(RoundState::Settlement)?;
        let round = collected.round;

        let contributions: BTreeMap<AgentId, u64> = collected
            .contributions
            .values()
            .filter_map(|d| d.contribution().map(|c| (d.agent, c)))
            .collect();

        let mut incidents: Vec<Incident> = collected
            .choices
            .values()
            .chain(collected.contributions.values())
            .chain(collected.sanctions.values())
            .flat_map(|d| d.incidents.iter().cloned())
            .collect();

        // --- Institution outcomes, from the full decision set ---
        let mut settled: Vec<SettledGroup> = Vec::new();
        for group in Group::partition(&collected.memberships) {
            let institution = Institution::new(group.institution, &self.rules);
            let public_good = institution.apply_contribution_phase(&group, &contributions, round)?;

            let mut orders = Vec::new();
            for member in &group.members {
                let Some(decision) = collected.sanctions.get(member) else {
                    continue;
                };
                let budget = collected.budgets.get(member).copied().unwrap_or(0);
                let admission =
                    institution.admit_sanctions(&group, *member, decision.sanctions(), budget);
                orders.extend(admission.orders);
                incidents.extend(admission.incidents);
            }
            let sanctions = institution.apply_sanction_phase(&orders)?;

            settled.push(SettledGroup {
                stage2: institution.stage2_endowment(),
                group,
                public_good,
                sanctions,
            });
        }

        // --- Payoffs and postings ---
        let granted = !self.from_balance();
        let mut payoffs: Vec<PayoffRecord> = Vec::with_capacity(self.agents.len());
        let mut postings: Vec<Posting> = Vec::new();
        let mut expectation = RoundExpectation {
            round,
            ..RoundExpectation::default()
        };

        for sg in &settled {
            expectation.pool_total = expectation
                .pool_total
                .checked_add(sg.public_good.pool)
                .ok_or_else(|| overflow("pool total"))?;
            expectation.sanction_spend_total = expectation
                .sanction_spend_total
                .checked_add(sg.sanctions.total_spend().ok_or_else(|| overflow("group spend"))?)
                .ok_or_else(|| overflow("sanction spend total"))?;

            for agent in &sg.group.members {
                let payoff = self.payoff(sg, *agent, &contributions, granted)?;
                postings.extend(postings_for(&payoff)?);
                expectation
                    .per_agent_delta
                    .insert(*agent, payoff.final_delta);
                payoffs.push(payoff);
            }
        }
        payoffs.sort_by_key(|p| p.agent);

        // --- Stage, reconcile ---
        let mut staged = self.ledger.clone();
        let receipt = staged.apply_batch(round, postings)?;
        for payoff in &mut payoffs {
            let applied = receipt.floor_adjustment(payoff.agent);
            if applied != payoff.floor_adjustment {
                return Err(RoundError::FloorAdjustment {
                    round,
                    agent: payoff.agent,
                    expected: payoff.floor_adjustment,
                    applied,
                });
            }
            payoff.balance = staged.balance(payoff.agent)?;
        }
        if let ReconciliationResult::Mismatch(mismatch) = staged.verify_round(&expectation) {
            error!(round, mismatch = %mismatch, "ledger reconciliation failed");
            return Err(mismatch.into());
        }
        let standings = standings(&self.history, &payoffs)?;

        // --- Records ---
        let groups = settled
            .iter()
            .map(|sg| summarize(sg, &payoffs))
            .collect::<Result<Vec<_>, RoundError>>()?;
        let decisions = decision_records(&collected, &settled);
        let degraded = incidents.iter().any(Incident::degrades_round);
        let incident_count = incidents.len();

        let record = RoundRecord {
            run_id: self.run_id,
            round,
            status: RoundStatus::Committed,
            choice_round: collected.choice_round,
            degraded,
            groups: groups.clone(),
            decisions,
            payoffs,
            sanctions: settled
                .iter()
                .flat_map(|sg| sg.sanctions.records.iter().cloned())
                .collect(),
            incidents,
            standings,
            abort_reason: None,
        };

        // --- Commit ---
        self.history.append(record)?;
        self.ledger = staged;
        self.memberships = collected.memberships;
        self.transition(RoundState::Committed)?;
        self.next_round = self.next_round.saturating_add(1);

        if degraded {
            warn!(round, incidents = incident_count, "round committed degraded");
        }
        for group in &groups {
            info!(
                round,
                institution = %group.institution,
                members = group.members.len(),
                total_contribution = group.total_contribution,
                pool = group.pool,
                residue = %group.residue,
                sanction_spend = group.sanction_spend,
                "group settled"
            );
        }

        let summary = RoundSummary {
            round,
            choice_round: collected.choice_round,
            degraded,
            groups,
            incidents: incident_count,
            total_supply: self.ledger.total_supply(),
        };
        info!(
            round,
            degraded,
            incidents = incident_count,
            total_supply = summary.total_supply,
            "round committed"
        );
        Ok(summary)
    }

    /// Compute one member's payoff breakdown, excluding the final balance.
    fn payoff(
        &self,
        sg: &SettledGroup,
        agent: AgentId,
        contributions: &BTreeMap<AgentId, u64>,
        granted: bool,
    ) -> Result<PayoffRecord, RoundError> {
        let endowment_stage1 = if granted { self.rules.endowment_stage_1 } else { 0 };
        let endowment_stage2 = if granted { sg.stage2 } else { 0 };
        let contributed = contributions.get(&agent).copied().unwrap_or(0);
        let public_good_return = sg.public_good.share(agent);
        let sanction_cost_paid = sg.sanctions.spend_of(agent);
        let punishment_received = sg.sanctions.punishment_of(agent);
        let reward_received = sg.sanctions.reward_of(agent);

        // Mirror the ledger's pass order: credits, debits, then punishment
        // clamped at zero.
        let before = self.ledger.balance(agent)?;
        let credited = before
            .checked_add(endowment_stage1)
            .and_then(|b| b.checked_add(endowment_stage2))
            .and_then(|b| b.checked_add(public_good_return))
            .and_then(|b| b.checked_add(reward_received))
            .ok_or_else(|| overflow("credited balance"))?;
        let available = credited
            .saturating_sub(contributed)
            .saturating_sub(sanction_cost_paid);
        let floor_adjustment = punishment_received.saturating_sub(available);

        let mut payoff = PayoffRecord {
            agent,
            institution: sg.group.institution,
            endowment_stage1,
            endowment_stage2,
            contributed,
            kept: endowment_stage1.saturating_sub(contributed),
            public_good_return,
            sanction_cost_paid,
            punishment_received,
            reward_received,
            sanction_effect_received: signed(reward_received, "reward")?
                .checked_sub(signed(punishment_received, "punishment")?)
                .ok_or_else(|| overflow("sanction effect"))?,
            floor_adjustment,
            final_delta: 0,
            balance: 0,
        };
        payoff.final_delta = payoff
            .identity_delta()
            .ok_or_else(|| overflow("payoff delta"))?;
        Ok(payoff)
    }

    /// Gather and settle one round.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError`] if collection or settlement fails. The caller
    /// should then [`abort_round`](Self::abort_round).
    pub async fn run_round<P: DecisionProvider>(
        &mut self,
        gateway: &DecisionGateway<P>,
    ) -> Result<RoundSummary, RoundError> {
        let collected = self.collect_round(gateway).await?;
        self.settle(collected)
    }

    /// Abandon the round in progress and record it as aborted.
    ///
    /// Partial decisions are discarded; ledger and memberships keep their
    /// last committed values. The environment accepts no further rounds.
    ///
    /// # Errors
    ///
    /// Returns [`RoundError::InvalidTransition`] if the run is already
    /// aborted, or [`RoundError::History`] if the record cannot be stored.
    pub fn abort_round(&mut self, reason: impl Into<String>) -> Result<(), RoundError> {
        if self.state == RoundState::Aborted {
            return Err(RoundError::InvalidTransition {
                from: self.state,
                to: RoundState::Aborted,
            });
        }
        let reason = reason.into();
        let round = self.next_round;
        warn!(round, from = ?self.state, reason = %reason, "round aborted");

        self.state = RoundState::Aborted;
        self.history.append(RoundRecord {
            run_id: self.run_id,
            round,
            status: RoundStatus::Aborted,
            choice_round: self.is_choice_round(round),
            degraded: false,
            groups: Vec::new(),
            decisions: Vec::new(),
            payoffs: Vec::new(),
            sanctions: Vec::new(),
            incidents: Vec::new(),
            standings: Vec::new(),
            abort_reason: Some(reason),
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Settlement helpers
// ---------------------------------------------------------------------------

fn postings_for(payoff: &PayoffRecord) -> Result<Vec<Posting>, RoundError> {
    let lines = [
        (LedgerEntryType::EndowmentStage1, payoff.endowment_stage1, "stage-1 endowment"),
        (LedgerEntryType::EndowmentStage2, payoff.endowment_stage2, "stage-2 endowment"),
        (LedgerEntryType::Contribution, payoff.contributed, "public good contribution"),
        (LedgerEntryType::PublicGoodShare, payoff.public_good_return, "public good share"),
        (LedgerEntryType::SanctionSpend, payoff.sanction_cost_paid, "sanction spend"),
        (LedgerEntryType::RewardReceived, payoff.reward_received, "reward received"),
        (LedgerEntryType::PunishmentReceived, payoff.punishment_received, "punishment received"),
    ];
    let mut postings = Vec::with_capacity(lines.len());
    for (entry_type, amount, reason) in lines {
        if amount == 0 {
            continue;
        }
        postings.push(
            PostingBuilder::new(entry_type)
                .agent(payoff.agent)
                .amount(amount)
                .reason(reason)
                .build()?,
        );
    }
    Ok(postings)
}

/// Running totals after this round's payoffs, ranked highest first.
fn standings(history: &RoundHistory, payoffs: &[PayoffRecord]) -> Result<Vec<Standing>, RoundError> {
    let out_of = u32::try_from(payoffs.len())
        .ok()
        .ok_or_else(|| overflow("ranked agents"))?;
    let mut totals = payoffs
        .iter()
        .map(|p| {
            let before = history
                .last_standing(p.agent)
                .map_or(0, |s| s.cumulative_payoff);
            before
                .checked_add(p.final_delta)
                .map(|total| (p.agent, total))
                .ok_or_else(|| overflow("cumulative payoff"))
        })
        .collect::<Result<Vec<_>, RoundError>>()?;
    // Stable: equal totals keep ascending agent order.
    totals.sort_by(|a, b| b.1.cmp(&a.1));

    let mut standings: Vec<Standing> = totals
        .into_iter()
        .zip(1_u32..)
        .map(|((agent, cumulative_payoff), rank)| Standing {
            agent,
            cumulative_payoff,
            rank,
            out_of,
        })
        .collect();
    standings.sort_by_key(|s| s.agent);
    Ok(standings)
}

fn summarize(sg: &SettledGroup, payoffs: &[PayoffRecord]) -> Result<GroupSummary, RoundError> {
    let size = Decimal::from(sg.group.len());
    let total = sg.public_good.total;
    let payoff_sum = payoffs
        .iter()
        .filter(|p| sg.group.contains(p.agent))
        .try_fold(0_i64, |acc, p| acc.checked_add(p.final_delta))
        .ok_or_else(|| overflow("group payoff sum"))?;

    Ok(GroupSummary {
        institution: sg.group.institution,
        members: sg.group.members.clone(),
        total_contribution: total,
        average_contribution: Decimal::from(total).checked_div(size).unwrap_or_default(),
        pool: sg.public_good.pool,
        residue: sg.public_good.residue,
        base_share: sg.public_good.base_share,
        remainder: sg.public_good.remainder,
        sanction_spend: sg
            .sanctions
            .total_spend()
            .ok_or_else(|| overflow("group spend"))?,
        average_payoff: Decimal::from(payoff_sum)
            .checked_div(size)
            .unwrap_or_default(),
    })
}

fn decision_records(collected: &CollectedRound, settled: &[SettledGroup]) -> Vec<DecisionRecord> {
    let choices = collected.choices.values().filter_map(|d| {
        d.institution().map(|variant| DecisionRecord::InstitutionChoice {
            agent: d.agent,
            variant,
            reasoning: d.reasoning.clone(),
            fallback: d.fallback,
        })
    });
    let contributions = collected.contributions.values().filter_map(|d| {
        d.contribution().map(|amount| DecisionRecord::Contribution {
            agent: d.agent,
            amount,
            reasoning: d.reasoning.clone(),
            fallback: d.fallback,
        })
    });
    let sanctions = settled
        .iter()
        .flat_map(|sg| sg.sanctions.records.iter())
        .map(|s| DecisionRecord::Sanction {
            from_agent: s.from,
            to_agent: s.to,
            kind: s.kind,
            amount: s.amount,
            reasoning: collected
                .sanctions
                .get(&s.from)
                .map(|d| d.reasoning.clone())
                .unwrap_or_default(),
        });
    choices.chain(contributions).chain(sanctions).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use commons_types::{ProviderDecision, SanctionIntent, SanctionKind};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::gateway::{StubProvider, ValidatedDecision};

    fn config(agents: u32, rounds: u32, mode: EndowmentMode) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.game.num_agents = agents;
        config.game.num_rounds = rounds;
        config.game.initial_tokens = 1000;
        config.game.endowment_stage_1 = 20;
        config.game.endowment_stage_2 = 20;
        config.game.public_good_multiplier = dec!(1.6);
        config.game.endowment_mode = mode;
        config
    }

    fn gateway(provider: StubProvider, config: &SimulationConfig) -> DecisionGateway<StubProvider> {
        DecisionGateway::new(provider, &config.gateway)
    }

    fn all_contribute(agents: u32, kind: InstitutionKind, amount: i64) -> StubProvider {
        (0..agents).fold(StubProvider::new(), |p, a| {
            p.with_decision(AgentId(a), ProviderDecision::InstitutionChoice(kind))
                .with_decision(AgentId(a), ProviderDecision::Contribution(amount))
        })
    }

    #[test]
    fn transitions_are_forward_only() {
        assert!(can_transition(RoundState::Init, RoundState::InstitutionChoice));
        assert!(can_transition(RoundState::Init, RoundState::Contribution));
        assert!(can_transition(RoundState::Contribution, RoundState::Settlement));
        assert!(can_transition(RoundState::Settlement, RoundState::Aborted));
        assert!(!can_transition(RoundState::Contribution, RoundState::InstitutionChoice));
        assert!(!can_transition(RoundState::Init, RoundState::Settlement));
        assert!(!can_transition(RoundState::Committed, RoundState::Aborted));
        assert!(!can_transition(RoundState::Aborted, RoundState::Init));
    }

    #[test]
    fn choice_rounds_follow_interval() {
        let mut cfg = config(2, 10, EndowmentMode::Granted);
        cfg.institutions.reselection_interval = 3;
        let env = Environment::new(cfg).unwrap();
        let choice: Vec<u32> = (1..=10).filter(|r| env.is_choice_round(*r)).collect();
        assert_eq!(choice, vec![1, 4, 7, 10]);

        let mut cfg = config(2, 10, EndowmentMode::Granted);
        cfg.institutions.reselection_interval = 0;
        let env = Environment::new(cfg).unwrap();
        let choice: Vec<u32> = (1..=10).filter(|r| env.is_choice_round(*r)).collect();
        assert_eq!(choice, vec![1]);
    }

    #[tokio::test]
    async fn from_balance_scenario_ends_at_1012() {
        let cfg = config(2, 1, EndowmentMode::FromBalance);
        let gw = gateway(all_contribute(2, InstitutionKind::SanctionFree, 20), &cfg);
        let mut env = Environment::new(cfg).unwrap();

        let summary = env.run_round(&gw).await.unwrap();
        assert_eq!(summary.round, 1);
        assert!(summary.choice_round);
        assert!(!summary.degraded);
        let group = summary.groups.first().unwrap();
        assert_eq!(group.pool, 64);
        assert_eq!(env.ledger().balance(AgentId(0)).unwrap(), 1012);
        assert_eq!(env.ledger().balance(AgentId(1)).unwrap(), 1012);
        assert_eq!(env.state(), RoundState::Committed);
        assert!(env.is_finished());
    }

    #[tokio::test]
    async fn granted_scenario_ends_at_1032() {
        let cfg = config(2, 1, EndowmentMode::Granted);
        let gw = gateway(all_contribute(2, InstitutionKind::SanctionFree, 20), &cfg);
        let mut env = Environment::new(cfg).unwrap();

        env.run_round(&gw).await.unwrap();
        let record = env.history().last().unwrap();
        let payoff = record.payoff(AgentId(0)).unwrap();
        assert_eq!(payoff.final_delta, 32);
        assert_eq!(payoff.balance, 1032);
        assert_eq!(payoff.identity_delta(), Some(32));
    }

    #[tokio::test]
    async fn punishment_costs_sender_and_hits_target() {
        let cfg = config(2, 1, EndowmentMode::Granted);
        let provider = all_contribute(2, InstitutionKind::Sanctioning, 20).with_decision(
            AgentId(0),
            ProviderDecision::Sanctions(vec![SanctionIntent {
                target: AgentId(1),
                kind: SanctionKind::Punish,
                amount: 5,
            }]),
        );
        let gw = gateway(provider, &cfg);
        let mut env = Environment::new(cfg).unwrap();

        env.run_round(&gw).await.unwrap();
        let record = env.history().last().unwrap();
        let a = record.payoff(AgentId(0)).unwrap();
        let b = record.payoff(AgentId(1)).unwrap();
        assert_eq!(a.sanction_cost_paid, 5);
        assert_eq!(b.punishment_received, 15);
        assert_eq!(b.sanction_effect_received, -15);
        // 20 + 20 - 20 + 32 - 5 = 47 and 20 + 20 - 20 + 32 - 15 = 37
        assert_eq!(a.final_delta, 47);
        assert_eq!(b.final_delta, 37);
        assert_eq!(record.sanctions.len(), 1);
    }

    #[tokio::test]
    async fn rounds_cannot_run_past_the_limit() {
        let cfg = config(2, 1, EndowmentMode::Granted);
        let gw = gateway(StubProvider::new(), &cfg);
        let mut env = Environment::new(cfg).unwrap();
        env.run_round(&gw).await.unwrap();
        let result = env.run_round(&gw).await;
        assert!(matches!(result, Err(RoundError::RoundLimit { num_rounds: 1 })));
    }

    #[tokio::test]
    async fn abort_discards_partial_round() {
        let cfg = config(3, 3, EndowmentMode::Granted);
        let gw = gateway(all_contribute(3, InstitutionKind::SanctionFree, 10), &cfg);
        let mut env = Environment::new(cfg).unwrap();
        env.run_round(&gw).await.unwrap();
        let balances = env.ledger().balances().clone();

        let collected = env.collect_round(&gw).await.unwrap();
        assert_eq!(collected.round, 2);
        env.abort_round("operator stop").unwrap();

        assert_eq!(env.ledger().balances(), &balances);
        assert_eq!(env.state(), RoundState::Aborted);
        assert!(env.is_finished());
        let last = env.history().last().unwrap();
        assert_eq!(last.status, RoundStatus::Aborted);
        assert_eq!(last.round, 2);
        assert!(env.abort_round("again").is_err());
        assert!(matches!(
            env.settle(collected),
            Err(RoundError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn failed_settlement_commits_nothing() {
        let cfg = config(3, 3, EndowmentMode::Granted);
        let gw = gateway(all_contribute(3, InstitutionKind::Sanctioning, 10), &cfg);
        let mut env = Environment::new(cfg).unwrap();
        env.run_round(&gw).await.unwrap();
        let balances = env.ledger().balances().clone();
        let entries = env.ledger().len();
        let memberships = env.memberships().clone();

        // A contribution above the stage-1 endowment can only come from a
        // broken collector; settlement must refuse it as a whole.
        let mut collected = env.collect_round(&gw).await.unwrap();
        let decision = collected.contributions.get_mut(&AgentId(1)).unwrap();
        decision.decision = ValidatedDecision::Contribution(25);

        let result = env.settle(collected);
        assert!(matches!(
            result,
            Err(RoundError::Institution {
                source: InstitutionError::ContributionOutOfRange {
                    agent: AgentId(1),
                    amount: 25,
                    max: 20,
                }
            })
        ));
        assert_eq!(env.ledger().balances(), &balances);
        assert_eq!(env.ledger().len(), entries);
        assert_eq!(env.history().len(), 1);
        assert_eq!(env.memberships(), &memberships);
        assert_eq!(env.next_round(), 2);
        assert_eq!(env.state(), RoundState::Settlement);

        env.abort_round(result.unwrap_err().to_string()).unwrap();
        assert_eq!(env.history().len(), 2);
        let last = env.history().last().unwrap();
        assert_eq!(last.status, RoundStatus::Aborted);
        assert_eq!(last.round, 2);
        assert!(last.payoffs.is_empty());
        assert!(last.standings.is_empty());
        assert!(
            last.abort_reason
                .as_deref()
                .is_some_and(|r| r.contains("exceeds maximum"))
        );
        assert_eq!(env.ledger().balances(), &balances);
        assert!(env.is_finished());
    }

    #[tokio::test]
    async fn standings_accumulate_and_rank() {
        let cfg = config(2, 2, EndowmentMode::Granted);
        let provider =
            StubProvider::new().with_decision(AgentId(0), ProviderDecision::Contribution(20));
        let gw = gateway(provider, &cfg);
        let mut env = Environment::new(cfg).unwrap();

        // SFI, no stage-2 endowment: 20 - 20 + 16 and 20 - 0 + 16 per round.
        env.run_round(&gw).await.unwrap();
        env.run_round(&gw).await.unwrap();
        let record = env.history().last().unwrap();
        assert_eq!(
            record.standings,
            vec![
                Standing {
                    agent: AgentId(0),
                    cumulative_payoff: 32,
                    rank: 2,
                    out_of: 2,
                },
                Standing {
                    agent: AgentId(1),
                    cumulative_payoff: 72,
                    rank: 1,
                    out_of: 2,
                },
            ]
        );
    }

    #[tokio::test]
    async fn equal_totals_rank_by_agent_id() {
        let cfg = config(3, 1, EndowmentMode::Granted);
        let gw = gateway(all_contribute(3, InstitutionKind::SanctionFree, 10), &cfg);
        let mut env = Environment::new(cfg).unwrap();
        env.run_round(&gw).await.unwrap();
        let ranks: Vec<u32> = env
            .history()
            .last()
            .unwrap()
            .standings
            .iter()
            .map(|s| s.rank)
            .collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn anonymous_sanction_targets_reach_real_agents() {
        let mut cfg = config(3, 1, EndowmentMode::Granted);
        cfg.gateway.anonymize_peers = true;
        // Members 0, 1, 2 appear as labels 1, 2, 3.
        let provider = all_contribute(3, InstitutionKind::Sanctioning, 20)
            .with_decision(
                AgentId(0),
                ProviderDecision::Sanctions(vec![SanctionIntent {
                    target: AgentId(3),
                    kind: SanctionKind::Punish,
                    amount: 2,
                }]),
            )
            .with_decision(
                AgentId(1),
                ProviderDecision::Sanctions(vec![SanctionIntent {
                    target: AgentId(0),
                    kind: SanctionKind::Reward,
                    amount: 1,
                }]),
            );
        let gw = gateway(provider, &cfg);
        let mut env = Environment::new(cfg).unwrap();

        env.run_round(&gw).await.unwrap();
        let record = env.history().last().unwrap();
        let applied: Vec<(AgentId, AgentId, u64)> = record
            .sanctions
            .iter()
            .map(|s| (s.from, s.to, s.amount))
            .collect();
        assert_eq!(applied, vec![(AgentId(0), AgentId(2), 2)]);
        assert!(record.incidents.iter().any(|i| matches!(
            i,
            Incident::Rejected {
                agent: AgentId(1),
                ..
            }
        )));
        assert_eq!(record.payoff(AgentId(2)).unwrap().punishment_received, 6);
    }

    #[tokio::test]
    async fn memberships_persist_between_choice_rounds() {
        let mut cfg = config(2, 2, EndowmentMode::Granted);
        cfg.institutions.reselection_interval = 0;
        let gw = gateway(all_contribute(2, InstitutionKind::Sanctioning, 5), &cfg);
        let mut env = Environment::new(cfg).unwrap();

        env.run_round(&gw).await.unwrap();
        let summary = env.run_round(&gw).await.unwrap();
        assert!(!summary.choice_round);
        assert_eq!(
            env.memberships().get(&AgentId(1)),
            Some(&InstitutionKind::Sanctioning)
        );
        let record = env.history().last().unwrap();
        assert!(
            !record
                .decisions
                .iter()
                .any(|d| matches!(d, DecisionRecord::InstitutionChoice { .. }))
        );
    }
}
