//! Decision gateway: the boundary between the engine and decision providers.
//!
//! Every decision an agent makes passes through [`DecisionGateway::request`],
//! which:
//!
//! 1. Calls the [`DecisionProvider`] under `decision_timeout_ms`.
//! 2. Substitutes the configured default on timeout, provider failure, or a
//!    reply for the wrong phase, recording an [`Incident::Fallback`].
//! 3. Clamps out-of-range values to the nearest legal value, recording an
//!    [`Incident::Clamped`].
//! 4. Maps sanction targets named by anonymous [`PeerLabels`] back to real
//!    agents.
//!
//! [`DecisionGateway::collect`] issues all requests of one phase
//! concurrently (bounded by `parallelism`) and returns once every agent has
//! a decision or a fallback. Results are keyed by agent, so completion
//! order never reaches the institutions.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use commons_types::{
    AgentId, GroupSummary, Incident, InstitutionKind, OutputRecord, PeerRound, PhaseKind,
    ProviderDecision, ProviderResponse, Standing,
};

use crate::config::GatewayConfig;
use crate::institution::SanctionOrder;
use crate::parse::parse_provider_reply;

/// Errors a decision provider can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider did not answer within the deadline.
    #[error("agent {agent} timed out in {phase} phase (deadline: {deadline_ms}ms)")]
    Timeout {
        /// The agent that timed out.
        agent: AgentId,
        /// The phase being decided.
        phase: PhaseKind,
        /// The deadline in milliseconds.
        deadline_ms: u64,
    },

    /// The provider answered with something that is not a decision.
    #[error("malformed provider output: {message}")]
    Malformed {
        /// Description of what could not be parsed.
        message: String,
    },

    /// The provider could not be reached.
    #[error("provider transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// The provider answered a different phase than was asked.
    #[error("expected a {expected} decision, provider returned {got}")]
    PhaseMismatch {
        /// The phase requested.
        expected: PhaseKind,
        /// The phase answered.
        got: PhaseKind,
    },
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Inclusive legal range for a numeric decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegalRange {
    /// Smallest legal value.
    pub min: u64,
    /// Largest legal value.
    pub max: u64,
}

impl LegalRange {
    /// Create a range; an inverted range collapses to `min`.
    pub const fn new(min: u64, max: u64) -> Self {
        if max < min {
            Self { min, max: min }
        } else {
            Self { min, max }
        }
    }

    /// Clamp a requested value to the nearest legal value.
    pub fn clamp(&self, value: i64) -> u64 {
        u64::try_from(value).map_or(self.min, |v| self.clamp_u64(v))
    }

    /// Clamp an unsigned value to the range.
    pub const fn clamp_u64(&self, value: u64) -> u64 {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }

    /// Whether `value` is already legal.
    pub const fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// How the agents in one request are named.
///
/// The identity mapping shows real ids. An anonymous mapping numbers the
/// group `1..=n` in ascending id order for this request only; providers
/// answer in labels and the gateway resolves them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLabels {
    real_by_label: BTreeMap<AgentId, AgentId>,
}

impl PeerLabels {
    /// Real ids, unchanged.
    pub const fn identity() -> Self {
        Self {
            real_by_label: BTreeMap::new(),
        }
    }

    /// Number `members` from 1 in the order given.
    pub fn anonymous(members: &[AgentId]) -> Self {
        Self {
            real_by_label: (1_u32..).map(AgentId).zip(members.iter().copied()).collect(),
        }
    }

    /// Whether real ids are hidden.
    pub fn is_anonymous(&self) -> bool {
        !self.real_by_label.is_empty()
    }

    /// The label `agent` appears under. Agents outside an anonymous
    /// mapping keep their id.
    pub fn label_of(&self, agent: AgentId) -> AgentId {
        self.real_by_label
            .iter()
            .find(|(_, real)| **real == agent)
            .map_or(agent, |(label, _)| *label)
    }

    /// The real agent behind `label`, or `None` for an unknown label.
    pub fn resolve(&self, label: AgentId) -> Option<AgentId> {
        if self.is_anonymous() {
            self.real_by_label.get(&label).copied()
        } else {
            Some(label)
        }
    }
}

/// What an agent may see when deciding.
///
/// Contains the agent's own history, its peers' rounds without their
/// identities, and round-level aggregates. Other agents' reasoning is never
/// included. Under anonymous [`PeerLabels`], `group_members`,
/// `group_contributions`, and `self_label` use labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionContext {
    /// The agent's balance before this round settles.
    pub balance: u64,
    /// The institution the agent belongs to this round, once known.
    pub institution: Option<InstitutionKind>,
    /// The id the agent appears under in this context.
    pub self_label: Option<AgentId>,
    /// Current members of the agent's group.
    pub group_members: Vec<AgentId>,
    /// The agent's own recent rounds, oldest first.
    pub own_history: Vec<OutputRecord>,
    /// Every other agent's recent rounds, anonymised, oldest first.
    pub peer_history: Vec<PeerRound>,
    /// Cumulative payoff and rank after the last committed round.
    pub standing: Option<Standing>,
    /// Per-institution aggregates from the previous round.
    pub previous_round: Vec<GroupSummary>,
    /// Contributions made in the agent's group this round (sanction phase only).
    pub group_contributions: BTreeMap<AgentId, u64>,
    /// Stage-1 endowment.
    pub endowment_stage_1: u64,
    /// Stage-2 endowment.
    pub endowment_stage_2: u64,
    /// Public-good multiplier.
    pub multiplier: Decimal,
    /// Payoff reduction per punishment token.
    pub punishment_effect: u64,
    /// Payoff increase per reward token.
    pub reward_effect: u64,
    /// Total rounds in the run.
    pub total_rounds: u32,
}

/// One call across the decision boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRequest {
    /// The deciding agent.
    pub agent: AgentId,
    /// The round being played.
    pub round: u32,
    /// The phase being decided.
    pub phase: PhaseKind,
    /// Legal range for numeric decisions. For sanctions, `max` is the
    /// budget for the whole decision.
    pub legal_range: Option<LegalRange>,
    /// Visible information.
    pub context: DecisionContext,
    /// How sanction targets in the reply are resolved. Never shown to
    /// the provider.
    #[serde(skip)]
    pub peer_labels: PeerLabels,
}

impl DecisionRequest {
    /// The id the deciding agent appears under in its context.
    pub fn own_label(&self) -> AgentId {
        self.context.self_label.unwrap_or(self.agent)
    }
}

/// A source of agent decisions.
///
/// Implementations might wrap a language model, a scripted policy, a human
/// player, or a test stub. A provider only answers; validation, clamping,
/// and fallback are the gateway's job.
pub trait DecisionProvider: Send + Sync {
    /// Produce a decision for one request.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if no decision can be produced. The gateway
    /// substitutes the configured default.
    fn decide(
        &self,
        request: &DecisionRequest,
    ) -> impl Future<Output = Result<ProviderResponse, ProviderError>> + Send;
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// A provider answering from a script.
///
/// Unscripted requests get the passive answer: `SFI`, contribution `0`,
/// no sanctions. Used in tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StubProvider {
    responses: BTreeMap<(AgentId, PhaseKind), ProviderResponse>,
    failures: BTreeMap<(AgentId, PhaseKind), ProviderError>,
    delays: BTreeMap<AgentId, Duration>,
}

impl StubProvider {
    /// Create an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `phase` for `agent` with `decision`.
    #[must_use]
    pub fn with_decision(mut self, agent: AgentId, decision: ProviderDecision) -> Self {
        let phase = decision.phase();
        self.failures.remove(&(agent, phase));
        self.responses
            .insert((agent, phase), ProviderResponse::new(decision, "scripted"));
        self
    }

    /// Answer `phase` for `agent` with the parse of `raw` provider text.
    #[must_use]
    pub fn with_raw(mut self, agent: AgentId, phase: PhaseKind, raw: &str) -> Self {
        match parse_provider_reply(phase, raw) {
            Ok(response) => {
                self.failures.remove(&(agent, phase));
                self.responses.insert((agent, phase), response);
            }
            Err(e) => {
                self.responses.remove(&(agent, phase));
                self.failures.insert((agent, phase), e);
            }
        }
        self
    }

    /// Fail `phase` for `agent` with `error`.
    #[must_use]
    pub fn with_failure(mut self, agent: AgentId, phase: PhaseKind, error: ProviderError) -> Self {
        self.responses.remove(&(agent, phase));
        self.failures.insert((agent, phase), error);
        self
    }

    /// Delay every answer for `agent`.
    #[must_use]
    pub fn with_delay(mut self, agent: AgentId, delay: Duration) -> Self {
        self.delays.insert(agent, delay);
        self
    }

    fn passive(phase: PhaseKind) -> ProviderResponse {
        let decision = match phase {
            PhaseKind::InstitutionChoice => {
                ProviderDecision::InstitutionChoice(InstitutionKind::SanctionFree)
            }
            PhaseKind::Contribution => ProviderDecision::Contribution(0),
            PhaseKind::Sanctioning => ProviderDecision::Sanctions(Vec::new()),
        };
        ProviderResponse::new(decision, "no scripted decision")
    }
}

impl DecisionProvider for StubProvider {
    async fn decide(&self, request: &DecisionRequest) -> Result<ProviderResponse, ProviderError> {
        if let Some(delay) = self.delays.get(&request.agent) {
            tokio::time::sleep(*delay).await;
        }
        let key = (request.agent, request.phase);
        if let Some(error) = self.failures.get(&key) {
            return Err(error.clone());
        }
        Ok(self
            .responses
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Self::passive(request.phase)))
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Default actions substituted when a provider fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultDecisions {
    /// Institution chosen on failure.
    pub institution: InstitutionKind,
    /// Contribution made on failure (clamped to the legal range).
    pub contribution: u64,
}

impl From<&GatewayConfig> for DefaultDecisions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            institution: config.default_institution,
            contribution: config.default_contribution,
        }
    }
}

/// A decision after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedDecision {
    /// Institution for the coming rounds.
    InstitutionChoice(InstitutionKind),
    /// Contribution within the legal range.
    Contribution(u64),
    /// Sanctions with negative amounts floored at zero and targets resolved
    /// to real agents. Targets and budget are checked later by the
    /// institution.
    Sanctions(Vec<SanctionOrder>),
}

/// The gateway's answer for one agent and phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDecision {
    /// The deciding agent.
    pub agent: AgentId,
    /// The phase decided.
    pub phase: PhaseKind,
    /// The validated decision.
    pub decision: ValidatedDecision,
    /// Free-text rationale from the provider (empty on fallback).
    pub reasoning: String,
    /// Whether the default action was substituted.
    pub fallback: bool,
    /// Clamp and fallback incidents raised for this decision.
    pub incidents: Vec<Incident>,
}

impl GatewayDecision {
    /// The chosen institution, for institution-choice decisions.
    pub const fn institution(&self) -> Option<InstitutionKind> {
        match self.decision {
            ValidatedDecision::InstitutionChoice(kind) => Some(kind),
            _ => None,
        }
    }

    /// The contribution, for contribution decisions.
    pub const fn contribution(&self) -> Option<u64> {
        match self.decision {
            ValidatedDecision::Contribution(amount) => Some(amount),
            _ => None,
        }
    }

    /// The sanction orders, empty for other phases.
    pub fn sanctions(&self) -> &[SanctionOrder] {
        match &self.decision {
            ValidatedDecision::Sanctions(orders) => orders,
            _ => &[],
        }
    }
}

/// Validating, time-bounded access to a [`DecisionProvider`].
#[derive(Debug)]
pub struct DecisionGateway<P> {
    provider: P,
    decision_timeout: Duration,
    parallelism: usize,
    defaults: DefaultDecisions,
}

impl<P: DecisionProvider> DecisionGateway<P> {
    /// Create a gateway from the `gateway` config section.
    pub fn new(provider: P, config: &GatewayConfig) -> Self {
        Self {
            provider,
            decision_timeout: Duration::from_millis(config.decision_timeout_ms),
            parallelism: config.parallelism.max(1),
            defaults: DefaultDecisions::from(config),
        }
    }

    /// The wrapped provider.
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Request and validate one decision. Never fails: provider problems
    /// become fallbacks.
    pub async fn request(&self, request: &DecisionRequest) -> GatewayDecision {
        let outcome = match timeout(self.decision_timeout, self.provider.decide(request)).await {
            Ok(Ok(response)) => self.validate(request, response),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout {
                agent: request.agent,
                phase: request.phase,
                deadline_ms: u64::try_from(self.decision_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        match outcome {
            Ok(decision) => {
                debug!(
                    agent = %request.agent,
                    round = request.round,
                    phase = %request.phase,
                    decision = ?decision.decision,
                    clamped = decision.incidents.len(),
                    "decision received"
                );
                decision
            }
            Err(e) => {
                warn!(
                    agent = %request.agent,
                    round = request.round,
                    phase = %request.phase,
                    error = %e,
                    "decision failed, substituting default"
                );
                self.fallback(request, &e)
            }
        }
    }

    /// Request decisions for every request concurrently, at most
    /// `parallelism` in flight, and wait for all of them.
    pub async fn collect(&self, requests: &[DecisionRequest]) -> BTreeMap<AgentId, GatewayDecision> {
        futures::stream::iter(requests)
            .map(|request| self.request(request))
            .buffer_unordered(self.parallelism)
            .map(|decision| (decision.agent, decision))
            .collect()
            .await
    }

    fn validate(
        &self,
        request: &DecisionRequest,
        response: ProviderResponse,
    ) -> Result<GatewayDecision, ProviderError> {
        let got = response.decision.phase();
        if got != request.phase {
            return Err(ProviderError::PhaseMismatch {
                expected: request.phase,
                got,
            });
        }

        let range = request.legal_range.unwrap_or_default();
        let mut incidents = Vec::new();
        let decision = match response.decision {
            ProviderDecision::InstitutionChoice(kind) => ValidatedDecision::InstitutionChoice(kind),
            ProviderDecision::Contribution(requested) => {
                let applied = range.clamp(requested);
                if i64::try_from(applied).ok() != Some(requested) {
                    incidents.push(clamped(request, "contribution".to_owned(), requested, applied));
                }
                ValidatedDecision::Contribution(applied)
            }
            ProviderDecision::Sanctions(intents) => {
                // Amounts are only floored here; the budget belongs to the
                // institution, which sees the requested total.
                let mut orders = Vec::with_capacity(intents.len());
                for intent in intents {
                    let applied = u64::try_from(intent.amount).unwrap_or(0);
                    if intent.amount < 0 {
                        incidents.push(clamped(
                            request,
                            format!("sanction:{}", intent.target),
                            intent.amount,
                            applied,
                        ));
                    }
                    let Some(target) = request.peer_labels.resolve(intent.target) else {
                        incidents.push(Incident::Rejected {
                            agent: request.agent,
                            phase: request.phase,
                            reason: format!("unknown sanction target {}", intent.target),
                        });
                        continue;
                    };
                    if applied > 0 {
                        orders.push(SanctionOrder {
                            from: request.agent,
                            to: target,
                            kind: intent.kind,
                            amount: applied,
                        });
                    }
                }
                ValidatedDecision::Sanctions(orders)
            }
        };

        for incident in &incidents {
            warn!(agent = %request.agent, round = request.round, incident = ?incident, "decision adjusted");
        }

        Ok(GatewayDecision {
            agent: request.agent,
            phase: request.phase,
            decision,
            reasoning: response.reasoning,
            fallback: false,
            incidents,
        })
    }

    fn fallback(&self, request: &DecisionRequest, error: &ProviderError) -> GatewayDecision {
        let decision = match request.phase {
            PhaseKind::InstitutionChoice => {
                ValidatedDecision::InstitutionChoice(self.defaults.institution)
            }
            PhaseKind::Contribution => ValidatedDecision::Contribution(
                request
                    .legal_range
                    .unwrap_or_default()
                    .clamp_u64(self.defaults.contribution),
            ),
            PhaseKind::Sanctioning => ValidatedDecision::Sanctions(Vec::new()),
        };
        GatewayDecision {
            agent: request.agent,
            phase: request.phase,
            decision,
            reasoning: String::new(),
            fallback: true,
            incidents: vec![Incident::Fallback {
                agent: request.agent,
                phase: request.phase,
                cause: error.to_string(),
            }],
        }
    }
}

fn clamped(request: &DecisionRequest, field: String, requested: i64, applied: u64) -> Incident {
    Incident::Clamped {
        agent: request.agent,
        phase: request.phase,
        field,
        requested,
        applied,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use commons_types::{SanctionIntent, SanctionKind};

    use super::*;

    fn request(agent: u32, phase: PhaseKind, range: Option<LegalRange>) -> DecisionRequest {
        DecisionRequest {
            agent: AgentId(agent),
            round: 1,
            phase,
            legal_range: range,
            context: DecisionContext::default(),
            peer_labels: PeerLabels::identity(),
        }
    }

    fn punish(target: u32, amount: i64) -> SanctionIntent {
        SanctionIntent {
            target: AgentId(target),
            kind: SanctionKind::Punish,
            amount,
        }
    }

    fn gateway(provider: StubProvider, timeout_ms: u64) -> DecisionGateway<StubProvider> {
        let config = GatewayConfig {
            decision_timeout_ms: timeout_ms,
            ..GatewayConfig::default()
        };
        DecisionGateway::new(provider, &config)
    }

    #[test]
    fn legal_range_clamps() {
        let range = LegalRange::new(0, 20);
        assert_eq!(range.clamp(9999), 20);
        assert_eq!(range.clamp(-5), 0);
        assert_eq!(range.clamp(7), 7);
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert_eq!(LegalRange::new(5, 2), LegalRange { min: 5, max: 5 });
    }

    #[tokio::test]
    async fn in_range_contribution_passes_through() {
        let provider = StubProvider::new().with_decision(AgentId(0), ProviderDecision::Contribution(12));
        let gw = gateway(provider, 1000);
        let decision = gw
            .request(&request(0, PhaseKind::Contribution, Some(LegalRange::new(0, 20))))
            .await;
        assert_eq!(decision.contribution(), Some(12));
        assert!(!decision.fallback);
        assert!(decision.incidents.is_empty());
    }

    #[tokio::test]
    async fn oversized_contribution_is_clamped_with_incident() {
        let provider =
            StubProvider::new().with_decision(AgentId(0), ProviderDecision::Contribution(9999));
        let gw = gateway(provider, 1000);
        let decision = gw
            .request(&request(0, PhaseKind::Contribution, Some(LegalRange::new(0, 20))))
            .await;
        assert_eq!(decision.contribution(), Some(20));
        assert!(!decision.fallback);
        assert_eq!(
            decision.incidents,
            vec![Incident::Clamped {
                agent: AgentId(0),
                phase: PhaseKind::Contribution,
                field: "contribution".to_owned(),
                requested: 9999,
                applied: 20,
            }]
        );
    }

    #[tokio::test]
    async fn timeout_substitutes_default() {
        let provider = StubProvider::new()
            .with_decision(AgentId(0), ProviderDecision::Contribution(15))
            .with_delay(AgentId(0), Duration::from_millis(500));
        let gw = gateway(provider, 20);
        let decision = gw
            .request(&request(0, PhaseKind::Contribution, Some(LegalRange::new(0, 20))))
            .await;
        assert!(decision.fallback);
        assert_eq!(decision.contribution(), Some(0));
        assert!(matches!(
            decision.incidents.as_slice(),
            [Incident::Fallback { .. }]
        ));
    }

    #[tokio::test]
    async fn malformed_reply_substitutes_default_institution() {
        let provider =
            StubProvider::new().with_raw(AgentId(1), PhaseKind::InstitutionChoice, "no idea");
        let gw = gateway(provider, 1000);
        let decision = gw
            .request(&request(1, PhaseKind::InstitutionChoice, None))
            .await;
        assert!(decision.fallback);
        assert_eq!(decision.institution(), Some(InstitutionKind::SanctionFree));
    }

    /// Always answers the institution-choice phase, whatever was asked.
    struct WrongPhase(StubProvider);

    impl DecisionProvider for WrongPhase {
        async fn decide(&self, request: &DecisionRequest) -> Result<ProviderResponse, ProviderError> {
            let mut asked = request.clone();
            asked.phase = PhaseKind::InstitutionChoice;
            self.0.decide(&asked).await
        }
    }

    #[tokio::test]
    async fn phase_mismatch_is_a_fallback() {
        let provider = StubProvider::new().with_decision(
            AgentId(0),
            ProviderDecision::InstitutionChoice(InstitutionKind::Sanctioning),
        );
        let gw = DecisionGateway::new(WrongPhase(provider), &GatewayConfig::default());
        let decision = gw
            .request(&request(0, PhaseKind::Contribution, Some(LegalRange::new(0, 20))))
            .await;
        assert!(decision.fallback);
        let Some(Incident::Fallback { cause, .. }) = decision.incidents.first() else {
            return;
        };
        assert!(cause.contains("expected a"));
    }

    #[tokio::test]
    async fn sanction_amounts_are_floored_at_zero_only() {
        let provider = StubProvider::new().with_decision(
            AgentId(0),
            ProviderDecision::Sanctions(vec![
                SanctionIntent {
                    target: AgentId(1),
                    kind: SanctionKind::Punish,
                    amount: 50,
                },
                SanctionIntent {
                    target: AgentId(2),
                    kind: SanctionKind::Reward,
                    amount: -3,
                },
                SanctionIntent {
                    target: AgentId(3),
                    kind: SanctionKind::Reward,
                    amount: 4,
                },
            ]),
        );
        let gw = gateway(provider, 1000);
        let decision = gw
            .request(&request(0, PhaseKind::Sanctioning, Some(LegalRange::new(0, 20))))
            .await;
        let amounts: Vec<(AgentId, u64)> =
            decision.sanctions().iter().map(|o| (o.to, o.amount)).collect();
        // The budget of 20 is left to the institution.
        assert_eq!(amounts, vec![(AgentId(1), 50), (AgentId(3), 4)]);
        assert_eq!(
            decision.incidents,
            vec![Incident::Clamped {
                agent: AgentId(0),
                phase: PhaseKind::Sanctioning,
                field: "sanction:2".to_owned(),
                requested: -3,
                applied: 0,
            }]
        );
        assert!(decision.sanctions().iter().all(|o| o.from == AgentId(0)));
    }

    #[test]
    fn peer_labels_number_members_from_one() {
        let labels = PeerLabels::anonymous(&[AgentId(4), AgentId(7), AgentId(9)]);
        assert!(labels.is_anonymous());
        assert_eq!(labels.label_of(AgentId(7)), AgentId(2));
        assert_eq!(labels.resolve(AgentId(3)), Some(AgentId(9)));
        assert_eq!(labels.resolve(AgentId(0)), None);
        assert_eq!(labels.resolve(AgentId(4)), None);

        let identity = PeerLabels::identity();
        assert!(!identity.is_anonymous());
        assert_eq!(identity.label_of(AgentId(7)), AgentId(7));
        assert_eq!(identity.resolve(AgentId(12)), Some(AgentId(12)));
    }

    #[tokio::test]
    async fn anonymous_targets_resolve_to_real_agents() {
        let provider = StubProvider::new().with_decision(
            AgentId(4),
            ProviderDecision::Sanctions(vec![punish(2, 3), punish(5, 1)]),
        );
        let gw = gateway(provider, 1000);
        let mut req = request(4, PhaseKind::Sanctioning, Some(LegalRange::new(0, 20)));
        req.peer_labels = PeerLabels::anonymous(&[AgentId(4), AgentId(7), AgentId(9)]);
        req.context.self_label = Some(req.peer_labels.label_of(AgentId(4)));
        assert_eq!(req.own_label(), AgentId(1));

        let decision = gw.request(&req).await;
        let targets: Vec<(AgentId, u64)> =
            decision.sanctions().iter().map(|o| (o.to, o.amount)).collect();
        assert_eq!(targets, vec![(AgentId(7), 3)]);
        assert!(matches!(
            decision.incidents.as_slice(),
            [Incident::Rejected { agent: AgentId(4), .. }]
        ));
    }

    #[test]
    fn peer_labels_are_not_serialized() {
        let mut req = request(4, PhaseKind::Sanctioning, None);
        req.peer_labels = PeerLabels::anonymous(&[AgentId(4), AgentId(7)]);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("peer_labels").is_none());
        assert!(json.get("context").is_some());
    }

    #[tokio::test]
    async fn collect_waits_for_every_agent() {
        let provider = StubProvider::new()
            .with_decision(AgentId(0), ProviderDecision::Contribution(5))
            .with_delay(AgentId(0), Duration::from_millis(30))
            .with_decision(AgentId(1), ProviderDecision::Contribution(6))
            .with_decision(AgentId(2), ProviderDecision::Contribution(7))
            .with_delay(AgentId(2), Duration::from_millis(10));
        let gw = gateway(provider, 1000);
        let requests: Vec<DecisionRequest> = (0..3)
            .map(|a| request(a, PhaseKind::Contribution, Some(LegalRange::new(0, 20))))
            .collect();
        let decisions = gw.collect(&requests).await;
        let contributions: Vec<(AgentId, Option<u64>)> = decisions
            .values()
            .map(|d| (d.agent, d.contribution()))
            .collect();
        assert_eq!(
            contributions,
            vec![
                (AgentId(0), Some(5)),
                (AgentId(1), Some(6)),
                (AgentId(2), Some(7)),
            ]
        );
    }
}
