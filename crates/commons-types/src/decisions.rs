//! Decision payloads exchanged with providers and the records kept of them.
//!
//! A provider answers one request per (agent, phase) with a
//! [`ProviderResponse`]. The engine validates it and keeps what it
//! actually applied as [`DecisionRecord`] values. Anything it had to
//! correct along the way is kept as an [`Incident`] so downstream
//! analysis can see it.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{InstitutionKind, PhaseKind, SanctionKind};
use crate::ids::AgentId;

// ---------------------------------------------------------------------------
// Provider boundary
// ---------------------------------------------------------------------------

/// A single sanction as requested by a provider.
///
/// `amount` is signed because providers may return anything; the gateway
/// clamps it into the legal range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SanctionIntent {
    /// Agent receiving the sanction.
    pub target: AgentId,
    /// Punish or reward.
    pub kind: SanctionKind,
    /// Tokens the sender wants to spend on this target.
    pub amount: i64,
}

/// The value chosen by a provider, shaped per phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "phase", content = "value", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ProviderDecision {
    /// Institution the agent wants to join.
    InstitutionChoice(InstitutionKind),
    /// Tokens to contribute (unvalidated).
    Contribution(i64),
    /// Sanctions to issue, in the order the provider listed them.
    Sanctions(Vec<SanctionIntent>),
}

impl ProviderDecision {
    /// The phase this decision answers.
    pub const fn phase(&self) -> PhaseKind {
        match self {
            Self::InstitutionChoice(_) => PhaseKind::InstitutionChoice,
            Self::Contribution(_) => PhaseKind::Contribution,
            Self::Sanctions(_) => PhaseKind::Sanctioning,
        }
    }
}

/// Structured reply from a decision provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ProviderResponse {
    /// The chosen value(s).
    pub decision: ProviderDecision,
    /// Free-text rationale. Opaque to the engine.
    pub reasoning: String,
}

impl ProviderResponse {
    /// Build a response with the given decision and rationale.
    pub fn new(decision: ProviderDecision, reasoning: impl Into<String>) -> Self {
        Self {
            decision,
            reasoning: reasoning.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Applied decisions
// ---------------------------------------------------------------------------

/// A decision as applied by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum DecisionRecord {
    /// Institution membership chosen for the round.
    InstitutionChoice {
        /// The choosing agent.
        agent: AgentId,
        /// The institution joined.
        variant: InstitutionKind,
        /// Provider rationale.
        reasoning: String,
        /// Whether the configured default replaced the provider's answer.
        fallback: bool,
    },
    /// Tokens contributed to the group's public good.
    Contribution {
        /// The contributing agent.
        agent: AgentId,
        /// Tokens contributed after validation.
        amount: u64,
        /// Provider rationale.
        reasoning: String,
        /// Whether the configured default replaced the provider's answer.
        fallback: bool,
    },
    /// Tokens spent sanctioning one peer.
    Sanction {
        /// The agent paying for the sanction.
        from_agent: AgentId,
        /// The agent being sanctioned.
        to_agent: AgentId,
        /// Punish or reward.
        kind: SanctionKind,
        /// Tokens spent after validation.
        amount: u64,
        /// Provider rationale for the whole sanction decision.
        reasoning: String,
    },
}

impl DecisionRecord {
    /// The agent that made this decision.
    pub const fn agent(&self) -> AgentId {
        match self {
            Self::InstitutionChoice { agent, .. } | Self::Contribution { agent, .. } => *agent,
            Self::Sanction { from_agent, .. } => *from_agent,
        }
    }
}

/// A non-fatal correction the engine made to a provider's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Incident {
    /// A value outside its legal range was clamped to the nearest bound.
    Clamped {
        /// Agent whose decision was clamped.
        agent: AgentId,
        /// Phase of the decision.
        phase: PhaseKind,
        /// What was clamped (e.g. `"contribution"`, `"sanction:3"`).
        field: String,
        /// Value the provider asked for.
        requested: i64,
        /// Value the engine applied.
        applied: u64,
    },
    /// Part or all of a decision was discarded as invalid.
    Rejected {
        /// Agent whose decision was rejected.
        agent: AgentId,
        /// Phase of the decision.
        phase: PhaseKind,
        /// Why it was discarded.
        reason: String,
    },
    /// The provider failed and the configured default was substituted.
    Fallback {
        /// Agent whose provider failed.
        agent: AgentId,
        /// Phase of the decision.
        phase: PhaseKind,
        /// Failure description (timeout, malformed output, ...).
        cause: String,
    },
}

impl Incident {
    /// The agent this incident concerns.
    pub const fn agent(&self) -> AgentId {
        match self {
            Self::Clamped { agent, .. }
            | Self::Rejected { agent, .. }
            | Self::Fallback { agent, .. } => *agent,
        }
    }

    /// Whether this incident marks its round as degraded.
    pub const fn degrades_round(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}
