//! Enumeration types for the Commons engine.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Institutions
// ---------------------------------------------------------------------------

/// The rule-set an agent joins for a round.
///
/// Serialized with the short codes used throughout the experiment
/// literature: `SI` and `SFI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum InstitutionKind {
    /// Sanctioning institution: contribution stage followed by costly
    /// punishment and reward.
    #[serde(rename = "SI")]
    Sanctioning,
    /// Sanction-free institution: contribution stage only.
    #[serde(rename = "SFI")]
    SanctionFree,
}

impl InstitutionKind {
    /// Both variants, in a fixed order.
    pub const ALL: [Self; 2] = [Self::Sanctioning, Self::SanctionFree];

    /// Short code (`SI` / `SFI`).
    pub const fn code(self) -> &'static str {
        match self {
            Self::Sanctioning => "SI",
            Self::SanctionFree => "SFI",
        }
    }

    /// Parse a short code, ignoring case and surrounding whitespace.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "SI" => Some(Self::Sanctioning),
            "SFI" => Some(Self::SanctionFree),
            _ => None,
        }
    }
}

impl core::fmt::Display for InstitutionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Phases and round lifecycle
// ---------------------------------------------------------------------------

/// A decision phase within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum PhaseKind {
    /// Agents pick the institution they join.
    InstitutionChoice,
    /// Agents contribute part of the stage-1 endowment to the public good.
    Contribution,
    /// Agents spend the stage-2 endowment punishing or rewarding peers.
    Sanctioning,
}

impl core::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::InstitutionChoice => "institution_choice",
            Self::Contribution => "contribution",
            Self::Sanctioning => "sanctioning",
        };
        f.write_str(name)
    }
}

/// State of the round state machine.
///
/// Transitions are strictly forward:
/// `Init -> InstitutionChoice? -> Contribution -> Sanctioning? -> Settlement -> Committed`.
/// `Aborted` is terminal and reachable from any state before `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum RoundState {
    /// No phase has started.
    Init,
    /// Collecting institution choices.
    InstitutionChoice,
    /// Collecting contributions.
    Contribution,
    /// Collecting sanctions from SI members.
    Sanctioning,
    /// Reconciling payoffs through the ledger.
    Settlement,
    /// Round appended to history.
    Committed,
    /// Round abandoned; nothing was committed.
    Aborted,
}

/// Final status of a round stored in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum RoundStatus {
    /// Payoffs were settled and committed to the ledger.
    Committed,
    /// The round was abandoned before settlement.
    Aborted,
}

// ---------------------------------------------------------------------------
// Sanctions
// ---------------------------------------------------------------------------

/// Direction of a sanction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SanctionKind {
    /// Reduce the target's payoff.
    Punish,
    /// Increase the target's payoff.
    Reward,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Category of a token ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum LedgerEntryType {
    /// Initial tokens granted when the run starts.
    Grant,
    /// Stage-1 endowment credited at the start of a round.
    EndowmentStage1,
    /// Stage-2 endowment credited to sanctioning-stage participants.
    EndowmentStage2,
    /// Tokens contributed to the public good.
    Contribution,
    /// Share of the multiplied pool paid back to a group member.
    PublicGoodShare,
    /// Tokens spent issuing punishments or rewards.
    SanctionSpend,
    /// Tokens gained from rewards received.
    RewardReceived,
    /// Tokens lost to punishments received.
    PunishmentReceived,
}

/// Which side of an account an entry type moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EntryDirection {
    /// Increases the balance.
    Credit,
    /// Decreases the balance.
    Debit,
}

impl LedgerEntryType {
    /// The balance direction every entry of this type moves.
    pub const fn direction(self) -> EntryDirection {
        match self {
            Self::Grant
            | Self::EndowmentStage1
            | Self::EndowmentStage2
            | Self::PublicGoodShare
            | Self::RewardReceived => EntryDirection::Credit,
            Self::Contribution | Self::SanctionSpend | Self::PunishmentReceived => {
                EntryDirection::Debit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn institution_codes_round_trip() {
        for kind in InstitutionKind::ALL {
            assert_eq!(InstitutionKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(InstitutionKind::from_code(" sfi "), Some(InstitutionKind::SanctionFree));
        assert_eq!(InstitutionKind::from_code("both"), None);
    }

    #[test]
    fn institution_serializes_as_code() {
        let json = serde_json::to_string(&InstitutionKind::Sanctioning).ok();
        assert_eq!(json.as_deref(), Some("\"SI\""));
    }

    #[test]
    fn entry_directions() {
        assert_eq!(LedgerEntryType::Grant.direction(), EntryDirection::Credit);
        assert_eq!(LedgerEntryType::Contribution.direction(), EntryDirection::Debit);
        assert_eq!(
            LedgerEntryType::PunishmentReceived.direction(),
            EntryDirection::Debit
        );
        assert_eq!(LedgerEntryType::RewardReceived.direction(), EntryDirection::Credit);
    }
}
