//! The token ledger: balances plus an append-only log of every movement.
//!
//! # Design
//!
//! - **Append-only**: entries are never modified or deleted.
//! - **Integers only**: balances and amounts are `u64`; overflow is an error.
//! - **Atomic settlement**: [`TokenLedger::apply_batch`] works on a scratch
//!   copy of the balances and only swaps it in when every posting applied.
//! - **Replayable**: [`balance_from_entries`] rebuilds any balance from the log.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use commons_types::{AgentId, EntryDirection, LedgerEntry, LedgerEntryId, LedgerEntryType};

use crate::reconcile::{ReconciliationResult, RoundExpectation, verify_round};
use crate::{LedgerError, Posting, PostingBuilder};

// ---------------------------------------------------------------------------
// Batch receipt
// ---------------------------------------------------------------------------

/// What [`TokenLedger::apply_batch`] actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    /// Number of entries appended.
    pub entries_posted: usize,
    /// Punishment tokens that could not be applied because the target's
    /// balance reached zero, per agent.
    pub floor_adjustments: BTreeMap<AgentId, u64>,
}

impl BatchReceipt {
    /// Floor adjustment for one agent (zero if none).
    pub fn floor_adjustment(&self, agent: AgentId) -> u64 {
        self.floor_adjustments.get(&agent).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Per-agent token balances backed by an append-only entry log.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    /// Current balance per agent.
    balances: BTreeMap<AgentId, u64>,
    /// All entries, in posting order.
    entries: Vec<LedgerEntry>,
}

impl TokenLedger {
    /// Create an empty ledger.
    pub const fn new() -> Self {
        Self {
            balances: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    /// Open an account for `agent` holding `initial` tokens.
    ///
    /// A non-zero initial amount is recorded as a `Grant` entry in round 0.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DuplicateAgent`] if the account already exists.
    pub fn open_account(&mut self, agent: AgentId, initial: u64) -> Result<(), LedgerError> {
        if self.balances.contains_key(&agent) {
            return Err(LedgerError::DuplicateAgent { agent });
        }
        self.balances.insert(agent, 0);
        if initial > 0 {
            let posting = PostingBuilder::new(LedgerEntryType::Grant)
                .agent(agent)
                .amount(initial)
                .reason("initial tokens")
                .build()?;
            self.apply_batch(0, vec![posting])?;
        }
        Ok(())
    }

    /// Current balance of `agent`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownAgent`] if no account exists.
    pub fn balance(&self, agent: AgentId) -> Result<u64, LedgerError> {
        self.balances
            .get(&agent)
            .copied()
            .ok_or(LedgerError::UnknownAgent { agent })
    }

    /// All balances in ascending agent order.
    pub const fn balances(&self) -> &BTreeMap<AgentId, u64> {
        &self.balances
    }

    /// Sum of all balances.
    pub fn total_supply(&self) -> Option<u64> {
        self.balances
            .values()
            .try_fold(0_u64, |acc, b| acc.checked_add(*b))
    }

    /// Credit `amount` to `agent` as a single-entry batch.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DirectionMismatch`] if `entry_type` is a debit
    /// type, plus any error from [`PostingBuilder::build`] or
    /// [`TokenLedger::apply_batch`].
    pub fn credit(
        &mut self,
        round: u32,
        agent: AgentId,
        entry_type: LedgerEntryType,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        if entry_type.direction() != EntryDirection::Credit {
            return Err(LedgerError::DirectionMismatch {
                entry_type,
                attempted: "credit",
            });
        }
        self.post_single(round, agent, entry_type, amount)
    }

    /// Debit `amount` from `agent` as a single-entry batch.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientFunds`] if the balance is too low,
    /// [`LedgerError::DirectionMismatch`] for credit types.
    pub fn debit(
        &mut self,
        round: u32,
        agent: AgentId,
        entry_type: LedgerEntryType,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        if entry_type.direction() != EntryDirection::Debit {
            return Err(LedgerError::DirectionMismatch {
                entry_type,
                attempted: "debit",
            });
        }
        self.post_single(round, agent, entry_type, amount)
    }

    fn post_single(
        &mut self,
        round: u32,
        agent: AgentId,
        entry_type: LedgerEntryType,
        amount: u64,
    ) -> Result<u64, LedgerError> {
        let posting = PostingBuilder::new(entry_type)
            .agent(agent)
            .amount(amount)
            .reason(format!("{entry_type:?}"))
            .build()?;
        self.apply_batch(round, vec![posting])?;
        self.balance(agent)
    }

    /// Apply a whole settlement atomically.
    ///
    /// Postings are applied in three passes so the outcome does not depend
    /// on their order: credits, then ordinary debits, then punishments.
    /// A `PunishmentReceived` posting larger than the remaining balance is
    /// reduced to that balance and the difference reported in the receipt.
    /// On any error nothing is applied.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownAgent`], [`LedgerError::Overflow`], or
    /// [`LedgerError::InsufficientFunds`] for an ordinary debit past zero.
    pub fn apply_batch(
        &mut self,
        round: u32,
        postings: Vec<Posting>,
    ) -> Result<BatchReceipt, LedgerError> {
        let mut scratch = self.balances.clone();
        let mut staged: Vec<LedgerEntry> = Vec::with_capacity(postings.len());
        let mut receipt = BatchReceipt::default();

        let (credits, debits): (Vec<Posting>, Vec<Posting>) = postings
            .into_iter()
            .partition(|p| p.direction() == EntryDirection::Credit);
        let (punishments, debits): (Vec<Posting>, Vec<Posting>) = debits
            .into_iter()
            .partition(|p| p.entry_type() == LedgerEntryType::PunishmentReceived);

        for posting in credits {
            let agent = posting.agent();
            let balance = scratch
                .get_mut(&agent)
                .ok_or(LedgerError::UnknownAgent { agent })?;
            *balance = balance
                .checked_add(posting.amount())
                .ok_or(LedgerError::Overflow { agent })?;
            staged.push(make_entry(round, &posting, posting.amount()));
        }

        for posting in debits {
            let agent = posting.agent();
            let balance = scratch
                .get_mut(&agent)
                .ok_or(LedgerError::UnknownAgent { agent })?;
            *balance = balance
                .checked_sub(posting.amount())
                .ok_or(LedgerError::InsufficientFunds {
                    agent,
                    balance: *balance,
                    requested: posting.amount(),
                })?;
            staged.push(make_entry(round, &posting, posting.amount()));
        }

        for posting in punishments {
            let agent = posting.agent();
            let balance = scratch
                .get_mut(&agent)
                .ok_or(LedgerError::UnknownAgent { agent })?;
            let applied = posting.amount().min(*balance);
            let shortfall = posting.amount().saturating_sub(applied);
            *balance = balance.saturating_sub(applied);
            if shortfall > 0 {
                let adj = receipt.floor_adjustments.entry(agent).or_insert(0);
                *adj = adj
                    .checked_add(shortfall)
                    .ok_or(LedgerError::Overflow { agent })?;
            }
            if applied > 0 {
                staged.push(make_entry(round, &posting, applied));
            }
        }

        for (agent, adjustment) in &receipt.floor_adjustments {
            warn!(
                round,
                agent = agent.index(),
                adjustment,
                "punishment clamped at zero balance"
            );
        }

        receipt.entries_posted = staged.len();
        self.balances = scratch;
        self.entries.extend(staged);

        debug!(round, entries = receipt.entries_posted, "ledger batch applied");
        Ok(receipt)
    }

    /// Reconcile the entries of `expected.round` against computed payoffs.
    pub fn verify_round(&self, expected: &RoundExpectation) -> ReconciliationResult {
        verify_round(expected, &self.entries)
    }

    /// All entries posted in `round`.
    pub fn entries_for_round(&self, round: u32) -> Vec<&LedgerEntry> {
        self.entries.iter().filter(|e| e.round == round).collect()
    }

    /// All entries, in posting order.
    pub fn all_entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Number of entries in the log.
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild every balance from the log.
    ///
    /// Returns `None` on overflow or if an entry would drive a balance
    /// negative, either of which means the log is corrupt.
    pub fn replayed_balances(&self) -> Option<BTreeMap<AgentId, u64>> {
        self.balances
            .keys()
            .map(|agent| balance_from_entries(&self.entries, *agent).map(|b| (*agent, b)))
            .collect()
    }
}

/// Replay `entries` to compute the balance of `agent`.
///
/// Returns `None` on overflow or if the running balance would go negative.
pub fn balance_from_entries(entries: &[LedgerEntry], agent: AgentId) -> Option<u64> {
    entries
        .iter()
        .filter(|e| e.agent == agent)
        .try_fold(0_u64, |balance, entry| match entry.entry_type.direction() {
            EntryDirection::Credit => balance.checked_add(entry.amount),
            EntryDirection::Debit => balance.checked_sub(entry.amount),
        })
}

fn make_entry(round: u32, posting: &Posting, amount: u64) -> LedgerEntry {
    LedgerEntry {
        id: LedgerEntryId::new(),
        round,
        agent: posting.agent(),
        entry_type: posting.entry_type(),
        amount,
        reason: posting.reason().to_owned(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn posting(entry_type: LedgerEntryType, agent: u32, amount: u64) -> Posting {
        PostingBuilder::new(entry_type)
            .agent(AgentId(agent))
            .amount(amount)
            .reason("test")
            .build()
            .unwrap()
    }

    fn ledger_with(agents: &[(u32, u64)]) -> TokenLedger {
        let mut ledger = TokenLedger::new();
        for (agent, initial) in agents {
            ledger.open_account(AgentId(*agent), *initial).unwrap();
        }
        ledger
    }

    #[test]
    fn open_account_records_grant() {
        let ledger = ledger_with(&[(0, 1000)]);
        assert_eq!(ledger.balance(AgentId(0)).unwrap(), 1000);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.entries_for_round(0).len(), 1);
        assert_eq!(
            ledger.all_entries().first().map(|e| e.entry_type),
            Some(LedgerEntryType::Grant)
        );
    }

    #[test]
    fn duplicate_account_rejected() {
        let mut ledger = ledger_with(&[(0, 10)]);
        let result = ledger.open_account(AgentId(0), 10);
        assert!(matches!(result, Err(LedgerError::DuplicateAgent { .. })));
    }

    #[test]
    fn zero_initial_opens_empty_account() {
        let ledger = ledger_with(&[(4, 0)]);
        assert_eq!(ledger.balance(AgentId(4)).unwrap(), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn unknown_agent_balance_is_error() {
        let ledger = TokenLedger::new();
        assert!(matches!(
            ledger.balance(AgentId(9)),
            Err(LedgerError::UnknownAgent { .. })
        ));
    }

    #[test]
    fn debit_below_zero_rejected() {
        let mut ledger = ledger_with(&[(0, 5)]);
        let result = ledger.debit(1, AgentId(0), LedgerEntryType::Contribution, 6);
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds {
                balance: 5,
                requested: 6,
                ..
            })
        ));
        assert_eq!(ledger.balance(AgentId(0)).unwrap(), 5);
    }

    #[test]
    fn credit_and_debit_check_direction() {
        let mut ledger = ledger_with(&[(0, 5)]);
        assert!(matches!(
            ledger.credit(1, AgentId(0), LedgerEntryType::Contribution, 1),
            Err(LedgerError::DirectionMismatch { .. })
        ));
        assert!(matches!(
            ledger.debit(1, AgentId(0), LedgerEntryType::PublicGoodShare, 1),
            Err(LedgerError::DirectionMismatch { .. })
        ));
        assert_eq!(
            ledger
                .credit(1, AgentId(0), LedgerEntryType::PublicGoodShare, 3)
                .unwrap(),
            8
        );
        assert_eq!(
            ledger
                .debit(1, AgentId(0), LedgerEntryType::Contribution, 8)
                .unwrap(),
            0
        );
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut ledger = ledger_with(&[(0, 10), (1, 10)]);
        let before = ledger.len();
        let result = ledger.apply_batch(
            1,
            vec![
                posting(LedgerEntryType::PublicGoodShare, 0, 4),
                posting(LedgerEntryType::Contribution, 1, 11),
            ],
        );
        assert!(result.is_err());
        assert_eq!(ledger.balance(AgentId(0)).unwrap(), 10);
        assert_eq!(ledger.balance(AgentId(1)).unwrap(), 10);
        assert_eq!(ledger.len(), before);
    }

    #[test]
    fn batch_applies_credits_before_debits() {
        // Contribution of 20 from a zero balance is funded by the endowment
        // even though it is listed first.
        let mut ledger = ledger_with(&[(0, 0)]);
        let receipt = ledger
            .apply_batch(
                1,
                vec![
                    posting(LedgerEntryType::Contribution, 0, 20),
                    posting(LedgerEntryType::EndowmentStage1, 0, 20),
                    posting(LedgerEntryType::PublicGoodShare, 0, 32),
                ],
            )
            .unwrap();
        assert_eq!(receipt.entries_posted, 3);
        assert_eq!(ledger.balance(AgentId(0)).unwrap(), 32);
    }

    #[test]
    fn punishment_is_floor_clamped() {
        let mut ledger = ledger_with(&[(0, 10)]);
        let receipt = ledger
            .apply_batch(
                1,
                vec![
                    posting(LedgerEntryType::PunishmentReceived, 0, 9),
                    posting(LedgerEntryType::PunishmentReceived, 0, 6),
                ],
            )
            .unwrap();
        assert_eq!(ledger.balance(AgentId(0)).unwrap(), 0);
        assert_eq!(receipt.floor_adjustment(AgentId(0)), 5);
        assert_eq!(receipt.floor_adjustment(AgentId(1)), 0);
        // 9 + 1 applied; the posted entries sum to the tokens actually removed.
        let removed: u64 = ledger
            .entries_for_round(1)
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(removed, 10);
    }

    #[test]
    fn replay_matches_balances() {
        let mut ledger = ledger_with(&[(0, 1000), (1, 1000)]);
        ledger
            .apply_batch(
                1,
                vec![
                    posting(LedgerEntryType::EndowmentStage1, 0, 20),
                    posting(LedgerEntryType::EndowmentStage1, 1, 20),
                    posting(LedgerEntryType::Contribution, 0, 20),
                    posting(LedgerEntryType::Contribution, 1, 10),
                    posting(LedgerEntryType::PublicGoodShare, 0, 24),
                    posting(LedgerEntryType::PublicGoodShare, 1, 24),
                ],
            )
            .unwrap();
        let replayed = ledger.replayed_balances().unwrap();
        assert_eq!(&replayed, ledger.balances());
        assert_eq!(replayed.get(&AgentId(0)).copied(), Some(1024));
        assert_eq!(replayed.get(&AgentId(1)).copied(), Some(1034));
        assert_eq!(ledger.total_supply(), Some(2058));
    }
}
