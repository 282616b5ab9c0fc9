//! Validated postings for the token ledger.
//!
//! A [`Posting`] is a balance movement that has passed validation but has
//! not been applied yet. Postings are produced only by [`PostingBuilder`],
//! so every posting has an agent, a reason, and a positive amount.

use commons_types::{AgentId, EntryDirection, LedgerEntryType};

use crate::LedgerError;

/// A validated, not yet applied, balance movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    agent: AgentId,
    entry_type: LedgerEntryType,
    amount: u64,
    reason: String,
}

impl Posting {
    /// Account the posting moves.
    pub const fn agent(&self) -> AgentId {
        self.agent
    }

    /// Entry category.
    pub const fn entry_type(&self) -> LedgerEntryType {
        self.entry_type
    }

    /// Tokens moved. Always positive.
    pub const fn amount(&self) -> u64 {
        self.amount
    }

    /// Human-readable reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Credit or debit, derived from the entry type.
    pub const fn direction(&self) -> EntryDirection {
        self.entry_type.direction()
    }
}

/// Builder for [`Posting`] values.
///
/// # Examples
///
/// ```
/// use commons_ledger::PostingBuilder;
/// use commons_types::{AgentId, LedgerEntryType};
///
/// let posting = PostingBuilder::new(LedgerEntryType::SanctionSpend)
///     .agent(AgentId(3))
///     .amount(5)
///     .reason("punish 4")
///     .build();
///
/// assert!(posting.is_ok());
/// ```
#[derive(Debug)]
pub struct PostingBuilder {
    entry_type: LedgerEntryType,
    agent: Option<AgentId>,
    amount: Option<u64>,
    reason: Option<String>,
}

impl PostingBuilder {
    /// Start building a posting of the given type.
    pub const fn new(entry_type: LedgerEntryType) -> Self {
        Self {
            entry_type,
            agent: None,
            amount: None,
            reason: None,
        }
    }

    /// Set the account.
    #[must_use]
    pub const fn agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set the amount.
    #[must_use]
    pub const fn amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Set the human-readable reason.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Validate and produce the [`Posting`].
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::MissingField`] if the agent, amount, or reason
    /// is unset, and [`LedgerError::ZeroAmount`] if the amount is zero.
    pub fn build(self) -> Result<Posting, LedgerError> {
        let agent = self.agent.ok_or(LedgerError::MissingField("agent"))?;
        let amount = self.amount.ok_or(LedgerError::MissingField("amount"))?;
        let reason = self.reason.ok_or(LedgerError::MissingField("reason"))?;

        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        Ok(Posting {
            agent,
            entry_type: self.entry_type,
            amount,
            reason,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn builds_valid_posting() {
        let posting = PostingBuilder::new(LedgerEntryType::EndowmentStage1)
            .agent(AgentId(1))
            .amount(20)
            .reason("stage 1")
            .build();
        let posting = posting.unwrap();
        assert_eq!(posting.agent(), AgentId(1));
        assert_eq!(posting.amount(), 20);
        assert_eq!(posting.direction(), EntryDirection::Credit);
        assert_eq!(posting.reason(), "stage 1");
    }

    #[test]
    fn rejects_zero_amount() {
        let result = PostingBuilder::new(LedgerEntryType::Contribution)
            .agent(AgentId(1))
            .amount(0)
            .reason("nothing")
            .build();
        assert!(matches!(result, Err(LedgerError::ZeroAmount)));
    }

    #[test]
    fn rejects_missing_fields() {
        let no_agent = PostingBuilder::new(LedgerEntryType::Contribution)
            .amount(1)
            .reason("x")
            .build();
        assert!(matches!(no_agent, Err(LedgerError::MissingField("agent"))));

        let no_reason = PostingBuilder::new(LedgerEntryType::Contribution)
            .agent(AgentId(0))
            .amount(1)
            .build();
        assert!(matches!(no_reason, Err(LedgerError::MissingField("reason"))));
    }
}
