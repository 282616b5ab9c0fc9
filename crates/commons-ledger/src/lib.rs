//! Token ledger for the Commons public-goods engine.
//!
//! Every token an agent holds is accounted for here. Balances only change
//! through validated [`Posting`]s, each of which becomes an append-only
//! [`LedgerEntry`](commons_types::LedgerEntry). The log can be replayed to
//! rebuild every balance, and each round is reconciled against the payoffs
//! the orchestrator computed before it is committed.
//!
//! # Modules
//!
//! - [`ledger`] -- The [`TokenLedger`]: balances, entries, atomic batches.
//! - [`posting`] -- The [`PostingBuilder`] for validated postings.
//! - [`reconcile`] -- Per-round reconciliation against expected payoffs.
//!
//! # Invariants
//!
//! - Balances never go negative. Ordinary debits past zero are rejected
//!   with [`LedgerError::InsufficientFunds`]; punishment debits are
//!   floor-clamped and the shortfall reported.
//! - A settlement batch is applied entirely or not at all.
//! - For every agent, the sum of its entries equals its balance.
//!
//! # Usage
//!
//! ```
//! use commons_ledger::{PostingBuilder, TokenLedger};
//! use commons_types::{AgentId, LedgerEntryType};
//!
//! let mut ledger = TokenLedger::new();
//! ledger.open_account(AgentId(0), 1000).ok();
//!
//! let postings = vec![
//!     PostingBuilder::new(LedgerEntryType::Contribution)
//!         .agent(AgentId(0))
//!         .amount(20)
//!         .reason("contribution")
//!         .build(),
//!     PostingBuilder::new(LedgerEntryType::PublicGoodShare)
//!         .agent(AgentId(0))
//!         .amount(32)
//!         .reason("public good share")
//!         .build(),
//! ];
//! let postings: Result<Vec<_>, _> = postings.into_iter().collect();
//!
//! let applied = postings.and_then(|p| ledger.apply_batch(1, p));
//! assert!(applied.is_ok());
//! assert_eq!(ledger.balance(AgentId(0)).ok(), Some(1012));
//! ```

pub mod ledger;
pub mod posting;
pub mod reconcile;

// Re-export primary types at crate root.
pub use ledger::{BatchReceipt, TokenLedger, balance_from_entries};
pub use posting::{Posting, PostingBuilder};
pub use reconcile::{ReconciliationResult, RoundExpectation, verify_round};

use std::collections::BTreeMap;

use serde::Serialize;

use commons_types::{AgentId, LedgerEntryType};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised by ledger operations.
///
/// All of these are logic defects in the caller: the orchestrator clamps
/// decisions before they reach the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A debit would drive the balance below zero.
    #[error("insufficient funds for agent {agent}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// The account being debited.
        agent: AgentId,
        /// Balance at the time of the debit.
        balance: u64,
        /// Amount requested.
        requested: u64,
    },

    /// The agent has no account.
    #[error("unknown agent {agent}")]
    UnknownAgent {
        /// The missing agent.
        agent: AgentId,
    },

    /// An account was opened twice.
    #[error("account for agent {agent} already exists")]
    DuplicateAgent {
        /// The agent that already has an account.
        agent: AgentId,
    },

    /// Posting amounts must be strictly positive.
    #[error("ledger posting amount must be non-zero")]
    ZeroAmount,

    /// A required field was not set on the builder.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The entry type moves the balance the other way.
    #[error("{entry_type:?} cannot be posted as a {attempted}")]
    DirectionMismatch {
        /// The entry type of the posting.
        entry_type: LedgerEntryType,
        /// What the caller attempted ("credit" or "debit").
        attempted: &'static str,
    },

    /// A balance or total exceeded the integer range.
    #[error("arithmetic overflow on agent {agent}")]
    Overflow {
        /// The account whose balance overflowed.
        agent: AgentId,
    },
}

// ---------------------------------------------------------------------------
// Reconciliation mismatch
// ---------------------------------------------------------------------------

/// A difference between the ledger and the payoffs computed for a round.
///
/// Any mismatch is fatal for the run: the round must not be committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationMismatch {
    /// The round being reconciled.
    pub round: u32,
    /// Agents whose ledger delta differs: `(expected, actual)`.
    pub agent_deltas: BTreeMap<AgentId, (i64, i64)>,
    /// Distributed pool vs. sum of `PublicGoodShare` entries, if different.
    pub pool: Option<(u64, u64)>,
    /// Expected vs. posted sanction spend, if different.
    pub sanction_spend: Option<(u64, u64)>,
    /// Human-readable description.
    pub message: String,
}

impl core::fmt::Display for ReconciliationMismatch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReconciliationMismatch {}
