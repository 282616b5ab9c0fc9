//! Shared type definitions for the Commons public-goods engine.
//!
//! Every record the engine produces or consumes is defined here, so the
//! ledger, the core orchestrator, and the engine binary agree on one
//! vocabulary. Types also flow to `TypeScript` via `ts-rs` for analysis
//! tooling.
//!
//! # Modules
//!
//! - [`ids`] -- Agent, run, and ledger entry identifiers
//! - [`enums`] -- Institutions, phases, round states, ledger entry types
//! - [`decisions`] -- Provider responses, applied decisions, incidents
//! - [`structs`] -- Payoffs, round records, output records, ledger entries

pub mod decisions;
pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use decisions::{DecisionRecord, Incident, ProviderDecision, ProviderResponse, SanctionIntent};
pub use enums::{
    EntryDirection, InstitutionKind, LedgerEntryType, PhaseKind, RoundState, RoundStatus,
    SanctionKind,
};
pub use ids::{AgentId, LedgerEntryId, RunId};
pub use structs::{
    GroupSummary, LedgerEntry, OutputRecord, PayoffRecord, PeerRound, PeerRoundEntry,
    RoundRecord, SanctionRecord, Standing,
};

#[cfg(test)]
mod tests {
    //! `TypeScript` binding generation.

    #[test]
    fn export_bindings() {
        // Files land in `bindings/` relative to the crate root.
        use ts_rs::TS;

        let _ = crate::ids::AgentId::export_all();
        let _ = crate::ids::RunId::export_all();
        let _ = crate::ids::LedgerEntryId::export_all();

        let _ = crate::enums::InstitutionKind::export_all();
        let _ = crate::enums::PhaseKind::export_all();
        let _ = crate::enums::RoundState::export_all();
        let _ = crate::enums::RoundStatus::export_all();
        let _ = crate::enums::SanctionKind::export_all();
        let _ = crate::enums::LedgerEntryType::export_all();
        let _ = crate::enums::EntryDirection::export_all();

        let _ = crate::decisions::SanctionIntent::export_all();
        let _ = crate::decisions::ProviderDecision::export_all();
        let _ = crate::decisions::ProviderResponse::export_all();
        let _ = crate::decisions::DecisionRecord::export_all();
        let _ = crate::decisions::Incident::export_all();

        let _ = crate::structs::PayoffRecord::export_all();
        let _ = crate::structs::SanctionRecord::export_all();
        let _ = crate::structs::Standing::export_all();
        let _ = crate::structs::PeerRoundEntry::export_all();
        let _ = crate::structs::PeerRound::export_all();
        let _ = crate::structs::GroupSummary::export_all();
        let _ = crate::structs::RoundRecord::export_all();
        let _ = crate::structs::OutputRecord::export_all();
        let _ = crate::structs::LedgerEntry::export_all();
    }
}
