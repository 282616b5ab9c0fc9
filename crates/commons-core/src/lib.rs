//! Institutions, decision gateway, and round orchestration for the Commons
//! public-goods engine.
//!
//! A run is a sequence of rounds. In each round agents (optionally) choose
//! between a sanctioning institution (SI) and a sanction-free institution
//! (SFI), contribute to their institution's public good, and, under SI,
//! punish or reward peers. Payoffs settle through the token ledger and are
//! reconciled before the round is committed.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `commons-config.yaml` into
//!   strongly-typed structs.
//! - [`institution`] -- Groups, public-good pooling, and sanction rules.
//! - [`gateway`] -- [`DecisionProvider`] trait, [`StubProvider`], and the
//!   validating, time-bounded [`DecisionGateway`].
//! - [`parse`] -- Provider free text into typed responses.
//! - [`history`] -- Append-only round history and output-record replay.
//! - [`round`] -- The per-round state machine.
//! - [`runner`] -- The simulation loop with run timeout and callbacks.
//!
//! [`DecisionProvider`]: gateway::DecisionProvider
//! [`StubProvider`]: gateway::StubProvider
//! [`DecisionGateway`]: gateway::DecisionGateway

pub mod config;
pub mod gateway;
pub mod history;
pub mod institution;
pub mod parse;
pub mod round;
pub mod runner;
