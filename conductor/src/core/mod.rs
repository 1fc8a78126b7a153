//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! ledgers and chain graphs and return deterministic outputs suitable for tests.

pub mod budget;
pub mod chain;
pub mod invariants;
pub mod ledger;
pub mod naming;
pub mod selector;
pub mod types;
