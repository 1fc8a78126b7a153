//! Ledger-driven orchestration of a chain of LLM worker agents.
//!
//! A run plans the task, then repeatedly decides which node of the configured
//! chain should act next, dispatches it, and records the outcome until the task
//! is satisfied or the run aborts. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (chain graphs, ledgers, selection,
//!   invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (config, processes, prompts, workspace
//!   discovery, run artifacts). Collaborators sit behind traits for mocking.
//!
//! [`planning`], [`decision`] and [`orchestrator`] coordinate core logic with
//! I/O to implement the run state machine.

pub mod core;
pub mod decision;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod planning;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
