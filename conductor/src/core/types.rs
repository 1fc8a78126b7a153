//! Shared deterministic types for the orchestration core.
//!
//! These types are the contracts between the decision engine, the
//! orchestrator and the run log. They carry no I/O and serialize stably.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cooperative cancellation flag shared between the caller, the orchestrator
/// loop and running agents.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle state of a chain node within one planning cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    #[default]
    Pending,
    Running,
    Succeeded,
    /// Retry budget exhausted. Not dispatched again until the next cycle.
    Failed,
    /// Never ran before the run finished.
    Skipped,
}

/// One dispatch of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub cycle: u32,
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output_preview: String,
}

/// What the ledger decided after a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureDisposition {
    /// Budget remains; the node is pending again.
    Retry,
    /// Budget spent; the node is failed for this cycle.
    Exhausted,
}

/// How the next node was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionBasis {
    /// The reasoner picked among several ready nodes.
    Reasoner,
    /// Only one node was ready.
    FixedEdge,
    /// The reasoner could not be parsed or reached; static chain order was used.
    Fallback { error: String },
}

/// Outcome of one decision step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Satisfied {
        reason: String,
    },
    Stalled {
        reason: String,
        stall_counter: u32,
    },
    Advance {
        node: String,
        instruction: String,
        basis: DecisionBasis,
    },
    ParseError {
        error: String,
    },
}

/// Phase of the orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Executing,
    Replanning,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    PlanningFailed { error: String },
    ReplanBudgetExceeded { replans: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted(AbortReason),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Why the executing phase handed control back to planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplanCause {
    NodeFailed { node: String, error: String },
    Stalled { reason: String },
    Undecidable { error: String },
}

impl ReplanCause {
    /// Fact appended to the task ledger before the next planning cycle.
    pub fn as_fact(&self) -> String {
        match self {
            ReplanCause::NodeFailed { node, error } => {
                format!("node {node} failed repeatedly: {error}")
            }
            ReplanCause::Stalled { reason } => format!("stall detected: {reason}"),
            ReplanCause::Undecidable { error } => {
                format!("no dispatchable node could be chosen: {error}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_with_tag() {
        let decision = Decision::Advance {
            node: "Code".to_string(),
            instruction: "write it".to_string(),
            basis: DecisionBasis::FixedEdge,
        };
        let value = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(value["decision"], "advance");
        assert_eq!(value["basis"]["kind"], "fixed_edge");
    }

    #[test]
    fn cancel_token_clones_share_state() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn replan_cause_facts_name_the_node() {
        let cause = ReplanCause::NodeFailed {
            node: "UnitTest".to_string(),
            error: "2 tests failed".to_string(),
        };
        assert_eq!(cause.as_fact(), "node UnitTest failed repeatedly: 2 tests failed");
    }
}
