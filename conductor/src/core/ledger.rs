//! Task and progress ledgers.
//!
//! The [`TaskLedger`] holds what the run is trying to achieve. Planning owns
//! it; execution only appends to its failure history. The [`ProgressLedger`]
//! holds per-cycle execution state and centralises every counter the state
//! machine depends on: retry counts, the stall counter and the ready frontier.
//! All transitions here are pure.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::chain::ChainGraph;
use crate::core::types::{ExecutionRecord, FailureDisposition, NodeState};

pub const KEY_PROJECT_NAME: &str = "project_name";
pub const KEY_DESCRIPTION: &str = "description";
pub const KEY_WORKING_DIR: &str = "working_dir";
pub const KEY_MAIN_FILE: &str = "main_file_path";
pub const KEY_TEST_FILE: &str = "test_file_path";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub original_task: String,
    pub facts: Vec<String>,
    pub plan: Vec<String>,
    pub project_config: BTreeMap<String, String>,
    /// Node name to role description, for prompts.
    pub node_capabilities: BTreeMap<String, String>,
    pub planning_cycles: u32,
    /// Nodes that exhausted their retries, across all cycles.
    #[serde(default)]
    pub failure_history: Vec<FailureNote>,
}

/// One exhausted node and where its failure went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub cycle: u32,
    pub node: String,
    pub error: String,
    /// Failure-edge target that took over, or `None` when the cycle replanned.
    pub routed_to: Option<String>,
}

impl TaskLedger {
    pub fn new(original_task: impl Into<String>, graph: &ChainGraph) -> Self {
        let node_capabilities = graph
            .nodes()
            .iter()
            .map(|node| (node.name.clone(), node.description.clone()))
            .collect();
        Self {
            original_task: original_task.into(),
            facts: Vec::new(),
            plan: Vec::new(),
            project_config: BTreeMap::new(),
            node_capabilities,
            planning_cycles: 0,
            failure_history: Vec::new(),
        }
    }

    /// Append facts, skipping blanks and exact duplicates.
    pub fn append_facts<I, S>(&mut self, facts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for fact in facts {
            let fact = fact.into();
            let fact = fact.trim();
            if fact.is_empty() || self.facts.iter().any(|known| known == fact) {
                continue;
            }
            self.facts.push(fact.to_string());
        }
    }

    pub fn replace_plan(&mut self, plan: Vec<String>) {
        self.plan = plan;
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.project_config.get(key).map(String::as_str)
    }

    pub fn set_config(&mut self, key: &str, value: impl Into<String>) {
        self.project_config.insert(key.to_string(), value.into());
    }

    pub fn record_exhausted(&mut self, note: FailureNote) {
        self.failure_history.push(note);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressLedger {
    pub cycle: u32,
    pub node_states: BTreeMap<String, NodeState>,
    pub current_active_nodes: Vec<String>,
    pub node_instructions: BTreeMap<String, String>,
    pub execution_history: Vec<ExecutionRecord>,
    pub retry_counts: BTreeMap<String, u32>,
    pub stall_counter: u32,
    /// Nodes the chain allows to run next, in the order they became ready.
    pub ready_nodes: Vec<String>,
    /// Failure-edge targets mapped to the node whose failure routed to them.
    pub failure_routes: BTreeMap<String, String>,
    /// Node that failed with budget left; the next dispatch must retry it.
    #[serde(default)]
    pub retry_pending: Option<String>,
}

impl ProgressLedger {
    pub fn new(graph: &ChainGraph) -> Self {
        let mut ledger = Self::default();
        ledger.reset_for_cycle(graph, 1);
        ledger
    }

    /// Reset per-cycle state. History survives.
    pub fn reset_for_cycle(&mut self, graph: &ChainGraph, cycle: u32) {
        self.cycle = cycle;
        self.node_states = graph
            .nodes()
            .iter()
            .map(|node| (node.name.clone(), NodeState::Pending))
            .collect();
        self.retry_counts = graph
            .nodes()
            .iter()
            .map(|node| (node.name.clone(), 0))
            .collect();
        self.current_active_nodes.clear();
        self.node_instructions.clear();
        self.failure_routes.clear();
        self.retry_pending = None;
        self.stall_counter = 0;
        self.ready_nodes = vec![graph.entry().to_string()];
    }

    pub fn state(&self, node: &str) -> NodeState {
        self.node_states.get(node).copied().unwrap_or_default()
    }

    pub fn retry_count(&self, node: &str) -> u32 {
        self.retry_counts.get(node).copied().unwrap_or(0)
    }

    pub fn is_ready(&self, node: &str) -> bool {
        self.ready_nodes.iter().any(|ready| ready == node)
    }

    /// Ready nodes that are still pending, in frontier order.
    pub fn dispatchable(&self) -> Vec<&str> {
        self.ready_nodes
            .iter()
            .filter(|node| self.state(node) == NodeState::Pending)
            .map(String::as_str)
            .collect()
    }

    pub fn instruction(&self, node: &str) -> Option<&str> {
        self.node_instructions.get(node).map(String::as_str)
    }

    /// Make `node` the sole active node and cache its instruction.
    pub fn activate(&mut self, node: &str, instruction: impl Into<String>) {
        self.retry_pending = None;
        self.current_active_nodes = vec![node.to_string()];
        self.node_states.insert(node.to_string(), NodeState::Running);
        self.node_instructions
            .insert(node.to_string(), instruction.into());
    }

    /// Record a successful dispatch and open the node's success successors.
    ///
    /// A successor that already failed this cycle is reopened with a fresh
    /// retry budget. Returns the reopened nodes.
    pub fn record_success(&mut self, record: ExecutionRecord, successors: &[&str]) -> Vec<String> {
        let node = record.node.clone();
        self.execution_history.push(record);
        self.deactivate(&node);
        self.node_states.insert(node.clone(), NodeState::Succeeded);
        self.retry_counts.insert(node.clone(), 0);
        self.stall_counter = 0;
        self.ready_nodes.retain(|ready| ready != &node);

        let mut reopened = Vec::new();
        for successor in successors {
            match self.state(successor) {
                NodeState::Pending => {}
                NodeState::Failed => {
                    self.node_states
                        .insert((*successor).to_string(), NodeState::Pending);
                    self.retry_counts.insert((*successor).to_string(), 0);
                    reopened.push((*successor).to_string());
                }
                _ => continue,
            }
            if !self.is_ready(successor) {
                self.ready_nodes.push((*successor).to_string());
            }
        }
        reopened
    }

    /// Record a failed dispatch and charge the node's retry budget.
    pub fn record_failure(
        &mut self,
        record: ExecutionRecord,
        max_retries: u32,
    ) -> FailureDisposition {
        let node = record.node.clone();
        self.execution_history.push(record);
        self.deactivate(&node);
        let count = self.retry_counts.entry(node.clone()).or_insert(0);
        *count += 1;
        if *count <= max_retries {
            self.node_states.insert(node.clone(), NodeState::Pending);
            self.retry_pending = Some(node);
            FailureDisposition::Retry
        } else {
            self.node_states.insert(node.clone(), NodeState::Failed);
            self.ready_nodes.retain(|ready| ready != &node);
            FailureDisposition::Exhausted
        }
    }

    /// Open the failure-edge target of an exhausted node.
    ///
    /// Returns false when the target can no longer run in this cycle.
    pub fn route_failure(&mut self, from: &str, target: &str) -> bool {
        if self.state(target) != NodeState::Pending {
            return false;
        }
        if !self.is_ready(target) {
            self.ready_nodes.insert(0, target.to_string());
        }
        self.failure_routes
            .insert(target.to_string(), from.to_string());
        true
    }

    /// Node whose failure routed to `node` in this cycle, if any.
    pub fn routed_from(&self, node: &str) -> Option<&str> {
        self.failure_routes.get(node).map(String::as_str)
    }

    pub fn register_stall(&mut self) -> u32 {
        self.stall_counter += 1;
        self.stall_counter
    }

    pub fn clear_stall(&mut self) {
        self.stall_counter = 0;
    }

    /// Close out the cycle: pending nodes never ran.
    pub fn finalize(&mut self) {
        for state in self.node_states.values_mut() {
            if *state == NodeState::Pending {
                *state = NodeState::Skipped;
            }
        }
        self.current_active_nodes.clear();
    }

    /// Most recent failed record for `node` in the current cycle.
    pub fn last_failure(&self, node: &str) -> Option<&ExecutionRecord> {
        self.execution_history
            .iter()
            .rev()
            .take_while(|record| record.cycle == self.cycle)
            .find(|record| record.node == node && !record.success)
    }

    /// Last `window` records, oldest first.
    pub fn recent_history(&self, window: usize) -> &[ExecutionRecord] {
        let start = self.execution_history.len().saturating_sub(window);
        &self.execution_history[start..]
    }

    /// Dispatch count per node across all cycles.
    pub fn attempts_by_node(&self) -> BTreeMap<String, u32> {
        let mut attempts = BTreeMap::new();
        for record in &self.execution_history {
            *attempts.entry(record.node.clone()).or_insert(0) += 1;
        }
        attempts
    }

    fn deactivate(&mut self, node: &str) {
        self.current_active_nodes.retain(|active| active != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::test_support::record;

    fn minimal() -> ChainGraph {
        get_chain("minimal", &BTreeMap::new()).expect("minimal chain")
    }

    #[test]
    fn new_cycle_readies_only_entry() {
        let ledger = ProgressLedger::new(&minimal());
        assert_eq!(ledger.ready_nodes, vec!["Plan"]);
        assert!(ledger.node_states.values().all(|s| *s == NodeState::Pending));
        assert_eq!(ledger.cycle, 1);
    }

    #[test]
    fn activate_makes_sole_running_node() {
        let mut ledger = ProgressLedger::new(&minimal());
        ledger.activate("Plan", "plan it");
        assert_eq!(ledger.current_active_nodes, vec!["Plan"]);
        assert_eq!(ledger.state("Plan"), NodeState::Running);
        assert_eq!(ledger.instruction("Plan"), Some("plan it"));
    }

    #[test]
    fn success_opens_successors_and_resets_counters() {
        let mut ledger = ProgressLedger::new(&minimal());
        ledger.activate("Plan", "go");
        ledger.register_stall();
        ledger.record_success(record(1, "Plan", true), &["Code"]);
        assert_eq!(ledger.state("Plan"), NodeState::Succeeded);
        assert_eq!(ledger.ready_nodes, vec!["Code"]);
        assert_eq!(ledger.stall_counter, 0);
        assert!(ledger.current_active_nodes.is_empty());
    }

    #[test]
    fn retry_count_increases_on_failure_and_resets_on_success() {
        let mut ledger = ProgressLedger::new(&minimal());
        let mut observed = vec![ledger.retry_count("Plan")];
        for _ in 0..2 {
            ledger.activate("Plan", "go");
            let disposition = ledger.record_failure(record(1, "Plan", false), 2);
            assert_eq!(disposition, FailureDisposition::Retry);
            assert_eq!(ledger.state("Plan"), NodeState::Pending);
            assert!(ledger.is_ready("Plan"));
            observed.push(ledger.retry_count("Plan"));
        }
        ledger.activate("Plan", "go");
        ledger.record_success(record(1, "Plan", true), &["Code"]);
        observed.push(ledger.retry_count("Plan"));
        assert_eq!(observed, vec![0, 1, 2, 0]);
    }

    #[test]
    fn retryable_failure_pins_next_dispatch_until_activation() {
        let mut ledger = ProgressLedger::new(&minimal());
        ledger.activate("Plan", "go");
        ledger.record_failure(record(1, "Plan", false), 1);
        assert_eq!(ledger.retry_pending.as_deref(), Some("Plan"));
        ledger.activate("Plan", "again");
        assert!(ledger.retry_pending.is_none());
        ledger.record_failure(record(1, "Plan", false), 1);
        assert!(ledger.retry_pending.is_none());
    }

    #[test]
    fn success_edge_reopens_failed_target_with_fresh_budget() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut ledger = ProgressLedger::new(&graph);
        for _ in 0..3 {
            ledger.activate("UnitTest", "run");
            ledger.record_failure(record(1, "UnitTest", false), 2);
        }
        assert_eq!(ledger.state("UnitTest"), NodeState::Failed);
        assert!(ledger.route_failure("UnitTest", "Refactor"));
        ledger.activate("Refactor", "fix");
        let reopened = ledger.record_success(record(1, "Refactor", true), &["UnitTest"]);

        assert_eq!(reopened, vec!["UnitTest"]);
        assert_eq!(ledger.state("UnitTest"), NodeState::Pending);
        assert_eq!(ledger.retry_count("UnitTest"), 0);
        assert!(ledger.is_ready("UnitTest"));
    }

    #[test]
    fn success_edge_does_not_reopen_succeeded_nodes() {
        let mut ledger = ProgressLedger::new(&minimal());
        ledger.activate("Plan", "go");
        ledger.record_success(record(1, "Plan", true), &["Code"]);
        ledger.activate("Code", "go");
        let reopened = ledger.record_success(record(1, "Code", true), &["Plan"]);
        assert!(reopened.is_empty());
        assert!(!ledger.is_ready("Plan"));
    }

    #[test]
    fn failure_past_budget_is_exhausted_and_leaves_frontier() {
        let mut ledger = ProgressLedger::new(&minimal());
        for _ in 0..2 {
            ledger.activate("Plan", "go");
            ledger.record_failure(record(1, "Plan", false), 2);
        }
        ledger.activate("Plan", "go");
        let disposition = ledger.record_failure(record(1, "Plan", false), 2);
        assert_eq!(disposition, FailureDisposition::Exhausted);
        assert_eq!(ledger.state("Plan"), NodeState::Failed);
        assert!(ledger.ready_nodes.is_empty());
    }

    #[test]
    fn reset_keeps_history_and_zeroes_retries() {
        let graph = minimal();
        let mut ledger = ProgressLedger::new(&graph);
        ledger.activate("Plan", "go");
        ledger.record_failure(record(1, "Plan", false), 2);
        ledger.reset_for_cycle(&graph, 2);
        assert_eq!(ledger.retry_count("Plan"), 0);
        assert_eq!(ledger.execution_history.len(), 1);
        assert_eq!(ledger.cycle, 2);
        assert!(ledger.node_instructions.is_empty());
    }

    #[test]
    fn route_failure_opens_pending_target_once() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut ledger = ProgressLedger::new(&graph);
        assert!(ledger.route_failure("UnitTest", "Refactor"));
        assert_eq!(ledger.routed_from("Refactor"), Some("UnitTest"));
        ledger.activate("Refactor", "fix");
        ledger.record_success(record(1, "Refactor", true), &[]);
        assert!(!ledger.route_failure("UnitTest", "Refactor"));
    }

    #[test]
    fn finalize_marks_untouched_nodes_skipped() {
        let mut ledger = ProgressLedger::new(&minimal());
        ledger.activate("Plan", "go");
        ledger.record_success(record(1, "Plan", true), &["Code"]);
        ledger.finalize();
        assert_eq!(ledger.state("Plan"), NodeState::Succeeded);
        assert_eq!(ledger.state("UnitTest"), NodeState::Skipped);
    }

    #[test]
    fn last_failure_ignores_previous_cycles() {
        let graph = minimal();
        let mut ledger = ProgressLedger::new(&graph);
        ledger.activate("Plan", "go");
        ledger.record_failure(record(1, "Plan", false), 2);
        assert!(ledger.last_failure("Plan").is_some());
        ledger.reset_for_cycle(&graph, 2);
        assert!(ledger.last_failure("Plan").is_none());
    }

    #[test]
    fn task_ledger_facts_are_deduplicated() {
        let mut task = TaskLedger::new("build a calculator", &minimal());
        task.append_facts(["uses python", " ", "uses python", "has tests"]);
        assert_eq!(task.facts, vec!["uses python", "has tests"]);
        assert_eq!(task.node_capabilities.len(), 4);
    }

    #[test]
    fn exhausted_failures_accumulate_across_cycles() {
        let mut task = TaskLedger::new("t", &minimal());
        for cycle in 1..=2 {
            task.record_exhausted(FailureNote {
                cycle,
                node: "UnitTest".to_string(),
                error: "2 tests failed".to_string(),
                routed_to: None,
            });
        }
        assert_eq!(task.failure_history.len(), 2);
        assert_eq!(task.failure_history[1].cycle, 2);
    }
}
