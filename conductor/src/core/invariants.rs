//! Ledger invariants checked between orchestration steps.

use crate::core::chain::ChainGraph;
use crate::core::ledger::ProgressLedger;
use crate::core::types::NodeState;

/// Check progress-ledger invariants against the chain:
/// - At most one active node, and every active node is `running`
/// - Every tracked node is declared by the chain
/// - Ready nodes are declared and never `succeeded` or `failed`
/// - Retry counts never exceed `max_retries + 1`
/// - History cycles never decrease and never exceed the current cycle
pub fn validate_progress(
    ledger: &ProgressLedger,
    graph: &ChainGraph,
    max_retries: u32,
) -> Vec<String> {
    let mut errors = Vec::new();

    if ledger.current_active_nodes.len() > 1 {
        errors.push(format!(
            "{} active nodes; at most one may run",
            ledger.current_active_nodes.len()
        ));
    }
    for node in &ledger.current_active_nodes {
        if ledger.state(node) != NodeState::Running {
            errors.push(format!("active node '{node}' is not running"));
        }
    }

    for node in ledger.node_states.keys() {
        if !graph.contains(node) {
            errors.push(format!("state tracked for undeclared node '{node}'"));
        }
    }

    for node in &ledger.ready_nodes {
        if !graph.contains(node) {
            errors.push(format!("ready node '{node}' is not declared"));
            continue;
        }
        if matches!(
            ledger.state(node),
            NodeState::Succeeded | NodeState::Failed
        ) {
            errors.push(format!(
                "ready node '{node}' is already {:?}",
                ledger.state(node)
            ));
        }
    }

    for (node, count) in &ledger.retry_counts {
        if *count > max_retries + 1 {
            errors.push(format!(
                "{node}: retry count {count} exceeds budget {max_retries}"
            ));
        }
    }

    let mut previous = 0;
    for record in &ledger.execution_history {
        if record.cycle < previous || record.cycle > ledger.cycle {
            errors.push(format!(
                "history record for '{}' has out-of-order cycle {}",
                record.node, record.cycle
            ));
        }
        previous = record.cycle;
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::test_support::record;
    use std::collections::BTreeMap;

    #[test]
    fn fresh_ledger_is_valid() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let ledger = ProgressLedger::new(&graph);
        assert!(validate_progress(&ledger, &graph, 2).is_empty());
    }

    #[test]
    fn active_node_must_be_running() {
        let graph = get_chain("minimal", &BTreeMap::new()).expect("minimal");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.current_active_nodes = vec!["Code".to_string()];
        let errors = validate_progress(&ledger, &graph, 2);
        assert_eq!(errors, vec!["active node 'Code' is not running"]);
    }

    #[test]
    fn succeeded_node_cannot_stay_ready() {
        let graph = get_chain("minimal", &BTreeMap::new()).expect("minimal");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.activate("Plan", "go");
        ledger.record_success(record(1, "Plan", true), &["Code"]);
        ledger.ready_nodes.push("Plan".to_string());
        let errors = validate_progress(&ledger, &graph, 2);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ready node 'Plan'"));
    }
}
