//! Deterministic node selection used when the reasoner cannot decide.

use crate::core::chain::ChainGraph;
use crate::core::ledger::ProgressLedger;

/// First node of the chain's static success order that is ready and pending.
///
/// Returns `None` if nothing can be dispatched.
pub fn fallback_node<'g>(graph: &'g ChainGraph, ledger: &ProgressLedger) -> Option<&'g str> {
    ready_candidates(graph, ledger).into_iter().next()
}

/// Candidates offered to the reasoner, ordered by the chain's success order.
///
/// A pending retry narrows the set to the node being retried.
pub fn ready_candidates<'g>(graph: &'g ChainGraph, ledger: &ProgressLedger) -> Vec<&'g str> {
    let dispatchable = ledger.dispatchable();
    let mut candidates: Vec<&str> = graph
        .success_order()
        .into_iter()
        .filter(|node| dispatchable.contains(node))
        .collect();
    if let Some(retry) = ledger.retry_pending.as_deref()
        && candidates.contains(&retry)
    {
        candidates.retain(|node| *node == retry);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::test_support::record;
    use std::collections::BTreeMap;

    #[test]
    fn fallback_follows_success_order_not_frontier_order() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.ready_nodes = vec!["Structure".to_string(), "Scan".to_string()];
        assert_eq!(fallback_node(&graph, &ledger), Some("Scan"));
        assert_eq!(ready_candidates(&graph, &ledger), vec!["Scan", "Structure"]);
    }

    #[test]
    fn pending_retry_is_the_only_candidate() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.ready_nodes = vec!["Scan".to_string(), "Structure".to_string()];
        ledger.activate("Structure", "lay out");
        ledger.record_failure(record(1, "Structure", false), 2);
        assert_eq!(ready_candidates(&graph, &ledger), vec!["Structure"]);
        assert_eq!(fallback_node(&graph, &ledger), Some("Structure"));
    }

    #[test]
    fn fallback_is_none_when_nothing_is_ready() {
        let graph = get_chain("prototype", &BTreeMap::new()).expect("prototype");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.activate("Plan", "go");
        ledger.record_success(record(1, "Plan", true), &[]);
        assert_eq!(fallback_node(&graph, &ledger), None);
    }

    #[test]
    fn running_node_is_not_a_candidate() {
        let graph = get_chain("minimal", &BTreeMap::new()).expect("minimal");
        let mut ledger = ProgressLedger::new(&graph);
        ledger.activate("Plan", "go");
        assert!(ready_candidates(&graph, &ledger).is_empty());
    }
}
