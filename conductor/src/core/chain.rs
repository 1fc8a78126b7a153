//! Static chain profiles: the node set and allowed transitions of a run.
//!
//! A [`ChainSpec`] is the raw, deserializable declaration (built-in or from
//! the config file). [`ChainGraph`] is the validated form; constructing one is
//! the only way to obtain a graph, so every graph in the system satisfies the
//! structural invariants checked by [`ChainGraph::from_spec`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Condition under which an edge is followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Followed after the source node succeeds. A success edge into a failed
    /// node reopens it for re-verification.
    #[default]
    Success,
    /// Followed once the source node has exhausted its retry budget.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Text an agent prints when it considers its work done.
    #[serde(default)]
    pub completion_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub on: EdgeKind,
}

/// Unvalidated chain declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    #[serde(default)]
    pub description: String,
    pub entry: String,
    pub nodes: Vec<ChainNode>,
    #[serde(default)]
    pub edges: Vec<ChainEdge>,
    /// Overrides the config-wide `max_stalls` for this profile.
    #[serde(default)]
    pub max_stalls: Option<u32>,
    /// Overrides the config-wide `max_node_retries` for this profile.
    #[serde(default)]
    pub max_node_retries: Option<u32>,
}

/// Validated chain graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainGraph {
    name: String,
    description: String,
    entry: String,
    nodes: Vec<ChainNode>,
    edges: Vec<ChainEdge>,
    max_stalls: Option<u32>,
    max_node_retries: Option<u32>,
}

impl ChainGraph {
    /// Validate `spec` and build a graph named `name`.
    ///
    /// Checks, in order: non-empty node list, a non-zero stall limit, non-empty
    /// and unique names, declared entry, edge endpoints, self-loops, at most one
    /// failure edge per node, reachability of every node from the entry, and a
    /// terminal node (no outgoing success edge) reachable along success edges.
    pub fn from_spec(name: &str, spec: ChainSpec) -> Result<Self, ConfigError> {
        let chain = name.to_string();
        if spec.nodes.is_empty() {
            return Err(ConfigError::EmptyChain { chain });
        }
        if spec.max_stalls == Some(0) {
            return Err(ConfigError::ZeroStallLimit { chain });
        }

        let mut names = BTreeSet::new();
        for node in &spec.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::EmptyNodeName { chain });
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode {
                    chain,
                    node: node.name.clone(),
                });
            }
        }

        if !names.contains(spec.entry.as_str()) {
            return Err(ConfigError::UnknownEntry {
                chain,
                entry: spec.entry.clone(),
            });
        }

        let mut failure_sources = BTreeSet::new();
        for edge in &spec.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !names.contains(endpoint.as_str()) {
                    return Err(ConfigError::DanglingEdge {
                        chain,
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if edge.from == edge.to {
                return Err(ConfigError::SelfLoop {
                    chain,
                    node: edge.from.clone(),
                });
            }
            if edge.on == EdgeKind::Failure && !failure_sources.insert(edge.from.as_str()) {
                return Err(ConfigError::MultipleFailureEdges {
                    chain,
                    node: edge.from.clone(),
                });
            }
        }

        let graph = Self {
            name: chain,
            description: spec.description,
            entry: spec.entry,
            nodes: spec.nodes,
            edges: spec.edges,
            max_stalls: spec.max_stalls,
            max_node_retries: spec.max_node_retries,
        };

        let reachable = graph.reachable_from_entry(|_| true);
        if let Some(node) = graph
            .nodes
            .iter()
            .find(|node| !reachable.contains(node.name.as_str()))
        {
            return Err(ConfigError::UnreachableNode {
                chain: graph.name.clone(),
                node: node.name.clone(),
            });
        }

        let along_success = graph.reachable_from_entry(|edge| edge.on == EdgeKind::Success);
        if !along_success.iter().any(|node| graph.is_terminal(node)) {
            return Err(ConfigError::NoReachableTerminal {
                chain: graph.name.clone(),
            });
        }

        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn nodes(&self) -> &[ChainNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[ChainEdge] {
        &self.edges
    }

    pub fn max_stalls(&self) -> Option<u32> {
        self.max_stalls
    }

    pub fn max_node_retries(&self) -> Option<u32> {
        self.max_node_retries
    }

    pub fn node(&self, name: &str) -> Option<&ChainNode> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    /// Targets of `node`'s success edges, in declaration order.
    pub fn success_successors(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|edge| edge.from == node && edge.on == EdgeKind::Success)
            .map(|edge| edge.to.as_str())
            .collect()
    }

    pub fn failure_target(&self, node: &str) -> Option<&str> {
        self.edges
            .iter()
            .find(|edge| edge.from == node && edge.on == EdgeKind::Failure)
            .map(|edge| edge.to.as_str())
    }

    /// A node with no outgoing success edge ends its branch of the chain.
    pub fn is_terminal(&self, node: &str) -> bool {
        !self
            .edges
            .iter()
            .any(|edge| edge.from == node && edge.on == EdgeKind::Success)
    }

    /// Static success-edge order: breadth-first from the entry along success
    /// edges (declaration order), then any remaining nodes in declaration order.
    pub fn success_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.entry.as_str()]);
        while let Some(current) = queue.pop_front() {
            if order.contains(&current) {
                continue;
            }
            order.push(current);
            queue.extend(self.success_successors(current));
        }
        for node in &self.nodes {
            if !order.contains(&node.name.as_str()) {
                order.push(node.name.as_str());
            }
        }
        order
    }

    /// Human-readable flow, e.g.
    /// `Plan -> Code -> Test -> Fix (Test =fail=> Fix, Fix -> Test)`.
    ///
    /// Failure edges and success edges that lead back up the order are listed
    /// in parentheses.
    pub fn describe_flow(&self) -> String {
        let order = self.success_order();
        let position = |node: &str| order.iter().position(|known| *known == node);
        let mut flow = order.join(" -> ");
        let side: Vec<String> = self
            .edges
            .iter()
            .filter_map(|edge| match edge.on {
                EdgeKind::Failure => Some(format!("{} =fail=> {}", edge.from, edge.to)),
                EdgeKind::Success if position(&edge.to) < position(&edge.from) => {
                    Some(format!("{} -> {}", edge.from, edge.to))
                }
                EdgeKind::Success => None,
            })
            .collect();
        if !side.is_empty() {
            flow.push_str(&format!(" ({})", side.join(", ")));
        }
        flow
    }

    fn reachable_from_entry<F: Fn(&ChainEdge) -> bool>(&self, follow: F) -> BTreeSet<&str> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([self.entry.as_str()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for edge in &self.edges {
                if edge.from == current && follow(edge) {
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        seen
    }
}

fn node(name: &str, description: &str, marker: &str) -> ChainNode {
    ChainNode {
        name: name.to_string(),
        description: description.to_string(),
        completion_marker: Some(marker.to_string()),
    }
}

fn edge(from: &str, to: &str, on: EdgeKind) -> ChainEdge {
    ChainEdge {
        from: from.to_string(),
        to: to.to_string(),
        on,
    }
}

fn plan_node() -> ChainNode {
    node(
        "Plan",
        "Analyses the task and writes an implementation plan with concrete file paths.",
        "PLANNING_COMPLETE",
    )
}

fn code_node() -> ChainNode {
    node(
        "Code",
        "Writes the main module with every function the plan calls for.",
        "CODING_COMPLETE",
    )
}

fn test_gen_node() -> ChainNode {
    node(
        "TestGen",
        "Reads the main module and writes unit tests for each public function.",
        "TESTING_COMPLETE",
    )
}

fn unit_test_node() -> ChainNode {
    node(
        "UnitTest",
        "Runs the unit tests and reports passes, failures and errors.",
        "UNIT_TESTING_COMPLETE",
    )
}

fn refactor_node() -> ChainNode {
    node(
        "Refactor",
        "Diagnoses failing tests and repairs the main module or the tests.",
        "REFACTORING_COMPLETE",
    )
}

fn scan_node() -> ChainNode {
    node(
        "Scan",
        "Runs static analysis over the main module and writes a quality report.",
        "SCANNING_COMPLETE",
    )
}

fn structure_node() -> ChainNode {
    node(
        "Structure",
        "Lays the generated files out as a project with src, tests and docs.",
        "PROJECT_STRUCTURE_COMPLETE",
    )
}

/// Built-in chain profiles, in display order.
pub fn builtin_chains() -> Vec<(&'static str, ChainSpec)> {
    use EdgeKind::{Failure, Success};

    vec![
        (
            "prototype",
            ChainSpec {
                description: "Planning and coding only, for quick proofs of concept.".to_string(),
                entry: "Plan".to_string(),
                nodes: vec![plan_node(), code_node()],
                edges: vec![edge("Plan", "Code", Success)],
                max_stalls: Some(1),
                max_node_retries: Some(1),
            },
        ),
        (
            "minimal",
            ChainSpec {
                description: "Plan, code, write tests and run them.".to_string(),
                entry: "Plan".to_string(),
                nodes: vec![plan_node(), code_node(), test_gen_node(), unit_test_node()],
                edges: vec![
                    edge("Plan", "Code", Success),
                    edge("Code", "TestGen", Success),
                    edge("TestGen", "UnitTest", Success),
                ],
                max_stalls: Some(2),
                max_node_retries: None,
            },
        ),
        (
            "quality",
            ChainSpec {
                description: "Code, verify with tests, then scan for quality issues.".to_string(),
                entry: "Code".to_string(),
                nodes: vec![code_node(), unit_test_node(), scan_node()],
                edges: vec![
                    edge("Code", "UnitTest", Success),
                    edge("UnitTest", "Scan", Success),
                ],
                max_stalls: Some(2),
                max_node_retries: Some(1),
            },
        ),
        (
            "standard",
            ChainSpec {
                description: "Full flow: plan, code, test, repair and re-test, scan, structure."
                    .to_string(),
                entry: "Plan".to_string(),
                nodes: vec![
                    plan_node(),
                    code_node(),
                    test_gen_node(),
                    unit_test_node(),
                    refactor_node(),
                    scan_node(),
                    structure_node(),
                ],
                edges: vec![
                    edge("Plan", "Code", Success),
                    edge("Code", "TestGen", Success),
                    edge("TestGen", "UnitTest", Success),
                    edge("UnitTest", "Refactor", Failure),
                    edge("UnitTest", "Scan", Success),
                    edge("Refactor", "UnitTest", Success),
                    edge("Scan", "Structure", Success),
                ],
                max_stalls: None,
                max_node_retries: None,
            },
        ),
    ]
}

/// Names of all available profiles: built-ins first, then custom ones.
pub fn list_chains(custom: &BTreeMap<String, ChainSpec>) -> Vec<String> {
    let mut names: Vec<String> = builtin_chains()
        .into_iter()
        .map(|(name, _)| name.to_string())
        .collect();
    for name in custom.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

/// Look up and validate a chain profile. Custom profiles shadow built-ins.
pub fn get_chain(
    profile: &str,
    custom: &BTreeMap<String, ChainSpec>,
) -> Result<ChainGraph, ConfigError> {
    if let Some(spec) = custom.get(profile) {
        return ChainGraph::from_spec(profile, spec.clone());
    }
    match builtin_chains()
        .into_iter()
        .find(|(name, _)| *name == profile)
    {
        Some((name, spec)) => ChainGraph::from_spec(name, spec),
        None => Err(ConfigError::UnknownProfile {
            name: profile.to_string(),
            available: list_chains(custom),
        }),
    }
}
