//! Prompt builder for reasoner and agent input.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a per-template order, then the last section is truncated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::chain::ChainGraph;
use crate::core::ledger::{ProgressLedger, TaskLedger};
use crate::core::types::{ExecutionRecord, NodeState};

const DECISION_TEMPLATE: &str = include_str!("prompts/decision.md");
const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");
const NAMING_TEMPLATE: &str = include_str!("prompts/naming.md");
const FACTS_TEMPLATE: &str = include_str!("prompts/facts.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");

const DECISION_DROP_ORDER: &[&str] = &["config", "plan", "facts", "history"];
const AGENT_DROP_ORDER: &[&str] = &["memory", "state", "plan", "failure"];
const FACTS_DROP_ORDER: &[&str] = &["facts", "paths"];
const PLAN_DROP_ORDER: &[&str] = &["previous", "failures", "facts"];

#[derive(Debug, Clone, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub name: String,
    pub description: String,
    pub state: NodeState,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateView {
    pub name: String,
    pub description: String,
}

fn config_entries(config: &BTreeMap<String, String>) -> Vec<ConfigEntry> {
    config
        .iter()
        .map(|(key, value)| ConfigEntry {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn node_views(graph: &ChainGraph, progress: &ProgressLedger) -> Vec<NodeView> {
    graph
        .nodes()
        .iter()
        .map(|node| NodeView {
            name: node.name.clone(),
            description: node.description.clone(),
            state: progress.state(&node.name),
            retries: progress.retry_count(&node.name),
        })
        .collect()
}

/// Inputs for a decision prompt.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionPromptInput {
    pub task: String,
    pub facts: Vec<String>,
    pub plan: Vec<String>,
    pub config: Vec<ConfigEntry>,
    pub nodes: Vec<NodeView>,
    pub history: Vec<ExecutionRecord>,
    pub candidates: Vec<CandidateView>,
    pub candidate_names: String,
    /// Set when exactly one node is ready.
    pub fixed_node: Option<String>,
    /// Why the previous reply was rejected, on re-prompts.
    pub clarification: Option<String>,
}

impl DecisionPromptInput {
    pub fn from_ledgers(
        task: &TaskLedger,
        progress: &ProgressLedger,
        graph: &ChainGraph,
        candidates: &[&str],
        history_window: usize,
    ) -> Self {
        let candidates: Vec<CandidateView> = candidates
            .iter()
            .map(|name| CandidateView {
                name: (*name).to_string(),
                description: graph
                    .node(name)
                    .map(|node| node.description.clone())
                    .unwrap_or_default(),
            })
            .collect();
        let candidate_names = candidates
            .iter()
            .map(|candidate| candidate.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let fixed_node = match candidates.as_slice() {
            [only] => Some(only.name.clone()),
            _ => None,
        };
        Self {
            task: task.original_task.clone(),
            facts: task.facts.clone(),
            plan: task.plan.clone(),
            config: config_entries(&task.project_config),
            nodes: node_views(graph, progress),
            history: progress.recent_history(history_window).to_vec(),
            candidates,
            candidate_names,
            fixed_node,
            clarification: None,
        }
    }
}

/// Failure context shown to an agent on retry or after a failure edge.
#[derive(Debug, Clone, Serialize)]
pub struct FailureView {
    /// Node that failed: the agent itself on retry, or the upstream node.
    pub source: String,
    pub retries: u32,
    pub error: String,
    pub output: String,
}

/// Inputs for an agent prompt.
#[derive(Debug, Clone, Serialize)]
pub struct AgentPromptInput {
    pub node: String,
    pub description: String,
    pub completion_marker: Option<String>,
    pub instruction: String,
    pub task: String,
    pub config: Vec<ConfigEntry>,
    pub plan: Vec<String>,
    pub nodes: Vec<NodeView>,
    pub failure: Option<FailureView>,
    pub notes: Vec<String>,
}

impl AgentPromptInput {
    pub fn new(
        node: &str,
        instruction: &str,
        task: &TaskLedger,
        progress: &ProgressLedger,
        graph: &ChainGraph,
    ) -> Self {
        let chain_node = graph.node(node);
        Self {
            node: node.to_string(),
            description: chain_node
                .map(|n| n.description.clone())
                .unwrap_or_default(),
            completion_marker: chain_node.and_then(|n| n.completion_marker.clone()),
            instruction: instruction.to_string(),
            task: task.original_task.clone(),
            config: config_entries(&task.project_config),
            plan: task.plan.clone(),
            nodes: node_views(graph, progress),
            failure: None,
            notes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamingPromptInput {
    pub task: String,
    pub extension: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FactsPromptInput {
    pub task: String,
    pub facts: Vec<String>,
    pub path_report: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanPromptInput {
    pub task: String,
    pub team: Vec<CandidateView>,
    pub config: Vec<ConfigEntry>,
    pub facts: Vec<String>,
    pub previous_plan: Vec<String>,
    /// One line per exhausted node from earlier cycles.
    pub failures: Vec<String>,
}

impl PlanPromptInput {
    pub fn new(task: &TaskLedger, graph: &ChainGraph) -> Self {
        Self {
            task: task.original_task.clone(),
            team: graph
                .success_order()
                .into_iter()
                .map(|name| CandidateView {
                    name: name.to_string(),
                    description: task
                        .node_capabilities
                        .get(name)
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect(),
            config: config_entries(&task.project_config),
            facts: task.facts.clone(),
            previous_plan: task.plan.clone(),
            failures: task
                .failure_history
                .iter()
                .map(|note| {
                    let outcome = match &note.routed_to {
                        Some(target) => format!("handed to {target}"),
                        None => "cycle replanned".to_string(),
                    };
                    format!(
                        "cycle {}: {} failed ({}); {outcome}",
                        note.cycle, note.node, note.error
                    )
                })
                .collect(),
        }
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex is valid")
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let key = caps.get(1)?.as_str().to_string();
            let required = caps.get(2)?.as_str() == "required";
            Some((whole.start(), whole.end(), key, required))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, body_start, key, required)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|(next_start, ..)| *next_start)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize, drop_order: &[&str]) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in drop_order {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other_len: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other_len);
    if last.content.len() > allowed {
        let before_len = last.content.len();
        let marker = "\n[truncated]";
        let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
        last.content.truncate(keep);
        if allowed > marker.len() {
            last.content.push_str(marker);
        }
        debug!(
            section = last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders every prompt the orchestrator sends, within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("decision", DECISION_TEMPLATE),
            ("agent", AGENT_TEMPLATE),
            ("naming", NAMING_TEMPLATE),
            ("facts", FACTS_TEMPLATE),
            ("plan", PLAN_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load {name} template"))?;
        }
        Ok(Self { env, budget_bytes })
    }

    pub fn build_decision(&self, input: &DecisionPromptInput) -> Result<String> {
        self.build("decision", input, DECISION_DROP_ORDER)
    }

    pub fn build_agent(&self, input: &AgentPromptInput) -> Result<String> {
        self.build("agent", input, AGENT_DROP_ORDER)
    }

    pub fn build_naming(&self, input: &NamingPromptInput) -> Result<String> {
        self.build("naming", input, &[])
    }

    pub fn build_facts(&self, input: &FactsPromptInput) -> Result<String> {
        self.build("facts", input, FACTS_DROP_ORDER)
    }

    pub fn build_plan(&self, input: &PlanPromptInput) -> Result<String> {
        self.build("plan", input, PLAN_DROP_ORDER)
    }

    fn build<S: Serialize>(&self, name: &str, input: &S, drop_order: &[&str]) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)?
            .render(input)
            .with_context(|| format!("render {name} prompt"))?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes, drop_order);
        Ok(render_sections(&sections))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::core::ledger::FailureNote;
    use crate::test_support::record;

    fn ledgers(chain: &str) -> (ChainGraph, TaskLedger, ProgressLedger) {
        let graph = get_chain(chain, &BTreeMap::new()).expect("chain");
        let mut task = TaskLedger::new("build a calculator", &graph);
        task.append_facts(["division by zero must raise"]);
        task.replace_plan(vec!["write calc.py".to_string(), "test it".to_string()]);
        task.set_config("main_file_path", "calc.py");
        let progress = ProgressLedger::new(&graph);
        (graph, task, progress)
    }

    #[test]
    fn decision_prompt_sections_are_ordered() {
        let (graph, task, mut progress) = ledgers("standard");
        progress.activate("Plan", "go");
        progress.record_success(record(1, "Plan", true), &["Code"]);
        let input = DecisionPromptInput::from_ledgers(&task, &progress, &graph, &["Code"], 5);
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build_decision(&input)
            .expect("render");

        let contract = prompt.find("### Orchestrator Contract").expect("contract");
        let task_pos = prompt.find("### Task").expect("task");
        let history = prompt.find("### Recent History").expect("history");
        let facts = prompt.find("### Facts").expect("facts");
        assert!(contract < task_pos && task_pos < history && history < facts);
        assert!(prompt.contains("exactly one next step: Code"));
        assert!(!prompt.contains("\"next_speaker\""));
    }

    #[test]
    fn branching_decision_asks_for_next_speaker() {
        let (graph, task, progress) = ledgers("standard");
        let input =
            DecisionPromptInput::from_ledgers(&task, &progress, &graph, &["Scan", "Structure"], 5);
        assert!(input.fixed_node.is_none());
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build_decision(&input)
            .expect("render");
        assert!(prompt.contains("\"next_speaker\""));
        assert!(prompt.contains("Scan, Structure"));
    }

    #[test]
    fn tight_budget_drops_context_but_keeps_contract() {
        let (graph, mut task, progress) = ledgers("minimal");
        task.append_facts((0..50).map(|i| format!("fact number {i} about the calculator")));
        let input = DecisionPromptInput::from_ledgers(&task, &progress, &graph, &["Plan"], 5);
        let prompt = PromptBuilder::new(1_500)
            .expect("builder")
            .build_decision(&input)
            .expect("render");
        assert!(!prompt.contains("### Facts"));
        assert!(!prompt.contains("### Project Config"));
        assert!(prompt.contains("### Orchestrator Contract"));
        assert!(prompt.contains("### Node States"));
    }

    #[test]
    fn agent_prompt_carries_failure_context() {
        let (graph, task, progress) = ledgers("minimal");
        let mut input = AgentPromptInput::new("UnitTest", "run the tests", &task, &progress, &graph);
        input.failure = Some(FailureView {
            source: "UnitTest".to_string(),
            retries: 1,
            error: "1 test failed".to_string(),
            output: String::new(),
        });
        input.notes = vec!["calc.divide raises ValueError".to_string()];
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build_agent(&input)
            .expect("render");
        assert!(prompt.contains("Your previous attempt (retry 1) failed."));
        assert!(prompt.contains("Error: 1 test failed"));
        assert!(prompt.contains("UNIT_TESTING_COMPLETE"));
        assert!(prompt.contains("main_file_path = calc.py"));
        assert!(prompt.contains("### Notes From Earlier Work"));
    }

    #[test]
    fn plan_prompt_lists_earlier_failures() {
        let (graph, mut task, _) = ledgers("standard");
        task.record_exhausted(FailureNote {
            cycle: 1,
            node: "UnitTest".to_string(),
            error: "2 tests failed".to_string(),
            routed_to: Some("Refactor".to_string()),
        });
        task.record_exhausted(FailureNote {
            cycle: 1,
            node: "UnitTest".to_string(),
            error: "1 test failed".to_string(),
            routed_to: None,
        });
        let prompt = PromptBuilder::new(10_000)
            .expect("builder")
            .build_plan(&PlanPromptInput::new(&task, &graph))
            .expect("render");
        assert!(prompt.contains("### Earlier Failures"));
        assert!(prompt.contains("cycle 1: UnitTest failed (2 tests failed); handed to Refactor"));
        assert!(prompt.contains("cycle 1: UnitTest failed (1 test failed); cycle replanned"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "task".to_string(),
            required: true,
            content: "é".repeat(40),
        }];
        apply_budget_to_sections(&mut sections, 25, &[]);
        assert!(sections[0].content.ends_with("[truncated]"));
        assert!(sections[0].content.len() <= 25);
    }
}
