//! Test-only helpers: scripted collaborators and ledger fixtures.
//!
//! Reasoner replies are routed by the contract heading of each prompt, so one
//! scripted reasoner serves naming, facts, planning and decisions.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::core::chain::{ChainEdge, ChainNode, ChainSpec, EdgeKind};
use crate::core::types::{CancelToken, ExecutionRecord};
use crate::error::CollaboratorError;
use crate::io::agent::{AgentReport, AgentRequest, AgentRunner};
use crate::io::config::ConductorConfig;
use crate::io::reasoner::Reasoner;

/// Deterministic execution record.
pub fn record(cycle: u32, node: &str, success: bool) -> ExecutionRecord {
    ExecutionRecord {
        cycle,
        node: node.to_string(),
        started_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
        success,
        duration_ms: 10,
        error: (!success).then(|| format!("{node} failed")),
        output_preview: String::new(),
    }
}

/// `Plan -> Code`, then `Scan` and `Structure` as independent branches.
pub fn fork_chain_spec() -> ChainSpec {
    let node = |name: &str| ChainNode {
        name: name.to_string(),
        description: format!("{name} step."),
        completion_marker: None,
    };
    let edge = |from: &str, to: &str| ChainEdge {
        from: from.to_string(),
        to: to.to_string(),
        on: EdgeKind::Success,
    };
    ChainSpec {
        description: "Two finishing branches.".to_string(),
        entry: "Plan".to_string(),
        nodes: ["Plan", "Code", "Scan", "Structure"].map(node).to_vec(),
        edges: vec![
            edge("Plan", "Code"),
            edge("Code", "Scan"),
            edge("Code", "Structure"),
        ],
        max_stalls: None,
        max_node_retries: None,
    }
}

/// Judgment reply in the reasoner's JSON contract.
pub fn judgment(
    satisfied: bool,
    in_loop: bool,
    progress: bool,
    next_speaker: Option<&str>,
    instruction: &str,
) -> String {
    let mut value = serde_json::json!({
        "is_request_satisfied": {"reason": "checked the ledger", "answer": satisfied},
        "is_in_loop": {"reason": "compared recent history", "answer": in_loop},
        "is_progress_being_made": {"reason": "compared recent history", "answer": progress},
        "instruction_or_question": {"reason": "next step of the plan", "answer": instruction},
    });
    if let Some(next) = next_speaker {
        value["next_speaker"] = serde_json::json!({"reason": "chain order", "answer": next});
    }
    format!("```json\n{value}\n```")
}

pub const NAMING_REPLY: &str = r#"{"project_name": "calculator", "main_file": "calculator.py", "test_file": "test_calculator.py", "description": "Simple calculator"}"#;
pub const FACTS_REPLY: &str = "- the calculator supports add, subtract, multiply, divide\n- division by zero raises ValueError";
pub const PLAN_REPLY: &str = "1. Write calculator.py\n2. Write test_calculator.py\n3. Run the tests";

/// Default behaviour for decision prompts once the scripted queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionMode {
    /// Progressing, never satisfied; nominates the first candidate.
    Progressing,
    /// Reports a loop on every step.
    Stuck,
    /// Replies with prose that contains no JSON.
    Unparseable,
    /// Fails every call as unreachable.
    Unreachable,
}

/// Reasoner that answers from scripts and records every prompt.
pub struct ScriptedReasoner {
    naming: Result<String, CollaboratorError>,
    facts: Result<String, CollaboratorError>,
    plan: Result<String, CollaboratorError>,
    decisions: RefCell<VecDeque<Result<String, CollaboratorError>>>,
    mode: DecisionMode,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedReasoner {
    fn with_mode(mode: DecisionMode) -> Self {
        Self {
            naming: Ok(NAMING_REPLY.to_string()),
            facts: Ok(FACTS_REPLY.to_string()),
            plan: Ok(PLAN_REPLY.to_string()),
            decisions: RefCell::new(VecDeque::new()),
            mode,
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn progressing() -> Self {
        Self::with_mode(DecisionMode::Progressing)
    }

    pub fn stuck() -> Self {
        Self::with_mode(DecisionMode::Stuck)
    }

    pub fn unparseable() -> Self {
        Self::with_mode(DecisionMode::Unparseable)
    }

    pub fn decision_unreachable() -> Self {
        Self::with_mode(DecisionMode::Unreachable)
    }

    /// Queue decision replies served before the default mode applies.
    pub fn with_decisions(self, replies: Vec<Result<String, CollaboratorError>>) -> Self {
        self.decisions.borrow_mut().extend(replies);
        self
    }

    pub fn with_naming(mut self, reply: Result<String, CollaboratorError>) -> Self {
        self.naming = reply;
        self
    }

    pub fn with_plan(mut self, reply: Result<String, CollaboratorError>) -> Self {
        self.plan = reply;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn decision_prompts(&self) -> Vec<String> {
        self.prompts
            .borrow()
            .iter()
            .filter(|prompt| prompt.contains("### Orchestrator Contract"))
            .cloned()
            .collect()
    }

    pub fn decision_calls(&self) -> usize {
        self.decision_prompts().len()
    }

    fn decide_by_mode(&self, prompt: &str) -> Result<String, CollaboratorError> {
        match self.mode {
            DecisionMode::Progressing => Ok(judgment(
                false,
                false,
                true,
                first_candidate(prompt).as_deref(),
                "continue with the plan",
            )),
            DecisionMode::Stuck => Ok(judgment(
                false,
                true,
                false,
                first_candidate(prompt).as_deref(),
                "try the same thing again",
            )),
            DecisionMode::Unparseable => Ok("I think the coder should go next.".to_string()),
            DecisionMode::Unreachable => Err(CollaboratorError::Unreachable(
                "connection refused".to_string(),
            )),
        }
    }
}

/// First name in the "Choose who runs next from: A, B." line, if any.
fn first_candidate(prompt: &str) -> Option<String> {
    let rest = prompt.split("Choose who runs next from: ").nth(1)?;
    let line = rest.lines().next()?;
    line.trim_end_matches('.')
        .split(", ")
        .next()
        .map(str::to_string)
}

impl Reasoner for ScriptedReasoner {
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError> {
        self.prompts.borrow_mut().push(prompt.to_string());
        if prompt.contains("### Naming Contract") {
            return self.naming.clone();
        }
        if prompt.contains("### Facts Contract") {
            return self.facts.clone();
        }
        if prompt.contains("### Plan Contract") {
            return self.plan.clone();
        }
        if let Some(reply) = self.decisions.borrow_mut().pop_front() {
            return reply;
        }
        self.decide_by_mode(prompt)
    }
}

/// Agent runner that serves per-node scripted outcomes and records requests.
///
/// Nodes without a script (or whose script ran out) succeed.
#[derive(Default)]
pub struct ScriptedAgentRunner {
    scripts: RefCell<BTreeMap<String, VecDeque<Result<AgentReport, CollaboratorError>>>>,
    always_fail: RefCell<Vec<String>>,
    requests: RefCell<Vec<AgentRequest>>,
    cancel_after: RefCell<Option<(usize, CancelToken)>>,
}

impl ScriptedAgentRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for `node`, served in order.
    pub fn with_outcomes(
        self,
        node: &str,
        outcomes: Vec<Result<AgentReport, CollaboratorError>>,
    ) -> Self {
        self.scripts
            .borrow_mut()
            .entry(node.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Fail `node` on every dispatch.
    pub fn failing(self, node: &str) -> Self {
        self.always_fail.borrow_mut().push(node.to_string());
        self
    }

    /// Cancel `token` once `dispatches` requests have been served.
    pub fn cancel_after(self, dispatches: usize, token: CancelToken) -> Self {
        *self.cancel_after.borrow_mut() = Some((dispatches, token));
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.borrow().clone()
    }

    pub fn dispatched_nodes(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.node.clone())
            .collect()
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn execute(&self, request: &AgentRequest) -> Result<AgentReport, CollaboratorError> {
        self.requests.borrow_mut().push(request.clone());
        if let Some((after, token)) = self.cancel_after.borrow().as_ref()
            && self.requests.borrow().len() >= *after
        {
            token.cancel();
        }
        if self.always_fail.borrow().contains(&request.node) {
            return Ok(AgentReport::failed(format!("{} keeps failing", request.node)));
        }
        let scripted = self
            .scripts
            .borrow_mut()
            .get_mut(&request.node)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            Ok(AgentReport::succeeded(format!(
                "{} done {}",
                request.node,
                request.completion_marker.as_deref().unwrap_or_default()
            )))
        })
    }
}

/// Temporary workspace with a fast, deterministic config.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path().join(".conductor").join("runs")
    }

    /// Defaults with zero backoff so retries do not sleep.
    pub fn config(&self) -> ConductorConfig {
        ConductorConfig {
            backoff_base_ms: 0,
            ..ConductorConfig::default()
        }
    }

    pub fn write_file(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}
