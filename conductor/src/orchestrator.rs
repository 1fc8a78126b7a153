//! Run state machine: plan, decide, dispatch, replan.
//!
//! ```text
//! Planning -> Executing -> Completed
//!                |
//!                +-> Replanning -> Planning
//!                |       |
//!                +-------+-> Aborted
//! ```
//!
//! Every transition goes to `tracing` and to the run's `events.jsonl`. A run
//! always ends with a [`RunSummary`], aborts included; only startup and
//! artifact I/O failures surface as errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, bail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::budget::elapsed_ms;
use crate::core::chain::ChainGraph;
use crate::core::invariants::validate_progress;
use crate::core::ledger::{FailureNote, KEY_PROJECT_NAME, ProgressLedger, TaskLedger};
use crate::core::types::{
    AbortReason, CancelToken, Decision, ExecutionRecord, FailureDisposition, Phase, ReplanCause,
    RunOutcome,
};
use crate::decision::{DecisionPolicy, decide};
use crate::io::agent::{AgentRequest, AgentRunner};
use crate::io::config::ConductorConfig;
use crate::io::memory::{Memory, recall_notes, remember_note};
use crate::io::path_resolver::PathResolver;
use crate::io::prompt::{AgentPromptInput, FailureView, PromptBuilder};
use crate::io::reasoner::{Reasoner, with_backoff};
use crate::io::run_log::{EventKind, RunLog};
use crate::planning::{Planner, PlanningError};

/// Characters of agent output kept on an execution record.
const OUTPUT_PREVIEW_CHARS: usize = 400;

/// External collaborators a run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub reasoner: &'a dyn Reasoner,
    pub agent: &'a dyn AgentRunner,
    pub memory: &'a dyn Memory,
}

/// Final report of a run, written to `summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub chain: String,
    pub outcome: RunOutcome,
    pub replans: u32,
    pub total_duration_ms: u64,
    pub attempts_by_node: BTreeMap<String, u32>,
    pub run_dir: PathBuf,
    pub task_ledger: TaskLedger,
    pub progress_ledger: ProgressLedger,
}

/// How the executing phase ended.
enum ExecutionEnd {
    Satisfied,
    Cancelled,
    Replan(ReplanCause),
}

/// State owned by one run. Never shared across runs.
struct RunContext {
    task: TaskLedger,
    progress: ProgressLedger,
    resolver: PathResolver,
    log: RunLog,
    phase: Option<Phase>,
    replans: u32,
}

impl RunContext {
    fn event(&self, kind: EventKind) -> Result<()> {
        self.log.append(self.progress.cycle, kind)
    }

    fn transition(&mut self, to: Phase) -> Result<()> {
        info!(from = ?self.phase, to = ?to, cycle = self.progress.cycle, "phase transition");
        let from = self.phase.replace(to);
        self.event(EventKind::Phase { from, to })
    }
}

pub struct Orchestrator<'a> {
    config: ConductorConfig,
    graph: ChainGraph,
    workspace: PathBuf,
    collaborators: Collaborators<'a>,
    prompts: PromptBuilder,
    policy: DecisionPolicy,
    max_node_retries: u32,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: ConductorConfig,
        graph: ChainGraph,
        workspace: impl Into<PathBuf>,
        collaborators: Collaborators<'a>,
    ) -> Result<Self> {
        config.validate()?;
        let prompts = PromptBuilder::new(config.prompt.budget_bytes)?;
        let policy = DecisionPolicy::for_chain(&config, &graph);
        let max_node_retries = graph
            .max_node_retries()
            .unwrap_or(config.max_node_retries);
        Ok(Self {
            config,
            graph,
            workspace: workspace.into(),
            collaborators,
            prompts,
            policy,
            max_node_retries,
            cancel: CancelToken::new(),
        })
    }

    /// Use `token` for cooperative cancellation instead of a private one.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &ChainGraph {
        &self.graph
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn log_root(&self) -> PathBuf {
        self.workspace.join(&self.config.log_dir)
    }

    /// Drive `task` to a terminal phase and write the run summary.
    #[instrument(skip_all, fields(chain = %self.graph.name()))]
    pub fn run(&self, task: &str) -> Result<RunSummary> {
        let start = Instant::now();
        let log = RunLog::create(&self.log_root())?;
        info!(run_id = log.run_id(), "run started");
        let mut run = RunContext {
            task: TaskLedger::new(task, &self.graph),
            progress: ProgressLedger::new(&self.graph),
            resolver: PathResolver::new(&self.config.resolver),
            log,
            phase: None,
            replans: 0,
        };
        run.event(EventKind::RunStarted {
            task: task.to_string(),
            chain: self.graph.name().to_string(),
        })?;
        run.transition(Phase::Planning)?;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break RunOutcome::Aborted(AbortReason::Cancelled);
            }
            match self.plan(&mut run) {
                Ok(()) => {}
                Err(PlanningError::Collaborator(err)) => {
                    warn!(err = %err, "planning failed");
                    break RunOutcome::Aborted(AbortReason::PlanningFailed {
                        error: err.to_string(),
                    });
                }
                Err(PlanningError::Internal(err)) => return Err(err),
            }

            run.transition(Phase::Executing)?;
            let cause = match self.execute(&mut run)? {
                ExecutionEnd::Satisfied => break RunOutcome::Completed,
                ExecutionEnd::Cancelled => break RunOutcome::Aborted(AbortReason::Cancelled),
                ExecutionEnd::Replan(cause) => cause,
            };

            run.transition(Phase::Replanning)?;
            let fact = cause.as_fact();
            run.task.append_facts([fact.clone()]);
            run.event(EventKind::ReplanRequested { fact })?;
            if run.replans >= self.config.max_replans {
                warn!(replans = run.replans, "replan budget exhausted");
                break RunOutcome::Aborted(AbortReason::ReplanBudgetExceeded {
                    replans: run.replans,
                });
            }
            run.replans += 1;
            let next_cycle = run.progress.cycle + 1;
            run.progress.reset_for_cycle(&self.graph, next_cycle);
            run.transition(Phase::Planning)?;
        };

        run.transition(match outcome {
            RunOutcome::Completed => Phase::Completed,
            RunOutcome::Aborted(_) => Phase::Aborted,
        })?;
        run.progress.finalize();

        let summary = RunSummary {
            run_id: run.log.run_id().to_string(),
            chain: self.graph.name().to_string(),
            outcome,
            replans: run.replans,
            total_duration_ms: elapsed_ms(start),
            attempts_by_node: run.progress.attempts_by_node(),
            run_dir: run.log.dir().to_path_buf(),
            task_ledger: run.task,
            progress_ledger: run.progress,
        };
        let path = run.log.write_summary(&summary)?;
        info!(
            completed = summary.outcome.is_completed(),
            outcome = ?summary.outcome,
            summary = %path.display(),
            "run finished"
        );
        Ok(summary)
    }

    fn plan(&self, run: &mut RunContext) -> Result<(), PlanningError> {
        let planner = Planner {
            reasoner: self.collaborators.reasoner,
            prompts: &self.prompts,
            config: &self.config,
            workspace: &self.workspace,
        };
        let outcome = planner.plan(&mut run.task, &self.graph, &mut run.resolver)?;
        run.event(EventKind::Planned {
            facts_added: outcome.facts_added,
            plan_steps: outcome.plan_steps,
            naming_fallback: outcome.naming_fallback,
        })?;
        Ok(())
    }

    fn execute(&self, run: &mut RunContext) -> Result<ExecutionEnd> {
        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation observed");
                return Ok(ExecutionEnd::Cancelled);
            }
            let decision = decide(
                &run.task,
                &mut run.progress,
                &self.graph,
                self.collaborators.reasoner,
                &self.prompts,
                &self.policy,
            )?;
            run.event(EventKind::Decided {
                decision: decision.clone(),
            })?;

            match decision {
                Decision::Satisfied { .. } => return Ok(ExecutionEnd::Satisfied),
                Decision::Stalled { reason, .. } => {
                    return Ok(ExecutionEnd::Replan(ReplanCause::Stalled { reason }));
                }
                Decision::ParseError { error } => {
                    return Ok(ExecutionEnd::Replan(ReplanCause::Undecidable { error }));
                }
                Decision::Advance {
                    node, instruction, ..
                } => {
                    let cause = self.dispatch(run, &node, &instruction)?;
                    self.check_invariants(&run.progress)?;
                    if let Some(cause) = cause {
                        return Ok(ExecutionEnd::Replan(cause));
                    }
                }
            }
        }
    }

    /// Run one node and fold the outcome into the progress ledger.
    ///
    /// Returns a replan cause when the node failed for good and no failure
    /// edge can take over.
    #[instrument(skip_all, fields(node = %node, cycle = run.progress.cycle))]
    fn dispatch(
        &self,
        run: &mut RunContext,
        node: &str,
        instruction: &str,
    ) -> Result<Option<ReplanCause>> {
        run.event(EventKind::Dispatched {
            node: node.to_string(),
            retries: run.progress.retry_count(node),
        })?;

        let mut input = AgentPromptInput::new(node, instruction, &run.task, &run.progress, &self.graph);
        input.failure = failure_context(&run.progress, node);
        input.notes = self.recall(&run.task, node, instruction);
        let request = AgentRequest {
            node: node.to_string(),
            instruction: instruction.to_string(),
            prompt: self.prompts.build_agent(&input)?,
            project_config: run.task.project_config.clone(),
            workdir: self.workspace.clone(),
            completion_marker: self
                .graph
                .node(node)
                .and_then(|n| n.completion_marker.clone()),
            timeout: self.config.node_timeout(),
            cancel: self.cancel.clone(),
        };

        let started_at = Utc::now();
        let start = Instant::now();
        let result = with_backoff(
            self.config.collaborator_attempts,
            self.config.backoff_base(),
            |_| self.collaborators.agent.execute(&request),
        );
        let duration_ms = elapsed_ms(start);
        let (output, error) = match result {
            Ok(report) if report.success => (report.output, None),
            Ok(report) => {
                let error = report
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                (report.output, Some(error))
            }
            Err(err) => (String::new(), Some(err.to_string())),
        };
        let record = ExecutionRecord {
            cycle: run.progress.cycle,
            node: node.to_string(),
            started_at,
            success: error.is_none(),
            duration_ms,
            error: error.clone(),
            output_preview: preview(&output),
        };

        let Some(error) = error else {
            info!(duration_ms, "node succeeded");
            self.remember(&run.task, node, run.progress.cycle, &record.output_preview);
            let reopened = run
                .progress
                .record_success(record, &self.graph.success_successors(node));
            run.event(EventKind::NodeSucceeded {
                node: node.to_string(),
                duration_ms,
            })?;
            for target in reopened {
                info!(target = %target, "reopening failed node for re-verification");
                run.event(EventKind::NodeReopened {
                    node: target,
                    by: node.to_string(),
                })?;
            }
            return Ok(None);
        };

        let disposition = run
            .progress
            .record_failure(record, self.max_node_retries);
        warn!(error = %error, ?disposition, "node failed");
        run.event(EventKind::NodeFailed {
            node: node.to_string(),
            error: error.clone(),
            disposition,
        })?;
        if disposition == FailureDisposition::Retry {
            return Ok(None);
        }

        let routed_to = self
            .graph
            .failure_target(node)
            .filter(|target| run.progress.route_failure(node, target));
        run.task.record_exhausted(FailureNote {
            cycle: run.progress.cycle,
            node: node.to_string(),
            error: error.clone(),
            routed_to: routed_to.map(str::to_string),
        });
        if let Some(target) = routed_to {
            info!(target, "following failure edge");
            run.event(EventKind::FailureRouted {
                from: node.to_string(),
                to: target.to_string(),
            })?;
            return Ok(None);
        }
        Ok(Some(ReplanCause::NodeFailed {
            node: node.to_string(),
            error,
        }))
    }

    fn recall(&self, task: &TaskLedger, node: &str, instruction: &str) -> Vec<String> {
        if !self.config.memory.enabled {
            return Vec::new();
        }
        let query = format!("{} {node} {instruction}", task.original_task);
        recall_notes(
            self.collaborators.memory,
            &query,
            self.config.memory.recall_limit,
        )
        .into_iter()
        .map(|hit| hit.text)
        .collect()
    }

    fn remember(&self, task: &TaskLedger, node: &str, cycle: u32, output: &str) {
        if !self.config.memory.enabled || output.trim().is_empty() {
            return;
        }
        let mut metadata = BTreeMap::from([
            ("node".to_string(), node.to_string()),
            ("cycle".to_string(), cycle.to_string()),
        ]);
        if let Some(project) = task.config_value(KEY_PROJECT_NAME) {
            metadata.insert("project".to_string(), project.to_string());
        }
        remember_note(
            self.collaborators.memory,
            &format!("{node}: {}", output.trim()),
            metadata,
        );
    }

    fn check_invariants(&self, progress: &ProgressLedger) -> Result<()> {
        let violations = validate_progress(progress, &self.graph, self.max_node_retries);
        if !violations.is_empty() {
            bail!("progress ledger invariant violated: {}", violations.join("; "));
        }
        Ok(())
    }
}

/// Failure context for `node`: its own last failure when retrying, else the
/// failure of the node that routed to it.
fn failure_context(progress: &ProgressLedger, node: &str) -> Option<FailureView> {
    let source = if progress.retry_count(node) > 0 {
        node
    } else {
        progress.routed_from(node)?
    };
    let last = progress.last_failure(source)?;
    Some(FailureView {
        source: source.to_string(),
        retries: progress.retry_count(source),
        error: last.error.clone().unwrap_or_default(),
        output: last.output_preview.clone(),
    })
}

fn preview(output: &str) -> String {
    let trimmed = output.trim();
    match trimmed.char_indices().nth(OUTPUT_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::test_support::record;

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(OUTPUT_PREVIEW_CHARS + 10);
        let short = preview(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), OUTPUT_PREVIEW_CHARS + 3);
        assert_eq!(preview("  ok \n"), "ok");
    }

    #[test]
    fn failure_context_prefers_own_retry() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut progress = ProgressLedger::new(&graph);
        progress.activate("Plan", "go");
        progress.record_failure(record(1, "Plan", false), 2);
        let view = failure_context(&progress, "Plan").expect("context");
        assert_eq!(view.source, "Plan");
        assert_eq!(view.retries, 1);
        assert_eq!(view.error, "Plan failed");
    }

    #[test]
    fn failure_context_follows_failure_route() {
        let graph = get_chain("standard", &BTreeMap::new()).expect("standard");
        let mut progress = ProgressLedger::new(&graph);
        for _ in 0..3 {
            progress.activate("UnitTest", "run");
            progress.record_failure(record(1, "UnitTest", false), 2);
        }
        assert!(progress.route_failure("UnitTest", "Refactor"));
        let view = failure_context(&progress, "Refactor").expect("context");
        assert_eq!(view.source, "UnitTest");
        assert_eq!(view.retries, 3);
        assert!(failure_context(&progress, "Scan").is_none());
    }
}
