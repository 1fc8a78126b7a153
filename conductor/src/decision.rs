//! Decision engine: turns ledger state into the next action.
//!
//! The reasoner supplies judgment (satisfied, looping, progressing) and the
//! instruction text. This module owns the policy around it: reply parsing and
//! validation, clarifying re-prompts, stall counting, and the deterministic
//! fallback to chain order when the reasoner cannot be used.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::chain::ChainGraph;
use crate::core::ledger::{KEY_MAIN_FILE, KEY_PROJECT_NAME, KEY_TEST_FILE, ProgressLedger, TaskLedger};
use crate::core::selector::{fallback_node, ready_candidates};
use crate::core::types::{Decision, DecisionBasis};
use crate::error::CollaboratorError;
use crate::io::config::ConductorConfig;
use crate::io::prompt::{DecisionPromptInput, PromptBuilder};
use crate::io::reasoner::{PROGRESS_JUDGMENT_SCHEMA, Reasoner, parse_structured, with_backoff};

/// Thresholds the engine applies. Built from [`ConductorConfig`], with the
/// chain's own stall limit taking precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub max_stalls: u32,
    pub parse_retries: u32,
    pub history_window: usize,
    pub collaborator_attempts: u32,
    pub backoff_base: Duration,
}

impl From<&ConductorConfig> for DecisionPolicy {
    fn from(config: &ConductorConfig) -> Self {
        Self {
            max_stalls: config.max_stalls,
            parse_retries: config.decision_parse_retries,
            history_window: config.history_window,
            collaborator_attempts: config.collaborator_attempts,
            backoff_base: config.backoff_base(),
        }
    }
}

impl DecisionPolicy {
    pub fn for_chain(config: &ConductorConfig, graph: &ChainGraph) -> Self {
        Self {
            max_stalls: graph.max_stalls().unwrap_or(config.max_stalls),
            ..Self::from(config)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Answer<T> {
    reason: String,
    answer: T,
}

#[derive(Debug, Clone, Deserialize)]
struct Judgment {
    is_request_satisfied: Answer<bool>,
    is_in_loop: Answer<bool>,
    is_progress_being_made: Answer<bool>,
    #[serde(default)]
    next_speaker: Option<Answer<String>>,
    instruction_or_question: Answer<String>,
}

/// Parse a judgment reply and resolve the node it nominates.
///
/// With a single candidate the node is fixed and `next_speaker` is ignored.
fn parse_judgment(reply: &str, candidates: &[&str]) -> Result<(Judgment, String), CollaboratorError> {
    let value = parse_structured(reply, PROGRESS_JUDGMENT_SCHEMA)?;
    let judgment: Judgment = serde_json::from_value(value)
        .map_err(|err| CollaboratorError::Parse(format!("judgment shape: {err}")))?;

    if let [only] = candidates {
        return Ok((judgment, (*only).to_string()));
    }
    let speaker = judgment
        .next_speaker
        .as_ref()
        .ok_or_else(|| CollaboratorError::Parse("next_speaker is required".to_string()))?;
    debug!(speaker = %speaker.answer, reason = %speaker.reason, "reasoner nominated next speaker");
    let speaker = speaker.answer.trim();
    let node = candidates
        .iter()
        .find(|candidate| **candidate == speaker)
        .or_else(|| {
            candidates
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(speaker))
        })
        .ok_or_else(|| {
            CollaboratorError::Parse(format!(
                "next_speaker '{speaker}' is not one of: {}",
                candidates.join(", ")
            ))
        })?;
    Ok((judgment, (*node).to_string()))
}

/// Instruction used when the reasoner could not supply one.
pub fn default_instruction(graph: &ChainGraph, task: &TaskLedger, node: &str) -> String {
    let description = graph
        .node(node)
        .map(|n| n.description.as_str())
        .filter(|d| !d.is_empty())
        .unwrap_or("Complete your step of the task.");
    let mut instruction = format!("{description} Task: {}", task.original_task);
    let project = task.config_value(KEY_PROJECT_NAME);
    let main = task.config_value(KEY_MAIN_FILE);
    let test = task.config_value(KEY_TEST_FILE);
    if let Some(project) = project {
        instruction.push_str(&format!(" Project: {project}."));
    }
    if let Some(main) = main {
        instruction.push_str(&format!(" Main file: {main}."));
    }
    if let Some(test) = test {
        instruction.push_str(&format!(" Test file: {test}."));
    }
    instruction
}

/// Decide the next action and, on `Advance`, activate the chosen node.
///
/// Errors only when a prompt cannot be rendered; every collaborator failure is
/// folded into the returned [`Decision`].
#[instrument(skip_all, fields(cycle = progress.cycle))]
pub fn decide(
    task: &TaskLedger,
    progress: &mut ProgressLedger,
    graph: &ChainGraph,
    reasoner: &dyn Reasoner,
    prompts: &PromptBuilder,
    policy: &DecisionPolicy,
) -> Result<Decision> {
    let candidates = ready_candidates(graph, progress);
    if candidates.is_empty() {
        debug!("no ready nodes remain");
        return Ok(Decision::Satisfied {
            reason: "every reachable node has finished".to_string(),
        });
    }

    let mut input = DecisionPromptInput::from_ledgers(
        task,
        progress,
        graph,
        &candidates,
        policy.history_window,
    );
    let mut last_error = String::new();

    for attempt in 0..policy.parse_retries.max(1) {
        let prompt = prompts.build_decision(&input)?;
        let reply = with_backoff(policy.collaborator_attempts, policy.backoff_base, |_| {
            reasoner.complete(&prompt)
        });
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(attempt, err = %err, "decision reasoner unavailable");
                last_error = err.to_string();
                break;
            }
        };
        match parse_judgment(&reply, &candidates) {
            Ok((judgment, node)) => {
                let fixed = candidates.len() == 1;
                return Ok(apply_judgment(progress, judgment, node, fixed, policy));
            }
            Err(err) => {
                warn!(attempt, err = %err, "decision reply rejected");
                input.clarification = Some(format!("Your previous reply was rejected: {err}"));
                last_error = err.to_string();
            }
        }
    }

    match fallback_node(graph, progress) {
        Some(node) => {
            let instruction = default_instruction(graph, task, node);
            info!(node, error = %last_error, "falling back to chain order");
            progress.activate(node, instruction.clone());
            Ok(Decision::Advance {
                node: node.to_string(),
                instruction,
                basis: DecisionBasis::Fallback { error: last_error },
            })
        }
        None => Ok(Decision::ParseError { error: last_error }),
    }
}

fn apply_judgment(
    progress: &mut ProgressLedger,
    judgment: Judgment,
    node: String,
    fixed: bool,
    policy: &DecisionPolicy,
) -> Decision {
    if judgment.is_request_satisfied.answer {
        info!("reasoner reports the request satisfied");
        return Decision::Satisfied {
            reason: judgment.is_request_satisfied.reason,
        };
    }

    if judgment.is_in_loop.answer || !judgment.is_progress_being_made.answer {
        let stall_counter = progress.register_stall();
        let reason = if judgment.is_in_loop.answer {
            judgment.is_in_loop.reason
        } else {
            judgment.is_progress_being_made.reason
        };
        warn!(stall_counter, max = policy.max_stalls, reason = %reason, "no progress");
        if stall_counter >= policy.max_stalls {
            return Decision::Stalled {
                reason,
                stall_counter,
            };
        }
    } else {
        progress.clear_stall();
    }

    let instruction = judgment.instruction_or_question.answer;
    debug!(
        node = %node,
        fixed,
        reason = %judgment.instruction_or_question.reason,
        "advancing"
    );
    progress.activate(&node, instruction.clone());
    Decision::Advance {
        node,
        instruction,
        basis: if fixed {
            DecisionBasis::FixedEdge
        } else {
            DecisionBasis::Reasoner
        },
    }
}
