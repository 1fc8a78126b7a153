//! Agent execution collaborator.
//!
//! The [`AgentRunner`] trait decouples the orchestrator from how a node's work
//! is actually performed. [`CommandAgentRunner`] spawns a configured command per
//! dispatch; tests use scripted runners that return predetermined reports.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::ledger::{KEY_MAIN_FILE, KEY_TEST_FILE};
use crate::core::types::CancelToken;
use crate::error::{CollaboratorError, ConfigError};
use crate::io::config::CommandConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::reasoner::split_command;

/// Parameters for one node dispatch.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub node: String,
    /// Instruction chosen by the decision engine.
    pub instruction: String,
    /// Fully rendered prompt (instruction plus ledger context).
    pub prompt: String,
    /// Read-only snapshot of the task ledger's project config.
    pub project_config: BTreeMap<String, String>,
    pub workdir: PathBuf,
    pub completion_marker: Option<String>,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

/// What an agent reported back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentReport {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    fn execute(&self, request: &AgentRequest) -> Result<AgentReport, CollaboratorError>;
}

/// Runner that spawns one process per dispatch.
///
/// The prompt is written to stdin. The node name and project paths are exported
/// as `CONDUCTOR_NODE`, `CONDUCTOR_MAIN_FILE` and `CONDUCTOR_TEST_FILE`.
#[derive(Debug, Clone)]
pub struct CommandAgentRunner {
    program: String,
    args: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandAgentRunner {
    pub fn from_config(config: &CommandConfig) -> Result<Self, ConfigError> {
        let (program, args) = split_command(config, "agent.command")?;
        Ok(Self {
            program,
            args,
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl AgentRunner for CommandAgentRunner {
    #[instrument(skip_all, fields(node = %request.node, program = %self.program))]
    fn execute(&self, request: &AgentRequest) -> Result<AgentReport, CollaboratorError> {
        info!(workdir = %request.workdir.display(), "dispatching agent");
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.workdir)
            .env("CONDUCTOR_NODE", &request.node);
        if let Some(main) = request.project_config.get(KEY_MAIN_FILE) {
            cmd.env("CONDUCTOR_MAIN_FILE", main);
        }
        if let Some(test) = request.project_config.get(KEY_TEST_FILE) {
            cmd.env("CONDUCTOR_TEST_FILE", test);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            Some(&request.cancel),
        )
        .map_err(|err| CollaboratorError::Unreachable(format!("{err:#}")))?;

        if output.cancelled {
            return Err(CollaboratorError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(CollaboratorError::Timeout(request.timeout));
        }

        let stdout = output.stdout_lossy();
        if let Some(report) = parse_report(&stdout) {
            debug!(success = report.success, "agent returned structured report");
            return Ok(report);
        }

        let marker_seen = request
            .completion_marker
            .as_deref()
            .is_none_or(|marker| stdout.contains(marker));
        if output.status.success() && marker_seen {
            return Ok(AgentReport::succeeded(stdout));
        }
        let error = if !output.status.success() {
            format!(
                "agent exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(400)
            )
        } else {
            format!(
                "agent finished without completion marker {}",
                request.completion_marker.as_deref().unwrap_or_default()
            )
        };
        Ok(AgentReport {
            success: false,
            output: stdout,
            error: Some(error),
        })
    }
}

/// A JSON report is accepted only when stdout is exactly one JSON object.
fn parse_report(stdout: &str) -> Option<AgentReport> {
    let trimmed = stdout.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
