//! Reasoning collaborator: the LLM behind planning and decisions.
//!
//! The [`Reasoner`] trait keeps orchestration independent of the backend.
//! [`CommandReasoner`] pipes the prompt to an external command (for example
//! `llm`) and reads the reply from stdout. Tests use scripted reasoners.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use jsonschema::validator_for;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::budget::backoff_delay;
use crate::error::{CollaboratorError, ConfigError};
use crate::io::config::CommandConfig;
use crate::io::process::run_command_with_timeout;

pub const PROGRESS_JUDGMENT_SCHEMA: &str =
    include_str!("../schemas/progress_judgment.schema.json");
pub const PROJECT_NAMING_SCHEMA: &str = include_str!("../schemas/project_naming.schema.json");

/// Abstraction over reasoning backends.
pub trait Reasoner {
    /// Send `prompt` and return the raw reply text.
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError>;
}

impl<R: Reasoner + ?Sized> Reasoner for &R {
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError> {
        (**self).complete(prompt)
    }
}

/// Reasoner backed by an external command. Prompt on stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandReasoner {
    pub fn from_config(config: &CommandConfig, workdir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (program, args) = split_command(config, "reasoner.command")?;
        Ok(Self {
            program,
            args,
            workdir,
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(program = %self.program, prompt_bytes = prompt.len()))]
    fn complete(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            None,
        )
        .map_err(|err| CollaboratorError::Unreachable(format!("{err:#}")))?;

        if output.timed_out {
            return Err(CollaboratorError::Timeout(self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoner command failed");
            return Err(CollaboratorError::Unreachable(format!(
                "reasoner exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(400)
            )));
        }
        debug!(reply_bytes = output.stdout.len(), "reasoner replied");
        Ok(output.stdout_lossy())
    }
}

pub(crate) fn split_command(
    config: &CommandConfig,
    field: &'static str,
) -> Result<(String, Vec<String>), ConfigError> {
    match config.command.split_first() {
        Some((program, args)) if !program.trim().is_empty() => {
            Ok((program.clone(), args.to_vec()))
        }
        _ => Err(ConfigError::InvalidValue {
            field,
            reason: "must be a non-empty array".to_string(),
        }),
    }
}

/// Run `op`, retrying only `Unreachable` failures with exponential backoff.
///
/// `op` receives the zero-based attempt number. At least one attempt is made.
pub fn with_backoff<T, F>(attempts: u32, base: Duration, mut op: F) -> Result<T, CollaboratorError>
where
    F: FnMut(u32) -> Result<T, CollaboratorError>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(attempt, ?delay, err = %err, "collaborator unreachable, backing off");
                thread::sleep(delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Extract the first JSON object from a reply.
///
/// Prefers a fenced code block; otherwise takes the outermost `{ ... }` span.
pub fn extract_json_object(reply: &str) -> Result<Value, CollaboratorError> {
    static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex is valid")
    });

    if let Some(caps) = FENCED_RE.captures(reply)
        && let Some(body) = caps.get(1)
        && let Ok(value) = serde_json::from_str::<Value>(body.as_str())
    {
        return ensure_object(value);
    }

    let start = reply.find('{');
    let end = reply.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            let value: Value = serde_json::from_str(&reply[start..=end])
                .map_err(|err| CollaboratorError::Parse(format!("invalid JSON: {err}")))?;
            ensure_object(value)
        }
        _ => Err(CollaboratorError::Parse(
            "reply contains no JSON object".to_string(),
        )),
    }
}

fn ensure_object(value: Value) -> Result<Value, CollaboratorError> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(CollaboratorError::Parse("reply JSON is not an object".to_string()))
    }
}

/// Validate `instance` against a bundled JSON Schema.
pub fn validate_reply(schema_raw: &str, instance: &Value) -> Result<(), CollaboratorError> {
    let schema: Value = serde_json::from_str(schema_raw)
        .map_err(|err| CollaboratorError::Parse(format!("bundled schema unreadable: {err}")))?;
    let compiled = validator_for(&schema)
        .map_err(|err| CollaboratorError::Parse(format!("invalid schema: {err}")))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(CollaboratorError::Parse(format!(
            "schema validation failed: {}",
            messages.join("; ")
        )));
    }
    Ok(())
}

/// Extract, then schema-check, a structured reply.
pub fn parse_structured(reply: &str, schema_raw: &str) -> Result<Value, CollaboratorError> {
    let value = extract_json_object(reply)?;
    validate_reply(schema_raw, &value)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn extracts_fenced_json_over_surrounding_braces() {
        let reply = "thinking {not json}\n```json\n{\"a\": 1}\n```\ndone";
        let value = extract_json_object(reply).expect("json");
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn extracts_outermost_braces_without_fence() {
        let reply = "Here you go: {\"a\": {\"b\": true}} hope it helps";
        let value = extract_json_object(reply).expect("json");
        assert_eq!(value["a"]["b"], true);
    }

    #[test]
    fn reply_without_object_is_parse_failure() {
        assert!(matches!(
            extract_json_object("no structure here"),
            Err(CollaboratorError::Parse(_))
        ));
        assert!(matches!(
            extract_json_object("{broken"),
            Err(CollaboratorError::Parse(_))
        ));
    }

    #[test]
    fn judgment_schema_requires_core_keys() {
        let missing = serde_json::json!({
            "is_request_satisfied": {"reason": "r", "answer": false},
            "is_in_loop": {"reason": "r", "answer": false}
        });
        let err = validate_reply(PROGRESS_JUDGMENT_SCHEMA, &missing).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn judgment_schema_accepts_without_next_speaker() {
        let value = serde_json::json!({
            "is_request_satisfied": {"reason": "r", "answer": false},
            "is_in_loop": {"reason": "r", "answer": false},
            "is_progress_being_made": {"reason": "r", "answer": true},
            "instruction_or_question": {"reason": "r", "answer": "write code"}
        });
        validate_reply(PROGRESS_JUDGMENT_SCHEMA, &value).expect("valid");
    }

    #[test]
    fn backoff_retries_only_unreachable() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_backoff(3, Duration::ZERO, |_| {
            calls.set(calls.get() + 1);
            Err(CollaboratorError::Unreachable("down".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);

        calls.set(0);
        let result: Result<(), _> = with_backoff(3, Duration::ZERO, |_| {
            calls.set(calls.get() + 1);
            Err(CollaboratorError::Timeout(Duration::from_secs(1)))
        });
        assert!(matches!(result, Err(CollaboratorError::Timeout(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_returns_first_success() {
        let result = with_backoff(3, Duration::ZERO, |attempt| {
            if attempt == 0 {
                Err(CollaboratorError::Unreachable("blip".to_string()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn empty_command_is_config_error() {
        let config = CommandConfig::default();
        assert!(matches!(
            CommandReasoner::from_config(&config, None),
            Err(ConfigError::InvalidValue {
                field: "reasoner.command",
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_reasoner_echoes_prompt() {
        let config = CommandConfig {
            command: vec!["cat".to_string()],
            ..CommandConfig::default()
        };
        let reasoner = CommandReasoner::from_config(&config, None).expect("reasoner");
        assert_eq!(reasoner.complete("ping").expect("reply"), "ping");
    }

    #[cfg(unix)]
    #[test]
    fn missing_program_is_unreachable() {
        let config = CommandConfig {
            command: vec!["conductor-no-such-binary".to_string()],
            ..CommandConfig::default()
        };
        let reasoner = CommandReasoner::from_config(&config, None).expect("reasoner");
        assert!(matches!(
            reasoner.complete("ping"),
            Err(CollaboratorError::Unreachable(_))
        ));
    }
}
