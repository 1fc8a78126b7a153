//! Orchestrator configuration stored under `.conductor/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::chain::ChainSpec;
use crate::error::ConfigError;

/// Default config location relative to the workspace root.
pub const DEFAULT_CONFIG_PATH: &str = ".conductor/config.toml";

/// Orchestrator configuration (TOML).
///
/// Every threshold the state machine depends on lives here. Missing fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Chain profile used when `--chain` is not given.
    pub default_chain: String,

    /// Consecutive no-progress decisions before replanning.
    pub max_stalls: u32,

    /// Retries per node per planning cycle (attempts = retries + 1).
    pub max_node_retries: u32,

    /// Replanning cycles before the run is aborted.
    pub max_replans: u32,

    /// Reasoner attempts per decision before falling back to chain order.
    pub decision_parse_retries: u32,

    /// Attempts per collaborator call when the collaborator is unreachable.
    pub collaborator_attempts: u32,

    /// First backoff delay; doubled on each further attempt.
    pub backoff_base_ms: u64,

    /// Wall-clock budget for a single agent dispatch.
    pub node_timeout_secs: u64,

    /// Execution records shown to the reasoner per decision.
    pub history_window: usize,

    /// Directory for per-run event logs and summaries, relative to the workspace.
    pub log_dir: PathBuf,

    pub prompt: PromptConfig,
    pub resolver: ResolverConfig,
    pub reasoner: CommandConfig,
    pub agent: CommandConfig,
    pub memory: MemoryConfig,

    /// Custom chain profiles. Shadow built-ins with the same name.
    pub chains: BTreeMap<String, ChainSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Rendered prompts above this size drop their droppable sections.
    pub budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Source file extensions considered during discovery (without the dot).
    pub extensions: Vec<String>,
    /// Directory levels scanned; 1 means the workspace root only.
    pub scan_depth: usize,
}

/// External command backing a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Notes recalled into each agent prompt.
    pub recall_limit: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 48_000,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["py".to_string()],
            scan_depth: 1,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recall_limit: 3,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            default_chain: "standard".to_string(),
            max_stalls: 3,
            max_node_retries: 2,
            max_replans: 2,
            decision_parse_retries: 3,
            collaborator_attempts: 3,
            backoff_base_ms: 500,
            node_timeout_secs: 10 * 60,
            history_window: 5,
            log_dir: PathBuf::from(".conductor/runs"),
            prompt: PromptConfig::default(),
            resolver: ResolverConfig::default(),
            reasoner: CommandConfig {
                command: vec!["llm".to_string()],
                ..CommandConfig::default()
            },
            agent: CommandConfig::default(),
            memory: MemoryConfig::default(),
            chains: BTreeMap::new(),
        }
    }
}

impl ConductorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::InvalidValue {
                field,
                reason: reason.to_string(),
            })
        }

        if self.default_chain.trim().is_empty() {
            return invalid("default_chain", "must not be empty");
        }
        if self.max_stalls == 0 {
            return invalid("max_stalls", "must be > 0");
        }
        if self.decision_parse_retries == 0 {
            return invalid("decision_parse_retries", "must be > 0");
        }
        if self.collaborator_attempts == 0 {
            return invalid("collaborator_attempts", "must be > 0");
        }
        if self.node_timeout_secs == 0 {
            return invalid("node_timeout_secs", "must be > 0");
        }
        if self.prompt.budget_bytes == 0 {
            return invalid("prompt.budget_bytes", "must be > 0");
        }
        if self.resolver.scan_depth == 0 {
            return invalid("resolver.scan_depth", "must be > 0");
        }
        if self.resolver.extensions.is_empty()
            || self
                .resolver
                .extensions
                .iter()
                .any(|ext| ext.trim().is_empty() || ext.starts_with('.'))
        {
            return invalid(
                "resolver.extensions",
                "must be a non-empty array of extensions without a leading dot",
            );
        }
        for (field, cmd) in [("reasoner", &self.reasoner), ("agent", &self.agent)] {
            if cmd.timeout_secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "timeout_secs must be > 0".to_string(),
                });
            }
            if cmd.output_limit_bytes == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "output_limit_bytes must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Primary recognized extension, used for synthesized file names.
    pub fn primary_extension(&self) -> &str {
        self.resolver
            .extensions
            .first()
            .map(String::as_str)
            .unwrap_or("py")
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConductorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConductorConfig, ConfigError> {
    if !path.exists() {
        let cfg = ConductorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: ConductorConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConductorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
