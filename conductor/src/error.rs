//! Typed error taxonomy for the orchestrator.
//!
//! Only [`ConfigError`] is fatal: it is raised at startup while loading the
//! configuration or building a chain graph. Collaborator failures are absorbed
//! into ledger transitions by the orchestrator and show up in the run summary.

use std::path::PathBuf;
use std::time::Duration;

/// Invalid configuration or chain definition. Never recoverable at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown chain profile '{name}' (available: {})", available.join(", "))]
    UnknownProfile { name: String, available: Vec<String> },

    #[error("chain '{chain}' declares no nodes")]
    EmptyChain { chain: String },

    #[error("chain '{chain}' sets max_stalls to 0; it must be > 0")]
    ZeroStallLimit { chain: String },

    #[error("chain '{chain}' declares a node with an empty name")]
    EmptyNodeName { chain: String },

    #[error("chain '{chain}' declares node '{node}' more than once")]
    DuplicateNode { chain: String, node: String },

    #[error("chain '{chain}' entry node '{entry}' is not declared")]
    UnknownEntry { chain: String, entry: String },

    #[error("chain '{chain}' edge {from} -> {to} references undeclared node '{missing}'")]
    DanglingEdge {
        chain: String,
        from: String,
        to: String,
        missing: String,
    },

    #[error("chain '{chain}' node '{node}' has an edge to itself")]
    SelfLoop { chain: String, node: String },

    #[error("chain '{chain}' node '{node}' has more than one failure edge")]
    MultipleFailureEdges { chain: String, node: String },

    #[error("chain '{chain}' node '{node}' is not reachable from the entry node")]
    UnreachableNode { chain: String, node: String },

    #[error("chain '{chain}' has no terminal node reachable along success edges")]
    NoReachableTerminal { chain: String },

    #[error("invalid config value `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("read config {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Failure talking to an external collaborator (reasoner, agent, memory).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Process- or transport-level failure. Retried with backoff.
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    #[error("collaborator call cancelled")]
    Cancelled,

    /// The collaborator answered, but not with the expected structure.
    #[error("unparseable collaborator response: {0}")]
    Parse(String),
}

impl CollaboratorError {
    /// Only transport failures are worth an immediate retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollaboratorError::Unreachable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_lists_available_names() {
        let err = ConfigError::UnknownProfile {
            name: "turbo".to_string(),
            available: vec!["minimal".to_string(), "standard".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "unknown chain profile 'turbo' (available: minimal, standard)"
        );
    }

    #[test]
    fn only_unreachable_is_retryable() {
        assert!(CollaboratorError::Unreachable("refused".to_string()).is_retryable());
        assert!(!CollaboratorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CollaboratorError::Cancelled.is_retryable());
        assert!(!CollaboratorError::Parse("{".to_string()).is_retryable());
    }
}
