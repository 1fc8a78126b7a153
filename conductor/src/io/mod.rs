//! I/O adapters for the orchestrator: configuration, filesystem discovery,
//! collaborator processes, prompts and run artifacts.

pub mod agent;
pub mod config;
pub mod memory;
pub mod path_resolver;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod run_log;
