//! Ledger-driven multi-agent orchestrator.
//!
//! Plans a natural-language task, then drives a chain of worker agents
//! (planner, coder, test writer, ...) until the task is satisfied or the run
//! aborts. Run artifacts land in `.conductor/runs/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

use conductor::core::chain::{get_chain, list_chains};
use conductor::core::types::RunOutcome;
use conductor::exit_codes;
use conductor::io::agent::CommandAgentRunner;
use conductor::io::config::{
    ConductorConfig, DEFAULT_CONFIG_PATH, load_config, write_config,
};
use conductor::io::memory::{InMemoryStore, Memory, NoMemory};
use conductor::io::path_resolver::PathResolver;
use conductor::io::reasoner::CommandReasoner;
use conductor::logging;
use conductor::orchestrator::{Collaborators, Orchestrator};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Ledger-driven multi-agent orchestrator"
)]
struct Cli {
    /// Workspace the agents work in.
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,
    /// Config file. Defaults to `.conductor/config.toml` under the workspace.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log progress to stderr (`RUST_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a task through a chain of agents.
    Run {
        /// Task description; multiple words are joined with spaces.
        #[arg(required = true)]
        task: Vec<String>,
        /// Chain profile. Defaults to `default_chain` from the config.
        #[arg(long)]
        chain: Option<String>,
    },
    /// List chain profiles and their flows.
    Chains,
    /// Print which main and test files would be selected in a directory.
    Resolve {
        /// Directory to scan. Defaults to the workspace.
        dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .unwrap_or_else(|| cli.workspace.join(DEFAULT_CONFIG_PATH));
    match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Run { task, chain } => {
            cmd_run(&cli.workspace, &config_path, &task.join(" "), chain)
        }
        Command::Chains => cmd_chains(&config_path),
        Command::Resolve { dir } => {
            cmd_resolve(&config_path, dir.as_deref().unwrap_or(&cli.workspace))
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &ConductorConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(workspace: &Path, config_path: &Path, task: &str, chain: Option<String>) -> Result<i32> {
    if task.trim().is_empty() {
        bail!("task must not be empty");
    }
    let cfg = load_config(config_path)?;
    let profile = chain.unwrap_or_else(|| cfg.default_chain.clone());
    let graph = get_chain(&profile, &cfg.chains)?;
    let reasoner = CommandReasoner::from_config(&cfg.reasoner, Some(workspace.to_path_buf()))?;
    let agent = CommandAgentRunner::from_config(&cfg.agent)?;
    let memory: Box<dyn Memory> = if cfg.memory.enabled {
        Box::new(InMemoryStore::new())
    } else {
        Box::new(NoMemory)
    };

    let orchestrator = Orchestrator::new(
        cfg,
        graph,
        workspace,
        Collaborators {
            reasoner: &reasoner,
            agent: &agent,
            memory: memory.as_ref(),
        },
    )?;
    let summary = orchestrator.run(task)?;

    let attempts: Vec<String> = summary
        .attempts_by_node
        .iter()
        .map(|(node, count)| format!("{node}={count}"))
        .collect();
    println!("run {} ({})", summary.run_id, summary.chain);
    println!("attempts: {}", attempts.join(" "));
    println!("replans: {}", summary.replans);
    println!("artifacts: {}", summary.run_dir.display());
    match &summary.outcome {
        RunOutcome::Completed => {
            println!("completed");
            Ok(exit_codes::OK)
        }
        RunOutcome::Aborted(reason) => {
            println!("aborted: {}", serde_json::to_string(reason)?);
            Ok(exit_codes::ABORTED)
        }
    }
}

fn cmd_chains(config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    for name in list_chains(&cfg.chains) {
        let graph = get_chain(&name, &cfg.chains)?;
        println!("{name}: {}", graph.describe_flow());
        if !graph.description().is_empty() {
            println!("  {}", graph.description());
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_resolve(config_path: &Path, dir: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let resolution = PathResolver::new(&cfg.resolver).resolve(dir);
    println!("{}", resolution.render_report());
    Ok(if resolution.is_found() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_joins_task_words() {
        let cli = Cli::parse_from(["conductor", "run", "build", "a", "calculator", "--chain", "minimal"]);
        let Command::Run { task, chain } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(task.join(" "), "build a calculator");
        assert_eq!(chain.as_deref(), Some("minimal"));
        assert_eq!(cli.workspace, PathBuf::from("."));
        assert!(!cli.verbose);
    }

    #[test]
    fn parse_run_requires_task() {
        assert!(Cli::try_parse_from(["conductor", "run"]).is_err());
    }

    #[test]
    fn parse_resolve_with_global_config() {
        let cli = Cli::parse_from(["conductor", "resolve", "src", "--config", "c.toml"]);
        assert!(matches!(cli.command, Command::Resolve { dir: Some(ref d) } if d == Path::new("src")));
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
    }
}
