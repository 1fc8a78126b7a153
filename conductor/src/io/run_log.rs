//! Per-run product artifacts under `<log_dir>/<run_id>/`.
//!
//! `events.jsonl` is append-only, one JSON event per line, written as the run
//! progresses. `summary.json` is written once when the run terminates.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Decision, FailureDisposition, Phase};

/// Upper bound on same-second run directories before giving up.
const MAX_RUN_SUFFIX: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        task: String,
        chain: String,
    },
    Phase {
        from: Option<Phase>,
        to: Phase,
    },
    Planned {
        facts_added: usize,
        plan_steps: usize,
        naming_fallback: bool,
    },
    Decided {
        decision: Decision,
    },
    Dispatched {
        node: String,
        retries: u32,
    },
    NodeSucceeded {
        node: String,
        duration_ms: u64,
    },
    NodeFailed {
        node: String,
        error: String,
        disposition: FailureDisposition,
    },
    FailureRouted {
        from: String,
        to: String,
    },
    /// A success edge from `by` reopened the failed `node`.
    NodeReopened {
        node: String,
        by: String,
    },
    ReplanRequested {
        fact: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    pub cycle: u32,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Writer for one run's artifacts.
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: String,
    dir: PathBuf,
}

impl RunLog {
    /// Allocate a fresh `run-<UTC %Y%m%d_%H%M%S>-<n>` directory under `log_root`.
    pub fn create(log_root: &Path) -> Result<Self> {
        fs::create_dir_all(log_root)
            .with_context(|| format!("create log dir {}", log_root.display()))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        for n in 1..=MAX_RUN_SUFFIX {
            let run_id = format!("run-{stamp}-{n}");
            let dir = log_root.join(&run_id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(Self { run_id, dir }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create run dir {}", dir.display()));
                }
            }
        }
        bail!(
            "no free run id for {stamp} under {}",
            log_root.display()
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.json")
    }

    pub fn append(&self, cycle: u32, kind: EventKind) -> Result<()> {
        let event = RunEvent {
            at: Utc::now(),
            cycle,
            kind,
        };
        let mut line = serde_json::to_string(&event).context("serialize run event")?;
        line.push('\n');
        let path = self.events_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", path.display()))
    }

    pub fn write_summary<T: Serialize>(&self, summary: &T) -> Result<PathBuf> {
        let path = self.summary_path();
        let mut buf = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Read back every event of a run, in order.
pub fn read_events(path: &Path) -> Result<Vec<RunEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}
