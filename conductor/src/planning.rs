//! Planning phase: populate the task ledger for one cycle.
//!
//! A cycle names the deliverable, corroborates file paths against the
//! workspace, gathers facts and writes a fresh plan. Only collaborator
//! failures that survive backoff abort planning; an unusable naming reply
//! degrades to keyword-based defaults.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::chain::ChainGraph;
use crate::core::ledger::{
    KEY_DESCRIPTION, KEY_MAIN_FILE, KEY_PROJECT_NAME, KEY_TEST_FILE, KEY_WORKING_DIR, TaskLedger,
};
use crate::core::naming::{ProjectNaming, default_naming, is_plain_file_name, sanitize_identifier};
use crate::error::CollaboratorError;
use crate::io::config::ConductorConfig;
use crate::io::path_resolver::{PathResolution, PathResolver};
use crate::io::prompt::{FactsPromptInput, NamingPromptInput, PlanPromptInput, PromptBuilder};
use crate::io::reasoner::{PROJECT_NAMING_SCHEMA, Reasoner, parse_structured, with_backoff};

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("planning reasoner failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningOutcome {
    pub facts_added: usize,
    pub plan_steps: usize,
    /// The naming reply was unusable and keyword defaults were applied.
    pub naming_fallback: bool,
}

/// Collaborators and settings a planning cycle needs.
pub struct Planner<'a> {
    pub reasoner: &'a dyn Reasoner,
    pub prompts: &'a PromptBuilder,
    pub config: &'a ConductorConfig,
    pub workspace: &'a Path,
}

impl Planner<'_> {
    /// Run one planning cycle against `task`.
    #[instrument(skip_all, fields(cycle = task.planning_cycles + 1))]
    pub fn plan(
        &self,
        task: &mut TaskLedger,
        graph: &ChainGraph,
        resolver: &mut PathResolver,
    ) -> Result<PlanningOutcome, PlanningError> {
        resolver.invalidate();
        let facts_before = task.facts.len();

        let (naming, naming_fallback) = self.name_project(&task.original_task)?;
        let resolution = resolver.resolve_cached(self.workspace);
        self.apply_paths(task, &naming, &resolution);

        let prompt = self.prompts.build_facts(&FactsPromptInput {
            task: task.original_task.clone(),
            facts: task.facts.clone(),
            path_report: resolution.render_report(),
        })?;
        let reply = self.ask(&prompt)?;
        task.append_facts(parse_list_items(&reply));

        let prompt = self.prompts.build_plan(&PlanPromptInput::new(task, graph))?;
        let reply = self.ask(&prompt)?;
        let mut plan = parse_list_items(&reply);
        if plan.is_empty() {
            warn!("plan reply had no steps, planning along the chain");
            plan = graph
                .success_order()
                .into_iter()
                .map(|node| {
                    let description = graph.node(node).map(|n| n.description.as_str()).unwrap_or("");
                    format!("{node}: {description}").trim_end_matches([':', ' ']).to_string()
                })
                .collect();
        }
        task.replace_plan(plan);
        task.planning_cycles += 1;

        let outcome = PlanningOutcome {
            facts_added: task.facts.len() - facts_before,
            plan_steps: task.plan.len(),
            naming_fallback,
        };
        info!(
            facts_added = outcome.facts_added,
            plan_steps = outcome.plan_steps,
            naming_fallback,
            "planning cycle complete"
        );
        Ok(outcome)
    }

    fn ask(&self, prompt: &str) -> Result<String, CollaboratorError> {
        with_backoff(
            self.config.collaborator_attempts,
            self.config.backoff_base(),
            |_| self.reasoner.complete(prompt),
        )
    }

    fn name_project(&self, task: &str) -> Result<(ProjectNaming, bool), PlanningError> {
        let extension = self.config.primary_extension();
        let prompt = self.prompts.build_naming(&NamingPromptInput {
            task: task.to_string(),
            extension: extension.to_string(),
        })?;
        let reply = match self.ask(&prompt) {
            Ok(reply) => reply,
            Err(CollaboratorError::Parse(err)) => {
                warn!(err = %err, "naming reply unusable, using defaults");
                return Ok((default_naming(task, extension), true));
            }
            Err(err) => return Err(err.into()),
        };
        match parse_naming(&reply, extension) {
            Ok(naming) => Ok((naming, false)),
            Err(err) => {
                warn!(err = %err, "naming reply unusable, using defaults");
                Ok((default_naming(task, extension), true))
            }
        }
    }

    /// Corroborate naming hints against the workspace and record the result.
    fn apply_paths(&self, task: &mut TaskLedger, naming: &ProjectNaming, resolution: &PathResolution) {
        let mut facts = Vec::new();
        let main = self.pick_path(&naming.main_file, resolution.main_path.as_ref(), "main", &mut facts);
        let test = self.pick_path(&naming.test_file, resolution.test_path.as_ref(), "test", &mut facts);

        task.set_config(KEY_PROJECT_NAME, naming.project_name.clone());
        task.set_config(KEY_DESCRIPTION, naming.description.clone());
        task.set_config(KEY_WORKING_DIR, self.workspace.display().to_string());
        task.set_config(KEY_MAIN_FILE, main);
        task.set_config(KEY_TEST_FILE, test);
        task.append_facts(facts);
    }

    /// A hinted file that exists wins, then an existing resolved file, then the hint.
    fn pick_path(
        &self,
        hint: &str,
        resolved: Option<&PathBuf>,
        role: &str,
        facts: &mut Vec<String>,
    ) -> String {
        let hinted = self.workspace.join(hint);
        if hinted.is_file() {
            facts.push(format!("{role} file {hint} already exists in the workspace"));
            return hint.to_string();
        }
        if let Some(existing) = resolved {
            let relative = self.relative(existing);
            facts.push(format!(
                "{role} file {relative} found in the workspace and used instead of {hint}"
            ));
            return relative;
        }
        facts.push(format!("{role} file {hint} will be created"));
        hint.to_string()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.workspace)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn parse_naming(reply: &str, extension: &str) -> Result<ProjectNaming, CollaboratorError> {
    let value = parse_structured(reply, PROJECT_NAMING_SCHEMA)?;
    let mut naming: ProjectNaming = serde_json::from_value(value)
        .map_err(|err| CollaboratorError::Parse(format!("naming shape: {err}")))?;
    naming.project_name = sanitize_identifier(&naming.project_name);
    if naming.project_name.is_empty() {
        return Err(CollaboratorError::Parse("project_name is empty".to_string()));
    }
    for file in [&naming.main_file, &naming.test_file] {
        if !is_plain_file_name(file, extension) {
            return Err(CollaboratorError::Parse(format!(
                "'{file}' is not a plain .{extension} file name"
            )));
        }
    }
    if naming.main_file == naming.test_file {
        return Err(CollaboratorError::Parse(
            "main_file and test_file must differ".to_string(),
        ));
    }
    Ok(naming)
}

/// Split free text into list items, stripping bullets and numbering.
pub fn parse_list_items(text: &str) -> Vec<String> {
    static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+").expect("list marker regex is valid")
    });

    text.lines()
        .map(|line| MARKER_RE.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("```"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::get_chain;
    use crate::test_support::{ScriptedReasoner, TestWorkspace};
    use std::collections::BTreeMap;

    fn plan_with(
        workspace: &TestWorkspace,
        reasoner: &ScriptedReasoner,
    ) -> (Result<PlanningOutcome, PlanningError>, TaskLedger) {
        let graph = get_chain("minimal", &BTreeMap::new()).expect("minimal");
        let config = workspace.config();
        let prompts = PromptBuilder::new(config.prompt.budget_bytes).expect("prompts");
        let mut resolver = PathResolver::new(&config.resolver);
        let mut task = TaskLedger::new("Create a calculator", &graph);
        let planner = Planner {
            reasoner,
            prompts: &prompts,
            config: &config,
            workspace: workspace.path(),
        };
        let outcome = planner.plan(&mut task, &graph, &mut resolver);
        (outcome, task)
    }

    #[test]
    fn list_items_lose_markers() {
        let items = parse_list_items("# Plan\n1. write code\n2) test it\n- ship\n\n* done\n");
        assert_eq!(items, vec!["write code", "test it", "ship", "done"]);
    }

    #[test]
    fn planning_fills_ledger() {
        let workspace = TestWorkspace::new().expect("workspace");
        let reasoner = ScriptedReasoner::progressing();
        let (outcome, task) = plan_with(&workspace, &reasoner);
        let outcome = outcome.expect("plan");
        assert!(!outcome.naming_fallback);
        assert_eq!(task.config_value(KEY_MAIN_FILE), Some("calculator.py"));
        assert_eq!(task.config_value(KEY_TEST_FILE), Some("test_calculator.py"));
        assert_eq!(task.plan.len(), 3);
        assert!(task.facts.iter().any(|f| f == "main file calculator.py will be created"));
        assert!(task.facts.iter().any(|f| f.contains("division by zero")));
        assert_eq!(task.planning_cycles, 1);
    }

    #[test]
    fn garbage_naming_uses_keyword_defaults() {
        let workspace = TestWorkspace::new().expect("workspace");
        let reasoner =
            ScriptedReasoner::progressing().with_naming(Ok("sure, call it calc".to_string()));
        let (outcome, task) = plan_with(&workspace, &reasoner);
        assert!(outcome.expect("plan").naming_fallback);
        assert_eq!(task.config_value(KEY_PROJECT_NAME), Some("math_utils"));
        assert_eq!(task.config_value(KEY_MAIN_FILE), Some("math_calculator.py"));
    }

    #[test]
    fn existing_workspace_file_wins_over_missing_hint() {
        let workspace = TestWorkspace::new().expect("workspace");
        workspace.write_file("calc.py", "def add(a, b): return a + b\n").expect("write");
        let reasoner = ScriptedReasoner::progressing();
        let (outcome, task) = plan_with(&workspace, &reasoner);
        outcome.expect("plan");
        assert_eq!(task.config_value(KEY_MAIN_FILE), Some("calc.py"));
        assert_eq!(task.config_value(KEY_TEST_FILE), Some("test_calculator.py"));
    }

    #[test]
    fn existing_hinted_file_is_kept() {
        let workspace = TestWorkspace::new().expect("workspace");
        workspace.write_file("calculator.py", "").expect("write");
        workspace.write_file("other.py", "").expect("write");
        let reasoner = ScriptedReasoner::progressing();
        let (_, task) = plan_with(&workspace, &reasoner);
        assert_eq!(task.config_value(KEY_MAIN_FILE), Some("calculator.py"));
    }

    #[test]
    fn unreachable_reasoner_fails_planning() {
        let workspace = TestWorkspace::new().expect("workspace");
        let reasoner = ScriptedReasoner::progressing()
            .with_naming(Err(CollaboratorError::Unreachable("down".to_string())));
        let (outcome, _) = plan_with(&workspace, &reasoner);
        assert!(matches!(
            outcome,
            Err(PlanningError::Collaborator(CollaboratorError::Unreachable(_)))
        ));
    }

    #[test]
    fn empty_plan_reply_falls_back_to_chain_steps() {
        let workspace = TestWorkspace::new().expect("workspace");
        let reasoner = ScriptedReasoner::progressing().with_plan(Ok("```\n```".to_string()));
        let (outcome, task) = plan_with(&workspace, &reasoner);
        outcome.expect("plan");
        assert_eq!(task.plan.len(), 4);
        assert!(task.plan[0].starts_with("Plan: "));
    }

    #[test]
    fn naming_with_directories_is_rejected() {
        let reply = r#"{"project_name": "Calc", "main_file": "src/calc.py", "test_file": "test_calc.py"}"#;
        assert!(parse_naming(reply, "py").is_err());
        let reply = r#"{"project_name": "My Calc", "main_file": "calc.py", "test_file": "test_calc.py"}"#;
        assert_eq!(parse_naming(reply, "py").expect("naming").project_name, "my_calc");
    }
}
