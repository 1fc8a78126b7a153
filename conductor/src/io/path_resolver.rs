//! Workspace file discovery and main/test role selection.
//!
//! The resolver scans the workspace root to a bounded depth, classifies source
//! files by stem, and picks one main and one test file:
//!
//! - `test_*` and `*_test` stems are test candidates; everything else is a
//!   main candidate.
//! - Per role, the most recently modified file wins. Ties go to the
//!   lexicographically first file name, then the full path.
//! - Hidden entries (leading `.`) are never visited.
//!
//! A missing or unreadable root is a `NotFound` status, not an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::io::config::ResolverConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// The root was scanned. Either role may still be unresolved.
    Scanned,
    NotFound { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResolution {
    pub root: PathBuf,
    pub main_path: Option<PathBuf>,
    pub test_path: Option<PathBuf>,
    /// Every recognized source file, sorted by path.
    pub discovered_files: Vec<PathBuf>,
    /// Candidates that lost selection, sorted by path.
    pub unselected: Vec<PathBuf>,
    pub status: ResolutionStatus,
}

impl PathResolution {
    fn not_found(root: &Path, reason: String) -> Self {
        Self {
            root: root.to_path_buf(),
            main_path: None,
            test_path: None,
            discovered_files: Vec::new(),
            unselected: Vec::new(),
            status: ResolutionStatus::NotFound { reason },
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == ResolutionStatus::Scanned
    }

    pub fn test_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.discovered_files
            .iter()
            .filter(|path| is_test_file(path))
    }

    pub fn main_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.discovered_files
            .iter()
            .filter(|path| !is_test_file(path))
    }

    /// Short human-readable report of the scan.
    pub fn render_report(&self) -> String {
        let mut lines = vec![format!("Path resolution for {}", self.root.display())];
        if let ResolutionStatus::NotFound { reason } = &self.status {
            lines.push(format!("  not found: {reason}"));
            return lines.join("\n");
        }
        let display = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unresolved)".to_string())
        };
        lines.push(format!("  main file: {}", display(&self.main_path)));
        lines.push(format!("  test file: {}", display(&self.test_path)));
        lines.push(format!(
            "  discovered: {} main, {} test",
            self.main_files().count(),
            self.test_files().count()
        ));
        if !self.unselected.is_empty() {
            lines.push("  unselected:".to_string());
            for path in &self.unselected {
                lines.push(format!("    - {}", path.display()));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

/// Scans workspaces and caches the most recent result for one planning cycle.
#[derive(Debug)]
pub struct PathResolver {
    extensions: Vec<String>,
    scan_depth: usize,
    cached: Option<PathResolution>,
}

impl PathResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            scan_depth: config.scan_depth.max(1),
            cached: None,
        }
    }

    /// Scan `root` fresh.
    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn resolve(&self, root: &Path) -> PathResolution {
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return PathResolution::not_found(root, "not a directory".to_string()),
            Err(e) => return PathResolution::not_found(root, e.to_string()),
        }

        let mut candidates = match self.scan(root) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(err = %e, "workspace root unreadable");
                return PathResolution::not_found(root, e.to_string());
            }
        };
        candidates.sort_by(|a, b| a.path.cmp(&b.path));

        let (tests, mains): (Vec<Candidate>, Vec<Candidate>) = candidates
            .iter()
            .cloned()
            .partition(|candidate| is_test_file(&candidate.path));

        let main_path = select(&mains);
        let test_path = select(&tests);
        let discovered_files: Vec<PathBuf> =
            candidates.into_iter().map(|candidate| candidate.path).collect();
        let unselected = discovered_files
            .iter()
            .filter(|path| Some(*path) != main_path.as_ref() && Some(*path) != test_path.as_ref())
            .cloned()
            .collect();

        debug!(
            discovered = discovered_files.len(),
            main = ?main_path,
            test = ?test_path,
            "workspace scanned"
        );
        PathResolution {
            root: root.to_path_buf(),
            main_path,
            test_path,
            discovered_files,
            unselected,
            status: ResolutionStatus::Scanned,
        }
    }

    /// Return the cached resolution for `root`, scanning if absent.
    pub fn resolve_cached(&mut self, root: &Path) -> PathResolution {
        if let Some(cached) = &self.cached
            && cached.root == root
        {
            return cached.clone();
        }
        let resolution = self.resolve(root);
        self.cached = Some(resolution.clone());
        resolution
    }

    /// Drop the cached scan. Called at the start of every planning cycle.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    fn scan(&self, root: &Path) -> Result<Vec<Candidate>, walkdir::Error> {
        let mut out = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.scan_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e),
                Err(e) => {
                    debug!(err = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_recognized(entry.path()) {
                continue;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(Candidate {
                path: entry.into_path(),
                modified,
            });
        }
        Ok(out)
    }

    fn is_recognized(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|known| known == ext))
    }
}

/// Leading-dot entries below the root. The root itself is always walked.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// `test_*` or `*_test` stems are test files.
pub fn is_test_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.starts_with("test_") || stem.ends_with("_test"))
}

fn select(candidates: &[Candidate]) -> Option<PathBuf> {
    candidates
        .iter()
        .min_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| file_name(&a.path).cmp(&file_name(&b.path)))
                .then_with(|| a.path.cmp(&b.path))
        })
        .map(|candidate| candidate.path.clone())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
