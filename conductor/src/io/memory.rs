//! Memory collaborator: best-effort notes recalled into agent prompts.
//!
//! Memory is advisory. Callers log failures and carry on; a run behaves
//! the same with [`NoMemory`] apart from thinner prompts.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CollaboratorError;

/// A recalled note with its similarity score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub score: f64,
}

pub trait Memory {
    fn remember(
        &self,
        text: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), CollaboratorError>;

    /// Up to `limit` hits, best first.
    fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, CollaboratorError>;
}

/// Disabled memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMemory;

impl Memory for NoMemory {
    fn remember(&self, _: &str, _: BTreeMap<String, String>) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn recall(&self, _: &str, _: usize) -> Result<Vec<MemoryHit>, CollaboratorError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    text: String,
    metadata: BTreeMap<String, String>,
    tokens: BTreeSet<String>,
}

/// Process-local store ranked by token overlap (Jaccard similarity).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RefCell<Vec<Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Memory for InMemoryStore {
    fn remember(
        &self,
        text: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), CollaboratorError> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Ok(());
        }
        self.entries.borrow_mut().push(Entry {
            text: text.to_string(),
            metadata,
            tokens,
        });
        Ok(())
    }

    fn recall(&self, query: &str, limit: usize) -> Result<Vec<MemoryHit>, CollaboratorError> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.borrow();
        let mut hits: Vec<(usize, MemoryHit)> = entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| {
                let shared = entry.tokens.intersection(&query_tokens).count();
                if shared == 0 {
                    return None;
                }
                let union = entry.tokens.union(&query_tokens).count();
                Some((
                    idx,
                    MemoryHit {
                        text: entry.text.clone(),
                        metadata: entry.metadata.clone(),
                        score: shared as f64 / union as f64,
                    },
                ))
            })
            .collect();
        // Best score first; newer entries win ties.
        hits.sort_by(|(ia, a), (ib, b)| b.score.total_cmp(&a.score).then(ib.cmp(ia)));
        Ok(hits.into_iter().take(limit).map(|(_, hit)| hit).collect())
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .filter(|token| token.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Recall notes, logging and swallowing failures.
pub fn recall_notes(memory: &dyn Memory, query: &str, limit: usize) -> Vec<MemoryHit> {
    match memory.recall(query, limit) {
        Ok(hits) => hits,
        Err(err) => {
            warn!(err = %err, "memory recall failed, continuing without notes");
            Vec::new()
        }
    }
}

/// Store a note, logging and swallowing failures.
pub fn remember_note(memory: &dyn Memory, text: &str, metadata: BTreeMap<String, String>) {
    if let Err(err) = memory.remember(text, metadata) {
        warn!(err = %err, "memory write failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(node: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("node".to_string(), node.to_string())])
    }

    #[test]
    fn recall_ranks_by_overlap() {
        let store = InMemoryStore::new();
        store
            .remember("calculator divide handles zero division", meta("Code"))
            .expect("remember");
        store
            .remember("network client retries timeouts", meta("Code"))
            .expect("remember");
        store
            .remember("calculator tests cover divide", meta("TestGen"))
            .expect("remember");

        let hits = store.recall("divide in calculator", 2).expect("recall");
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.text.contains("calculator")));
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn unrelated_query_recalls_nothing() {
        let store = InMemoryStore::new();
        store.remember("calculator divide", meta("Code")).expect("remember");
        assert!(store.recall("weather forecast", 3).expect("recall").is_empty());
    }

    #[test]
    fn failing_memory_is_swallowed() {
        struct Broken;
        impl Memory for Broken {
            fn remember(
                &self,
                _: &str,
                _: BTreeMap<String, String>,
            ) -> Result<(), CollaboratorError> {
                Err(CollaboratorError::Unreachable("store down".to_string()))
            }
            fn recall(&self, _: &str, _: usize) -> Result<Vec<MemoryHit>, CollaboratorError> {
                Err(CollaboratorError::Unreachable("store down".to_string()))
            }
        }
        remember_note(&Broken, "note", BTreeMap::new());
        assert!(recall_notes(&Broken, "note", 3).is_empty());
    }
}
