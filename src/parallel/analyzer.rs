//! Completion analyzer.
//!
//! Classifies each task of a unit by looking for its commit in the worktree
//! history. This makes partial progress visible even when the agent session
//! itself failed or errored out.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use super::unit::UnitOfWork;
use crate::vcs::{CommitSummary, VcsService};

/// Task ids split into completed and failed. The two lists are disjoint
/// and together hold every task of the analysed unit, in unit order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl Classification {
    pub fn all_failed(unit: &UnitOfWork) -> Self {
        Self {
            completed: Vec::new(),
            failed: unit.task_ids(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.completed.is_empty()
    }
}

#[derive(Clone)]
pub struct CompletionAnalyzer {
    vcs: Arc<dyn VcsService>,
}

impl CompletionAnalyzer {
    pub fn new(vcs: Arc<dyn VcsService>) -> Self {
        Self { vcs }
    }

    /// Classify the tasks of `unit` from commits in `worktree_dir` that are
    /// not on `base_branch`. Never fails: any error yields all-failed.
    pub async fn analyze(
        &self,
        unit: &UnitOfWork,
        worktree_dir: &Path,
        base_branch: &str,
    ) -> Classification {
        let commits = match self.vcs.commits_since(worktree_dir, base_branch).await {
            Ok(commits) => commits,
            Err(err) => {
                warn!(
                    owner_id = %unit.owner_id,
                    error = %err,
                    "could not read worktree history, classifying all tasks as failed"
                );
                return Classification::all_failed(unit);
            }
        };

        match classify_commits(unit, &commits) {
            Some(classification) => {
                debug!(
                    owner_id = %unit.owner_id,
                    commits = commits.len(),
                    completed = classification.completed.len(),
                    failed = classification.failed.len(),
                    "classified unit"
                );
                classification
            }
            None => {
                warn!(
                    owner_id = %unit.owner_id,
                    "could not build commit matcher, classifying all tasks as failed"
                );
                Classification::all_failed(unit)
            }
        }
    }
}

/// Match commit subjects against the unit's commit convention.
///
/// Task *n* (1-based) is completed when a subject starts with
/// `[<owner>] Task <n>` or carries the `[<task id>]` marker.
pub fn classify_commits(unit: &UnitOfWork, commits: &[CommitSummary]) -> Option<Classification> {
    let numbered = Regex::new(&format!(
        r"^\[{}\]\s*Task\s+(\d+)\b",
        regex::escape(&unit.owner_id)
    ))
    .ok()?;

    let mut numbers: HashSet<usize> = HashSet::new();
    for commit in commits {
        if let Some(n) = numbered
            .captures(commit.subject.trim())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
        {
            numbers.insert(n);
        }
    }

    let mut classification = Classification::default();
    for (i, task) in unit.tasks.iter().enumerate() {
        let marker = format!("[{}]", task.id);
        let done = numbers.contains(&(i + 1))
            || commits.iter().any(|c| c.subject.contains(&marker));
        if done {
            classification.completed.push(task.id.clone());
        } else {
            classification.failed.push(task.id.clone());
        }
    }
    Some(classification)
}
