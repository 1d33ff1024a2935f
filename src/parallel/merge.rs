//! Deferred merge engine.
//!
//! Reconciles queued branches into the target branch strictly one at a time,
//! in queue order, so every branch rebases onto the post-merge target. Per
//! branch it tries rebase-then-merge, resolves conflicts through a
//! [`ConflictResolver`], falls back to a direct merge, and gives up after a
//! bounded number of attempts, leaving the branch intact for manual work.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::resolver::{ConflictRequest, ConflictResolver, ConflictStage};
use super::unit::{MergeBranchResult, QueuedBranch};
use crate::vcs::{IntegrationOutcome, VcsService};

/// Error recorded when a queued branch has vanished.
pub const MISSING_BRANCH_ERROR: &str = "branch does not exist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Total attempts per branch.
    pub max_retries: u32,
    /// Resolver invocations allowed while continuing one rebase or merge.
    pub max_resolution_rounds: u32,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_resolution_rounds: 5,
        }
    }
}

/// Consolidated report of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub target: String,
    pub results: Vec<MergeBranchResult>,
    /// Local changes were stashed before merging.
    pub stashed: bool,
    /// Set when restoring stashed changes failed.
    pub stash_error: Option<String>,
}

impl MergeSummary {
    pub fn merged_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> Vec<&MergeBranchResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    pub fn all_merged(&self) -> bool {
        self.results.iter().all(|r| r.success) && self.stash_error.is_none()
    }

    /// Shell commands a human can use to finish what the engine could not.
    pub fn manual_instructions(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .failed()
            .into_iter()
            .map(|result| {
                format!(
                    "git checkout {} && git merge {}    # {}",
                    self.target,
                    result.branch,
                    result.error.as_deref().unwrap_or("merge failed")
                )
            })
            .collect();
        if let Some(err) = &self.stash_error {
            lines.push(format!("git stash pop    # restore local changes ({})", err));
        }
        lines
    }
}

pub struct DeferredMergeEngine {
    vcs: Arc<dyn VcsService>,
    options: MergeOptions,
}

impl DeferredMergeEngine {
    pub fn new(vcs: Arc<dyn VcsService>, options: MergeOptions) -> Self {
        Self { vcs, options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Merge `branches` into `target`, one after another, in input order.
    ///
    /// Local changes in the working tree are stashed first and restored at
    /// the end. Failures are reported, never raised; failed branches are
    /// never deleted.
    pub async fn merge_sequentially(
        &self,
        branches: &[QueuedBranch],
        target: &str,
        resolver: &dyn ConflictResolver,
    ) -> MergeSummary {
        let mut summary = MergeSummary {
            target: target.to_string(),
            ..MergeSummary::default()
        };
        if branches.is_empty() {
            return summary;
        }

        summary.stashed = self.stash_local_changes().await;

        for queued in branches {
            let result = self.merge_branch(queued, target, resolver).await;
            if result.success {
                info!(branch = %queued.branch, owner_id = %queued.owner_id, "merged");
            } else {
                warn!(
                    branch = %queued.branch,
                    owner_id = %queued.owner_id,
                    error = result.error.as_deref().unwrap_or(""),
                    "branch left unmerged"
                );
            }
            summary.results.push(result);
        }

        if summary.stashed {
            if let Err(err) = self.vcs.pop_stash().await {
                warn!(error = %err, "failed to restore stashed changes; run `git stash pop`");
                summary.stash_error = Some(err.to_string());
            }
        }

        info!(
            target_branch = target,
            merged = summary.merged_count(),
            failed = summary.results.len() - summary.merged_count(),
            "merge pass finished"
        );
        summary
    }

    async fn stash_local_changes(&self) -> bool {
        match self.vcs.has_uncommitted_changes().await {
            Ok(false) => false,
            Ok(true) => match self.vcs.stash().await {
                Ok(stashed) => {
                    debug!(stashed, "stashed local changes before merging");
                    stashed
                }
                Err(err) => {
                    warn!(error = %err, "failed to stash local changes");
                    false
                }
            },
            Err(err) => {
                warn!(error = %err, "could not inspect working tree before merging");
                false
            }
        }
    }

    /// Up to `max_retries` attempts for one branch.
    async fn merge_branch(
        &self,
        queued: &QueuedBranch,
        target: &str,
        resolver: &dyn ConflictResolver,
    ) -> MergeBranchResult {
        let max_attempts = self.options.max_retries.max(1);
        let mut last_error = String::from("no merge attempt made");

        for attempt in 1..=max_attempts {
            match self.vcs.branch_exists(&queued.branch).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(branch = %queued.branch, "queued branch no longer exists");
                    return MergeBranchResult::failed(queued, MISSING_BRANCH_ERROR);
                }
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            }

            match self.attempt(queued, target, resolver).await {
                Ok(()) => {
                    self.delete_merged_branch(&queued.branch).await;
                    return MergeBranchResult::merged(queued);
                }
                Err(err) => {
                    debug!(branch = %queued.branch, attempt, error = %err, "merge attempt failed");
                    last_error = err;
                }
            }
        }

        MergeBranchResult::failed(
            queued,
            format!("{} (after {} attempts)", last_error, max_attempts),
        )
    }

    /// One attempt: rebase then merge, with a direct-merge fallback.
    async fn attempt(
        &self,
        queued: &QueuedBranch,
        target: &str,
        resolver: &dyn ConflictResolver,
    ) -> Result<(), String> {
        let rebase_error = match self.vcs.rebase(&queued.branch, target).await {
            Ok(IntegrationOutcome::Clean) => return self.merge_after_rebase(queued, target).await,
            Ok(IntegrationOutcome::Conflicts(files)) => {
                match self.resolve_rebase(queued, target, files, resolver).await {
                    Ok(()) => return self.merge_after_rebase(queued, target).await,
                    Err(err) => err,
                }
            }
            Err(err) => err.to_string(),
        };

        if let Err(err) = self.vcs.abort_rebase().await {
            debug!(branch = %queued.branch, error = %err, "abort rebase");
        }
        debug!(branch = %queued.branch, error = %rebase_error, "rebase failed, trying direct merge");

        self.direct_merge(queued, target, resolver)
            .await
            .map_err(|merge_error| {
                format!("rebase: {}; direct merge: {}", rebase_error, merge_error)
            })
    }

    async fn merge_after_rebase(&self, queued: &QueuedBranch, target: &str) -> Result<(), String> {
        let error = match self
            .vcs
            .merge(&queued.branch, target, Some(&queued.commit_message))
            .await
        {
            Ok(IntegrationOutcome::Clean) => return Ok(()),
            Ok(IntegrationOutcome::Conflicts(files)) => {
                format!("merge conflicts after clean rebase: {}", files.join(", "))
            }
            Err(err) => err.to_string(),
        };
        if let Err(err) = self.vcs.abort_merge().await {
            debug!(branch = %queued.branch, error = %err, "abort merge");
        }
        Err(error)
    }

    /// Resolve rebase conflicts and continue the rebase, possibly over
    /// several rounds as later commits conflict too.
    async fn resolve_rebase(
        &self,
        queued: &QueuedBranch,
        target: &str,
        mut files: Vec<String>,
        resolver: &dyn ConflictResolver,
    ) -> Result<(), String> {
        for _ in 0..self.options.max_resolution_rounds.max(1) {
            self.resolve_round(queued, target, files, ConflictStage::Rebase, resolver)
                .await?;
            match self.vcs.continue_rebase().await {
                Ok(IntegrationOutcome::Clean) => return Ok(()),
                Ok(IntegrationOutcome::Conflicts(next)) => files = next,
                Err(err) => return Err(err.to_string()),
            }
        }
        Err(format!(
            "conflicts persisted after {} resolution rounds",
            self.options.max_resolution_rounds.max(1)
        ))
    }

    /// Merge without rebasing; resolve and commit on conflicts.
    async fn direct_merge(
        &self,
        queued: &QueuedBranch,
        target: &str,
        resolver: &dyn ConflictResolver,
    ) -> Result<(), String> {
        let result = match self
            .vcs
            .merge(&queued.branch, target, Some(&queued.commit_message))
            .await
        {
            Ok(IntegrationOutcome::Clean) => return Ok(()),
            Ok(IntegrationOutcome::Conflicts(files)) => {
                match self
                    .resolve_round(queued, target, files, ConflictStage::Merge, resolver)
                    .await
                {
                    Ok(()) => self
                        .vcs
                        .commit_merge(&queued.commit_message)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err.to_string()),
        };

        if result.is_err() {
            if let Err(err) = self.vcs.abort_merge().await {
                debug!(branch = %queued.branch, error = %err, "abort merge");
            }
        }
        result
    }

    /// One resolver call, then verify nothing is left conflicted.
    async fn resolve_round(
        &self,
        queued: &QueuedBranch,
        target: &str,
        files: Vec<String>,
        stage: ConflictStage,
        resolver: &dyn ConflictResolver,
    ) -> Result<(), String> {
        let request = ConflictRequest {
            owner_id: queued.owner_id.clone(),
            branch: queued.branch.clone(),
            target: target.to_string(),
            files,
            stage,
        };
        resolver
            .resolve(&request)
            .await
            .map_err(|e| e.to_string())?;

        let remaining = self
            .vcs
            .conflicted_files()
            .await
            .map_err(|e| e.to_string())?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(format!("unresolved conflicts in {}", remaining.join(", ")))
        }
    }

    async fn delete_merged_branch(&self, branch: &str) {
        if let Err(err) = self.vcs.delete_local_branch(branch, false).await {
            warn!(branch, error = %err, "merged branch could not be deleted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(results: Vec<MergeBranchResult>) -> MergeSummary {
        MergeSummary {
            target: "main".into(),
            results,
            ..MergeSummary::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = MergeOptions::default();
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.max_resolution_rounds, 5);
    }

    #[test]
    fn test_manual_instructions_for_failed_branches() {
        let ok = QueuedBranch::new("patchwright/a", "a", "msg");
        let bad = QueuedBranch::new("patchwright/b", "b", "msg");
        let summary = summary(vec![
            MergeBranchResult::merged(&ok),
            MergeBranchResult::failed(&bad, "conflicts in a.ts"),
        ]);

        assert_eq!(summary.merged_count(), 1);
        assert!(!summary.all_merged());
        assert_eq!(
            summary.manual_instructions(),
            vec!["git checkout main && git merge patchwright/b    # conflicts in a.ts".to_string()]
        );
    }

    #[test]
    fn test_stash_failure_adds_instruction() {
        let mut summary = summary(Vec::new());
        summary.stashed = true;
        summary.stash_error = Some("conflict".into());
        assert!(!summary.all_merged());
        assert_eq!(summary.manual_instructions().len(), 1);
        assert!(summary.manual_instructions()[0].starts_with("git stash pop"));
    }
}
