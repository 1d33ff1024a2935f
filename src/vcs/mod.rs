//! Version-control capability interface.
//!
//! The pipeline never touches repository storage directly; everything goes
//! through [`VcsService`]. Every call returns a tagged [`VcsResult`]:
//! conflicts during rebase/merge are a normal outcome
//! ([`IntegrationOutcome::Conflicts`]), not an error.

pub mod git;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

pub use git::GitVcs;

/// Broad category of a VCS failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcsErrorKind {
    /// Unresolved conflicts block the operation.
    Conflict,
    /// A branch, worktree or ref does not exist.
    NotFound,
    /// The VCS command ran and reported failure.
    CommandFailed,
    /// The VCS command could not be spawned or its output read.
    Io,
}

impl VcsErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcsErrorKind::Conflict => "conflict",
            VcsErrorKind::NotFound => "not_found",
            VcsErrorKind::CommandFailed => "command_failed",
            VcsErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for VcsErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged VCS error: `{kind, message, context}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {message}")]
pub struct VcsError {
    pub kind: VcsErrorKind,
    pub message: String,
    /// The operation that failed, e.g. `rebase feature onto main`.
    pub context: String,
}

impl VcsError {
    pub fn new(kind: VcsErrorKind, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: context.into(),
        }
    }

    pub fn command_failed(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(VcsErrorKind::CommandFailed, context, message)
    }

    pub fn not_found(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(VcsErrorKind::NotFound, context, message)
    }

    pub fn io(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(VcsErrorKind::Io, context, message)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == VcsErrorKind::Conflict
    }
}

/// Result type for VCS operations.
pub type VcsResult<T> = Result<T, VcsError>;

/// An isolated working copy bound to its own branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of a rebase or merge that ran to completion or stopped on
/// conflicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationOutcome {
    Clean,
    /// Stopped with these files conflicted; the operation is still in
    /// progress and must be continued or aborted.
    Conflicts(Vec<String>),
}

impl IntegrationOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, IntegrationOutcome::Clean)
    }
}

/// One commit from a history listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    /// First line of the commit message.
    pub subject: String,
}

impl CommitSummary {
    pub fn new(sha: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            subject: subject.into(),
        }
    }
}

/// Narrow capability interface over the version-control system.
///
/// Operations without a directory argument act on the caller's main working
/// tree (the one that holds the merge target).
#[async_trait]
pub trait VcsService: Send + Sync {
    /// Create an isolated worktree on a fresh branch derived from
    /// `owner_ref`, starting at `base_branch`.
    async fn create_worktree(&self, owner_ref: &str, base_branch: &str) -> VcsResult<Worktree>;

    /// Remove the worktree directory. The branch and its commits persist.
    async fn cleanup_worktree(&self, path: &Path) -> VcsResult<()>;

    /// Rebase `branch` onto `onto`.
    async fn rebase(&self, branch: &str, onto: &str) -> VcsResult<IntegrationOutcome>;

    /// Merge `branch` into `into`, using `message` for a merge commit.
    async fn merge(
        &self,
        branch: &str,
        into: &str,
        message: Option<&str>,
    ) -> VcsResult<IntegrationOutcome>;

    async fn abort_rebase(&self) -> VcsResult<()>;

    async fn abort_merge(&self) -> VcsResult<()>;

    /// Continue an in-progress rebase after conflicts were staged.
    async fn continue_rebase(&self) -> VcsResult<IntegrationOutcome>;

    /// Conclude an in-progress merge after conflicts were staged.
    async fn commit_merge(&self, message: &str) -> VcsResult<()>;

    async fn delete_local_branch(&self, branch: &str, force: bool) -> VcsResult<()>;

    async fn branch_exists(&self, branch: &str) -> VcsResult<bool>;

    async fn has_uncommitted_changes(&self) -> VcsResult<bool>;

    /// Stash local changes. Returns `false` when there was nothing to stash.
    async fn stash(&self) -> VcsResult<bool>;

    async fn pop_stash(&self) -> VcsResult<()>;

    async fn conflicted_files(&self) -> VcsResult<Vec<String>>;

    /// Commits reachable from HEAD of `dir` but not from `base`, oldest first.
    async fn commits_since(&self, dir: &Path, base: &str) -> VcsResult<Vec<CommitSummary>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = VcsError::command_failed("rebase issue-1 onto main", "exit status 128");
        assert_eq!(err.to_string(), "rebase issue-1 onto main: exit status 128");
        assert_eq!(err.kind, VcsErrorKind::CommandFailed);
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_integration_outcome_is_clean() {
        assert!(IntegrationOutcome::Clean.is_clean());
        assert!(!IntegrationOutcome::Conflicts(vec!["a.ts".into()]).is_clean());
    }
}
