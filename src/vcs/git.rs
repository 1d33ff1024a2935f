//! [`VcsService`] backed by the `git` command line.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{CommitSummary, IntegrationOutcome, VcsError, VcsResult, VcsService, Worktree};

const BRANCH_PREFIX: &str = "patchwright";
const AUTO_STASH_MESSAGE: &str = "patchwright auto-stash before merge";
const FIELD_SEP: char = '\u{1f}';

#[derive(Debug)]
struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Git adapter operating on one repository and a directory of worktrees.
///
/// The state directory, and any path added with [`GitVcs::with_excluded`],
/// is written to the repository's `info/exclude` before the first status,
/// stash or worktree call, so pipeline files never count as local changes
/// and never end up in a commit.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_dir: PathBuf,
    worktree_root: PathBuf,
    excluded: Vec<String>,
    excludes_written: Arc<OnceCell<()>>,
}

impl GitVcs {
    /// Worktrees are created under `<repo_dir>/<state_dir>/worktrees`.
    pub fn new(repo_dir: impl Into<PathBuf>, state_dir: impl AsRef<Path>) -> Self {
        let repo_dir = repo_dir.into();
        let state_dir = state_dir.as_ref();
        let worktree_root = repo_dir.join(state_dir).join("worktrees");
        let excluded = exclude_pattern(&repo_dir, state_dir).into_iter().collect();
        Self {
            repo_dir,
            worktree_root,
            excluded,
            excludes_written: Arc::new(OnceCell::new()),
        }
    }

    /// Also exclude `path` (relative to the root of every worktree).
    pub fn with_excluded(mut self, path: impl AsRef<Path>) -> Self {
        if let Some(pattern) = exclude_pattern(&self.repo_dir, path.as_ref()) {
            if !self.excluded.contains(&pattern) {
                self.excluded.push(pattern);
            }
        }
        self
    }

    pub fn with_worktree_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.worktree_root = root.into();
        self
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Branch name used for a worktree owned by `owner_ref`.
    pub fn branch_for(owner_ref: &str) -> String {
        format!("{}/{}", BRANCH_PREFIX, sanitize_ref(owner_ref))
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> VcsResult<GitOutput> {
        debug!(dir = %dir.display(), args = ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| VcsError::io(format!("git {}", args.join(" ")), e.to_string()))?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run in the main repository and fail on a non-zero exit status.
    async fn run_ok(&self, context: &str, args: &[&str]) -> VcsResult<String> {
        let output = self.run(&self.repo_dir, args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(VcsError::command_failed(context, output.failure_message()))
        }
    }

    async fn ensure_excluded(&self) -> VcsResult<()> {
        self.excludes_written
            .get_or_try_init(|| self.write_excludes())
            .await?;
        Ok(())
    }

    /// Append missing patterns to `<git-common-dir>/info/exclude`, which is
    /// shared by the main checkout and every linked worktree.
    async fn write_excludes(&self) -> VcsResult<()> {
        if self.excluded.is_empty() {
            return Ok(());
        }
        let context = "update info/exclude";
        let common_dir = self
            .run_ok(context, &["rev-parse", "--git-common-dir"])
            .await?;
        let info_dir = self.repo_dir.join(common_dir.trim()).join("info");
        let exclude_file = info_dir.join("exclude");

        let existing = match tokio::fs::read_to_string(&exclude_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(VcsError::io(context, e.to_string())),
        };
        let missing: Vec<&String> = self
            .excluded
            .iter()
            .filter(|pattern| !existing.lines().any(|line| line.trim() == pattern.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for pattern in missing {
            content.push_str(pattern);
            content.push('\n');
        }
        tokio::fs::create_dir_all(&info_dir)
            .await
            .map_err(|e| VcsError::io(context, e.to_string()))?;
        tokio::fs::write(&exclude_file, content)
            .await
            .map_err(|e| VcsError::io(context, e.to_string()))?;
        debug!(file = %exclude_file.display(), "excluded pipeline paths from git");
        Ok(())
    }

    /// Map a failed rebase/merge to conflicts when the index has unmerged
    /// paths, otherwise to a command failure.
    async fn integration_result(
        &self,
        context: &str,
        output: GitOutput,
    ) -> VcsResult<IntegrationOutcome> {
        if output.success {
            return Ok(IntegrationOutcome::Clean);
        }
        let conflicted = self.conflicted_files().await?;
        if conflicted.is_empty() {
            Err(VcsError::command_failed(context, output.failure_message()))
        } else {
            Ok(IntegrationOutcome::Conflicts(conflicted))
        }
    }
}

#[async_trait]
impl VcsService for GitVcs {
    async fn create_worktree(&self, owner_ref: &str, base_branch: &str) -> VcsResult<Worktree> {
        let branch = Self::branch_for(owner_ref);
        let path = self.worktree_root.join(sanitize_ref(owner_ref).replace('/', "-"));
        let context = format!("create worktree for {}", owner_ref);
        self.ensure_excluded().await?;

        tokio::fs::create_dir_all(&self.worktree_root)
            .await
            .map_err(|e| VcsError::io(&context, e.to_string()))?;
        let path_arg = path.to_string_lossy().into_owned();

        if self.branch_exists(&branch).await? {
            self.run_ok(&context, &["worktree", "add", &path_arg, &branch])
                .await?;
        } else {
            self.run_ok(
                &context,
                &["worktree", "add", "-b", &branch, &path_arg, base_branch],
            )
            .await?;
        }

        Ok(Worktree { path, branch })
    }

    async fn cleanup_worktree(&self, path: &Path) -> VcsResult<()> {
        let context = format!("remove worktree {}", path.display());
        let path_arg = path.to_string_lossy().into_owned();
        self.run_ok(&context, &["worktree", "remove", "--force", &path_arg])
            .await?;
        self.run_ok("prune worktrees", &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn rebase(&self, branch: &str, onto: &str) -> VcsResult<IntegrationOutcome> {
        let context = format!("rebase {} onto {}", branch, onto);
        let output = self.run(&self.repo_dir, &["rebase", onto, branch]).await?;
        self.integration_result(&context, output).await
    }

    async fn merge(
        &self,
        branch: &str,
        into: &str,
        message: Option<&str>,
    ) -> VcsResult<IntegrationOutcome> {
        let context = format!("merge {} into {}", branch, into);
        self.run_ok(&context, &["checkout", into]).await?;

        let mut args = vec!["merge", "--no-edit"];
        if let Some(message) = message {
            args.push("-m");
            args.push(message);
        }
        args.push(branch);
        let output = self.run(&self.repo_dir, &args).await?;
        self.integration_result(&context, output).await
    }

    async fn abort_rebase(&self) -> VcsResult<()> {
        self.run_ok("abort rebase", &["rebase", "--abort"]).await?;
        Ok(())
    }

    async fn abort_merge(&self) -> VcsResult<()> {
        self.run_ok("abort merge", &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn continue_rebase(&self) -> VcsResult<IntegrationOutcome> {
        let output = self
            .run(
                &self.repo_dir,
                &["-c", "core.editor=true", "rebase", "--continue"],
            )
            .await?;
        self.integration_result("continue rebase", output).await
    }

    async fn commit_merge(&self, message: &str) -> VcsResult<()> {
        self.run_ok("commit merge", &["commit", "--no-edit", "-m", message])
            .await?;
        Ok(())
    }

    async fn delete_local_branch(&self, branch: &str, force: bool) -> VcsResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_ok(&format!("delete branch {}", branch), &["branch", flag, branch])
            .await?;
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> VcsResult<bool> {
        let reference = format!("refs/heads/{}", branch);
        let output = self
            .run(
                &self.repo_dir,
                &["rev-parse", "--verify", "--quiet", &reference],
            )
            .await?;
        Ok(output.success)
    }

    async fn has_uncommitted_changes(&self) -> VcsResult<bool> {
        self.ensure_excluded().await?;
        let stdout = self
            .run_ok("check working tree status", &["status", "--porcelain"])
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn stash(&self) -> VcsResult<bool> {
        self.ensure_excluded().await?;
        let stdout = self
            .run_ok(
                "stash local changes",
                &["stash", "push", "--include-untracked", "-m", AUTO_STASH_MESSAGE],
            )
            .await?;
        Ok(!stdout.contains("No local changes to save"))
    }

    async fn pop_stash(&self) -> VcsResult<()> {
        self.run_ok("restore stashed changes", &["stash", "pop"])
            .await?;
        Ok(())
    }

    async fn conflicted_files(&self) -> VcsResult<Vec<String>> {
        let stdout = self
            .run_ok(
                "list conflicted files",
                &["diff", "--name-only", "--diff-filter=U"],
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn commits_since(&self, dir: &Path, base: &str) -> VcsResult<Vec<CommitSummary>> {
        let range = format!("{}..HEAD", base);
        let format = format!("--format=%H{}%s", FIELD_SEP);
        let output = self
            .run(dir, &["log", "--reverse", &format, &range])
            .await?;
        if !output.success {
            return Err(VcsError::command_failed(
                format!("list commits in {} since {}", dir.display(), base),
                output.failure_message(),
            ));
        }
        Ok(parse_log(&output.stdout))
    }
}

fn parse_log(stdout: &str) -> Vec<CommitSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let (sha, subject) = line.split_once(FIELD_SEP)?;
            Some(CommitSummary::new(sha.trim(), subject.trim()))
        })
        .collect()
}

/// Anchored `info/exclude` pattern for a directory inside the repository,
/// or `None` when it lies outside.
fn exclude_pattern(repo_dir: &Path, dir: &Path) -> Option<String> {
    let relative = if dir.is_absolute() {
        dir.strip_prefix(repo_dir).ok()?
    } else {
        dir
    };
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("/{}/", parts.join("/")))
}

/// Replace characters git rejects in ref names.
fn sanitize_ref(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.trim_matches(|c| c == '-' || c == '.' || c == '/').to_string()
}
