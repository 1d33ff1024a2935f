//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use patchwright::agent::{AgentError, AgentExecutor, AgentRequest, AgentResponse, AgentResult};
use patchwright::model::{RunMeta, Task};
use patchwright::parallel::{ConflictRequest, ConflictResolver, ResolutionError, UnitOfWork};
use patchwright::pipeline::{RunStore, StoreResult};
use patchwright::vcs::{
    CommitSummary, IntegrationOutcome, VcsError, VcsResult, VcsService, Worktree,
};

// ============================================================================
// Recording VCS
// ============================================================================

/// VCS double that records every call in order and scripts conflicts per
/// branch.
#[derive(Default)]
pub struct FakeVcs {
    calls: Mutex<Vec<String>>,
    worktrees: Mutex<HashMap<PathBuf, String>>,
    commits: Mutex<HashMap<PathBuf, Vec<CommitSummary>>>,
    branches: Mutex<HashSet<String>>,
    rebase_conflicts: Mutex<HashMap<String, Vec<String>>>,
    merge_conflicts: Mutex<HashMap<String, Vec<String>>>,
    failing_worktrees: Mutex<HashSet<String>>,
    conflicted: Mutex<Vec<String>>,
    dirty: AtomicBool,
    stashed: AtomicBool,
    active: AtomicUsize,
    overlapped: AtomicBool,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Position of the first call equal to `call`.
    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Two rebase/merge operations ran at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn has_branch(&self, branch: &str) -> bool {
        self.branches.lock().unwrap().contains(branch)
    }

    pub fn add_branch(&self, branch: &str) {
        self.branches.lock().unwrap().insert(branch.to_string());
    }

    pub fn conflict_on_rebase(&self, branch: &str, files: &[&str]) {
        self.rebase_conflicts
            .lock()
            .unwrap()
            .insert(branch.to_string(), files.iter().map(|f| f.to_string()).collect());
    }

    pub fn conflict_on_merge(&self, branch: &str, files: &[&str]) {
        self.merge_conflicts
            .lock()
            .unwrap()
            .insert(branch.to_string(), files.iter().map(|f| f.to_string()).collect());
    }

    /// Worktree creation for this owner ref suffix fails.
    pub fn fail_worktree(&self, owner: &str) {
        self.failing_worktrees.lock().unwrap().insert(owner.to_string());
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn is_stashed(&self) -> bool {
        self.stashed.load(Ordering::SeqCst)
    }

    /// Owner ref the worktree at `path` was created for.
    pub fn owner_ref_for(&self, path: &Path) -> Option<String> {
        self.worktrees.lock().unwrap().get(path).cloned()
    }

    pub fn commit(&self, dir: &Path, subject: &str) {
        let mut commits = self.commits.lock().unwrap();
        let list = commits.entry(dir.to_path_buf()).or_default();
        let sha = format!("{:07x}", list.len() + 1);
        list.push(CommitSummary::new(sha, subject));
    }

    /// What a resolver does: clear the conflicted set.
    pub fn resolve_all(&self) {
        self.conflicted.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn exclusive<T>(&self, value: T) -> T {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        value
    }
}

#[async_trait]
impl VcsService for FakeVcs {
    async fn create_worktree(&self, owner_ref: &str, _base_branch: &str) -> VcsResult<Worktree> {
        self.record(format!("create_worktree {}", owner_ref));
        let failing = self
            .failing_worktrees
            .lock()
            .unwrap()
            .iter()
            .any(|owner| owner_ref.ends_with(owner.as_str()));
        if failing {
            return Err(VcsError::command_failed(
                format!("worktree add {}", owner_ref),
                "fatal: disk full",
            ));
        }
        let path = PathBuf::from("/fake/worktrees").join(owner_ref);
        let branch = format!("patchwright/{}", owner_ref);
        self.worktrees
            .lock()
            .unwrap()
            .insert(path.clone(), owner_ref.to_string());
        self.add_branch(&branch);
        Ok(Worktree { path, branch })
    }

    async fn cleanup_worktree(&self, path: &Path) -> VcsResult<()> {
        self.record(format!("cleanup_worktree {}", path.display()));
        Ok(())
    }

    async fn rebase(&self, branch: &str, onto: &str) -> VcsResult<IntegrationOutcome> {
        self.record(format!("rebase {} onto {}", branch, onto));
        let conflicts = self.rebase_conflicts.lock().unwrap().get(branch).cloned();
        let outcome = match conflicts {
            Some(files) => {
                *self.conflicted.lock().unwrap() = files.clone();
                IntegrationOutcome::Conflicts(files)
            }
            None => IntegrationOutcome::Clean,
        };
        Ok(self.exclusive(outcome).await)
    }

    async fn merge(
        &self,
        branch: &str,
        into: &str,
        _message: Option<&str>,
    ) -> VcsResult<IntegrationOutcome> {
        let conflicts = self.merge_conflicts.lock().unwrap().get(branch).cloned();
        let outcome = match conflicts {
            Some(files) => {
                *self.conflicted.lock().unwrap() = files.clone();
                IntegrationOutcome::Conflicts(files)
            }
            None => IntegrationOutcome::Clean,
        };
        let outcome = self.exclusive(outcome).await;
        // Logged on completion so ordering checks see the end of the merge.
        self.record(format!("merge {} into {}", branch, into));
        Ok(outcome)
    }

    async fn abort_rebase(&self) -> VcsResult<()> {
        self.record("abort_rebase".to_string());
        self.conflicted.lock().unwrap().clear();
        Ok(())
    }

    async fn abort_merge(&self) -> VcsResult<()> {
        self.record("abort_merge".to_string());
        self.conflicted.lock().unwrap().clear();
        Ok(())
    }

    async fn continue_rebase(&self) -> VcsResult<IntegrationOutcome> {
        self.record("continue_rebase".to_string());
        Ok(IntegrationOutcome::Clean)
    }

    async fn commit_merge(&self, _message: &str) -> VcsResult<()> {
        self.record("commit_merge".to_string());
        Ok(())
    }

    async fn delete_local_branch(&self, branch: &str, _force: bool) -> VcsResult<()> {
        self.record(format!("delete_branch {}", branch));
        self.branches.lock().unwrap().remove(branch);
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> VcsResult<bool> {
        Ok(self.has_branch(branch))
    }

    async fn has_uncommitted_changes(&self) -> VcsResult<bool> {
        Ok(self.dirty.load(Ordering::SeqCst))
    }

    async fn stash(&self) -> VcsResult<bool> {
        self.record("stash".to_string());
        let dirty = self.dirty.swap(false, Ordering::SeqCst);
        self.stashed.store(dirty, Ordering::SeqCst);
        Ok(dirty)
    }

    async fn pop_stash(&self) -> VcsResult<()> {
        self.record("pop_stash".to_string());
        if self.stashed.swap(false, Ordering::SeqCst) {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn conflicted_files(&self) -> VcsResult<Vec<String>> {
        Ok(self.conflicted.lock().unwrap().clone())
    }

    async fn commits_since(&self, dir: &Path, _base: &str) -> VcsResult<Vec<CommitSummary>> {
        Ok(self
            .commits
            .lock()
            .unwrap()
            .get(dir)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Scripted agent
// ============================================================================

/// How the fake agent behaves for one owner.
#[derive(Debug, Clone)]
pub struct Script {
    /// Commit the first `n` task subjects from the prompt; `None` commits all.
    pub commits: Option<usize>,
    pub delay: Duration,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    /// The session reports failure.
    Failure(String),
    /// The executor itself errors, like a crashed process.
    Error(String),
}

impl Script {
    pub fn commit_all() -> Self {
        Self {
            commits: None,
            delay: Duration::ZERO,
            outcome: Outcome::Success,
        }
    }

    pub fn commit(n: usize) -> Self {
        Self {
            commits: Some(n),
            ..Self::commit_all()
        }
    }

    pub fn then_fail(mut self, error: &str) -> Self {
        self.outcome = Outcome::Failure(error.to_string());
        self
    }

    pub fn then_crash(mut self, error: &str) -> Self {
        self.outcome = Outcome::Error(error.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Agent double that commits into the fake VCS the way a real session would
/// commit into its worktree.
pub struct ScriptedAgent {
    vcs: std::sync::Arc<FakeVcs>,
    scripts: Mutex<HashMap<String, Script>>,
    default_script: Script,
    sessions: Mutex<Vec<String>>,
    tokens: (u64, u64),
}

impl ScriptedAgent {
    pub fn new(vcs: std::sync::Arc<FakeVcs>) -> Self {
        Self {
            vcs,
            scripts: Mutex::new(HashMap::new()),
            default_script: Script::commit_all(),
            sessions: Mutex::new(Vec::new()),
            tokens: (100, 40),
        }
    }

    pub fn script(self, owner: &str, script: Script) -> Self {
        self.scripts.lock().unwrap().insert(owner.to_string(), script);
        self
    }

    /// Owner refs of every session, in start order.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().clone()
    }

    fn script_for(&self, owner_ref: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .find(|(owner, _)| owner_ref.ends_with(&format!("-{}", owner)))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| self.default_script.clone())
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        let owner_ref = self
            .vcs
            .owner_ref_for(&request.work_dir)
            .unwrap_or_else(|| request.work_dir.display().to_string());
        self.sessions.lock().unwrap().push(owner_ref.clone());
        let script = self.script_for(&owner_ref);

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        let subject = Regex::new(r"Commit subject: `([^`]+)`").unwrap();
        let subjects: Vec<String> = subject
            .captures_iter(&request.prompt)
            .map(|c| c[1].to_string())
            .collect();
        let n = script.commits.unwrap_or(subjects.len()).min(subjects.len());
        for s in &subjects[..n] {
            self.vcs.commit(&request.work_dir, s);
        }

        match script.outcome {
            Outcome::Success => {
                Ok(AgentResponse::succeeded("done").with_tokens(self.tokens.0, self.tokens.1))
            }
            Outcome::Failure(error) => {
                Ok(AgentResponse::failed(error).with_tokens(self.tokens.0, self.tokens.1))
            }
            Outcome::Error(error) => Err(AgentError::NotConfigured(error)),
        }
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// Resolver that succeeds by clearing the fake VCS conflict set.
pub struct ClearingResolver {
    pub vcs: std::sync::Arc<FakeVcs>,
    pub requests: Mutex<Vec<ConflictRequest>>,
}

impl ClearingResolver {
    pub fn new(vcs: std::sync::Arc<FakeVcs>) -> Self {
        Self {
            vcs,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ConflictResolver for ClearingResolver {
    async fn resolve(&self, request: &ConflictRequest) -> Result<(), ResolutionError> {
        self.requests.lock().unwrap().push(request.clone());
        self.vcs.resolve_all();
        Ok(())
    }
}

/// Resolver that always gives up.
pub struct FailingResolver {
    pub calls: AtomicUsize,
}

impl FailingResolver {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ConflictResolver for FailingResolver {
    async fn resolve(&self, _request: &ConflictRequest) -> Result<(), ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ResolutionError("agent could not resolve".to_string()))
    }
}

// ============================================================================
// Stores and builders
// ============================================================================

#[derive(Default)]
pub struct MemoryRuns {
    runs: Mutex<HashMap<String, RunMeta>>,
    current: Mutex<Option<String>>,
}

impl RunStore for MemoryRuns {
    fn load(&self, run_id: &str) -> StoreResult<Option<RunMeta>> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    fn save(&self, run: &RunMeta) -> StoreResult<()> {
        self.runs.lock().unwrap().insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn current(&self) -> StoreResult<Option<String>> {
        Ok(self.current.lock().unwrap().clone())
    }

    fn set_current(&self, run_id: &str) -> StoreResult<()> {
        *self.current.lock().unwrap() = Some(run_id.to_string());
        Ok(())
    }
}

pub fn task(id: &str, title: &str) -> Task {
    Task::new(id, title)
}

pub fn unit(owner: &str, task_ids: &[&str]) -> UnitOfWork {
    let tasks = task_ids
        .iter()
        .map(|id| Task::new(*id, format!("fix {}", id)).with_issue(owner))
        .collect();
    UnitOfWork::new(owner, format!("{} fixes", owner), tasks)
}
