//! The exec phase: load ready tasks, run them through the coordinator and
//! persist every status transition through the task store.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::orchestrator::{PhaseContext, PhaseHandler, PhaseOutcome};
use super::store::{TaskStore, TaskUpdate};
use crate::agent::AgentExecutor;
use crate::audit::SharedAuditWriter;
use crate::error::PipelineResult;
use crate::metrics::{RunMetricsCollector, RunMetricsStore};
use crate::model::{status_index, Issue, PipelinePhase, RunMeta, Task, TaskStatus};
use crate::parallel::{
    group_by_owner, ConflictResolver, ExecutionObserver, ExecutionOptions, ExecutionSummary,
    GroupScheduler, ManualResolver, MergeSummary, ParallelCoordinator, UnitOfWork, UnitResult,
};
use crate::vcs::VcsService;

/// Directory inside each worktree that receives reference material.
pub const REFERENCE_DIR: &str = ".patchwright-context";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// One unit per issue, all of its ready tasks in one session.
    #[default]
    PerIssue,
    /// One unit per task, walking parallel groups with a merge after each.
    PerTask,
}

pub struct ExecPhase {
    tasks: Arc<dyn TaskStore>,
    vcs: Arc<dyn VcsService>,
    agent: Arc<dyn AgentExecutor>,
    resolver: Arc<dyn ConflictResolver>,
    options: ExecutionOptions,
    mode: ExecMode,
    reference_files: Vec<PathBuf>,
    rerun_command: String,
    retry_failed: bool,
    audit: Option<SharedAuditWriter>,
    metrics_store: Option<RunMetricsStore>,
}

impl ExecPhase {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        vcs: Arc<dyn VcsService>,
        agent: Arc<dyn AgentExecutor>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            tasks,
            vcs,
            agent,
            resolver: Arc::new(ManualResolver),
            options,
            mode: ExecMode::PerIssue,
            reference_files: Vec::new(),
            rerun_command: "patchwright exec".to_string(),
            retry_failed: false,
            audit: None,
            metrics_store: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Files copied into every worktree before the agent starts.
    pub fn with_reference_files(mut self, files: Vec<PathBuf>) -> Self {
        self.reference_files = files;
        self
    }

    /// Command printed for re-running failed tasks.
    pub fn with_rerun_command(mut self, command: impl Into<String>) -> Self {
        self.rerun_command = command.into();
        self
    }

    /// Put `failed` and `skipped` tasks back to `pending` before selecting.
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn with_audit(mut self, audit: SharedAuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_metrics_store(mut self, store: RunMetricsStore) -> Self {
        self.metrics_store = Some(store);
        self
    }

    fn coordinator(
        &self,
        ctx: &PhaseContext,
        metrics: &RunMetricsCollector,
    ) -> ParallelCoordinator {
        let coordinator = ParallelCoordinator::new(
            Arc::clone(&self.vcs),
            Arc::clone(&self.agent),
            self.options.clone(),
            ctx.run_id.clone(),
        )
        .with_resolver(Arc::clone(&self.resolver))
        .with_cancel(ctx.cancel.clone())
        .with_metrics(metrics.clone());
        match &self.audit {
            Some(audit) => coordinator.with_audit(Arc::clone(audit)),
            None => coordinator,
        }
    }

    /// Tasks left `running` by an interrupted run go back to `pending`, and
    /// so do failed ones when retrying.
    fn reset_stale(&self, tasks: &mut [Task]) -> PipelineResult<()> {
        let retry_failed = self.retry_failed;
        let stale: Vec<TaskUpdate> = tasks
            .iter_mut()
            .filter(|t| match t.status {
                TaskStatus::Running => true,
                TaskStatus::Failed | TaskStatus::Skipped => retry_failed,
                _ => false,
            })
            .map(|t| {
                t.status = TaskStatus::Pending;
                t.error = None;
                TaskUpdate::new(t.id.clone(), TaskStatus::Pending)
            })
            .collect();
        if !stale.is_empty() {
            info!(tasks = stale.len(), retry_failed, "resetting tasks to pending");
            self.tasks.apply(&stale)?;
        }
        Ok(())
    }

    fn mark_running(&self, tasks: &[Task]) -> PipelineResult<()> {
        let updates: Vec<TaskUpdate> = tasks
            .iter()
            .map(|t| TaskUpdate::new(t.id.clone(), TaskStatus::Running))
            .collect();
        self.tasks.apply(&updates)?;
        Ok(())
    }

    /// Walks parallel groups in ascending order; each pass runs one unit
    /// per issue over the current group and merges before the next pass.
    async fn run_per_issue(
        &self,
        ctx: &PhaseContext,
        tasks: Vec<Task>,
        issues: &[Issue],
        coordinator: &ParallelCoordinator,
        observer: Arc<StoreObserver>,
    ) -> PipelineResult<Vec<ExecutionSummary>> {
        let mut scheduler = GroupScheduler::new(tasks)?;
        let mut attempted: HashSet<String> = HashSet::new();
        let mut summaries = Vec::new();

        while !scheduler.is_finished() && !ctx.cancel.is_cancelled() {
            let selected = select_excluding(scheduler.tasks(), &attempted);
            if selected.is_empty() {
                if self.skip_blocked(&mut scheduler)? {
                    continue;
                }
                break;
            }
            attempted.extend(selected.iter().map(|t| t.id.clone()));

            let units: Vec<UnitOfWork> = group_by_owner(&selected, issues)
                .into_iter()
                .map(UnitOfWork::from_owner_group)
                .collect();
            if units.is_empty() {
                continue;
            }
            let dispatched: Vec<Task> =
                units.iter().flat_map(|u| u.tasks.iter().cloned()).collect();
            self.mark_running(&dispatched)?;

            info!(
                group = ?scheduler.current_group(),
                units = units.len(),
                tasks = dispatched.len(),
                "dispatching issue units"
            );
            let summary = coordinator.run(units, observer.clone()).await;
            record_outcomes(&mut scheduler, &summary);

            let stop = self.options.fail_fast && !summary.all_succeeded();
            summaries.push(summary);
            if stop {
                warn!("stopping after failed group (fail-fast)");
                break;
            }
        }
        Ok(summaries)
    }

    /// Mark blocked tasks of the current group `skipped`. Returns whether
    /// anything changed.
    fn skip_blocked(&self, scheduler: &mut GroupScheduler) -> PipelineResult<bool> {
        let skipped = scheduler.skip_blocked();
        if skipped.is_empty() {
            return Ok(false);
        }
        let updates: Vec<TaskUpdate> = skipped
            .iter()
            .map(|blocked| {
                warn!(task_id = %blocked.task_id, reason = %blocked.reason, "skipping blocked task");
                TaskUpdate::new(blocked.task_id.clone(), TaskStatus::Skipped)
                    .with_error(Some(blocked.reason.to_string()))
            })
            .collect();
        self.tasks.apply(&updates)?;
        Ok(true)
    }

    async fn run_per_task(
        &self,
        ctx: &PhaseContext,
        tasks: Vec<Task>,
        issues: &[Issue],
        coordinator: &ParallelCoordinator,
        observer: Arc<StoreObserver>,
    ) -> PipelineResult<Vec<ExecutionSummary>> {
        let issues: HashMap<&str, &Issue> = issues.iter().map(|i| (i.id.as_str(), i)).collect();
        let mut scheduler = GroupScheduler::new(tasks)?;
        let mut summaries = Vec::new();

        while !scheduler.is_finished() && !ctx.cancel.is_cancelled() {
            let batch = scheduler.next_batch();
            if batch.ready.is_empty() {
                if self.skip_blocked(&mut scheduler)? {
                    continue;
                }
                break;
            }

            self.mark_running(&batch.ready)?;
            let units: Vec<UnitOfWork> = batch
                .ready
                .into_iter()
                .map(|task| {
                    let issue = task
                        .issue_id
                        .as_deref()
                        .and_then(|id| issues.get(id))
                        .map(|issue| (*issue).clone());
                    UnitOfWork::for_task(task, issue)
                })
                .collect();
            info!(group = ?batch.group, units = units.len(), "dispatching task group");

            let summary = coordinator.run(units, observer.clone()).await;
            record_outcomes(&mut scheduler, &summary);

            let stop = self.options.fail_fast && !summary.all_succeeded();
            summaries.push(summary);
            if stop {
                warn!("stopping after failed group (fail-fast)");
                break;
            }
        }
        Ok(summaries)
    }

    fn outcome(&self, summaries: &[ExecutionSummary], observer: &StoreObserver) -> PhaseOutcome {
        let completed: usize = summaries.iter().map(|s| s.tasks_completed).sum();
        let failed: usize = summaries.iter().map(|s| s.tasks_failed).sum();
        let input: u64 = summaries.iter().map(|s| s.total_input_tokens).sum();
        let output: u64 = summaries.iter().map(|s| s.total_output_tokens).sum();
        let merges: Vec<&MergeSummary> =
            summaries.iter().filter_map(|s| s.merge.as_ref()).collect();
        let merged: usize = merges.iter().map(|m| m.merged_count()).sum();
        let merge_failed: usize = merges.iter().map(|m| m.failed().len()).sum();

        let mut remediation: Vec<String> = merges
            .iter()
            .flat_map(|m| m.manual_instructions())
            .collect();
        if failed > 0 || merge_failed > 0 {
            remediation.push(format!(
                "{}    # re-run failed and unmerged tasks",
                self.rerun_command
            ));
        }

        let summary = format!(
            "{} tasks completed, {} failed, {} branches merged, {} left unmerged",
            completed, failed, merged, merge_failed
        );
        let store_errors = observer.take_errors();
        let outcome = if failed == 0 && merge_failed == 0 && store_errors.is_empty() {
            PhaseOutcome::succeeded(summary)
        } else {
            let mut error = summary.clone();
            if !store_errors.is_empty() {
                error.push_str(&format!("; status updates failed: {}", store_errors.join("; ")));
            }
            let mut outcome = PhaseOutcome::failed(error);
            outcome.summary = summary;
            outcome
        };
        outcome.with_tokens(input, output).with_remediation(remediation)
    }
}

#[async_trait]
impl PhaseHandler for ExecPhase {
    fn phase(&self) -> PipelinePhase {
        PipelinePhase::Exec
    }

    #[instrument(skip_all, fields(run_id = %ctx.run_id, mode = ?self.mode))]
    async fn run(&self, ctx: &PhaseContext, run: &mut RunMeta) -> PipelineResult<PhaseOutcome> {
        let mut plan = self.tasks.load_plan()?;
        self.reset_stale(&mut plan.tasks)?;
        // Reject cycles and impossible group orderings up front.
        GroupScheduler::new(plan.tasks.clone())?;

        let metrics = RunMetricsCollector::new(ctx.run_id.clone(), 0);
        let coordinator = self.coordinator(ctx, &metrics);
        let observer = Arc::new(StoreObserver::new(
            Arc::clone(&self.tasks),
            self.reference_files.clone(),
        ));

        let summaries = match self.mode {
            ExecMode::PerIssue => {
                self.run_per_issue(
                    ctx,
                    plan.tasks.clone(),
                    &plan.issues,
                    &coordinator,
                    Arc::clone(&observer),
                )
                .await?
            }
            ExecMode::PerTask => {
                self.run_per_task(
                    ctx,
                    plan.tasks.clone(),
                    &plan.issues,
                    &coordinator,
                    Arc::clone(&observer),
                )
                .await?
            }
        };

        if let Some(store) = &self.metrics_store {
            if let Err(err) = store.save(&metrics.finish()) {
                warn!(error = %err, "failed to save run metrics");
            }
        }

        let after = self.tasks.load_plan()?;
        run.tasks_total = after.tasks.len() as u32;
        run.tasks_completed = after
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count() as u32;
        run.tasks_failed = after
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::MergeError))
            .count() as u32;

        if summaries.is_empty() {
            info!("no ready tasks");
            return Ok(PhaseOutcome::succeeded("no ready tasks"));
        }
        Ok(self.outcome(&summaries, &observer))
    }
}

/// Runnable tasks of the lowest parallel group that still has unfinished
/// work, whose dependencies are done or are themselves selected and belong
/// to the same issue (they run earlier in the same session).
pub fn select_per_issue(tasks: &[Task]) -> Vec<Task> {
    select_excluding(tasks, &HashSet::new())
}

fn select_excluding(tasks: &[Task], attempted: &HashSet<String>) -> Vec<Task> {
    let Some(group) = current_group(tasks) else {
        return Vec::new();
    };
    let statuses = status_index(tasks);
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut selected: HashSet<&str> = tasks
        .iter()
        .filter(|t| {
            t.parallel_group == group && t.status.is_runnable() && !attempted.contains(&t.id)
        })
        .map(|t| t.id.as_str())
        .collect();

    loop {
        let rejected: Vec<&str> = selected
            .iter()
            .copied()
            .filter(|id| {
                let task = by_id[id];
                !task.depends_on.iter().all(|dep| {
                    statuses.get(dep) == Some(&TaskStatus::Done)
                        || (selected.contains(dep.as_str())
                            && by_id[dep.as_str()].issue_id == task.issue_id)
                })
            })
            .collect();
        if rejected.is_empty() {
            break;
        }
        for id in rejected {
            selected.remove(id);
        }
    }

    tasks
        .iter()
        .filter(|t| selected.contains(t.id.as_str()))
        .cloned()
        .collect()
}

/// Feed a coordinator pass back into the scheduler's view of statuses.
fn record_outcomes(scheduler: &mut GroupScheduler, summary: &ExecutionSummary) {
    for unit in &summary.units {
        for id in &unit.completed_task_ids {
            scheduler.update(id, TaskStatus::Done);
        }
        for id in &unit.failed_task_ids {
            scheduler.update(id, TaskStatus::Failed);
        }
    }
    for id in summary.merge_failed_task_ids() {
        scheduler.update(&id, TaskStatus::MergeError);
    }
}

/// Lowest parallel group holding a non-terminal task.
fn current_group(tasks: &[Task]) -> Option<i64> {
    tasks
        .iter()
        .filter(|t| !t.status.is_terminal())
        .map(|t| t.parallel_group)
        .min()
}

/// Persists unit and merge outcomes and primes worktrees.
struct StoreObserver {
    tasks: Arc<dyn TaskStore>,
    reference_files: Vec<PathBuf>,
    completed_by_owner: Mutex<HashMap<String, Vec<String>>>,
    errors: Mutex<Vec<String>>,
}

impl StoreObserver {
    fn new(tasks: Arc<dyn TaskStore>, reference_files: Vec<PathBuf>) -> Self {
        Self {
            tasks,
            reference_files,
            completed_by_owner: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    fn apply(&self, updates: &[TaskUpdate]) {
        if updates.is_empty() {
            return;
        }
        if let Err(err) = self.tasks.apply(updates) {
            warn!(error = %err, "failed to persist task status");
            if let Ok(mut errors) = self.errors.lock() {
                errors.push(err.to_string());
            }
        }
    }

    fn take_errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionObserver for StoreObserver {
    async fn prime_worktree(&self, _unit: &UnitOfWork, worktree: &Path) -> Result<(), String> {
        if self.reference_files.is_empty() {
            return Ok(());
        }
        let dest = worktree.join(REFERENCE_DIR);
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| format!("create {}: {}", dest.display(), e))?;
        for file in &self.reference_files {
            let Some(name) = file.file_name() else {
                continue;
            };
            if !file.exists() {
                continue;
            }
            tokio::fs::copy(file, dest.join(name))
                .await
                .map_err(|e| format!("copy {}: {}", file.display(), e))?;
        }
        Ok(())
    }

    async fn on_unit_complete(&self, _unit: &UnitOfWork, result: &UnitResult) {
        let done = result.completed_task_ids.iter().map(|id| {
            TaskUpdate::new(id.clone(), TaskStatus::Done).with_branch(result.branch_name.clone())
        });
        let failed = result.failed_task_ids.iter().map(|id| {
            TaskUpdate::new(id.clone(), TaskStatus::Failed)
                .with_error(result.error.clone())
                .with_branch(result.branch_name.clone())
        });
        let updates: Vec<TaskUpdate> = done.chain(failed).collect();
        self.apply(&updates);

        if let Ok(mut map) = self.completed_by_owner.lock() {
            map.insert(result.owner_id.clone(), result.completed_task_ids.clone());
        }
    }

    async fn on_merge_complete(&self, summary: &MergeSummary) {
        let updates: Vec<TaskUpdate> = {
            let Ok(map) = self.completed_by_owner.lock() else {
                return;
            };
            summary
                .failed()
                .into_iter()
                .flat_map(|failed| {
                    let error = format!(
                        "merge failed: {}",
                        failed.error.as_deref().unwrap_or("unknown error")
                    );
                    map.get(&failed.owner_id)
                        .into_iter()
                        .flatten()
                        .map(move |id| {
                            TaskUpdate::new(id.clone(), TaskStatus::MergeError)
                                .with_error(Some(error.clone()))
                        })
                })
                .collect()
        };
        self.apply(&updates);
    }
}
