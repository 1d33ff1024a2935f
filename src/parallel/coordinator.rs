//! Parallel execution coordinator.
//!
//! Runs units of work concurrently, each in its own worktree, under a
//! semaphore-bounded pool. After every unit has finished, all worktrees are
//! removed and only then are the eligible branches merged, one at a time.
//! That ordering (finish all, clean up all, merge sequentially) is what keeps
//! the target branch free of concurrent writers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::analyzer::CompletionAnalyzer;
use super::merge::{DeferredMergeEngine, MergeOptions, MergeSummary};
use super::prompt::{DefaultPromptBuilder, UnitPromptBuilder};
use super::resolver::{ConflictResolver, ManualResolver};
use super::unit::{BranchStatus, QueuedBranch, UnitOfWork, UnitResult};
use crate::agent::{AgentExecutor, AgentRequest};
use crate::audit::SharedAuditWriter;
use crate::cancel::CancelSignal;
use crate::metrics::RunMetricsCollector;
use crate::retry::{execute_with_retry, RetryConfig};
use crate::vcs::{VcsService, Worktree};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub max_concurrent: usize,
    pub base_branch: String,
    /// Leave eligible branches unmerged.
    pub skip_merge: bool,
    /// Stop dispatching new units once any unit finishes with a failed task.
    pub fail_fast: bool,
    /// Retry policy for the per-unit agent session.
    pub retry: RetryConfig,
    pub merge: MergeOptions,
    pub model_override: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            base_branch: "main".to_string(),
            skip_merge: false,
            fail_fast: false,
            retry: RetryConfig::agent_default(),
            merge: MergeOptions::default(),
            model_override: None,
        }
    }
}

/// Caller hooks. Each call is awaited before the coordinator moves on.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    /// Copy reference material into a fresh worktree before the agent runs.
    async fn prime_worktree(&self, _unit: &UnitOfWork, _worktree: &Path) -> Result<(), String> {
        Ok(())
    }

    /// Invoked once per unit, before the unit counts as finished.
    async fn on_unit_complete(&self, _unit: &UnitOfWork, _result: &UnitResult) {}

    /// Invoked once after the merge pass.
    async fn on_merge_complete(&self, _summary: &MergeSummary) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl ExecutionObserver for NoopObserver {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Per-unit results in input order.
    pub units: Vec<UnitResult>,
    /// Branch states after merging.
    pub branches: Vec<BranchStatus>,
    /// `None` when merging was skipped.
    pub merge: Option<MergeSummary>,
}

impl ExecutionSummary {
    pub fn all_succeeded(&self) -> bool {
        self.tasks_failed == 0 && self.merge.as_ref().map_or(true, MergeSummary::all_merged)
    }

    /// Task ids whose unit finished but whose branch failed to merge.
    pub fn merge_failed_task_ids(&self) -> Vec<String> {
        let Some(merge) = &self.merge else {
            return Vec::new();
        };
        merge
            .failed()
            .into_iter()
            .filter_map(|failed| self.units.iter().find(|u| u.owner_id == failed.owner_id))
            .flat_map(|unit| unit.completed_task_ids.iter().cloned())
            .collect()
    }
}

struct UnitOutcome {
    result: UnitResult,
    worktree: Option<Worktree>,
    queued: Option<QueuedBranch>,
}

struct Shared {
    vcs: Arc<dyn VcsService>,
    agent: Arc<dyn AgentExecutor>,
    prompts: Arc<dyn UnitPromptBuilder>,
    analyzer: CompletionAnalyzer,
    options: ExecutionOptions,
    run_id: String,
    cancel: CancelSignal,
    halted: AtomicBool,
    audit: Option<SharedAuditWriter>,
    metrics: RunMetricsCollector,
}

pub struct ParallelCoordinator {
    vcs: Arc<dyn VcsService>,
    agent: Arc<dyn AgentExecutor>,
    prompts: Arc<dyn UnitPromptBuilder>,
    resolver: Arc<dyn ConflictResolver>,
    options: ExecutionOptions,
    run_id: String,
    cancel: CancelSignal,
    audit: Option<SharedAuditWriter>,
    metrics: RunMetricsCollector,
}

impl ParallelCoordinator {
    pub fn new(
        vcs: Arc<dyn VcsService>,
        agent: Arc<dyn AgentExecutor>,
        options: ExecutionOptions,
        run_id: impl Into<String>,
    ) -> Self {
        let run_id = run_id.into();
        Self {
            vcs,
            agent,
            prompts: Arc::new(DefaultPromptBuilder),
            resolver: Arc::new(ManualResolver),
            options,
            metrics: RunMetricsCollector::new(run_id.clone(), 0),
            run_id,
            cancel: CancelSignal::never(),
            audit: None,
        }
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn UnitPromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_audit(mut self, audit: SharedAuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_metrics(mut self, metrics: RunMetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn metrics(&self) -> &RunMetricsCollector {
        &self.metrics
    }

    /// Execute `units` and merge the branches of fully completed ones.
    #[instrument(skip_all, fields(run_id = %self.run_id, units = units.len()))]
    pub async fn run(
        &self,
        units: Vec<UnitOfWork>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> ExecutionSummary {
        let shared = Arc::new(Shared {
            vcs: Arc::clone(&self.vcs),
            agent: Arc::clone(&self.agent),
            prompts: Arc::clone(&self.prompts),
            analyzer: CompletionAnalyzer::new(Arc::clone(&self.vcs)),
            options: self.options.clone(),
            run_id: self.run_id.clone(),
            cancel: self.cancel.clone(),
            halted: AtomicBool::new(false),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
        });
        shared.metrics.add_expected_units(units.len());

        let semaphore = Arc::new(Semaphore::new(shared.options.max_concurrent.max(1)));
        let mut handles = Vec::with_capacity(units.len());

        for unit in &units {
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            let observer = Arc::clone(&observer);
            let unit = unit.clone();
            handles.push(tokio::spawn(async move {
                // Hold the permit for the whole unit.
                let _permit = semaphore.acquire_owned().await.ok();
                shared.run_unit(unit, observer.as_ref()).await
            }));
        }

        let joined = futures::future::join_all(handles).await;
        let mut outcomes = Vec::with_capacity(units.len());
        for (unit, joined) in units.iter().zip(joined) {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(owner_id = %unit.owner_id, error = %err, "unit task panicked");
                    let result =
                        UnitResult::all_failed(unit, format!("unit task panicked: {}", err));
                    observer.on_unit_complete(unit, &result).await;
                    outcomes.push(UnitOutcome {
                        result,
                        worktree: None,
                        queued: None,
                    });
                }
            }
        }

        // Barrier: no worktree may hold a branch while it is merged.
        for worktree in outcomes.iter().filter_map(|o| o.worktree.as_ref()) {
            if let Err(err) = shared.vcs.cleanup_worktree(&worktree.path).await {
                warn!(
                    path = %worktree.path.display(),
                    branch = %worktree.branch,
                    error = %err,
                    "failed to remove worktree"
                );
            }
        }

        let queue: Vec<QueuedBranch> = outcomes.iter().filter_map(|o| o.queued.clone()).collect();
        let merge = if shared.options.skip_merge {
            if !queue.is_empty() {
                info!(branches = queue.len(), "merge skipped, branches retained");
            }
            None
        } else {
            let engine = DeferredMergeEngine::new(Arc::clone(&shared.vcs), shared.options.merge);
            let summary = engine
                .merge_sequentially(&queue, &shared.options.base_branch, self.resolver.as_ref())
                .await;
            for result in &summary.results {
                shared.metrics.record_merge(result.success);
                if let Some(audit) = &shared.audit {
                    audit.lock().await.emit_merge(
                        result.owner_id.clone(),
                        result.branch.clone(),
                        result.success,
                        result.error.clone(),
                    );
                }
            }
            observer.on_merge_complete(&summary).await;
            Some(summary)
        };

        summarize(outcomes.into_iter().map(|o| o.result).collect(), merge)
    }
}

impl Shared {
    #[instrument(skip_all, fields(owner_id = %unit.owner_id, tasks = unit.tasks.len()))]
    async fn run_unit(&self, unit: UnitOfWork, observer: &dyn ExecutionObserver) -> UnitOutcome {
        let started = Instant::now();
        self.metrics.start_unit(unit.owner_id.clone());

        let (result, worktree, attempts) = if self.cancel.is_cancelled() {
            (UnitResult::all_failed(&unit, "not started: run cancelled"), None, 0)
        } else if self.halted.load(Ordering::SeqCst) {
            (
                UnitResult::all_failed(&unit, "not started: an earlier unit failed (fail-fast)"),
                None,
                0,
            )
        } else {
            let owner_ref = format!("{}-{}", self.run_id, unit.owner_id);
            match self
                .vcs
                .create_worktree(&owner_ref, &self.options.base_branch)
                .await
            {
                Ok(worktree) => {
                    let (result, attempts) =
                        self.execute_in_worktree(&unit, &worktree, observer).await;
                    (result, Some(worktree), attempts)
                }
                Err(err) => {
                    warn!(error = %err, "worktree creation failed, failing every task in the unit");
                    (
                        UnitResult::all_failed(&unit, format!("worktree creation failed: {}", err)),
                        None,
                        0,
                    )
                }
            }
        };

        if !result.success && self.options.fail_fast {
            self.halted.store(true, Ordering::SeqCst);
        }

        self.metrics.complete_unit(
            &unit.owner_id,
            result.success,
            attempts,
            started.elapsed(),
            result.input_tokens,
            result.output_tokens,
            result.error.clone(),
        );
        if let Some(audit) = &self.audit {
            audit.lock().await.emit_unit(
                unit.owner_id.clone(),
                result.branch_state().as_str(),
                &result.completed_task_ids,
                &result.failed_task_ids,
                result.error.clone(),
            );
            self.metrics.record_audit_unit(unit.owner_id.clone());
        }

        observer.on_unit_complete(&unit, &result).await;

        let queued = match (&result.branch_name, result.success) {
            (Some(branch), true) => Some(QueuedBranch::new(
                branch.clone(),
                unit.owner_id.clone(),
                unit.merge_message(),
            )),
            _ => None,
        };

        info!(
            completed = result.completed_task_ids.len(),
            failed = result.failed_task_ids.len(),
            queued = queued.is_some(),
            "unit finished"
        );
        UnitOutcome {
            result,
            worktree,
            queued,
        }
    }

    /// Prime, run the agent once through the retry runtime, then classify.
    async fn execute_in_worktree(
        &self,
        unit: &UnitOfWork,
        worktree: &Worktree,
        observer: &dyn ExecutionObserver,
    ) -> (UnitResult, u32) {
        if let Err(err) = observer.prime_worktree(unit, &worktree.path).await {
            warn!(error = %err, "failed to prime worktree, continuing without reference material");
        }

        let mut request = AgentRequest::new(self.prompts.build(unit), &worktree.path);
        request.model_override = self.options.model_override.clone();

        let input_tokens = AtomicU64::new(0);
        let output_tokens = AtomicU64::new(0);
        let outcome = execute_with_retry(&self.options.retry, &self.cancel, |attempt| {
            let request = request.clone();
            let (input_tokens, output_tokens) = (&input_tokens, &output_tokens);
            async move {
                debug!(attempt, "starting agent session");
                let response = self.agent.execute(request).await.map_err(|e| e.to_string())?;
                input_tokens.fetch_add(response.input_tokens, Ordering::Relaxed);
                output_tokens.fetch_add(response.output_tokens, Ordering::Relaxed);
                if response.success {
                    Ok(response)
                } else {
                    Err(response
                        .error
                        .unwrap_or_else(|| "agent reported failure".to_string()))
                }
            }
        })
        .await;

        let attempts = outcome.attempt_count();
        let agent_error = match outcome.into_result() {
            Ok(_) => None,
            Err(err) => {
                warn!(attempts, error = %err, "agent session failed, checking for partial progress");
                Some(err.to_string())
            }
        };

        let classification = self
            .analyzer
            .analyze(unit, &worktree.path, &self.options.base_branch)
            .await;
        let success = classification.is_complete();
        let error = agent_error.or_else(|| {
            (!success).then(|| {
                format!(
                    "{} of {} tasks have no matching commit",
                    classification.failed.len(),
                    unit.tasks.len()
                )
            })
        });

        let result = UnitResult {
            owner_id: unit.owner_id.clone(),
            completed_task_ids: classification.completed,
            failed_task_ids: classification.failed,
            input_tokens: input_tokens.load(Ordering::Relaxed),
            output_tokens: output_tokens.load(Ordering::Relaxed),
            success,
            branch_name: Some(worktree.branch.clone()),
            error,
        };
        (result, attempts)
    }
}

fn summarize(units: Vec<UnitResult>, merge: Option<MergeSummary>) -> ExecutionSummary {
    let branches = units
        .iter()
        .filter_map(|unit| {
            let mut status = unit.branch_status()?;
            if let Some(merge) = &merge {
                if let Some(result) = merge.results.iter().find(|r| r.branch == status.branch) {
                    status.merged = result.success;
                    if !result.success {
                        status.error = result.error.clone();
                    }
                }
            }
            Some(status)
        })
        .collect();

    ExecutionSummary {
        tasks_completed: units.iter().map(|u| u.completed_task_ids.len()).sum(),
        tasks_failed: units.iter().map(|u| u.failed_task_ids.len()).sum(),
        total_input_tokens: units.iter().map(|u| u.input_tokens).sum(),
        total_output_tokens: units.iter().map(|u| u.output_tokens).sum(),
        units,
        branches,
        merge,
    }
}
