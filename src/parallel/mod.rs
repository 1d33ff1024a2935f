//! Issue-grouped parallel execution and deferred merging.
//!
//! Tasks are grouped into units of work ([`grouping`], [`unit`]), executed
//! concurrently in isolated worktrees ([`coordinator`]), classified from
//! their commit history ([`analyzer`]) and merged back one branch at a time
//! ([`merge`]).

pub mod analyzer;
pub mod coordinator;
pub mod grouping;
pub mod merge;
pub mod prompt;
pub mod resolver;
pub mod schedule;
pub mod unit;

pub use analyzer::{classify_commits, Classification, CompletionAnalyzer};
pub use coordinator::{
    ExecutionObserver, ExecutionOptions, ExecutionSummary, NoopObserver, ParallelCoordinator,
};
pub use grouping::{
    extract_parallel_groups, group_by_owner, OwnerGroup, ParallelGroup, UNASSIGNED_OWNER,
};
pub use merge::{DeferredMergeEngine, MergeOptions, MergeSummary, MISSING_BRANCH_ERROR};
pub use prompt::{
    conflict_resolution_prompt, task_commit_subject, DefaultPromptBuilder, UnitPromptBuilder,
};
pub use resolver::{
    AgentConflictResolver, ConflictRequest, ConflictResolver, ConflictStage, ManualResolver,
    ResolutionError,
};
pub use schedule::{
    BlockReason, BlockedTask, GroupScheduler, ScheduleBatch, ScheduleError, ScheduleResult,
};
pub use unit::{
    session_order, BranchState, BranchStatus, MergeBranchResult, QueuedBranch, UnitOfWork,
    UnitResult,
};
