//! Records shared between the core and the external state store.
//!
//! The core only reads these and returns classification deltas; persistence
//! belongs to the [`crate::pipeline::store`] adapters or the caller.

pub mod issue;
pub mod run;
pub mod task;

pub use issue::{Issue, IssueGroup, IssueStatus, Severity};
pub use run::{generate_run_id, PipelinePhase, RunMeta, RunPhase};
pub use task::{ready_tasks, status_index, Task, TaskStatus};
