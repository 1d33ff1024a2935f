//! Task records and readiness rules.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// `MergeError` means the agent session produced the work but the resulting
/// branch could not be merged. It is re-runnable and is treated exactly like
/// `Pending` by the readiness check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
    MergeError,
}

impl TaskStatus {
    /// Whether a task in this status may be (re)queued for execution.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::MergeError)
    }

    /// Whether the task has reached a state that closes its parallel group.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::MergeError => "merge_error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of planned change, owned by the external task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub parallel_group: i64,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl Task {
    /// Create a pending task with no dependencies in parallel group 0.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            files: Vec::new(),
            depends_on: Vec::new(),
            checks: Vec::new(),
            acceptance_criteria: Vec::new(),
            parallel_group: 0,
            status: TaskStatus::Pending,
            issue_id: None,
            error: None,
            branch: None,
        }
    }

    pub fn with_issue(mut self, issue_id: impl Into<String>) -> Self {
        self.issue_id = Some(issue_id.into());
        self
    }

    pub fn with_group(mut self, group: i64) -> Self {
        self.parallel_group = group;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Whether every dependency resolves to a task with status `done`.
    ///
    /// Unknown dependency ids are never satisfied.
    pub fn dependencies_satisfied(&self, statuses: &HashMap<String, TaskStatus>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| statuses.get(dep) == Some(&TaskStatus::Done))
    }

    /// Whether the task may start now: runnable status and all deps done.
    pub fn is_ready(&self, statuses: &HashMap<String, TaskStatus>) -> bool {
        self.status.is_runnable() && self.dependencies_satisfied(statuses)
    }
}

/// Build a status lookup keyed by task id.
pub fn status_index(tasks: &[Task]) -> HashMap<String, TaskStatus> {
    tasks.iter().map(|t| (t.id.clone(), t.status)).collect()
}

/// Return the tasks that are ready to run, preserving input order.
pub fn ready_tasks(tasks: &[Task]) -> Vec<&Task> {
    let statuses = status_index(tasks);
    tasks.iter().filter(|t| t.is_ready(&statuses)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_all_dependencies_done() {
        let tasks = vec![
            Task::new("T1", "first").with_status(TaskStatus::Done),
            Task::new("T2", "second").with_status(TaskStatus::Running),
            Task::new("T3", "third").with_depends_on(["T1"]),
            Task::new("T4", "fourth").with_depends_on(["T1", "T2"]),
        ];

        let ready: Vec<_> = ready_tasks(&tasks).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ready, vec!["T3".to_string()]);
    }

    #[test]
    fn test_merge_error_is_requeued_like_pending() {
        let statuses = HashMap::from([("T0".to_string(), TaskStatus::Done)]);
        let pending = Task::new("T1", "a").with_depends_on(["T0"]);
        let merge_error = pending.clone().with_status(TaskStatus::MergeError);

        assert_eq!(pending.is_ready(&statuses), merge_error.is_ready(&statuses));
        assert!(merge_error.is_ready(&statuses));
    }

    #[test]
    fn test_unknown_dependency_is_never_satisfied() {
        let statuses = HashMap::new();
        let task = Task::new("T1", "a").with_depends_on(["missing"]);
        assert!(!task.is_ready(&statuses));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::MergeError.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::MergeError).unwrap();
        assert_eq!(json, "\"merge_error\"");
    }
}
