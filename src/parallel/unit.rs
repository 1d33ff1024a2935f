//! Units of work and the records produced by executing and merging them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::grouping::OwnerGroup;
use crate::model::{Issue, Task};

/// Tasks executed together in one isolated worktree by one agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    /// Issue id for per-issue units, task id for per-task units.
    pub owner_id: String,
    pub title: String,
    pub issue: Option<Issue>,
    /// In the order the agent should commit them.
    pub tasks: Vec<Task>,
}

impl UnitOfWork {
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            owner_id: owner_id.into(),
            title: title.into(),
            issue: None,
            tasks,
        }
    }

    pub fn with_issue(mut self, issue: Issue) -> Self {
        self.issue = Some(issue);
        self
    }

    /// One unit covering every task of an issue.
    pub fn from_owner_group(group: OwnerGroup) -> Self {
        let title = group
            .issue
            .as_ref()
            .map(|issue| first_line(&issue.symptom))
            .filter(|symptom| !symptom.is_empty())
            .unwrap_or_else(|| format!("{} tasks", group.owner_id));
        Self {
            owner_id: group.owner_id,
            title,
            issue: group.issue,
            tasks: session_order(group.tasks),
        }
    }

    /// One unit for a single task, owned by the task itself.
    pub fn for_task(task: Task, issue: Option<Issue>) -> Self {
        Self {
            owner_id: task.id.clone(),
            title: task.title.clone(),
            issue,
            tasks: vec![task],
        }
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.id.clone()).collect()
    }

    /// Human-readable merge commit message derived from the owning issue.
    pub fn merge_message(&self) -> String {
        let summary = self
            .issue
            .as_ref()
            .map(|issue| first_line(&issue.symptom))
            .filter(|symptom| !symptom.is_empty())
            .unwrap_or_else(|| self.title.clone());
        let count = self.tasks.len();
        let noun = if count == 1 { "task" } else { "tasks" };
        format!("Fix {}: {} ({} {})", self.owner_id, summary, count, noun)
    }
}

/// Order tasks for one session: ascending parallel group, and inside a group
/// every task after the tasks it depends on. Otherwise input order is kept.
pub fn session_order(tasks: Vec<Task>) -> Vec<Task> {
    let mut pending: Vec<(usize, Task)> = tasks.into_iter().enumerate().collect();
    pending.sort_by_key(|(index, task)| (task.parallel_group, *index));
    let in_unit: HashSet<String> = pending.iter().map(|(_, t)| t.id.clone()).collect();

    let mut emitted: HashSet<String> = HashSet::with_capacity(pending.len());
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let next = pending
            .iter()
            .position(|(_, task)| {
                task.depends_on
                    .iter()
                    .all(|dep| !in_unit.contains(dep) || emitted.contains(dep))
            })
            // A cycle cannot be ordered; fall back to the remaining order.
            .unwrap_or(0);
        let (_, task) = pending.remove(next);
        emitted.insert(task.id.clone());
        ordered.push(task);
    }
    ordered
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

/// Classification of one unit after execution.
///
/// `completed_task_ids` and `failed_task_ids` are disjoint and together
/// cover every task of the unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitResult {
    pub owner_id: String,
    pub completed_task_ids: Vec<String>,
    pub failed_task_ids: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Every task completed.
    pub success: bool,
    pub branch_name: Option<String>,
    pub error: Option<String>,
}

impl UnitResult {
    /// Every task of `unit` failed, e.g. because no worktree could be made.
    pub fn all_failed(unit: &UnitOfWork, error: impl Into<String>) -> Self {
        Self {
            owner_id: unit.owner_id.clone(),
            failed_task_ids: unit.task_ids(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn total_count(&self) -> usize {
        self.completed_task_ids.len() + self.failed_task_ids.len()
    }

    pub fn branch_state(&self) -> BranchState {
        BranchState::from_counts(
            self.completed_task_ids.len(),
            self.failed_task_ids.len(),
            self.total_count(),
        )
    }

    /// Branch status before merging; `None` when no branch was created.
    pub fn branch_status(&self) -> Option<BranchStatus> {
        let branch = self.branch_name.clone()?;
        Some(BranchStatus {
            branch,
            owner_id: self.owner_id.clone(),
            status: self.branch_state(),
            completed_count: self.completed_task_ids.len(),
            failed_count: self.failed_task_ids.len(),
            total_count: self.total_count(),
            merged: false,
            error: self.error.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Complete,
    Partial,
    Failed,
}

impl BranchState {
    pub fn from_counts(completed: usize, failed: usize, total: usize) -> Self {
        if total > 0 && completed == total && failed == 0 {
            BranchState::Complete
        } else if completed > 0 {
            BranchState::Partial
        } else {
            BranchState::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchState::Complete => "complete",
            BranchState::Partial => "partial",
            BranchState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchStatus {
    pub branch: String,
    pub owner_id: String,
    pub status: BranchState,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub merged: bool,
    pub error: Option<String>,
}

/// Branch waiting for the deferred merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBranch {
    pub branch: String,
    pub owner_id: String,
    pub commit_message: String,
}

impl QueuedBranch {
    pub fn new(
        branch: impl Into<String>,
        owner_id: impl Into<String>,
        commit_message: impl Into<String>,
    ) -> Self {
        Self {
            branch: branch.into(),
            owner_id: owner_id.into(),
            commit_message: commit_message.into(),
        }
    }
}

/// Outcome of merging one queued branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeBranchResult {
    pub branch: String,
    pub owner_id: String,
    pub success: bool,
    pub error: Option<String>,
}

impl MergeBranchResult {
    pub fn merged(queued: &QueuedBranch) -> Self {
        Self {
            branch: queued.branch.clone(),
            owner_id: queued.owner_id.clone(),
            success: true,
            error: None,
        }
    }

    pub fn failed(queued: &QueuedBranch, error: impl Into<String>) -> Self {
        Self {
            branch: queued.branch.clone(),
            owner_id: queued.owner_id.clone(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    #[test]
    fn test_branch_state_from_counts() {
        assert_eq!(BranchState::from_counts(2, 0, 2), BranchState::Complete);
        assert_eq!(BranchState::from_counts(2, 1, 3), BranchState::Partial);
        assert_eq!(BranchState::from_counts(0, 3, 3), BranchState::Failed);
        assert_eq!(BranchState::from_counts(0, 0, 0), BranchState::Failed);
    }

    #[test]
    fn test_session_order_puts_dependencies_first() {
        let tasks = vec![
            Task::new("t2", "b").with_depends_on(["t1"]),
            Task::new("t3", "c").with_group(1),
            Task::new("t1", "a"),
            Task::new("t4", "d"),
        ];
        let ordered: Vec<String> = session_order(tasks).into_iter().map(|t| t.id).collect();
        assert_eq!(ordered, vec!["t1", "t2", "t4", "t3"]);
    }

    #[test]
    fn test_from_owner_group_orders_by_dependency() {
        let group = OwnerGroup {
            owner_id: "I1".to_string(),
            issue: None,
            tasks: vec![
                Task::new("t2", "b").with_issue("I1").with_depends_on(["t1"]),
                Task::new("t1", "a").with_issue("I1"),
            ],
        };
        let unit = UnitOfWork::from_owner_group(group);
        assert_eq!(unit.task_ids(), vec!["t1", "t2"]);
    }

    #[test]
    fn test_all_failed_covers_every_task() {
        let unit = UnitOfWork::new(
            "ISS-1",
            "title",
            vec![Task::new("t1", "a"), Task::new("t2", "b")],
        );
        let result = UnitResult::all_failed(&unit, "worktree creation failed");
        assert!(result.completed_task_ids.is_empty());
        assert_eq!(result.failed_task_ids, vec!["t1", "t2"]);
        assert!(!result.success);
        assert!(result.branch_status().is_none());
    }

    #[test]
    fn test_merge_message_uses_issue_symptom() {
        let issue = Issue::new("ISS-9", Severity::High)
            .with_symptom("Panic when config is empty\nstack trace follows");
        let unit =
            UnitOfWork::new("ISS-9", "ignored", vec![Task::new("t1", "a")]).with_issue(issue);
        assert_eq!(
            unit.merge_message(),
            "Fix ISS-9: Panic when config is empty (1 task)"
        );
    }

    #[test]
    fn test_from_owner_group_without_issue() {
        let group = OwnerGroup {
            owner_id: "UNASSIGNED".into(),
            issue: None,
            tasks: vec![Task::new("t1", "a"), Task::new("t2", "b")],
        };
        let unit = UnitOfWork::from_owner_group(group);
        assert_eq!(unit.title, "UNASSIGNED tasks");
        assert_eq!(unit.merge_message(), "Fix UNASSIGNED: UNASSIGNED tasks (2 tasks)");
    }
}
