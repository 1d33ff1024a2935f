//! Partition tasks into owner groups and parallel groups.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::model::{Issue, Severity, Task};

/// Owner bucket for tasks that are not attached to any issue.
pub const UNASSIGNED_OWNER: &str = "UNASSIGNED";

/// Tasks sharing one owner (an issue, or the unassigned bucket).
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerGroup {
    pub owner_id: String,
    /// `None` for the unassigned bucket.
    pub issue: Option<Issue>,
    pub tasks: Vec<Task>,
}

impl OwnerGroup {
    pub fn severity(&self) -> Severity {
        self.issue
            .as_ref()
            .map(|issue| issue.severity)
            .unwrap_or(Severity::Unknown)
    }
}

/// Group tasks by owning issue.
///
/// Tasks that reference an issue missing from `issues` are dropped with a
/// warning. Groups are ordered by severity rank, then owner id. Task order
/// inside a group follows input order.
pub fn group_by_owner(tasks: &[Task], issues: &[Issue]) -> Vec<OwnerGroup> {
    let issues_by_id: HashMap<&str, &Issue> =
        issues.iter().map(|issue| (issue.id.as_str(), issue)).collect();
    let mut buckets: BTreeMap<String, OwnerGroup> = BTreeMap::new();

    for task in tasks {
        let (owner_id, issue) = match task.issue_id.as_deref() {
            None => (UNASSIGNED_OWNER.to_string(), None),
            Some(issue_id) => match issues_by_id.get(issue_id) {
                Some(issue) => (issue_id.to_string(), Some((*issue).clone())),
                None => {
                    warn!(
                        task_id = %task.id,
                        issue_id,
                        "task references unknown issue, excluding it from this run"
                    );
                    continue;
                }
            },
        };

        buckets
            .entry(owner_id.clone())
            .or_insert_with(|| OwnerGroup {
                owner_id,
                issue,
                tasks: Vec::new(),
            })
            .tasks
            .push(task.clone());
    }

    let mut groups: Vec<OwnerGroup> = buckets.into_values().collect();
    groups.sort_by(|a, b| {
        a.severity()
            .rank()
            .cmp(&b.severity().rank())
            .then_with(|| a.owner_id.cmp(&b.owner_id))
    });
    groups
}

/// Tasks sharing one `parallel_group` value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelGroup {
    pub index: i64,
    pub tasks: Vec<Task>,
}

impl ParallelGroup {
    /// Every task is done, failed or skipped.
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|task| task.status.is_terminal())
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.id.clone()).collect()
    }
}

/// Bucket tasks by `parallel_group`, ascending.
pub fn extract_parallel_groups(tasks: &[Task]) -> Vec<ParallelGroup> {
    let mut buckets: BTreeMap<i64, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        buckets
            .entry(task.parallel_group)
            .or_default()
            .push(task.clone());
    }
    buckets
        .into_iter()
        .map(|(index, tasks)| ParallelGroup { index, tasks })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    fn issue(id: &str, severity: Severity) -> Issue {
        Issue::new(id, severity)
    }

    // ============================================================================
    // Owner grouping
    // ============================================================================

    #[test]
    fn test_groups_sorted_by_severity_then_id() {
        let issues = vec![
            issue("ISS-3", Severity::Low),
            issue("ISS-2", Severity::Critical),
            issue("ISS-1", Severity::Critical),
            issue("ISS-4", Severity::High),
        ];
        let tasks = vec![
            Task::new("t1", "a").with_issue("ISS-3"),
            Task::new("t2", "b").with_issue("ISS-2"),
            Task::new("t3", "c").with_issue("ISS-1"),
            Task::new("t4", "d").with_issue("ISS-4"),
            Task::new("t5", "e"),
        ];

        let groups = group_by_owner(&tasks, &issues);
        let owners: Vec<&str> = groups.iter().map(|g| g.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["ISS-1", "ISS-2", "ISS-4", "ISS-3", UNASSIGNED_OWNER]);
        assert!(groups[4].issue.is_none());
    }

    #[test]
    fn test_unknown_issue_tasks_are_dropped() {
        let issues = vec![issue("ISS-1", Severity::Medium)];
        let tasks = vec![
            Task::new("t1", "a").with_issue("ISS-1"),
            Task::new("t2", "b").with_issue("ISS-404"),
        ];

        let groups = group_by_owner(&tasks, &issues);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tasks.len(), 1);
        assert_eq!(groups[0].tasks[0].id, "t1");
    }

    #[test]
    fn test_task_order_within_group_is_preserved() {
        let issues = vec![issue("ISS-1", Severity::High)];
        let tasks = vec![
            Task::new("t2", "second").with_issue("ISS-1"),
            Task::new("t1", "first").with_issue("ISS-1"),
        ];
        let groups = group_by_owner(&tasks, &issues);
        assert_eq!(groups[0].tasks[0].id, "t2");
        assert_eq!(groups[0].tasks[1].id, "t1");
    }

    // ============================================================================
    // Parallel groups
    // ============================================================================

    #[test]
    fn test_parallel_groups_ascending() {
        let tasks = vec![
            Task::new("a", "a").with_group(2),
            Task::new("b", "b").with_group(0),
            Task::new("c", "c").with_group(2),
            Task::new("d", "d").with_group(-1),
        ];
        let groups = extract_parallel_groups(&tasks);
        let indexes: Vec<i64> = groups.iter().map(|g| g.index).collect();
        assert_eq!(indexes, vec![-1, 0, 2]);
        assert_eq!(groups[2].task_ids(), vec!["a", "c"]);
    }

    #[test]
    fn test_group_completion() {
        let group = ParallelGroup {
            index: 0,
            tasks: vec![
                Task::new("a", "a").with_status(TaskStatus::Done),
                Task::new("b", "b").with_status(TaskStatus::Skipped),
                Task::new("c", "c").with_status(TaskStatus::Failed),
            ],
        };
        assert!(group.is_complete());

        let pending = ParallelGroup {
            index: 1,
            tasks: vec![
                Task::new("a", "a").with_status(TaskStatus::Done),
                Task::new("b", "b").with_status(TaskStatus::MergeError),
            ],
        };
        assert!(!pending.is_complete());
    }
}
