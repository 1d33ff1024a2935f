//! Dependency-ordered group scheduler.
//!
//! Parallel groups are coarse dependency tiers: group *g+1* starts only after
//! every task in group *g* is terminal. Inside the current group a task is
//! ready once all of its `depends_on` tasks are `done`. The scheduler holds
//! an in-memory view of task statuses; callers feed outcomes back with
//! [`GroupScheduler::update`] and persist them on their own.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::model::{status_index, Task, TaskStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("dependency cycle between tasks: {}", task_ids.join(", "))]
    Cycle { task_ids: Vec<String> },

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("task {task_id} (group {group}) depends on {dependency} in later group {dependency_group}")]
    GroupOrder {
        task_id: String,
        group: i64,
        dependency: String,
        dependency_group: i64,
    },
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Why a task can never become ready in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// A dependency ended `failed` or `skipped`.
    FailedDependency(String),
    /// A dependency id matches no known task.
    UnknownDependency(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::FailedDependency(dep) => write!(f, "dependency {} did not complete", dep),
            BlockReason::UnknownDependency(dep) => write!(f, "unknown dependency {}", dep),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub task_id: String,
    pub reason: BlockReason,
}

/// Work the scheduler can hand out right now.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleBatch {
    /// Group the batch belongs to, or `None` when every group is complete.
    pub group: Option<i64>,
    pub ready: Vec<Task>,
    pub blocked: Vec<BlockedTask>,
}

impl ScheduleBatch {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

#[derive(Debug)]
pub struct GroupScheduler {
    tasks: Vec<Task>,
    positions: HashMap<String, usize>,
    /// Tasks handed out in this run; never handed out twice.
    attempted: HashSet<String>,
}

impl GroupScheduler {
    /// Validate the dependency graph and build a scheduler.
    ///
    /// Rejects duplicate ids, dependency cycles, and dependencies on tasks in
    /// a later parallel group (those could never be satisfied).
    pub fn new(tasks: Vec<Task>) -> ScheduleResult<Self> {
        let mut positions = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if positions.insert(task.id.clone(), i).is_some() {
                return Err(ScheduleError::DuplicateTask(task.id.clone()));
            }
        }

        check_cycles(&tasks, &positions)?;

        for task in &tasks {
            for dep in &task.depends_on {
                if let Some(&pos) = positions.get(dep) {
                    let dependency_group = tasks[pos].parallel_group;
                    if dependency_group > task.parallel_group {
                        return Err(ScheduleError::GroupOrder {
                            task_id: task.id.clone(),
                            group: task.parallel_group,
                            dependency: dep.clone(),
                            dependency_group,
                        });
                    }
                }
            }
        }

        Ok(Self {
            tasks,
            positions,
            attempted: HashSet::new(),
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.positions.get(task_id).map(|&i| self.tasks[i].status)
    }

    /// Record a new status for a task. Unknown ids are ignored.
    pub fn update(&mut self, task_id: &str, status: TaskStatus) {
        if let Some(&i) = self.positions.get(task_id) {
            self.tasks[i].status = status;
        }
    }

    /// Group indexes in ascending order, with whether each is complete.
    pub fn group_states(&self) -> Vec<(i64, bool)> {
        let mut groups: BTreeMap<i64, bool> = BTreeMap::new();
        for task in &self.tasks {
            let complete = groups.entry(task.parallel_group).or_insert(true);
            *complete &= task.status.is_terminal();
        }
        groups.into_iter().collect()
    }

    /// First group that still has non-terminal tasks.
    pub fn current_group(&self) -> Option<i64> {
        self.group_states()
            .into_iter()
            .find(|(_, complete)| !complete)
            .map(|(index, _)| index)
    }

    pub fn is_finished(&self) -> bool {
        self.current_group().is_none()
    }

    /// Ready tasks of the current group, excluding anything already handed
    /// out. Returned tasks are marked attempted.
    pub fn next_batch(&mut self) -> ScheduleBatch {
        let Some(group) = self.current_group() else {
            return ScheduleBatch::default();
        };

        let statuses = status_index(&self.tasks);

        let mut batch = ScheduleBatch {
            group: Some(group),
            ..ScheduleBatch::default()
        };
        for task in self.tasks.iter().filter(|t| t.parallel_group == group) {
            if !task.status.is_runnable() || self.attempted.contains(&task.id) {
                continue;
            }
            if let Some(reason) = block_reason(task, &statuses) {
                batch.blocked.push(BlockedTask {
                    task_id: task.id.clone(),
                    reason,
                });
            } else if task.dependencies_satisfied(&statuses) {
                batch.ready.push(task.clone());
            }
        }

        for task in &batch.ready {
            self.attempted.insert(task.id.clone());
        }
        batch
    }

    /// Mark blocked tasks of the current group `skipped` so the group can
    /// close. Returns what was skipped.
    pub fn skip_blocked(&mut self) -> Vec<BlockedTask> {
        let blocked = self.blocked_in_current_group();
        for entry in &blocked {
            self.update(&entry.task_id, TaskStatus::Skipped);
        }
        blocked
    }

    fn blocked_in_current_group(&self) -> Vec<BlockedTask> {
        let Some(group) = self.current_group() else {
            return Vec::new();
        };
        let statuses = status_index(&self.tasks);
        self.tasks
            .iter()
            .filter(|t| t.parallel_group == group && t.status.is_runnable())
            .filter_map(|task| {
                block_reason(task, &statuses).map(|reason| BlockedTask {
                    task_id: task.id.clone(),
                    reason,
                })
            })
            .collect()
    }
}

fn block_reason(task: &Task, statuses: &HashMap<String, TaskStatus>) -> Option<BlockReason> {
    task.depends_on.iter().find_map(|dep| match statuses.get(dep) {
        None => Some(BlockReason::UnknownDependency(dep.clone())),
        Some(TaskStatus::Failed | TaskStatus::Skipped) => {
            Some(BlockReason::FailedDependency(dep.clone()))
        }
        Some(_) => None,
    })
}

fn check_cycles(tasks: &[Task], positions: &HashMap<String, usize>) -> ScheduleResult<()> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(tasks.len(), 0);
    let nodes: Vec<NodeIndex> = (0..tasks.len()).map(|i| graph.add_node(i)).collect();

    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            if let Some(&d) = positions.get(dep) {
                graph.add_edge(nodes[d], nodes[i], ());
            }
        }
    }

    for component in tarjan_scc(&graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if is_cycle {
            let mut task_ids: Vec<String> = component
                .iter()
                .map(|&n| tasks[graph[n]].id.clone())
                .collect();
            task_ids.sort();
            return Err(ScheduleError::Cycle { task_ids });
        }
    }
    Ok(())
}
