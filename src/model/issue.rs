//! Issues discovered by the scan phase.

use serde::{Deserialize, Serialize};

use super::task::Task;

/// Issue severity. Ordering across issue groups uses [`Severity::rank`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Severity {
    /// Sort rank: critical=0 through low=3, anything else 4.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Unknown => 4,
        }
    }
}

/// Issue lifecycle status as recorded by the state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    Validated,
    Rejected,
    Planned,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub symptom: String,
    #[serde(default)]
    pub related_task_ids: Vec<String>,
}

impl Issue {
    pub fn new(id: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            severity,
            status: IssueStatus::Open,
            symptom: String::new(),
            related_task_ids: Vec::new(),
        }
    }

    pub fn with_symptom(mut self, symptom: impl Into<String>) -> Self {
        self.symptom = symptom.into();
        self
    }
}

/// An issue paired with the tasks that fix it.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueGroup {
    pub issue: Issue,
    pub tasks: Vec<Task>,
}
