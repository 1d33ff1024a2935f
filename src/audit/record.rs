use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current audit schema version.
pub const AUDIT_SCHEMA_VERSION: u32 = 1;

/// Lifecycle event kinds recorded for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunStart,
    Phase,
    Unit,
    Merge,
    RunComplete,
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: u32,
    pub run_id: String,
    /// RFC 3339 with millisecond precision.
    pub timestamp: String,
    pub event_type: AuditEventType,
    /// `run`, a phase name, an owner id or a branch name.
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_task_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AuditRecord {
    pub fn new(
        event_type: AuditEventType,
        run_id: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: AUDIT_SCHEMA_VERSION,
            run_id: run_id.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event_type,
            subject: subject.into(),
            status: None,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            branch: None,
            error_message: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = error;
        self
    }
}

/// Manifest kept next to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record_count: u64,
}

impl AuditRunManifest {
    pub fn new(run_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: AUDIT_SCHEMA_VERSION,
            run_id: run_id.into(),
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
        }
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = timestamp;
        self.record_count = self.record_count.saturating_add(1);
    }
}
