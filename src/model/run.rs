//! Run progress records.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the six executable pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Scan,
    Validate,
    Plan,
    Consolidate,
    Exec,
    Verify,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Scan => "scan",
            PipelinePhase::Validate => "validate",
            PipelinePhase::Plan => "plan",
            PipelinePhase::Consolidate => "consolidate",
            PipelinePhase::Exec => "exec",
            PipelinePhase::Verify => "verify",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelinePhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scan" => Ok(PipelinePhase::Scan),
            "validate" => Ok(PipelinePhase::Validate),
            "plan" => Ok(PipelinePhase::Plan),
            "consolidate" => Ok(PipelinePhase::Consolidate),
            "exec" => Ok(PipelinePhase::Exec),
            "verify" => Ok(PipelinePhase::Verify),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// Recorded position of a run: a pipeline phase or a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Scan,
    Validate,
    Plan,
    Consolidate,
    Exec,
    Verify,
    Completed,
    Failed,
}

impl From<PipelinePhase> for RunPhase {
    fn from(phase: PipelinePhase) -> Self {
        match phase {
            PipelinePhase::Scan => RunPhase::Scan,
            PipelinePhase::Validate => RunPhase::Validate,
            PipelinePhase::Plan => RunPhase::Plan,
            PipelinePhase::Consolidate => RunPhase::Consolidate,
            PipelinePhase::Exec => RunPhase::Exec,
            PipelinePhase::Verify => RunPhase::Verify,
        }
    }
}

impl RunPhase {
    /// The pipeline phase this record points at, if it is not terminal.
    pub fn as_pipeline_phase(&self) -> Option<PipelinePhase> {
        match self {
            RunPhase::Scan => Some(PipelinePhase::Scan),
            RunPhase::Validate => Some(PipelinePhase::Validate),
            RunPhase::Plan => Some(PipelinePhase::Plan),
            RunPhase::Consolidate => Some(PipelinePhase::Consolidate),
            RunPhase::Exec => Some(PipelinePhase::Exec),
            RunPhase::Verify => Some(PipelinePhase::Verify),
            RunPhase::Completed | RunPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }
}

/// Progress record for a single pipeline run.
///
/// `phase` holds the next phase to execute; it advances as phases complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: String,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub issues_found: u32,
    #[serde(default)]
    pub issues_validated: u32,
    #[serde(default)]
    pub tasks_total: u32,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
    /// Phase that moved the run to `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<PipelinePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunMeta {
    /// Create a run positioned at the scan phase.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            phase: RunPhase::Scan,
            created_at: now,
            updated_at: now,
            issues_found: 0,
            issues_validated: 0,
            tasks_total: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            failed_phase: None,
            last_error: None,
        }
    }

    /// Pipeline phase the run should resume from, if any.
    ///
    /// A failed run resumes at the phase that failed; a completed run has
    /// nothing left to resume.
    pub fn resume_phase(&self) -> Option<PipelinePhase> {
        match self.phase {
            RunPhase::Failed => Some(self.failed_phase.unwrap_or(PipelinePhase::Scan)),
            RunPhase::Completed => None,
            other => other.as_pipeline_phase(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate a run id from the current time and process id.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run-{}-{}", timestamp_ms, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_starts_at_scan() {
        let meta = RunMeta::new("run-1");
        assert_eq!(meta.phase, RunPhase::Scan);
        assert_eq!(meta.resume_phase(), Some(PipelinePhase::Scan));
    }

    #[test]
    fn test_failed_run_resumes_at_failed_phase() {
        let mut meta = RunMeta::new("run-1");
        meta.phase = RunPhase::Failed;
        meta.failed_phase = Some(PipelinePhase::Exec);
        assert_eq!(meta.resume_phase(), Some(PipelinePhase::Exec));
    }

    #[test]
    fn test_completed_run_has_no_resume_phase() {
        let mut meta = RunMeta::new("run-1");
        meta.phase = RunPhase::Completed;
        assert_eq!(meta.resume_phase(), None);
    }

    #[test]
    fn test_phase_parse_round_trip() {
        assert_eq!("Exec".parse::<PipelinePhase>(), Ok(PipelinePhase::Exec));
        assert!("deploy".parse::<PipelinePhase>().is_err());
    }

    #[test]
    fn test_generate_run_id_prefix() {
        assert!(generate_run_id().starts_with("run-"));
    }
}
