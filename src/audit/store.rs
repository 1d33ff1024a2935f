use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;

use super::record::{AuditRecord, AuditRunManifest};

const AUDIT_DIR_NAME: &str = "audit";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid run ID")]
    InvalidRunId,
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Append-only audit log under `<state_dir>/audit/<run_id>/`.
#[derive(Debug, Clone)]
pub struct AuditStore {
    root_dir: PathBuf,
}

impl AuditStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> AuditResult<Self> {
        let root_dir = state_dir.into().join(AUDIT_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root_dir.join(run_id)
    }

    /// Append one record and bump the run manifest.
    pub fn append(&self, record: &AuditRecord) -> AuditResult<()> {
        if record.run_id.trim().is_empty() {
            return Err(AuditError::InvalidRunId);
        }

        let run_dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&run_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        file.sync_all()?;

        let now = Utc::now();
        let mut manifest = self
            .read_manifest(&record.run_id)?
            .unwrap_or_else(|| AuditRunManifest::new(record.run_id.clone(), now));
        manifest.record(now);
        self.write_manifest(&run_dir, &manifest)
    }

    /// All records of a run in append order. Missing runs yield nothing.
    pub fn read_events(&self, run_id: &str) -> AuditResult<Vec<AuditRecord>> {
        let path = self.run_dir(run_id).join(EVENTS_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }

    pub fn read_manifest(&self, run_id: &str) -> AuditResult<Option<AuditRunManifest>> {
        match fs::read_to_string(self.run_dir(run_id).join(MANIFEST_FILE_NAME)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_manifest(&self, run_dir: &Path, manifest: &AuditRunManifest) -> AuditResult<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        let temp_path = run_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, run_dir.join(MANIFEST_FILE_NAME))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::AuditEventType;
    use tempfile::TempDir;

    #[test]
    fn test_append_writes_events_and_manifest() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = AuditStore::new(temp_dir.path()).expect("store");

        store
            .append(&AuditRecord::new(AuditEventType::RunStart, "run-1", "run"))
            .expect("append");
        store
            .append(
                &AuditRecord::new(AuditEventType::Unit, "run-1", "ISS-1").with_status("complete"),
            )
            .expect("append");

        let events = store.read_events("run-1").expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status.as_deref(), Some("complete"));

        let manifest = store.read_manifest("run-1").expect("read").expect("manifest");
        assert_eq!(manifest.record_count, 2);
        assert!(!store.run_dir("run-1").join("run.json.tmp").exists());
    }

    #[test]
    fn test_blank_run_id_is_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = AuditStore::new(temp_dir.path()).expect("store");
        let err = store
            .append(&AuditRecord::new(AuditEventType::RunStart, "  ", "run"))
            .unwrap_err();
        assert!(matches!(err, AuditError::InvalidRunId));
    }

    #[test]
    fn test_missing_run_has_no_events() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = AuditStore::new(temp_dir.path()).expect("store");
        assert!(store.read_events("run-none").expect("events").is_empty());
        assert!(store.read_manifest("run-none").expect("manifest").is_none());
    }
}
