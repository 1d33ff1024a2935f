use std::path::{Path, PathBuf};

use tracing::warn;

use super::record::{AuditEventType, AuditRecord};
use super::store::{AuditResult, AuditStore};

/// Records run lifecycle events to durable storage.
///
/// Write failures are logged and swallowed; auditing never fails a run.
pub struct AuditWriter {
    run_id: String,
    store: AuditStore,
}

impl AuditWriter {
    pub fn try_new(state_dir: &Path, run_id: impl Into<String>) -> AuditResult<Self> {
        Ok(Self {
            run_id: run_id.into(),
            store: AuditStore::new(state_dir)?,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> PathBuf {
        self.store.run_dir(&self.run_id)
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    pub fn emit_run_start(&mut self) {
        let record = AuditRecord::new(AuditEventType::RunStart, self.run_id.clone(), "run");
        self.write(record);
    }

    pub fn emit_phase(
        &mut self,
        phase: impl Into<String>,
        status: impl Into<String>,
        error: Option<String>,
    ) {
        let record = AuditRecord::new(AuditEventType::Phase, self.run_id.clone(), phase)
            .with_status(status)
            .with_error(error);
        self.write(record);
    }

    pub fn emit_unit(
        &mut self,
        owner_id: impl Into<String>,
        status: impl Into<String>,
        completed: &[String],
        failed: &[String],
        error: Option<String>,
    ) {
        let mut record = AuditRecord::new(AuditEventType::Unit, self.run_id.clone(), owner_id)
            .with_status(status)
            .with_error(error);
        record.completed_task_ids = completed.to_vec();
        record.failed_task_ids = failed.to_vec();
        self.write(record);
    }

    pub fn emit_merge(
        &mut self,
        owner_id: impl Into<String>,
        branch: impl Into<String>,
        merged: bool,
        error: Option<String>,
    ) {
        let mut record = AuditRecord::new(AuditEventType::Merge, self.run_id.clone(), owner_id)
            .with_status(if merged { "merged" } else { "failed" })
            .with_error(error);
        record.branch = Some(branch.into());
        self.write(record);
    }

    pub fn emit_run_complete(&mut self, status: impl Into<String>, error: Option<String>) {
        let record = AuditRecord::new(AuditEventType::RunComplete, self.run_id.clone(), "run")
            .with_status(status)
            .with_error(error);
        self.write(record);
    }

    fn write(&mut self, record: AuditRecord) {
        if let Err(err) = self.store.append(&record) {
            warn!(
                run_id = %self.run_id,
                dir = %self.store.root_dir().display(),
                error = %err,
                "failed to write audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_records_lifecycle_in_order() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut writer = AuditWriter::try_new(temp_dir.path(), "run-7").expect("writer");

        writer.emit_run_start();
        writer.emit_unit(
            "ISS-1",
            "partial",
            &["t1".to_string()],
            &["t2".to_string()],
            Some("1 of 2 tasks have no commit".into()),
        );
        writer.emit_merge("ISS-2", "patchwright/run-7-ISS-2", true, None);
        writer.emit_run_complete("completed", None);

        let events = writer.store().read_events("run-7").expect("events");
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventType::RunStart,
                AuditEventType::Unit,
                AuditEventType::Merge,
                AuditEventType::RunComplete
            ]
        );
        assert_eq!(events[1].failed_task_ids, vec!["t2"]);
        assert_eq!(events[2].branch.as_deref(), Some("patchwright/run-7-ISS-2"));
        assert_eq!(events[2].status.as_deref(), Some("merged"));
        assert!(writer.run_dir().join("run.json").exists());
    }
}
