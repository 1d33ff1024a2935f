//! Pipeline phase orchestrator.
//!
//! Sequences the six phases over one run record, re-pinning that run as
//! current before every phase, skipping phases the run has already passed,
//! and aggregating what each phase reports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::phase::{next_phase, phase_slice, should_skip};
use super::store::RunStore;
use crate::audit::SharedAuditWriter;
use crate::cancel::CancelSignal;
use crate::error::{PipelineError, PipelineResult};
use crate::model::{generate_run_id, PipelinePhase, RunMeta, RunPhase};

/// What a phase handler gets besides the run record.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: String,
    pub cancel: CancelSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub summary: String,
    /// Commands a human can run to recover from partial failure.
    pub remediation: Vec<String>,
    pub error: Option<String>,
}

impl PhaseOutcome {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_remediation(mut self, remediation: Vec<String>) -> Self {
        self.remediation = remediation;
        self
    }
}

/// Executes one pipeline phase.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    fn phase(&self) -> PipelinePhase;

    /// Run the phase. Handlers may update the run's counters; the
    /// orchestrator owns `phase`, `failed_phase` and `last_error`.
    async fn run(&self, ctx: &PhaseContext, run: &mut RunMeta) -> PipelineResult<PhaseOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: PipelinePhase,
    pub status: PhaseStatus,
    pub duration: Duration,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub summary: String,
    pub remediation: Vec<String>,
    pub error: Option<String>,
}

impl PhaseReport {
    fn skipped(phase: PipelinePhase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            duration: Duration::ZERO,
            input_tokens: 0,
            output_tokens: 0,
            summary: String::new(),
            remediation: Vec::new(),
            error: None,
        }
    }

    fn from_outcome(phase: PipelinePhase, outcome: PhaseOutcome, duration: Duration) -> Self {
        Self {
            phase,
            status: if outcome.success {
                PhaseStatus::Completed
            } else {
                PhaseStatus::Failed
            },
            duration,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            summary: outcome.summary,
            remediation: outcome.remediation,
            error: outcome.error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub start: Option<PipelinePhase>,
    pub end: Option<PipelinePhase>,
    /// Stop at the first failed phase.
    pub fail_fast: bool,
    /// Skip phases the run has already passed.
    pub skip_completed: bool,
    /// Run every phase in the slice regardless of recorded progress.
    pub force: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            fail_fast: true,
            skip_completed: true,
            force: false,
        }
    }
}

impl PipelineOptions {
    pub fn only(phase: PipelinePhase) -> Self {
        Self {
            start: Some(phase),
            end: Some(phase),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub phases: Vec<PhaseReport>,
    /// Phase at which this invocation stopped early.
    pub stopped_at: Option<PipelinePhase>,
    pub cancelled: bool,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        !self.cancelled && self.failed_phases().is_empty()
    }

    pub fn failed_phases(&self) -> Vec<PipelinePhase> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Failed)
            .map(|p| p.phase)
            .collect()
    }

    pub fn executed_phases(&self) -> Vec<PipelinePhase> {
        self.phases
            .iter()
            .filter(|p| p.status != PhaseStatus::Skipped)
            .map(|p| p.phase)
            .collect()
    }
}

pub struct PipelineOrchestrator {
    runs: Arc<dyn RunStore>,
    handlers: BTreeMap<PipelinePhase, Arc<dyn PhaseHandler>>,
    cancel: CancelSignal,
    audit: Option<SharedAuditWriter>,
}

impl PipelineOrchestrator {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self {
            runs,
            handlers: BTreeMap::new(),
            cancel: CancelSignal::never(),
            audit: None,
        }
    }

    /// Register a handler for the phase it reports. Later registrations win.
    pub fn with_handler(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        self.handlers.insert(handler.phase(), handler);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_audit(mut self, audit: SharedAuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Create, persist and pin a fresh run.
    pub fn start_run(&self) -> PipelineResult<RunMeta> {
        let run = RunMeta::new(generate_run_id());
        self.runs.save(&run)?;
        self.runs.set_current(&run.id)?;
        info!(run_id = %run.id, "started run");
        Ok(run)
    }

    /// Load `run_id`, or the current run when none is given.
    pub fn load_run(&self, run_id: Option<&str>) -> PipelineResult<RunMeta> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self.runs.current()?.ok_or(PipelineError::NoCurrentRun)?,
        };
        self.runs
            .load(&run_id)?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    /// Run the phase slice selected by `options` against `run`.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub async fn run(
        &self,
        run: &mut RunMeta,
        options: &PipelineOptions,
    ) -> PipelineResult<PipelineReport> {
        let started = Instant::now();
        let recorded = run.resume_phase().map(RunPhase::from).unwrap_or(run.phase);
        let mut report = PipelineReport {
            run_id: run.id.clone(),
            ..PipelineReport::default()
        };
        let mut first_failure: Option<(PipelinePhase, String)> = None;

        if let Some(audit) = &self.audit {
            audit.lock().await.emit_run_start();
        }

        for phase in phase_slice(options.start, options.end) {
            if self.cancel.is_cancelled() {
                warn!(phase = %phase, "cancelled before phase");
                report.cancelled = true;
                report.stopped_at = Some(phase);
                break;
            }

            // Another process may have switched the current run.
            self.runs.set_current(&run.id)?;

            if should_skip(phase, recorded, options.skip_completed, options.force) {
                info!(phase = %phase, "skipping completed phase");
                report.phases.push(PhaseReport::skipped(phase));
                continue;
            }

            run.phase = phase.into();
            run.touch();
            self.runs.save(run)?;

            info!(phase = %phase, "starting phase");
            let ctx = PhaseContext {
                run_id: run.id.clone(),
                cancel: self.cancel.clone(),
            };
            let phase_started = Instant::now();
            let outcome = match self.handlers.get(&phase) {
                Some(handler) => handler
                    .run(&ctx, run)
                    .await
                    .unwrap_or_else(|err| PhaseOutcome::failed(err.to_string())),
                None => PhaseOutcome::failed(format!("no handler registered for phase {}", phase)),
            };
            let phase_report = PhaseReport::from_outcome(phase, outcome, phase_started.elapsed());

            if let Some(audit) = &self.audit {
                let status = match phase_report.status {
                    PhaseStatus::Completed => "completed",
                    PhaseStatus::Failed => "failed",
                    PhaseStatus::Skipped => "skipped",
                };
                audit
                    .lock()
                    .await
                    .emit_phase(phase.as_str(), status, phase_report.error.clone());
            }

            let failed = phase_report.status == PhaseStatus::Failed;
            if failed {
                let message = phase_report
                    .error
                    .clone()
                    .unwrap_or_else(|| "phase failed".to_string());
                error!(phase = %phase, error = %message, "phase failed");
                first_failure.get_or_insert((phase, message));
            } else {
                info!(
                    phase = %phase,
                    elapsed_ms = phase_report.duration.as_millis() as u64,
                    "phase completed"
                );
                run.phase = next_phase(phase)
                    .map(RunPhase::from)
                    .unwrap_or(RunPhase::Completed);
            }
            report.phases.push(phase_report);
            run.touch();
            self.runs.save(run)?;

            if failed && options.fail_fast {
                report.stopped_at = Some(phase);
                break;
            }
        }

        if let Some((phase, message)) = &first_failure {
            run.phase = RunPhase::Failed;
            run.failed_phase = Some(*phase);
            run.last_error = Some(message.clone());
        } else if !report.cancelled {
            run.failed_phase = None;
            run.last_error = None;
        }
        run.touch();
        self.runs.save(run)?;

        report.total_input_tokens = report.phases.iter().map(|p| p.input_tokens).sum();
        report.total_output_tokens = report.phases.iter().map(|p| p.output_tokens).sum();
        report.duration = started.elapsed();

        if let Some(audit) = &self.audit {
            let status = if report.cancelled {
                "cancelled"
            } else if first_failure.is_some() {
                "failed"
            } else {
                "completed"
            };
            audit
                .lock()
                .await
                .emit_run_complete(status, first_failure.map(|(_, message)| message));
        }
        Ok(report)
    }

    /// Restart a run from its recorded phase, re-running that phase even if
    /// its work looks done.
    pub async fn resume(
        &self,
        run_id: Option<&str>,
        options: &PipelineOptions,
    ) -> PipelineResult<(RunMeta, PipelineReport)> {
        let mut run = self.load_run(run_id)?;
        let phase = run
            .resume_phase()
            .ok_or_else(|| PipelineError::NothingToResume(run.id.clone()))?;
        info!(run_id = %run.id, phase = %phase, "resuming run");

        let options = PipelineOptions {
            start: Some(phase),
            skip_completed: false,
            ..*options
        };
        let report = self.run(&mut run, &options).await?;
        Ok((run, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::StoreResult;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryRuns {
        runs: Mutex<HashMap<String, RunMeta>>,
        current: Mutex<Option<String>>,
        pins: Mutex<u32>,
    }

    impl RunStore for MemoryRuns {
        fn load(&self, run_id: &str) -> StoreResult<Option<RunMeta>> {
            Ok(self.runs.lock().unwrap().get(run_id).cloned())
        }

        fn save(&self, run: &RunMeta) -> StoreResult<()> {
            self.runs.lock().unwrap().insert(run.id.clone(), run.clone());
            Ok(())
        }

        fn current(&self) -> StoreResult<Option<String>> {
            Ok(self.current.lock().unwrap().clone())
        }

        fn set_current(&self, run_id: &str) -> StoreResult<()> {
            *self.pins.lock().unwrap() += 1;
            *self.current.lock().unwrap() = Some(run_id.to_string());
            Ok(())
        }
    }

    struct Scripted {
        phase: PipelinePhase,
        succeed: bool,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(phase: PipelinePhase, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                phase,
                succeed,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PhaseHandler for Scripted {
        fn phase(&self) -> PipelinePhase {
            self.phase
        }

        async fn run(
            &self,
            _ctx: &PhaseContext,
            _run: &mut RunMeta,
        ) -> PipelineResult<PhaseOutcome> {
            *self.calls.lock().unwrap() += 1;
            if self.succeed {
                Ok(PhaseOutcome::succeeded(self.phase.as_str()).with_tokens(10, 5))
            } else {
                Ok(PhaseOutcome::failed(format!("{} broke", self.phase)))
            }
        }
    }

    fn orchestrator(
        runs: Arc<MemoryRuns>,
        handlers: &[Arc<Scripted>],
    ) -> PipelineOrchestrator {
        handlers.iter().fold(PipelineOrchestrator::new(runs), |o, h| {
            o.with_handler(h.clone())
        })
    }

    fn all_handlers(failing: Option<PipelinePhase>) -> Vec<Arc<Scripted>> {
        crate::pipeline::phase::PHASE_ORDER
            .iter()
            .map(|&p| Scripted::new(p, Some(p) != failing))
            .collect()
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let runs = Arc::new(MemoryRuns::default());
        let handlers = all_handlers(None);
        let orchestrator = orchestrator(runs.clone(), &handlers);

        let mut run = orchestrator.start_run().unwrap();
        let report = orchestrator.run(&mut run, &PipelineOptions::default()).await.unwrap();

        assert!(report.success());
        assert_eq!(report.executed_phases().len(), 6);
        assert_eq!(report.total_input_tokens, 60);
        assert_eq!(run.phase, RunPhase::Completed);
        assert!(*runs.pins.lock().unwrap() >= 6);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_sequence() {
        let runs = Arc::new(MemoryRuns::default());
        let handlers = all_handlers(Some(PipelinePhase::Plan));
        let orchestrator = orchestrator(runs, &handlers);

        let mut run = orchestrator.start_run().unwrap();
        let report = orchestrator.run(&mut run, &PipelineOptions::default()).await.unwrap();

        assert_eq!(report.stopped_at, Some(PipelinePhase::Plan));
        assert_eq!(report.phases.len(), 3);
        assert_eq!(handlers[3].calls(), 0);
        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(run.failed_phase, Some(PipelinePhase::Plan));
    }

    #[tokio::test]
    async fn test_without_fail_fast_later_phases_still_run() {
        let runs = Arc::new(MemoryRuns::default());
        let handlers = all_handlers(Some(PipelinePhase::Plan));
        let orchestrator = orchestrator(runs, &handlers);

        let mut run = orchestrator.start_run().unwrap();
        let options = PipelineOptions {
            fail_fast: false,
            ..PipelineOptions::default()
        };
        let report = orchestrator.run(&mut run, &options).await.unwrap();

        assert_eq!(report.stopped_at, None);
        assert_eq!(report.executed_phases().len(), 6);
        assert_eq!(report.failed_phases(), vec![PipelinePhase::Plan]);
        assert_eq!(run.phase, RunPhase::Failed);
    }

    #[tokio::test]
    async fn test_completed_phases_are_skipped() {
        let runs = Arc::new(MemoryRuns::default());
        let handlers = all_handlers(None);
        let orchestrator = orchestrator(runs, &handlers);

        let mut run = orchestrator.start_run().unwrap();
        run.phase = RunPhase::Consolidate;
        let report = orchestrator.run(&mut run, &PipelineOptions::default()).await.unwrap();

        assert_eq!(
            report.executed_phases(),
            vec![PipelinePhase::Consolidate, PipelinePhase::Exec, PipelinePhase::Verify]
        );
        assert_eq!(handlers[0].calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_phase() {
        let runs = Arc::new(MemoryRuns::default());
        let orchestrator = PipelineOrchestrator::new(runs);

        let mut run = orchestrator.start_run().unwrap();
        let report = orchestrator
            .run(&mut run, &PipelineOptions::only(PipelinePhase::Exec))
            .await
            .unwrap();
        assert_eq!(report.failed_phases(), vec![PipelinePhase::Exec]);
        assert!(report.phases[0]
            .error
            .as_deref()
            .unwrap()
            .contains("no handler"));
    }

    #[tokio::test]
    async fn test_resume_restarts_failed_phase() {
        let runs = Arc::new(MemoryRuns::default());
        let failing = all_handlers(Some(PipelinePhase::Exec));
        let first = orchestrator(runs.clone(), &failing);
        let mut run = first.start_run().unwrap();
        first.run(&mut run, &PipelineOptions::default()).await.unwrap();
        assert_eq!(run.phase, RunPhase::Failed);

        let handlers = all_handlers(None);
        let second = orchestrator(runs, &handlers);
        let (run, report) = second.resume(None, &PipelineOptions::default()).await.unwrap();

        assert_eq!(
            report.executed_phases(),
            vec![PipelinePhase::Exec, PipelinePhase::Verify]
        );
        assert_eq!(handlers[3].calls(), 0);
        assert_eq!(run.phase, RunPhase::Completed);
        assert!(run.last_error.is_none());
    }

    #[tokio::test]
    async fn test_resume_completed_run_is_rejected() {
        let runs = Arc::new(MemoryRuns::default());
        let mut run = RunMeta::new("run-done");
        run.phase = RunPhase::Completed;
        runs.save(&run).unwrap();

        let orchestrator = PipelineOrchestrator::new(runs);
        let err = orchestrator
            .resume(Some("run-done"), &PipelineOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NothingToResume(id) if id == "run-done"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_phase() {
        let runs = Arc::new(MemoryRuns::default());
        let handlers = all_handlers(None);
        let (handle, signal) = crate::cancel::cancel_pair();
        let orchestrator = orchestrator(runs, &handlers).with_cancel(signal);
        handle.cancel();

        let mut run = orchestrator.start_run().unwrap();
        let report = orchestrator.run(&mut run, &PipelineOptions::default()).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.stopped_at, Some(PipelinePhase::Scan));
        assert!(!report.success());
        assert_eq!(handlers[0].calls(), 0);
    }
}
