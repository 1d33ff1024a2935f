//! Run metrics collection.
//!
//! One [`UnitMetrics`] entry per unit of work, aggregated into a
//! [`RunMetrics`] snapshot stored under `<state_dir>/metrics/`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

const METRICS_DIR_NAME: &str = "metrics";

/// Metrics for a single unit within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitMetrics {
    pub owner_id: String,
    /// Agent attempts made for this unit
    pub attempts: u32,
    pub duration: Duration,
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: SystemTime,
    pub completed_at: SystemTime,
    pub error: Option<String>,
}

impl UnitMetrics {
    fn new(owner_id: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            owner_id: owner_id.into(),
            attempts: 0,
            duration: Duration::ZERO,
            success: false,
            input_tokens: 0,
            output_tokens: 0,
            started_at: now,
            completed_at: now,
            error: None,
        }
    }
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub started_at: SystemTime,
    pub completed_at: SystemTime,
    pub run_duration: Duration,
    /// Units expected for the run
    pub expected_units: u32,
    pub units_attempted: u32,
    pub units_completed: u32,
    pub failures: u32,
    /// Agent retries across all units
    pub retries: u32,
    pub merged_branches: u32,
    pub merge_failures: u32,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Percentage of expected units with an audit record
    pub completeness_percent: f64,
    pub units: Vec<UnitMetrics>,
}

impl RunMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.units_attempted == 0 {
            return 0.0;
        }
        self.units_completed as f64 / self.units_attempted as f64
    }
}

#[derive(Debug)]
struct RunMetricsState {
    run_id: String,
    started_at: SystemTime,
    started_instant: Instant,
    expected_units: usize,
    units: HashMap<String, UnitMetrics>,
    audited_units: HashSet<String>,
    merged_branches: u32,
    merge_failures: u32,
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    pub fn new(run_id: impl Into<String>, expected_units: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                run_id: run_id.into(),
                started_at: SystemTime::now(),
                started_instant: Instant::now(),
                expected_units,
                units: HashMap::new(),
                audited_units: HashSet::new(),
                merged_branches: 0,
                merge_failures: 0,
            })),
        }
    }

    /// Count more units toward the run; one collector can span several
    /// coordinator passes.
    pub fn add_expected_units(&self, units: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.expected_units += units;
        }
    }

    pub fn start_unit(&self, owner_id: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            let owner_id = owner_id.into();
            state
                .units
                .entry(owner_id.clone())
                .or_insert_with(|| UnitMetrics::new(owner_id));
        }
    }

    /// Record that an audit event was written for a unit.
    pub fn record_audit_unit(&self, owner_id: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            state.audited_units.insert(owner_id.into());
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_unit(
        &self,
        owner_id: &str,
        success: bool,
        attempts: u32,
        duration: Duration,
        input_tokens: u64,
        output_tokens: u64,
        error: Option<String>,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state
                .units
                .entry(owner_id.to_string())
                .or_insert_with(|| UnitMetrics::new(owner_id));
            entry.attempts = attempts;
            entry.duration = duration;
            entry.success = success;
            entry.input_tokens = input_tokens;
            entry.output_tokens = output_tokens;
            entry.completed_at = SystemTime::now();
            entry.error = error;
        }
    }

    pub fn record_merge(&self, merged: bool) {
        if let Ok(mut state) = self.inner.lock() {
            if merged {
                state.merged_branches += 1;
            } else {
                state.merge_failures += 1;
            }
        }
    }

    /// Build a run metrics snapshot.
    pub fn finish(&self) -> RunMetrics {
        let Ok(state) = self.inner.lock() else {
            let now = SystemTime::now();
            return RunMetrics {
                run_id: "run-unknown".to_string(),
                started_at: now,
                completed_at: now,
                run_duration: Duration::ZERO,
                expected_units: 0,
                units_attempted: 0,
                units_completed: 0,
                failures: 0,
                retries: 0,
                merged_branches: 0,
                merge_failures: 0,
                total_input_tokens: 0,
                total_output_tokens: 0,
                completeness_percent: 0.0,
                units: Vec::new(),
            };
        };

        let units_attempted = state.units.len() as u32;
        let units_completed = state.units.values().filter(|u| u.success).count() as u32;
        let retries = state
            .units
            .values()
            .map(|u| u.attempts.saturating_sub(1))
            .sum();
        let completeness_percent = if state.expected_units == 0 {
            100.0
        } else {
            ((state.audited_units.len() as f64 / state.expected_units as f64) * 100.0).min(100.0)
        };
        let mut units: Vec<UnitMetrics> = state.units.values().cloned().collect();
        units.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));

        RunMetrics {
            run_id: state.run_id.clone(),
            started_at: state.started_at,
            completed_at: SystemTime::now(),
            run_duration: state.started_instant.elapsed(),
            expected_units: state.expected_units as u32,
            units_attempted,
            units_completed,
            failures: units_attempted.saturating_sub(units_completed),
            retries,
            merged_branches: state.merged_branches,
            merge_failures: state.merge_failures,
            total_input_tokens: units.iter().map(|u| u.input_tokens).sum(),
            total_output_tokens: units.iter().map(|u| u.output_tokens).sum(),
            completeness_percent,
            units,
        }
    }
}

/// Stores run metrics snapshots under `<state_dir>/metrics/`.
#[derive(Debug, Clone)]
pub struct RunMetricsStore {
    metrics_dir: PathBuf,
}

impl RunMetricsStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let metrics_dir = state_dir.into().join(METRICS_DIR_NAME);
        std::fs::create_dir_all(&metrics_dir)?;
        Ok(Self { metrics_dir })
    }

    pub fn save(&self, metrics: &RunMetrics) -> io::Result<PathBuf> {
        let path = self.metrics_dir.join(format!("{}.json", metrics.run_id));
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(metrics).map_err(io::Error::other)?;
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &path)?;
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> io::Result<Option<RunMetrics>> {
        let path = self.metrics_dir.join(format!("{}.json", run_id));
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(
                serde_json::from_str(&contents).map_err(io::Error::other)?,
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Human-readable run summary.
pub fn format_metrics(metrics: &RunMetrics) -> String {
    let mut output = String::new();
    output.push_str(&format!("Run {}\n", metrics.run_id));
    output.push_str(&format!(
        "  Units: {} completed, {} failed ({:.0}% success)\n",
        metrics.units_completed,
        metrics.failures,
        metrics.success_rate() * 100.0
    ));
    if metrics.retries > 0 {
        output.push_str(&format!("  Agent retries: {}\n", metrics.retries));
    }
    output.push_str(&format!(
        "  Branches: {} merged, {} failed\n",
        metrics.merged_branches, metrics.merge_failures
    ));
    output.push_str(&format!(
        "  Tokens: {} in / {} out\n",
        metrics.total_input_tokens, metrics.total_output_tokens
    ));
    output.push_str(&format!(
        "  Duration: {:.1}s\n",
        metrics.run_duration.as_secs_f64()
    ));
    output
}
