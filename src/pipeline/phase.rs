//! Phase ordering and skip rules.

use crate::model::{PipelinePhase, RunPhase};

/// Strict execution order of the pipeline.
pub const PHASE_ORDER: [PipelinePhase; 6] = [
    PipelinePhase::Scan,
    PipelinePhase::Validate,
    PipelinePhase::Plan,
    PipelinePhase::Consolidate,
    PipelinePhase::Exec,
    PipelinePhase::Verify,
];

pub fn phase_index(phase: PipelinePhase) -> usize {
    PHASE_ORDER
        .iter()
        .position(|p| *p == phase)
        .unwrap_or(PHASE_ORDER.len())
}

/// Position of a recorded run state in [`PHASE_ORDER`]. `completed` sits
/// past the last phase; `failed` carries no position of its own.
fn run_position(run_at: RunPhase) -> Option<usize> {
    match run_at {
        RunPhase::Completed => Some(PHASE_ORDER.len()),
        RunPhase::Failed => None,
        other => other.as_pipeline_phase().map(phase_index),
    }
}

/// The phase after `phase`, if any.
pub fn next_phase(phase: PipelinePhase) -> Option<PipelinePhase> {
    PHASE_ORDER.get(phase_index(phase) + 1).copied()
}

/// Phases from `start` to `end` inclusive. Empty when `start` is after `end`.
pub fn phase_slice(start: Option<PipelinePhase>, end: Option<PipelinePhase>) -> Vec<PipelinePhase> {
    let from = start.map(phase_index).unwrap_or(0);
    let to = end.map(phase_index).unwrap_or(PHASE_ORDER.len() - 1);
    if from > to {
        return Vec::new();
    }
    PHASE_ORDER[from..=to].to_vec()
}

/// A phase is skipped only when completed phases may be skipped, nothing is
/// forced, and the run's recorded phase is strictly ahead of it.
pub fn should_skip(
    phase: PipelinePhase,
    run_at: RunPhase,
    skip_completed: bool,
    force: bool,
) -> bool {
    if !skip_completed || force {
        return false;
    }
    run_position(run_at).is_some_and(|position| position > phase_index(phase))
}
