//! Pipeline phases and the orchestrator that sequences them.

pub mod agent_phase;
pub mod exec;
pub mod orchestrator;
pub mod phase;
pub mod store;

pub use agent_phase::{default_prompt, AgentPhase};
pub use exec::{select_per_issue, ExecMode, ExecPhase, REFERENCE_DIR};
pub use orchestrator::{
    PhaseContext, PhaseHandler, PhaseOutcome, PhaseReport, PhaseStatus, PipelineOptions,
    PipelineOrchestrator, PipelineReport,
};
pub use phase::{next_phase, phase_index, phase_slice, should_skip, PHASE_ORDER};
pub use store::{
    FileRunStore, FileTaskStore, RunStore, StoreError, StoreResult, TaskPlan, TaskStore, TaskUpdate,
};
