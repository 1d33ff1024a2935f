//! Top-level error type.

use thiserror::Error;

use crate::agent::AgentError;
use crate::audit::AuditError;
use crate::model::PipelinePhase;
use crate::parallel::ScheduleError;
use crate::pipeline::StoreError;
use crate::retry::RetryError;
use crate::vcs::VcsError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("no current run to resume")]
    NoCurrentRun,

    #[error("run {0} has already completed")]
    NothingToResume(String),

    #[error("phase {phase} failed: {message}")]
    PhaseFailed {
        phase: PipelinePhase,
        message: String,
    },

    #[error("run cancelled")]
    Cancelled,
}

pub type PipelineResult<T> = Result<T, PipelineError>;
