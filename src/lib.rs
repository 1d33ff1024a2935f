//! Patchwright: an autonomous multi-agent code-fixing pipeline.
//!
//! Issues and tasks are grouped into units of work, each unit runs an agent
//! session in its own git worktree, and finished branches are merged back
//! one at a time after every unit has settled.

pub mod agent;
pub mod audit;
pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod parallel;
pub mod pipeline;
pub mod retry;
pub mod vcs;

pub use config::Settings;
pub use error::{PipelineError, PipelineResult};
