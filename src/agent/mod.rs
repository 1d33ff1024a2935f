//! AI coding agent capability interface.
//!
//! An [`AgentExecutor`] runs one coding session: it receives a prompt and a
//! working directory and reports success, token usage and free-text output.
//! Concrete adapters live in submodules.

pub mod command;
pub mod usage;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use command::{CommandAgentConfig, CommandAgentExecutor};
pub use usage::{extract_or_estimate, ParsedTokenUsage, TokenUsageParser};

/// Errors raised when an agent session cannot run at all.
///
/// A session that runs but reports failure is an `Ok` response with
/// `success == false`.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to spawn agent `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent session timed out after {0}s")]
    TimedOut(u64),

    #[error("agent is not configured: {0}")]
    NotConfigured(String),
}

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Input to one agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub prompt: String,
    pub work_dir: PathBuf,
    pub model_override: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            work_dir: work_dir.into(),
            model_override: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

/// Outcome of one agent session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentResponse {
    pub success: bool,
    pub response: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn succeeded(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: response.into(),
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
}

/// Progress emitted by a streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentProgress {
    Started,
    Output(String),
    Finished { success: bool },
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> AgentResult<AgentResponse>;

    /// Streaming variant. The default reports start/finish around
    /// [`AgentExecutor::execute`] and forwards the full output once.
    async fn execute_with_progress(
        &self,
        request: AgentRequest,
        progress: mpsc::UnboundedSender<AgentProgress>,
    ) -> AgentResult<AgentResponse> {
        let _ = progress.send(AgentProgress::Started);
        let result = self.execute(request).await;
        if let Ok(response) = &result {
            if !response.response.is_empty() {
                let _ = progress.send(AgentProgress::Output(response.response.clone()));
            }
        }
        let _ = progress.send(AgentProgress::Finished {
            success: matches!(&result, Ok(r) if r.success),
        });
        result
    }
}
