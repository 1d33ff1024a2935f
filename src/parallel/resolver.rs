//! Conflict resolvers used by the deferred merge engine.
//!
//! A resolver edits and stages the conflicted files. It never continues a
//! rebase or commits a merge; the engine owns those transitions.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::prompt::conflict_resolution_prompt;
use crate::agent::{AgentExecutor, AgentRequest};
use crate::cancel::CancelSignal;
use crate::retry::{execute_with_retry, RetryConfig};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("conflict resolution failed: {0}")]
pub struct ResolutionError(pub String);

/// Where the conflict arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStage {
    Rebase,
    Merge,
}

impl ConflictStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStage::Rebase => "rebase",
            ConflictStage::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRequest {
    pub owner_id: String,
    pub branch: String,
    pub target: String,
    pub files: Vec<String>,
    pub stage: ConflictStage,
}

#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, request: &ConflictRequest) -> Result<(), ResolutionError>;
}

/// Refuses every conflict; branches with conflicts are left for manual
/// merging.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolver;

#[async_trait]
impl ConflictResolver for ManualResolver {
    async fn resolve(&self, request: &ConflictRequest) -> Result<(), ResolutionError> {
        Err(ResolutionError(format!(
            "automatic resolution disabled ({} conflicted files)",
            request.files.len()
        )))
    }
}

/// Asks an agent to resolve conflicts in the main working tree, through the
/// retry runtime.
pub struct AgentConflictResolver {
    agent: Arc<dyn AgentExecutor>,
    repo_dir: PathBuf,
    retry: RetryConfig,
    cancel: CancelSignal,
    model_override: Option<String>,
}

impl AgentConflictResolver {
    pub fn new(agent: Arc<dyn AgentExecutor>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            repo_dir: repo_dir.into(),
            retry: RetryConfig::merge_default(),
            cancel: CancelSignal::never(),
            model_override: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

#[async_trait]
impl ConflictResolver for AgentConflictResolver {
    async fn resolve(&self, request: &ConflictRequest) -> Result<(), ResolutionError> {
        let prompt = conflict_resolution_prompt(&request.branch, &request.target, &request.files);
        let mut agent_request = AgentRequest::new(prompt, &self.repo_dir);
        agent_request.model_override = self.model_override.clone();

        info!(
            branch = %request.branch,
            stage = request.stage.as_str(),
            files = request.files.len(),
            "resolving conflicts with agent"
        );

        let outcome = execute_with_retry(&self.retry, &self.cancel, |_| {
            let agent = Arc::clone(&self.agent);
            let agent_request = agent_request.clone();
            async move {
                let response = agent
                    .execute(agent_request)
                    .await
                    .map_err(|e| e.to_string())?;
                if response.success {
                    Ok(response)
                } else {
                    Err(response
                        .error
                        .unwrap_or_else(|| "agent reported failure".to_string()))
                }
            }
        })
        .await;

        let attempts = outcome.attempt_count();
        match outcome.into_result() {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(branch = %request.branch, attempts, error = %err, "agent could not resolve conflicts");
                Err(ResolutionError(err.to_string()))
            }
        }
    }
}
