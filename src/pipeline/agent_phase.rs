//! Phases that amount to one agent session in the repository root.
//!
//! Scan, validate, plan, consolidate and verify each hand a prompt to the
//! agent and report its success. What the agent writes is read by later
//! phases through the task store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::orchestrator::{PhaseContext, PhaseHandler, PhaseOutcome};
use crate::agent::{AgentExecutor, AgentRequest};
use crate::error::PipelineResult;
use crate::model::{PipelinePhase, RunMeta};
use crate::retry::{execute_with_retry, RetryConfig};

pub struct AgentPhase {
    phase: PipelinePhase,
    agent: Arc<dyn AgentExecutor>,
    work_dir: PathBuf,
    prompt: String,
    retry: RetryConfig,
}

impl AgentPhase {
    pub fn new(
        phase: PipelinePhase,
        agent: Arc<dyn AgentExecutor>,
        work_dir: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            agent,
            work_dir: work_dir.into(),
            prompt: prompt.into(),
            retry: RetryConfig::agent_default(),
        }
    }

    /// Handler with the built-in prompt for `phase`.
    pub fn with_default_prompt(
        phase: PipelinePhase,
        agent: Arc<dyn AgentExecutor>,
        work_dir: impl Into<PathBuf>,
        plan_file: &str,
    ) -> Self {
        Self::new(phase, agent, work_dir, default_prompt(phase, plan_file))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

pub fn default_prompt(phase: PipelinePhase, plan_file: &str) -> String {
    match phase {
        PipelinePhase::Scan => {
            "Scan this repository for defects. Record each as an issue with an id, \
             a severity (critical, high, medium, low) and a symptom."
                .to_string()
        }
        PipelinePhase::Validate => {
            "Re-check every recorded issue against the code and discard the ones \
             that cannot be reproduced."
                .to_string()
        }
        PipelinePhase::Plan => format!(
            "Write a fix plan for the validated issues to {} as JSON \
             {{\"issues\": [...], \"tasks\": [...]}}. Every task needs an id, a \
             title, its issue_id, depends_on and a parallel_group.",
            plan_file
        ),
        PipelinePhase::Consolidate => format!(
            "Merge duplicate or overlapping tasks in {} and make sure dependencies \
             only point at earlier or equal parallel groups.",
            plan_file
        ),
        PipelinePhase::Exec => format!("Execute the tasks in {}.", plan_file),
        PipelinePhase::Verify => {
            "Verify the fixes on the current branch: build, run the tests and \
             report anything still broken."
                .to_string()
        }
    }
}

#[async_trait]
impl PhaseHandler for AgentPhase {
    fn phase(&self) -> PipelinePhase {
        self.phase
    }

    async fn run(&self, ctx: &PhaseContext, _run: &mut RunMeta) -> PipelineResult<PhaseOutcome> {
        let request = AgentRequest::new(self.prompt.clone(), &self.work_dir);
        let outcome = execute_with_retry(&self.retry, &ctx.cancel, |_| {
            let request = request.clone();
            async move {
                let response = self.agent.execute(request).await.map_err(|e| e.to_string())?;
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
            Ok(response) => {
                info!(phase = %self.phase, attempts, "agent phase finished");
                Ok(PhaseOutcome::succeeded(first_line(&response.response))
                    .with_tokens(response.input_tokens, response.output_tokens))
            }
            Err(err) => {
                warn!(phase = %self.phase, attempts, error = %err, "agent phase failed");
                Ok(PhaseOutcome::failed(err.to_string()))
            }
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}
