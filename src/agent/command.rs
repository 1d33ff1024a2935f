//! Agent adapter that runs a coding CLI as a child process.
//!
//! The prompt is written to the child's stdin; stdout is the response and is
//! scanned for token usage. A non-zero exit status is a failed session.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::usage::extract_or_estimate;
use super::{AgentError, AgentExecutor, AgentRequest, AgentResponse, AgentResult};

/// How to launch the agent CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandAgentConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Flag that precedes a model override, e.g. `--model`.
    pub model_flag: Option<String>,
    /// Hard deadline per session. Unset means no deadline.
    pub timeout_secs: Option<u64>,
}

impl Default for CommandAgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model_flag: Some("--model".to_string()),
            timeout_secs: None,
        }
    }
}

impl CommandAgentConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
pub struct CommandAgentExecutor {
    config: CommandAgentConfig,
}

impl CommandAgentExecutor {
    pub fn new(config: CommandAgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandAgentConfig {
        &self.config
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        if let (Some(flag), Some(model)) = (&self.config.model_flag, &request.model_override) {
            cmd.arg(flag).arg(model);
        }
        cmd.current_dir(&request.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, request: &AgentRequest) -> AgentResult<AgentResponse> {
        let mut child = self
            .build_command(request)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let usage = extract_or_estimate(&stdout, &request.prompt);
        debug!(
            exit_code = ?output.status.code(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            usage_source = %usage.source,
            "agent process finished"
        );

        let response = if output.status.success() {
            AgentResponse::succeeded(stdout)
        } else {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            AgentResponse {
                response: stdout,
                ..AgentResponse::failed(format!(
                    "agent exited with {}: {}",
                    output.status, detail
                ))
            }
        };
        Ok(response.with_tokens(usage.input_tokens, usage.output_tokens))
    }
}

#[async_trait]
impl AgentExecutor for CommandAgentExecutor {
    #[instrument(skip_all, fields(command = %self.config.command, work_dir = %request.work_dir.display()))]
    async fn execute(&self, request: AgentRequest) -> AgentResult<AgentResponse> {
        match self.config.timeout() {
            None => self.run(&request).await,
            Some(limit) => match tokio::time::timeout(limit, self.run(&request)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "agent session timed out");
                    Err(AgentError::TimedOut(limit.as_secs()))
                }
            },
        }
    }
}
