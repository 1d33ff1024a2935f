//! Layered settings: built-in defaults, then `patchwright.toml` (or an
//! explicit file), then `PATCHWRIGHT__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use ::config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::agent::CommandAgentConfig;
use crate::parallel::{ExecutionOptions, MergeOptions};
use crate::pipeline::ExecMode;
use crate::retry::RetryConfig;

/// Looked up in the working directory when no file is given.
pub const DEFAULT_CONFIG_FILE: &str = "patchwright.toml";
pub const ENV_PREFIX: &str = "PATCHWRIGHT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for runs, worktrees, audit logs and metrics.
    pub state_dir: PathBuf,
    /// Plan document holding issues and tasks.
    pub plan_file: PathBuf,
    pub parallel: ParallelSettings,
    pub merge: MergeSettings,
    pub retry: RetrySettings,
    pub agent: CommandAgentConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".patchwright"),
            plan_file: PathBuf::from(".patchwright/plan.json"),
            parallel: ParallelSettings::default(),
            merge: MergeSettings::default(),
            retry: RetrySettings::default(),
            agent: CommandAgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelSettings {
    pub max_concurrent: usize,
    pub base_branch: String,
    pub skip_merge: bool,
    pub fail_fast: bool,
    pub mode: ExecMode,
    pub model: Option<String>,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            base_branch: "main".to_string(),
            skip_merge: false,
            fail_fast: false,
            mode: ExecMode::PerIssue,
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    /// Attempts per branch.
    pub max_retries: u32,
    pub max_resolution_rounds: u32,
    /// Let the agent resolve conflicts; otherwise conflicted branches are
    /// left for manual merging.
    pub ai_resolution: bool,
}

impl Default for MergeSettings {
    fn default() -> Self {
        let options = MergeOptions::default();
        Self {
            max_retries: options.max_retries,
            max_resolution_rounds: options.max_resolution_rounds,
            ai_resolution: true,
        }
    }
}

impl MergeSettings {
    pub fn options(&self) -> MergeOptions {
        MergeOptions {
            max_retries: self.max_retries,
            max_resolution_rounds: self.max_resolution_rounds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub agent: RetryConfig,
    pub merge: RetryConfig,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            agent: RetryConfig::agent_default(),
            merge: RetryConfig::merge_default(),
        }
    }
}

impl Settings {
    /// Load settings. An explicit `path` must exist; the default file is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_from(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::new(&path.to_string_lossy(), FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        // Defaults go in as a source so files and env override single keys.
        Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file)
            .add_source(
                env.prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_concurrent: self.parallel.max_concurrent.max(1),
            base_branch: self.parallel.base_branch.clone(),
            skip_merge: self.parallel.skip_merge,
            fail_fast: self.parallel.fail_fast,
            retry: self.retry.agent.clone(),
            merge: self.merge.options(),
            model_override: self.parallel.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.parallel.max_concurrent, 3);
        assert_eq!(settings.parallel.base_branch, "main");
        assert_eq!(settings.merge.max_retries, 3);
        assert_eq!(settings.merge.max_resolution_rounds, 5);
        assert_eq!(settings.state_dir, PathBuf::from(".patchwright"));
        assert_eq!(settings.retry.agent, RetryConfig::agent_default());
    }

    #[test]
    fn test_file_overrides_single_keys() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("custom.toml");
        fs::write(
            &path,
            "[parallel]\nmax_concurrent = 6\nmode = \"per_task\"\n\n[retry.agent]\nmax_retries = 1\n",
        )
        .expect("write");

        let settings = Settings::load_from(Some(&path), no_env()).expect("load");
        assert_eq!(settings.parallel.max_concurrent, 6);
        assert_eq!(settings.parallel.mode, ExecMode::PerTask);
        assert_eq!(settings.parallel.base_branch, "main");
        assert_eq!(settings.retry.agent.max_retries, 1);
        assert_eq!(settings.retry.agent.base_delay_ms, 2_000);
    }

    #[test]
    fn test_env_overrides_file() {
        let env = Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::from([
            ("PATCHWRIGHT__PARALLEL__MAX_CONCURRENT".to_string(), "4".to_string()),
            ("PATCHWRIGHT__PARALLEL__BASE_BRANCH".to_string(), "develop".to_string()),
        ])));
        let settings = Settings::load_from(None, env).expect("load");
        assert_eq!(settings.parallel.max_concurrent, 4);
        assert_eq!(settings.parallel.base_branch, "develop");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let missing = temp_dir.path().join("nope.toml");
        assert!(Settings::load_from(Some(&missing), no_env()).is_err());
    }

    #[test]
    fn test_toml_output_parses_back() {
        let text = Settings::default().to_toml().expect("toml");
        assert!(text.contains("[parallel]"));
        let parsed: Settings = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, Settings::default());
    }

    #[test]
    fn test_execution_options_clamp_concurrency() {
        let mut settings = Settings::default();
        settings.parallel.max_concurrent = 0;
        assert_eq!(settings.execution_options().max_concurrent, 1);
    }
}
