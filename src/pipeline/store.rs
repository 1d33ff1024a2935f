//! Run and task persistence.
//!
//! Both file-backed stores write through a temp file and rename, so a crash
//! never leaves a half-written document behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Issue, RunMeta, Task, TaskStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
    file.write_all(contents).map_err(io_err(&temp_path))?;
    file.sync_all().map_err(io_err(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_err(path))
}

fn read_optional(path: &Path) -> StoreResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path)(err)),
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Persistence for run progress and the "current run" marker.
pub trait RunStore: Send + Sync {
    fn load(&self, run_id: &str) -> StoreResult<Option<RunMeta>>;

    fn save(&self, run: &RunMeta) -> StoreResult<()>;

    fn current(&self) -> StoreResult<Option<String>>;

    fn set_current(&self, run_id: &str) -> StoreResult<()>;
}

/// `<state_dir>/runs/<id>.json` plus `<state_dir>/current`.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    state_dir: PathBuf,
}

impl FileRunStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join("runs").join(format!("{}.json", run_id))
    }

    fn current_path(&self) -> PathBuf {
        self.state_dir.join("current")
    }
}

impl RunStore for FileRunStore {
    fn load(&self, run_id: &str) -> StoreResult<Option<RunMeta>> {
        let path = self.run_path(run_id);
        read_optional(&path)?
            .map(|content| serde_json::from_str(&content).map_err(json_err(&path)))
            .transpose()
    }

    fn save(&self, run: &RunMeta) -> StoreResult<()> {
        let path = self.run_path(&run.id);
        let json = serde_json::to_vec_pretty(run).map_err(json_err(&path))?;
        write_atomic(&path, &json)
    }

    fn current(&self) -> StoreResult<Option<String>> {
        Ok(read_optional(&self.current_path())?
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    fn set_current(&self, run_id: &str) -> StoreResult<()> {
        write_atomic(&self.current_path(), run_id.as_bytes())
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Plan document: the issues and tasks a run works on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPlan {
    pub issues: Vec<Issue>,
    pub tasks: Vec<Task>,
}

/// A status change for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub branch: Option<String>,
}

impl TaskUpdate {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            error: None,
            branch: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }
}

/// Persistence for tasks and issues.
pub trait TaskStore: Send + Sync {
    fn load_plan(&self) -> StoreResult<TaskPlan>;

    /// Apply updates atomically. Unknown task ids fail the whole batch.
    fn apply(&self, updates: &[TaskUpdate]) -> StoreResult<()>;
}

pub(crate) fn apply_updates(plan: &mut TaskPlan, updates: &[TaskUpdate]) -> StoreResult<()> {
    for update in updates {
        let task = plan
            .tasks
            .iter_mut()
            .find(|t| t.id == update.task_id)
            .ok_or_else(|| StoreError::UnknownTask(update.task_id.clone()))?;
        task.status = update.status;
        task.error = update.error.clone();
        if update.branch.is_some() {
            task.branch = update.branch.clone();
        }
    }
    Ok(())
}

/// JSON plan file updated in place.
#[derive(Debug)]
pub struct FileTaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save_plan(&self, plan: &TaskPlan) -> StoreResult<()> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.write(plan)
    }

    fn read(&self) -> StoreResult<TaskPlan> {
        let content = fs::read_to_string(&self.path).map_err(io_err(&self.path))?;
        serde_json::from_str(&content).map_err(json_err(&self.path))
    }

    fn write(&self, plan: &TaskPlan) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(plan).map_err(json_err(&self.path))?;
        write_atomic(&self.path, &json)
    }
}

impl TaskStore for FileTaskStore {
    fn load_plan(&self) -> StoreResult<TaskPlan> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        self.read()
    }

    fn apply(&self, updates: &[TaskUpdate]) -> StoreResult<()> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut plan = self.read()?;
        apply_updates(&mut plan, updates)?;
        self.write(&plan)
    }
}
