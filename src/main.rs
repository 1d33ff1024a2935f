//! `patchwright` command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{info, warn};

use patchwright::agent::{AgentExecutor, CommandAgentExecutor};
use patchwright::audit::{AuditWriter, SharedAuditWriter};
use patchwright::cancel::{cancel_pair, CancelSignal};
use patchwright::metrics::RunMetricsStore;
use patchwright::model::{PipelinePhase, RunMeta};
use patchwright::parallel::{
    AgentConflictResolver, ConflictResolver, DeferredMergeEngine, ManualResolver, QueuedBranch,
};
use patchwright::pipeline::{
    AgentPhase, ExecMode, ExecPhase, FileRunStore, FileTaskStore, PhaseStatus, PipelineOptions,
    PipelineOrchestrator, PipelineReport, RunStore, PHASE_ORDER, REFERENCE_DIR,
};
use patchwright::vcs::{GitVcs, VcsService};
use patchwright::{logging, PipelineResult, Settings};

#[derive(Parser)]
#[command(
    name = "patchwright",
    version,
    about = "Run AI agents on grouped fixes in isolated worktrees and merge the results"
)]
struct Cli {
    /// Settings file (defaults to ./patchwright.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline phases for a new run.
    Run {
        /// First phase to run.
        #[arg(long)]
        from: Option<PipelinePhase>,
        /// Last phase to run.
        #[arg(long)]
        to: Option<PipelinePhase>,
        /// Keep going after a failed phase.
        #[arg(long)]
        no_fail_fast: bool,
    },
    /// Execute ready tasks from a plan file in parallel worktrees.
    Exec {
        /// Plan document with issues and tasks.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// `per_issue` or `per_task`.
        #[arg(long, value_parser = parse_mode)]
        mode: Option<ExecMode>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Leave finished branches unmerged.
        #[arg(long)]
        skip_merge: bool,
        /// Stop dispatching after the first failed unit.
        #[arg(long)]
        fail_fast: bool,
        /// Re-run tasks that failed or were skipped last time.
        #[arg(long)]
        retry_failed: bool,
        /// File copied into every worktree before the agent starts.
        #[arg(long = "reference")]
        references: Vec<PathBuf>,
    },
    /// Continue the current (or given) run from where it stopped.
    Resume {
        #[arg(long = "run")]
        run_id: Option<String>,
        /// Re-run every remaining phase even if recorded as passed.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_fail_fast: bool,
    },
    /// Merge branches into the target one at a time.
    Merge {
        #[arg(required = true)]
        branches: Vec<String>,
        /// Branch to merge into (defaults to the configured base branch).
        #[arg(long)]
        target: Option<String>,
        /// Leave conflicted branches for manual merging.
        #[arg(long)]
        no_ai: bool,
    },
    /// Print the effective settings as TOML.
    Config,
}

fn parse_mode(value: &str) -> Result<ExecMode, String> {
    match value.replace('-', "_").as_str() {
        "per_issue" => Ok(ExecMode::PerIssue),
        "per_task" => Ok(ExecMode::PerTask),
        other => Err(format!("unknown mode '{}' (expected per_issue or per_task)", other)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

/// Everything the subcommands share.
struct App {
    settings: Settings,
    repo_dir: PathBuf,
    vcs: Arc<dyn VcsService>,
    agent: Arc<dyn AgentExecutor>,
    runs: Arc<dyn RunStore>,
    cancel: CancelSignal,
}

async fn run(cli: Cli) -> PipelineResult<bool> {
    let settings = Settings::load(cli.config.as_deref())?;
    if let Command::Config = cli.command {
        print!("{}", settings.to_toml()?);
        return Ok(true);
    }

    let repo_dir = std::env::current_dir()?;
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            handle.cancel();
        }
    });

    let app = App {
        vcs: Arc::new(
            GitVcs::new(repo_dir.clone(), &settings.state_dir).with_excluded(REFERENCE_DIR),
        ),
        agent: Arc::new(CommandAgentExecutor::new(settings.agent.clone())),
        runs: Arc::new(FileRunStore::new(settings.state_dir.clone())),
        repo_dir,
        settings,
        cancel,
    };

    match cli.command {
        Command::Run {
            from,
            to,
            no_fail_fast,
        } => {
            let options = PipelineOptions {
                start: from,
                end: to,
                fail_fast: !no_fail_fast,
                ..PipelineOptions::default()
            };
            let mut run = PipelineOrchestrator::new(Arc::clone(&app.runs)).start_run()?;
            let report = app.orchestrator(&run, Vec::new(), false)?.run(&mut run, &options).await?;
            Ok(print_report(&run, &report))
        }
        Command::Exec {
            plan,
            mode,
            max_concurrent,
            skip_merge,
            fail_fast,
            retry_failed,
            references,
        } => {
            let mut app = app;
            if let Some(plan) = plan {
                app.settings.plan_file = plan;
            }
            if let Some(mode) = mode {
                app.settings.parallel.mode = mode;
            }
            if let Some(max) = max_concurrent {
                app.settings.parallel.max_concurrent = max;
            }
            app.settings.parallel.skip_merge |= skip_merge;
            app.settings.parallel.fail_fast |= fail_fast;

            let mut run = PipelineOrchestrator::new(Arc::clone(&app.runs)).start_run()?;
            let report = app
                .orchestrator(&run, references, retry_failed)?
                .run(&mut run, &PipelineOptions::only(PipelinePhase::Exec))
                .await?;
            Ok(print_report(&run, &report))
        }
        Command::Resume {
            run_id,
            force,
            no_fail_fast,
        } => {
            let existing =
                PipelineOrchestrator::new(Arc::clone(&app.runs)).load_run(run_id.as_deref())?;
            let options = PipelineOptions {
                fail_fast: !no_fail_fast,
                force,
                ..PipelineOptions::default()
            };
            let (run, report) = app
                .orchestrator(&existing, Vec::new(), true)?
                .resume(Some(&existing.id), &options)
                .await?;
            Ok(print_report(&run, &report))
        }
        Command::Merge {
            branches,
            target,
            no_ai,
        } => app.merge(branches, target, no_ai).await,
        Command::Config => Ok(true),
    }
}

impl App {
    fn resolver(&self, ai_resolution: bool) -> Arc<dyn ConflictResolver> {
        if !ai_resolution {
            return Arc::new(ManualResolver);
        }
        let resolver = AgentConflictResolver::new(Arc::clone(&self.agent), self.repo_dir.clone())
            .with_retry(self.settings.retry.merge.clone())
            .with_cancel(self.cancel.clone());
        match &self.settings.parallel.model {
            Some(model) => Arc::new(resolver.with_model(model.clone())),
            None => Arc::new(resolver),
        }
    }

    /// Orchestrator with every phase registered, auditing into `run`.
    fn orchestrator(
        &self,
        run: &RunMeta,
        references: Vec<PathBuf>,
        retry_failed: bool,
    ) -> PipelineResult<PipelineOrchestrator> {
        let state_dir = &self.settings.state_dir;
        let audit: SharedAuditWriter =
            Arc::new(Mutex::new(AuditWriter::try_new(state_dir, run.id.clone())?));
        let plan_file = self.settings.plan_file.clone();

        let exec = ExecPhase::new(
            Arc::new(FileTaskStore::new(plan_file.clone())),
            Arc::clone(&self.vcs),
            Arc::clone(&self.agent),
            self.settings.execution_options(),
        )
        .with_mode(self.settings.parallel.mode)
        .with_resolver(self.resolver(self.settings.merge.ai_resolution))
        .with_reference_files(references)
        .with_retry_failed(retry_failed)
        .with_rerun_command(format!(
            "patchwright exec --plan {} --retry-failed",
            plan_file.display()
        ))
        .with_audit(Arc::clone(&audit))
        .with_metrics_store(RunMetricsStore::new(state_dir.clone())?);

        let mut orchestrator = PipelineOrchestrator::new(Arc::clone(&self.runs))
            .with_handler(Arc::new(exec))
            .with_cancel(self.cancel.clone())
            .with_audit(audit);
        for phase in PHASE_ORDER.iter().copied().filter(|p| *p != PipelinePhase::Exec) {
            let handler = AgentPhase::with_default_prompt(
                phase,
                Arc::clone(&self.agent),
                self.repo_dir.clone(),
                &plan_file.to_string_lossy(),
            )
            .with_retry(self.settings.retry.agent.clone());
            orchestrator = orchestrator.with_handler(Arc::new(handler));
        }
        Ok(orchestrator)
    }

    async fn merge(
        &self,
        branches: Vec<String>,
        target: Option<String>,
        no_ai: bool,
    ) -> PipelineResult<bool> {
        let target = target.unwrap_or_else(|| self.settings.parallel.base_branch.clone());
        let queued: Vec<QueuedBranch> = branches
            .iter()
            .map(|branch| {
                let message = format!("Merge branch '{}'", branch);
                QueuedBranch::new(branch.clone(), branch.clone(), message)
            })
            .collect();
        let resolver = self.resolver(self.settings.merge.ai_resolution && !no_ai);

        info!(branches = queued.len(), target = %target, "merging branches");
        let engine = DeferredMergeEngine::new(Arc::clone(&self.vcs), self.settings.merge.options());
        let summary = engine.merge_sequentially(&queued, &target, resolver.as_ref()).await;

        for result in &summary.results {
            match &result.error {
                None => println!("merged   {}", result.branch),
                Some(error) => println!("failed   {}: {}", result.branch, error),
            }
        }
        if let Some(error) = &summary.stash_error {
            println!("stash not restored: {}", error);
        }
        print_remediation(&summary.manual_instructions());
        Ok(summary.all_merged() && summary.stash_error.is_none())
    }
}

fn print_report(run: &RunMeta, report: &PipelineReport) -> bool {
    println!("run {}", run.id);
    for phase in &report.phases {
        let status = match phase.status {
            PhaseStatus::Completed => "ok",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Skipped => "skipped",
        };
        println!("  {:<12} {:<8} {}", phase.phase, status, phase.summary);
        if let Some(error) = &phase.error {
            if *error != phase.summary {
                println!("  {:<12} {:<8} {}", "", "", error);
            }
        }
    }
    if report.cancelled {
        println!("cancelled; resume with `patchwright resume --run {}`", run.id);
    }
    println!(
        "tokens: {} in, {} out ({:.1}s)",
        report.total_input_tokens,
        report.total_output_tokens,
        report.duration.as_secs_f64()
    );

    let remediation: Vec<String> = report
        .phases
        .iter()
        .flat_map(|p| p.remediation.iter().cloned())
        .collect();
    print_remediation(&remediation);
    report.success()
}

fn print_remediation(lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    println!("\nto finish by hand:");
    for line in lines {
        println!("  {}", line);
    }
}

