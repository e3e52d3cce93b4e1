//! crossforge CLI
//!
//! Cross-platform build/test orchestrator: expands a platform ×
//! architecture × suite matrix into jobs, executes them in isolated
//! containers with timeout enforcement and retry-with-recovery, runs a
//! background resource governor, and always finishes with a verified
//! cleanup of every session-tagged resource.

mod classify;
mod cleanup;
mod config;
mod docker;
mod error;
mod executor;
mod governor;
mod matrix;
mod mitigate;
mod recovery;
mod report;
mod resources;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleanup::CleanupCoordinator;
use crate::config::OrchestratorConfig;
use crate::docker::DockerCli;
use crate::executor::JobExecutor;
use crate::governor::{HostMetrics, ResourceGovernor};
use crate::matrix::{plan, Job};
use crate::mitigate::{Mitigator, TimeoutScale};
use crate::recovery::{RecoveryController, RecoverySession, SessionStatus};
use crate::report::{JsonlReporter, Reporter, RunSummary};
use crate::resources::ResourceRegistry;
use crate::store::SessionStore;

/// Label key attached to every resource a session creates.
const SESSION_LABEL_KEY: &str = "crossforge.session";

/// Exit code: one or more jobs terminally failed.
const EXIT_JOBS_FAILED: i32 = 1;
/// Exit code: global session timeout fired before completion.
const EXIT_SESSION_TIMEOUT: i32 = 124;
/// Exit code: interrupted (SIGINT) after best-effort cleanup.
const EXIT_INTERRUPTED: i32 = 130;
/// Exit code: terminated (SIGTERM) after best-effort cleanup.
const EXIT_TERMINATED: i32 = 143;

/// Cross-platform build/test orchestrator with recovery and resource governance
#[derive(Parser)]
#[command(name = "crossforge")]
#[command(about = "Cross-platform build/test orchestrator with recovery and resource governance")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the orchestrator config file
    #[arg(long, default_value = "crossforge.json", global = true)]
    config: PathBuf,

    /// Session identifier (defaults to a fresh one per run)
    #[arg(long, global = true)]
    session: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output file for JSONL events (in addition to stdout)
    #[arg(long, global = true)]
    output_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full matrix: plan, execute with recovery, govern, clean up
    Run {
        /// Launch all jobs in parallel instead of sequentially
        #[arg(long)]
        parallel: bool,
    },
    /// Print the expanded job matrix without executing anything
    Plan,
    /// Clean up session-tagged resources (all sessions unless --session)
    Cleanup {
        /// Skip the graceful phase and go straight to the emergency path
        #[arg(long)]
        force: bool,
    },
    /// Classify a failure message and print its remediation guidance
    Classify {
        /// The failure message to classify
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "crossforge=debug" } else { "crossforge=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let code = match cli.command {
        Commands::Run { parallel } => {
            let config = OrchestratorConfig::load(&cli.config)?;
            run_orchestration(&config, cli.session, parallel, cli.output_file).await?
        }
        Commands::Plan => {
            let config = OrchestratorConfig::load(&cli.config)?;
            print_plan(&config);
            0
        }
        Commands::Cleanup { force } => {
            let config = OrchestratorConfig::load(&cli.config)?;
            run_standalone_cleanup(&config, cli.session, force).await?
        }
        Commands::Classify { message } => {
            print_classification(&message);
            0
        }
    };

    std::process::exit(code);
}

/// Print the expanded matrix, one job per line.
fn print_plan(config: &OrchestratorConfig) {
    let jobs = plan(config);
    println!("{}", format!("Job matrix ({} jobs):", jobs.len()).bold());
    for job in &jobs {
        println!("  {job}");
    }
}

/// Print category, description and remediations for a message.
fn print_classification(message: &str) {
    let category = classify::classify(message);
    println!("{}: {}", "Category".bold(), category.to_string().yellow());
    println!("{}: {}", "Description".bold(), category.description());
    println!("{}:", "Remediations".bold());
    for remediation in category.remediations() {
        println!("  - {remediation}");
    }
}

/// Standalone cleanup entry point.
async fn run_standalone_cleanup(
    config: &OrchestratorConfig,
    session: Option<String>,
    force: bool,
) -> Result<i32> {
    // Bare label key matches every crossforge session
    let tag = session.map_or_else(
        || SESSION_LABEL_KEY.to_string(),
        |s| format!("{SESSION_LABEL_KEY}={s}"),
    );
    let runtime: Arc<dyn docker::ContainerRuntime> = Arc::new(DockerCli::new());
    let registry = Arc::new(ResourceRegistry::new(tag));
    let coordinator = CleanupCoordinator::new(
        runtime,
        registry,
        Duration::from_secs(config.cleanup_timeout_secs),
    );

    match coordinator.run(force).await {
        Ok(report) => {
            println!("{}", report.to_string().green());
            Ok(0)
        }
        Err(e) => {
            error!(error = %e, "Cleanup failed");
            Ok(EXIT_JOBS_FAILED)
        }
    }
}

/// How the job phase ended.
enum RunEnd {
    Finished(Result<Vec<Job>>),
    SessionTimeout,
    Interrupted(i32),
}

/// Full orchestration run. Returns the process exit code.
async fn run_orchestration(
    config: &OrchestratorConfig,
    session: Option<String>,
    parallel_flag: bool,
    output_file: Option<PathBuf>,
) -> Result<i32> {
    let session_id = session.unwrap_or_else(|| {
        uuid::Uuid::new_v4()
            .to_string()
            .split('-')
            .next()
            .unwrap_or("run")
            .to_string()
    });
    let session_tag = format!("{SESSION_LABEL_KEY}={session_id}");
    let parallel = parallel_flag || config.parallel;

    info!(session = %session_tag, parallel = %parallel, "Starting orchestration run");

    let store = SessionStore::open(config.state_dir.join(&session_id))?;
    let recovery_session = match store.load_session()? {
        Some(existing) => {
            info!(
                session = %existing.id,
                status = ?existing.status,
                failed = %existing.failed_job_ids.len(),
                "Resuming persisted session"
            );
            existing
        }
        None => RecoverySession::new(&session_tag),
    };
    let recovery_session = Arc::new(Mutex::new(recovery_session));

    let runtime: Arc<dyn docker::ContainerRuntime> = Arc::new(DockerCli::new());
    let registry = Arc::new(ResourceRegistry::new(&session_tag));
    let timeout_scale = TimeoutScale::new();
    let mitigator = Arc::new(Mitigator::new(
        runtime.clone(),
        config,
        &session_tag,
        timeout_scale.clone(),
    ));
    let executor = JobExecutor::new(config, &session_tag);
    let controller = Arc::new(RecoveryController::new(
        config,
        executor,
        mitigator.clone(),
        store.clone(),
        registry.clone(),
        recovery_session.clone(),
        timeout_scale,
    ));
    let coordinator = Arc::new(CleanupCoordinator::new(
        runtime.clone(),
        registry.clone(),
        Duration::from_secs(config.cleanup_timeout_secs),
    ));
    let reporter: Arc<dyn Reporter> = Arc::new(JsonlReporter::new(output_file));

    // Governor runs as a cancellable background task for the whole
    // session; its emergency requests are serviced here.
    let (emergency_tx, mut emergency_rx) = mpsc::channel::<()>(4);
    let governor = Arc::new(ResourceGovernor::new(
        config.governor.clone(),
        Arc::new(HostMetrics::new(runtime.clone(), &session_tag)),
        mitigator,
        recovery_session.clone(),
        emergency_tx,
    ));
    let governor_token = CancellationToken::new();
    let governor_task = {
        let governor = governor.clone();
        let token = governor_token.clone();
        tokio::spawn(async move { governor.run(token).await })
    };
    let emergency_task = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while emergency_rx.recv().await.is_some() {
                warn!("Governor requested emergency cleanup");
                if let Err(e) = coordinator.emergency_pass().await {
                    error!(error = %e, "Emergency cleanup failed");
                }
            }
        })
    };

    let mut signal_rx = spawn_signal_listener();

    let jobs = plan(config);
    if jobs.is_empty() {
        warn!("Planner produced no jobs");
    }
    store.save_session(&*recovery_session.lock().await)?;

    let completed: Arc<Mutex<Vec<Job>>> = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let session_budget = config
        .session_timeout_secs
        .map_or(Duration::from_secs(60 * 60 * 24 * 365), Duration::from_secs);

    let end = tokio::select! {
        result = run_jobs(controller.clone(), jobs, parallel, reporter.clone(), completed.clone()) => {
            RunEnd::Finished(result)
        }
        () = tokio::time::sleep(session_budget) => RunEnd::SessionTimeout,
        Some(code) = signal_rx.recv() => RunEnd::Interrupted(code),
    };

    // Stop the governor before teardown; it acknowledges within one
    // sampling interval.
    governor_token.cancel();
    let _ = governor_task.await;
    emergency_task.abort();

    match end {
        RunEnd::Finished(result) => {
            let exit = match result {
                Ok(jobs) => {
                    let summary = RunSummary::from_jobs(
                        &jobs,
                        &session_tag,
                        started.elapsed().as_secs_f64(),
                    );
                    {
                        let mut session = recovery_session.lock().await;
                        session.status = SessionStatus::RetryCompleted;
                    }
                    if let Err(e) = store.save_session(&*recovery_session.lock().await) {
                        warn!(error = %e, "Failed to persist final session state");
                    }
                    reporter.session_complete(&summary);
                    print_summary(&summary);
                    if summary.all_green() { 0 } else { EXIT_JOBS_FAILED }
                }
                Err(e) => {
                    error!(error = %e, "Orchestration run aborted");
                    EXIT_JOBS_FAILED
                }
            };

            let cleanup_ok = run_final_cleanup(&coordinator, &mut signal_rx).await;
            if cleanup_ok {
                Ok(exit)
            } else {
                Ok(exit.max(EXIT_JOBS_FAILED))
            }
        }
        RunEnd::SessionTimeout => {
            error!(
                budget_secs = %session_budget.as_secs(),
                "Global session timeout exceeded; running emergency cleanup"
            );
            collect_partial_results(&store, &recovery_session, &completed).await;
            if let Err(e) = coordinator.emergency_pass().await {
                error!(error = %e, "Emergency cleanup failed");
            }
            Ok(EXIT_SESSION_TIMEOUT)
        }
        RunEnd::Interrupted(code) => {
            warn!(code = %code, "Signal received; collecting partial results");
            collect_partial_results(&store, &recovery_session, &completed).await;

            // A second signal during cleanup escalates straight to the
            // emergency path.
            tokio::select! {
                result = coordinator.run(false) => {
                    if let Err(e) = result {
                        error!(error = %e, "Cleanup after interrupt failed");
                    }
                }
                Some(_) = signal_rx.recv() => {
                    warn!("Second signal; escalating to emergency cleanup");
                    if let Err(e) = coordinator.emergency_pass().await {
                        error!(error = %e, "Emergency cleanup failed");
                    }
                }
            }
            Ok(code)
        }
    }
}

/// Run every planned job to a terminal status.
async fn run_jobs(
    controller: Arc<RecoveryController>,
    jobs: Vec<Job>,
    parallel: bool,
    reporter: Arc<dyn Reporter>,
    completed: Arc<Mutex<Vec<Job>>>,
) -> Result<Vec<Job>> {
    let mut done = Vec::with_capacity(jobs.len());

    if parallel {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let controller = controller.clone();
                let reporter = reporter.clone();
                let completed = completed.clone();
                tokio::spawn(async move {
                    let (job, outcome) = controller.run_job(job).await?;
                    reporter.job_finished(&job, &outcome);
                    completed.lock().await.push(job.clone());
                    Ok::<Job, anyhow::Error>(job)
                })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            done.push(result.context("Job task panicked")??);
        }
    } else {
        for job in jobs {
            let (job, outcome) = controller.run_job(job).await?;
            reporter.job_finished(&job, &outcome);
            completed.lock().await.push(job.clone());
            done.push(job);
        }
    }

    Ok(done)
}

/// Best-effort partial-result collection: non-blocking, swallows its
/// own errors.
async fn collect_partial_results(
    store: &SessionStore,
    session: &Arc<Mutex<RecoverySession>>,
    completed: &Arc<Mutex<Vec<Job>>>,
) {
    {
        let mut session = session.lock().await;
        session.status = SessionStatus::PartialResultsCollected;
    }
    if let Err(e) = store.save_session(&*session.lock().await) {
        warn!(error = %e, "Failed to persist partial session state");
    }
    let snapshot = completed.lock().await.clone();
    match serde_json::to_value(&snapshot) {
        Ok(value) => {
            if let Err(e) = store.save_partial_results(&value) {
                warn!(error = %e, "Failed to persist partial results");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize partial results"),
    }
}

/// Standard end-of-run cleanup; a signal during it escalates. Returns
/// false when resources could not be fully reclaimed.
async fn run_final_cleanup(
    coordinator: &Arc<CleanupCoordinator>,
    signal_rx: &mut mpsc::Receiver<i32>,
) -> bool {
    tokio::select! {
        result = coordinator.run(false) => match result {
            Ok(report) => {
                info!(%report, "Final cleanup complete");
                true
            }
            Err(e) => {
                error!(error = %e, "Final cleanup failed");
                false
            }
        },
        Some(_) = signal_rx.recv() => {
            warn!("Signal during final cleanup; escalating to emergency path");
            match coordinator.emergency_pass().await {
                Ok(_) => true,
                Err(e) => {
                    error!(error = %e, "Emergency cleanup failed");
                    false
                }
            }
        }
    }
}

/// Forward SIGINT/SIGTERM as exit codes on a channel; repeated signals
/// keep arriving so a second one can escalate cleanup.
fn spawn_signal_listener() -> mpsc::Receiver<i32> {
    let (tx, rx) = mpsc::channel(4);

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        loop {
            let code = tokio::select! {
                _ = sigint.recv() => EXIT_INTERRUPTED,
                _ = sigterm.recv() => EXIT_TERMINATED,
            };
            if tx.send(code).await.is_err() {
                break;
            }
        }
    });

    #[cfg(not(unix))]
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            if tx.send(EXIT_INTERRUPTED).await.is_err() {
                break;
            }
        }
    });

    rx
}

/// Human-facing run summary.
fn print_summary(summary: &RunSummary) {
    let headline = format!(
        "{} jobs: {} passed, {} failed, {} timed out, {} skipped ({:.1}s)",
        summary.total,
        summary.passed,
        summary.failed,
        summary.timed_out,
        summary.skipped,
        summary.duration_secs
    );
    if summary.all_green() {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.red().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::JobStatus;

    fn summary(statuses: &[JobStatus]) -> RunSummary {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"platforms": [{"name": "p", "architectures": ["a", "b", "c", "d"]}]}"#,
        )
        .unwrap();
        let mut jobs = plan(&config);
        jobs.truncate(statuses.len());
        for (job, status) in jobs.iter_mut().zip(statuses) {
            job.status = *status;
        }
        RunSummary::from_jobs(&jobs, "session=t", 1.0)
    }

    #[test]
    fn test_exit_code_mapping() {
        let green = summary(&[JobStatus::Passed, JobStatus::Skipped]);
        assert!(green.all_green());

        let red = summary(&[JobStatus::Passed, JobStatus::Failed]);
        assert!(!red.all_green());

        let timed = summary(&[JobStatus::TimedOut]);
        assert!(!timed.all_green());
    }

    #[test]
    fn test_session_tag_format() {
        let tag = format!("{SESSION_LABEL_KEY}=abc123");
        assert_eq!(tag, "crossforge.session=abc123");
        assert!(tag.starts_with(SESSION_LABEL_KEY));
    }
}
