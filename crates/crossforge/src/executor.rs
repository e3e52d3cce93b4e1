//! Job execution.
//!
//! Runs one build or test job to completion under a hard wall-clock
//! timeout, capturing stdout/stderr into a job-scoped, per-attempt log
//! file. On timeout the whole process group is killed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::matrix::{Job, JobKind, JobStatus};
use crate::resources::ResourceRegistry;

/// Result of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Wall-clock duration of the attempt (seconds)
    pub duration_secs: f64,
    /// Log file for the attempt
    pub log_reference: PathBuf,
    /// Failure message for classification; empty on success
    pub message: String,
}

impl JobOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == JobStatus::Passed
    }
}

/// Executes jobs against the configured build/test entry points.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    log_dir: PathBuf,
    build_command: Vec<String>,
    test_command: Vec<String>,
    session_tag: String,
}

impl JobExecutor {
    #[must_use]
    pub fn new(config: &OrchestratorConfig, session_tag: impl Into<String>) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            build_command: config.build_command.clone(),
            test_command: config.test_command.clone(),
            session_tag: session_tag.into(),
        }
    }

    /// Log file path for a (job, attempt) pair. Attempts are never
    /// overwritten; each gets its own suffix.
    #[must_use]
    pub fn log_path(&self, job: &Job, attempt: u32) -> PathBuf {
        self.log_dir.join(format!("{}.attempt{attempt}.log", job.id))
    }

    /// Execute one attempt of a job under the given timeout.
    ///
    /// # Errors
    ///
    /// Returns an error only when the process cannot be spawned or the
    /// log file cannot be created; a failing or timed-out job is a
    /// normal `JobOutcome`.
    pub async fn execute(
        &self,
        job: &Job,
        attempt: u32,
        timeout: Duration,
        registry: &ResourceRegistry,
    ) -> Result<JobOutcome> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("Failed to create log dir: {}", self.log_dir.display()))?;

        let log_path = self.log_path(job, attempt);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;
        let stderr_file = log_file
            .try_clone()
            .context("Failed to clone log file handle")?;

        let base = match job.kind {
            JobKind::Build => &self.build_command,
            JobKind::Test => &self.test_command,
        };
        let program = base
            .first()
            .context("Configured job command is empty")?;

        let mut cmd = Command::new(program);
        cmd.args(&base[1..])
            .arg("--platform")
            .arg(&job.platform)
            .arg("--arch")
            .arg(&job.architecture);
        if let Some(suite) = &job.suite {
            cmd.arg("--suite").arg(suite);
        }
        cmd.env("CROSSFORGE_SESSION", &self.session_tag)
            .env("CROSSFORGE_TIMEOUT_SECS", timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            job = %job.id,
            attempt = %attempt,
            timeout_secs = %timeout.as_secs(),
            "Executing job"
        );

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn job command: {program}"))?;

        let pid = child.id();
        if let Some(pid) = pid {
            registry.register_process(pid);
        }

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let duration = started.elapsed();
                if status.success() {
                    JobOutcome {
                        status: JobStatus::Passed,
                        duration_secs: duration.as_secs_f64(),
                        log_reference: log_path.clone(),
                        message: String::new(),
                    }
                } else {
                    let code = status.code().map_or_else(
                        || "signal".to_string(),
                        |c| c.to_string(),
                    );
                    let tail = tail_of_log(&log_path, 2048);
                    JobOutcome {
                        status: JobStatus::Failed,
                        duration_secs: duration.as_secs_f64(),
                        log_reference: log_path.clone(),
                        message: format!("exited with status {code}: {tail}"),
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(job = %job.id, error = %e, "Failed waiting on job process");
                JobOutcome {
                    status: JobStatus::Failed,
                    duration_secs: started.elapsed().as_secs_f64(),
                    log_reference: log_path.clone(),
                    message: format!("process wait failed: {e}"),
                }
            }
            Err(_) => {
                // Hard timeout: take down the whole process group
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                let _ = child.kill().await;
                JobOutcome {
                    status: JobStatus::TimedOut,
                    duration_secs: started.elapsed().as_secs_f64(),
                    log_reference: log_path.clone(),
                    message: format!("operation timed out after {}s", timeout.as_secs()),
                }
            }
        };

        if let Some(pid) = pid {
            registry.forget_process(pid);
        }

        debug!(
            job = %job.id,
            status = ?outcome.status,
            duration_secs = %outcome.duration_secs,
            "Job attempt finished"
        );
        Ok(outcome)
    }
}

/// Kill an entire process group, shelling out the way the rest of the
/// orchestrator drives external tools.
async fn kill_process_group(pid: u32) {
    let target = format!("-{pid}");
    let result = Command::new("kill")
        .args(["-9", &target])
        .output()
        .await;
    if let Err(e) = result {
        warn!(pid = %pid, error = %e, "Failed to kill process group");
    }
}

/// Last `max_bytes` of a log file, flattened to one line.
///
/// Both the slice start and the final truncation are snapped to UTF-8
/// char boundaries; a multi-byte character straddling either cut point
/// is dropped rather than split.
#[must_use]
pub fn tail_of_log(path: &Path, max_bytes: usize) -> String {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let mut tail_start = contents.len().saturating_sub(max_bytes);
    while !contents.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let mut tail = contents[tail_start..].trim().replace('\n', " | ");
    let mut end = max_bytes.min(tail.len());
    while !tail.is_char_boundary(end) {
        end -= 1;
    }
    tail.truncate(end);
    tail
}
