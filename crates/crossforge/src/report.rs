//! Reporting boundary.
//!
//! The orchestrator hands per-job results and the final session summary
//! to a [`Reporter`]; all human/CI-facing rendering lives behind this
//! trait. The shipped implementation emits JSONL events to stdout and
//! optionally to a file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

use crate::executor::JobOutcome;
use crate::matrix::{Job, JobStatus};

/// Final tally for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub duration_secs: f64,
    pub session_tag: String,
}

impl RunSummary {
    /// Tally terminal job states.
    #[must_use]
    pub fn from_jobs(jobs: &[Job], session_tag: &str, duration_secs: f64) -> Self {
        let mut summary = Self {
            total: jobs.len(),
            duration_secs,
            session_tag: session_tag.to_string(),
            ..Self::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Passed => summary.passed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::TimedOut => summary.timed_out += 1,
                JobStatus::Skipped => summary.skipped += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        summary
    }

    /// Whether every job passed or was skipped.
    #[must_use]
    pub fn all_green(&self) -> bool {
        self.failed == 0 && self.timed_out == 0 && self.passed + self.skipped == self.total
    }
}

/// Receives results; rendering is the implementor's problem.
pub trait Reporter: Send + Sync {
    fn job_finished(&self, job: &Job, outcome: &JobOutcome);
    fn session_complete(&self, summary: &RunSummary);
}

/// One emitted event line.
#[derive(Debug, Serialize)]
struct ReportEvent<'a> {
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<&'a str>,
    details: serde_json::Value,
}

/// JSONL emitter: every event goes to stdout, and to a file when
/// configured.
pub struct JsonlReporter {
    output_file: Option<PathBuf>,
}

impl JsonlReporter {
    #[must_use]
    pub fn new(output_file: Option<PathBuf>) -> Self {
        Self { output_file }
    }

    fn emit(&self, event: &ReportEvent<'_>) -> Result<()> {
        let json = serde_json::to_string(event)?;
        println!("{json}");
        std::io::stdout().flush()?;

        if let Some(ref path) = self.output_file {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open output file: {}", path.display()))?;
            writeln!(file, "{json}")?;
        }
        Ok(())
    }
}

impl Reporter for JsonlReporter {
    fn job_finished(&self, job: &Job, outcome: &JobOutcome) {
        let event = ReportEvent {
            event_type: "job_finished",
            timestamp: Utc::now(),
            job_id: Some(&job.id),
            details: serde_json::json!({
                "status": outcome.status,
                "duration_secs": outcome.duration_secs,
                "log_reference": outcome.log_reference,
                "attempts": job.attempt_count,
            }),
        };
        if let Err(e) = self.emit(&event) {
            warn!(error = %e, "Failed to emit job event");
        }
    }

    fn session_complete(&self, summary: &RunSummary) {
        let event = ReportEvent {
            event_type: "session_complete",
            timestamp: Utc::now(),
            job_id: None,
            details: serde_json::to_value(summary).unwrap_or_default(),
        };
        if let Err(e) = self.emit(&event) {
            warn!(error = %e, "Failed to emit session summary");
        }
    }
}
