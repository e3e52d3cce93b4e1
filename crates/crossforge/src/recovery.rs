//! Retry-with-recovery for failed jobs.
//!
//! Each failed attempt is classified, its category mitigation applied,
//! and the job retried with a linearly scaled timeout, bounded by the
//! configured attempt budget. All mutable run-wide counters live in the
//! [`RecoverySession`] aggregate rather than ambient state.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::classify::{classify, FailureCategory};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::executor::{JobExecutor, JobOutcome};
use crate::matrix::{Job, JobStatus};
use crate::mitigate::{Mitigator, TimeoutScale};
use crate::resources::ResourceRegistry;
use crate::store::SessionStore;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    PartialResultsCollected,
    RetryCompleted,
}

/// Run-wide mutable state, persisted so a crash mid-run can resume
/// partial-result collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub id: String,
    pub status: SessionStatus,
    pub failed_job_ids: BTreeSet<String>,
    /// Attempt counter per job id
    pub retry_attempts: BTreeMap<String, u32>,
    /// Consecutive violating resource samples; reset on any clean sample
    pub violation_streak: u32,
    pub started_at: DateTime<Utc>,
}

impl RecoverySession {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Initialized,
            failed_job_ids: BTreeSet::new(),
            retry_attempts: BTreeMap::new(),
            violation_streak: 0,
            started_at: Utc::now(),
        }
    }
}

/// One classified failure. Append-only; a job accumulates one record per
/// failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: String,
    pub category: FailureCategory,
    pub raw_message: String,
    pub timestamp: DateTime<Utc>,
    pub recovery_actions_applied: Vec<String>,
}

/// Drives jobs through the execute/classify/mitigate/retry loop.
pub struct RecoveryController {
    executor: JobExecutor,
    mitigator: Arc<Mitigator>,
    store: SessionStore,
    registry: Arc<ResourceRegistry>,
    session: Arc<Mutex<RecoverySession>>,
    timeout_scale: TimeoutScale,
    /// Cumulative failure count per category, for the fatal threshold
    category_counts: Arc<Mutex<BTreeMap<FailureCategory, u32>>>,
    max_retries: u32,
    retry_delay: Duration,
    error_threshold: u32,
}

impl RecoveryController {
    #[must_use]
    pub fn new(
        config: &OrchestratorConfig,
        executor: JobExecutor,
        mitigator: Arc<Mitigator>,
        store: SessionStore,
        registry: Arc<ResourceRegistry>,
        session: Arc<Mutex<RecoverySession>>,
        timeout_scale: TimeoutScale,
    ) -> Self {
        Self {
            executor,
            mitigator,
            store,
            registry,
            session,
            timeout_scale,
            category_counts: Arc::new(Mutex::new(BTreeMap::new())),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            error_threshold: config.error_threshold,
        }
    }

    /// Run one job to a terminal status, retrying with mitigation.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::ErrorThresholdExceeded` (fatal to the
    /// run) when one category accumulates too many failures; infra
    /// errors (unspawnable command, unwritable log dir) also propagate.
    pub async fn run_job(&self, mut job: Job) -> Result<(Job, JobOutcome)> {
        let base_timeout = Duration::from_secs(job.timeout_secs);
        job.mark_started();

        loop {
            job.attempt_count += 1;
            let attempt = job.attempt_count;

            // Linear backoff: attempt n runs under n * base, then the
            // run-wide scale from any TIMEOUT mitigations on top.
            let timeout = self.timeout_scale.apply(base_timeout * attempt);

            {
                let mut session = self.session.lock().await;
                *session.retry_attempts.entry(job.id.clone()).or_insert(0) = attempt;
            }

            let outcome = self
                .executor
                .execute(&job, attempt, timeout, &self.registry)
                .await?;
            job.log_reference = Some(outcome.log_reference.clone());

            if outcome.passed() {
                job.finish(JobStatus::Passed);
                let mut session = self.session.lock().await;
                session.failed_job_ids.remove(&job.id);
                self.store.save_session(&session)?;
                return Ok((job, outcome));
            }

            let category = classify(&outcome.message);
            warn!(
                job = %job.id,
                attempt = %attempt,
                category = %category,
                message = %outcome.message,
                "Job attempt failed"
            );

            let can_retry = attempt < self.max_retries;
            let actions = if can_retry {
                self.mitigator.apply(category).await
            } else {
                Vec::new()
            };

            self.record_failure(&job.id, category, &outcome.message, actions)?;
            self.check_threshold(category).await?;

            if !can_retry {
                error!(
                    job = %job.id,
                    attempts = %attempt,
                    category = %category,
                    description = %category.description(),
                    remediations = ?category.remediations(),
                    "Job terminally failed"
                );
                job.finish(outcome.status);
                let mut session = self.session.lock().await;
                session.failed_job_ids.insert(job.id.clone());
                self.store.save_session(&session)?;
                return Ok((job, outcome));
            }

            info!(
                job = %job.id,
                next_attempt = %(attempt + 1),
                delay_secs = %self.retry_delay.as_secs(),
                "Retrying after mitigation"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    fn record_failure(
        &self,
        job_id: &str,
        category: FailureCategory,
        message: &str,
        actions: Vec<String>,
    ) -> Result<()> {
        self.store.record_failure(&FailureRecord {
            job_id: job_id.to_string(),
            category,
            raw_message: message.to_string(),
            timestamp: Utc::now(),
            recovery_actions_applied: actions,
        })
    }

    /// Fatal when any category's cumulative count exceeds the threshold.
    async fn check_threshold(&self, category: FailureCategory) -> Result<()> {
        let mut counts = self.category_counts.lock().await;
        let count = counts.entry(category).or_insert(0);
        *count += 1;
        if *count > self.error_threshold {
            return Err(OrchestratorError::ErrorThresholdExceeded {
                category,
                count: *count,
                threshold: self.error_threshold,
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::test_support::FakeRuntime;
    use crate::matrix::plan;
    use std::path::Path;

    fn test_config(dir: &Path, command: Vec<String>) -> OrchestratorConfig {
        let mut config: OrchestratorConfig = serde_json::from_str(
            r#"{"platforms": [{"name": "linux", "architectures": ["amd64"]}]}"#,
        )
        .unwrap();
        config.log_dir = dir.join("logs");
        config.state_dir = dir.join("state");
        config.build_dir = dir.join("dist");
        config.build_command = command;
        config.retry_delay_secs = 0;
        config.default_timeout_secs = 10;
        config
    }

    fn controller(config: &OrchestratorConfig) -> (RecoveryController, SessionStore) {
        let runtime = Arc::new(FakeRuntime::default());
        let scale = TimeoutScale::new();
        let executor = JobExecutor::new(config, "session=t");
        let mitigator = Arc::new(Mitigator::new(
            runtime,
            config,
            "session=t",
            scale.clone(),
        ));
        let store = SessionStore::open(&config.state_dir).unwrap();
        let session = Arc::new(Mutex::new(RecoverySession::new("session=t")));
        (
            RecoveryController::new(
                config,
                executor,
                mitigator,
                store.clone(),
                Arc::new(ResourceRegistry::new("session=t")),
                session,
                scale,
            ),
            store,
        )
    }

    #[tokio::test]
    async fn test_passing_job_single_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), vec!["true".to_string()]);
        let (controller, store) = controller(&config);
        let job = plan(&config).remove(0);

        let (job, outcome) = controller.run_job(job).await.unwrap();
        assert_eq!(job.status, JobStatus::Passed);
        assert_eq!(job.attempt_count, 1);
        assert!(outcome.passed());
        assert!(store.load_failures().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_always_failing_job_stops_at_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "echo dns error >&2; exit 1".to_string()],
        );
        let (controller, store) = controller(&config);
        let job = plan(&config).remove(0);

        let (job, _) = controller.run_job(job).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        // max_retries = 3: exactly 3 attempts, no 4th
        assert_eq!(job.attempt_count, 3);
        assert!(job.attempt_count <= config.max_retries + 1);

        // Exactly one failure record per failed attempt
        let records = store.load_failures().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.category == FailureCategory::Network));
        // Retries had mitigation applied, the terminal attempt did not
        assert_eq!(records[0].recovery_actions_applied, vec!["reset_networks"]);
        assert!(records[2].recovery_actions_applied.is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_lands_in_session_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        );
        let (controller, _) = controller(&config);
        let job = plan(&config).remove(0);
        let job_id = job.id.clone();

        controller.run_job(job).await.unwrap();
        let session = controller.session.lock().await;
        assert!(session.failed_job_ids.contains(&job_id));
        assert_eq!(session.retry_attempts.get(&job_id), Some(&3));
    }

    #[tokio::test]
    async fn test_error_threshold_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "echo dns error >&2; exit 1".to_string()],
        );
        config.error_threshold = 2;
        let (controller, _) = controller(&config);

        // First job burns 3 NETWORK failures; the threshold (2) trips
        // during its retries.
        let job = plan(&config).remove(0);
        let err = controller.run_job(job).await.unwrap_err();
        let orchestration = err.downcast_ref::<OrchestratorError>().unwrap();
        assert!(matches!(
            orchestration,
            OrchestratorError::ErrorThresholdExceeded {
                category: FailureCategory::Network,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_terminal_state_survives_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        );
        let (controller, _) = controller(&config);
        let job = plan(&config).remove(0);
        let job_id = job.id.clone();

        controller.run_job(job).await.unwrap();

        // A fresh store handle (as after a crash) sees the terminal state
        let reopened = SessionStore::open(&config.state_dir).unwrap();
        let session = reopened.load_session().unwrap().unwrap();
        assert!(session.failed_job_ids.contains(&job_id));
        assert_eq!(session.retry_attempts.get(&job_id), Some(&3));
    }

    #[tokio::test]
    async fn test_timeout_failures_classify_as_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(
            dir.path(),
            vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
        );
        config.default_timeout_secs = 1;
        config.max_retries = 1;
        let (controller, store) = controller(&config);
        let job = plan(&config).remove(0);

        let (job, outcome) = controller.run_job(job).await.unwrap();
        assert_eq!(job.status, JobStatus::TimedOut);
        assert_eq!(outcome.message, "operation timed out after 1s");

        let records = store.load_failures().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, FailureCategory::Timeout);
    }
}
