//! Orchestration-level fatal errors.

use thiserror::Error;

use crate::classify::FailureCategory;

/// Errors that abort the whole run rather than a single job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Session-tagged resources survived two teardown passes.
    #[error("cleanup verification failed: {remaining} session-tagged resources survived two teardown passes")]
    CleanupVerificationFailed { remaining: usize },

    /// Too many failures of one category across the run.
    #[error("error threshold exceeded: {count} {category} failures (threshold {threshold})")]
    ErrorThresholdExceeded {
        category: FailureCategory,
        count: u32,
        threshold: u32,
    },
}
