//! Category-keyed mitigations.
//!
//! One table, two call sites: the recovery controller runs a mitigation
//! before retrying a failed job, and the resource governor runs the same
//! mitigation as a soft response to a threshold violation. Mitigations
//! are idempotent and best-effort; individual action failures are logged
//! and swallowed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::classify::FailureCategory;
use crate::config::OrchestratorConfig;
use crate::docker::ContainerRuntime;

/// Shared multiplier applied to every outstanding job timeout.
///
/// Stored as a percentage so it fits an atomic; starts at 100 and the
/// TIMEOUT mitigation scales it upward.
#[derive(Debug, Clone)]
pub struct TimeoutScale(Arc<AtomicU64>);

impl TimeoutScale {
    const STEP_PCT: u64 = 50;
    const MAX_PCT: u64 = 400;

    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(100)))
    }

    /// Current multiplier as a percentage.
    #[must_use]
    pub fn percent(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Scale all outstanding timeouts upward, capped.
    pub fn scale_up(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + Self::STEP_PCT).min(Self::MAX_PCT))
            });
    }

    /// Apply the multiplier to a base duration.
    #[must_use]
    pub fn apply(&self, base: Duration) -> Duration {
        base.mul_f64(self.percent() as f64 / 100.0)
    }
}

impl Default for TimeoutScale {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the mitigation actions for a failure category.
pub struct Mitigator {
    runtime: Arc<dyn ContainerRuntime>,
    session_tag: String,
    build_dir: PathBuf,
    log_dir: PathBuf,
    timeout_scale: TimeoutScale,
}

impl Mitigator {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &OrchestratorConfig,
        session_tag: impl Into<String>,
        timeout_scale: TimeoutScale,
    ) -> Self {
        Self {
            runtime,
            session_tag: session_tag.into(),
            build_dir: config.build_dir.clone(),
            log_dir: config.log_dir.clone(),
            timeout_scale,
        }
    }

    /// Apply the mitigation for a category. Returns the identifiers of
    /// the actions that were applied.
    pub async fn apply(&self, category: FailureCategory) -> Vec<String> {
        let actions = category.recovery_actions();
        info!(category = %category, actions = ?actions, "Applying mitigation");

        for action in actions {
            match *action {
                "scale_timeouts" => self.timeout_scale.scale_up(),
                "clear_build_dir" => self.clear_build_dir(),
                "reset_networks" => {
                    if let Err(e) = self.runtime.prune_networks().await {
                        warn!(error = %e, "Network prune failed");
                    }
                }
                "prune_system" => {
                    if let Err(e) = self.runtime.system_prune().await {
                        warn!(error = %e, "System prune failed");
                    }
                }
                "purge_old_logs" => self.purge_old_logs(),
                "remove_exited_containers" => {
                    match self.runtime.remove_exited(&self.session_tag).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed = %removed, "Removed exited session containers");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Removing exited containers failed"),
                    }
                }
                "diagnostic_only" => {
                    info!(
                        category = %category,
                        description = %category.description(),
                        "No automated mitigation; operator attention required"
                    );
                }
                other => warn!(action = %other, "Unknown mitigation action"),
            }
        }

        actions.iter().map(|a| (*a).to_string()).collect()
    }

    fn clear_build_dir(&self) {
        if !self.build_dir.exists() {
            return;
        }
        match std::fs::remove_dir_all(&self.build_dir) {
            Ok(()) => info!(dir = %self.build_dir.display(), "Discarded build output"),
            Err(e) => warn!(
                dir = %self.build_dir.display(),
                error = %e,
                "Failed to discard build output"
            ),
        }
    }

    /// Delete job logs older than one day.
    fn purge_old_logs(&self) {
        let cutoff = std::time::SystemTime::now() - Duration::from_secs(24 * 60 * 60);
        let Ok(entries) = std::fs::read_dir(&self.log_dir) else {
            return;
        };
        let mut purged = 0u32;
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged = %purged, "Purged logs older than one day");
        }
    }
}
