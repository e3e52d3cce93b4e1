//! Two-phase cleanup coordinator.
//!
//! Discovery enumerates every session-tagged resource and probes
//! container liveness; teardown runs graceful stop-then-kill unless a
//! resource is stuck or force mode is requested, in which case the
//! emergency path (kill, force-remove, system prune) runs directly.
//! Verification re-discovers and escalates once before reporting a
//! fatal cleanup error.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::docker::{is_missing_resource, ContainerRuntime};
use crate::error::OrchestratorError;
use crate::resources::{Liveness, ResourceHandle, ResourceKind, ResourceRegistry};

/// How long a single liveness probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// What a cleanup pass did.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub containers_removed: u32,
    pub networks_removed: u32,
    pub volumes_removed: u32,
    pub processes_killed: u32,
    /// Whether the emergency path ran
    pub emergency_used: bool,
    /// Whether verification had to escalate
    pub escalated: bool,
}

impl CleanupReport {
    #[must_use]
    pub fn total(&self) -> u32 {
        self.containers_removed + self.networks_removed + self.volumes_removed
            + self.processes_killed
    }
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cleaned up: {} containers, {} networks, {} volumes, {} processes{}",
            self.containers_removed,
            self.networks_removed,
            self.volumes_removed,
            self.processes_killed,
            if self.emergency_used { " (emergency path)" } else { "" }
        )
    }
}

/// Discovers, tears down and verifies removal of session resources.
pub struct CleanupCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ResourceRegistry>,
    cleanup_timeout: Duration,
}

impl CleanupCoordinator {
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ResourceRegistry>,
        cleanup_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            cleanup_timeout,
        }
    }

    /// Discovery phase: every session-tagged resource, with container
    /// liveness probed and runtime state recorded.
    pub async fn discover(&self) -> Result<Vec<ResourceHandle>> {
        let tag = self.registry.session_tag().to_string();
        let mut handles = Vec::new();

        for container in self.runtime.list_containers(&tag).await? {
            let mut handle = ResourceHandle::new(ResourceKind::Container, &container.id, &tag);
            handle.runtime_state = Some(container.state.clone());
            handle.liveness = if container.state == "running" {
                if self.runtime.probe_exec(&container.id, PROBE_TIMEOUT).await? {
                    Liveness::Healthy
                } else {
                    Liveness::Unresponsive
                }
            } else if container.state == "exited" || container.state == "created" {
                Liveness::Unknown
            } else {
                // restarting / dead / paused: probe to see if anything
                // answers at all
                if self.runtime.probe_exec(&container.id, PROBE_TIMEOUT).await? {
                    Liveness::Healthy
                } else {
                    Liveness::Unresponsive
                }
            };
            handles.push(handle);
        }

        for network in self.runtime.list_networks(&tag).await? {
            handles.push(ResourceHandle::new(ResourceKind::Network, network, &tag));
        }
        for volume in self.runtime.list_volumes(&tag).await? {
            handles.push(ResourceHandle::new(ResourceKind::Volume, volume, &tag));
        }
        handles.extend(self.registry.process_handles());

        debug!(count = %handles.len(), "Discovered session resources");
        Ok(handles)
    }

    /// Full cleanup pass: discover, tear down, verify, escalating once
    /// on verification failure.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::CleanupVerificationFailed` when
    /// resources survive two teardown passes.
    pub async fn run(&self, force: bool) -> Result<CleanupReport> {
        let handles = self.discover().await?;
        if handles.is_empty() {
            info!("No session resources to clean up");
            return Ok(CleanupReport::default());
        }

        let stuck: Vec<&ResourceHandle> = handles.iter().filter(|h| h.is_stuck()).collect();
        let mut report = CleanupReport::default();

        if force || !stuck.is_empty() {
            if !stuck.is_empty() {
                warn!(
                    stuck = %stuck.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                    "Stuck resources detected; bypassing graceful teardown"
                );
            }
            self.emergency(&handles, &mut report).await;
        } else {
            // Graceful path runs under a watchdog of half the cleanup
            // budget; overrun escalates to the emergency path.
            let graceful_budget = self.cleanup_timeout / 2;
            let graceful = tokio::time::timeout(
                graceful_budget,
                self.graceful(&handles, &mut report),
            )
            .await;
            if graceful.is_err() {
                warn!(
                    budget_secs = %graceful_budget.as_secs(),
                    "Graceful teardown exceeded its deadline; escalating"
                );
                self.emergency(&handles, &mut report).await;
            }
        }

        // Verification: discovery must come back empty.
        let survivors = self.discover().await?;
        if survivors.is_empty() {
            self.registry.clear_processes();
            info!(%report, "Cleanup verified");
            return Ok(report);
        }

        warn!(
            survivors = %survivors.len(),
            "Cleanup verification failed; escalating to emergency path"
        );
        report.escalated = true;
        self.emergency(&survivors, &mut report).await;

        let survivors = self.discover().await?;
        if survivors.is_empty() {
            self.registry.clear_processes();
            info!(%report, "Cleanup verified after escalation");
            return Ok(report);
        }

        Err(OrchestratorError::CleanupVerificationFailed {
            remaining: survivors.len(),
        }
        .into())
    }

    /// Emergency path: kill and force-remove everything, then prune.
    pub async fn emergency_pass(&self) -> Result<CleanupReport> {
        let handles = self.discover().await?;
        let mut report = CleanupReport::default();
        self.emergency(&handles, &mut report).await;
        Ok(report)
    }

    /// Graceful teardown: stop containers with a deadline, kill
    /// survivors, then remove everything.
    async fn graceful(&self, handles: &[ResourceHandle], report: &mut CleanupReport) {
        let stop_wait = (self.cleanup_timeout.as_secs() / 4).max(1);

        for handle in handles.iter().filter(|h| h.kind == ResourceKind::Container) {
            if handle.runtime_state.as_deref() == Some("running") {
                if let Err(e) = self
                    .runtime
                    .stop_container(&handle.external_id, stop_wait)
                    .await
                {
                    if !is_missing_resource(&e) {
                        warn!(container = %handle.external_id, error = %e, "Graceful stop failed");
                    }
                }
            }
        }

        // Kill anything still running after the stop pass
        if let Ok(remaining) = self
            .runtime
            .list_containers(self.registry.session_tag())
            .await
        {
            for container in remaining.iter().filter(|c| c.state == "running") {
                warn!(container = %container.id, "Container survived graceful stop; killing");
                if let Err(e) = self.runtime.kill_container(&container.id).await {
                    if !is_missing_resource(&e) {
                        warn!(container = %container.id, error = %e, "Kill failed");
                    }
                }
            }
        }

        for handle in handles {
            match handle.kind {
                ResourceKind::Container => {
                    if self.remove_ok(
                        self.runtime.remove_container(&handle.external_id, false).await,
                        handle,
                    ) {
                        report.containers_removed += 1;
                    }
                }
                ResourceKind::Network => {
                    if self.remove_ok(
                        self.runtime.remove_network(&handle.external_id).await,
                        handle,
                    ) {
                        report.networks_removed += 1;
                    }
                }
                ResourceKind::Volume => {
                    if self.remove_ok(
                        self.runtime.remove_volume(&handle.external_id, false).await,
                        handle,
                    ) {
                        report.volumes_removed += 1;
                    }
                }
                ResourceKind::Process => {
                    if terminate_process(&handle.external_id, false) {
                        report.processes_killed += 1;
                    }
                }
            }
        }
    }

    /// Emergency teardown: no grace, force everything, prune the system.
    async fn emergency(&self, handles: &[ResourceHandle], report: &mut CleanupReport) {
        report.emergency_used = true;
        info!(count = %handles.len(), "Running emergency cleanup");

        for handle in handles {
            match handle.kind {
                ResourceKind::Container => {
                    let _ = self.runtime.kill_container(&handle.external_id).await;
                    if self.remove_ok(
                        self.runtime.remove_container(&handle.external_id, true).await,
                        handle,
                    ) {
                        report.containers_removed += 1;
                    }
                }
                ResourceKind::Network => {
                    if self.remove_ok(
                        self.runtime.remove_network(&handle.external_id).await,
                        handle,
                    ) {
                        report.networks_removed += 1;
                    }
                }
                ResourceKind::Volume => {
                    if self.remove_ok(
                        self.runtime.remove_volume(&handle.external_id, true).await,
                        handle,
                    ) {
                        report.volumes_removed += 1;
                    }
                }
                ResourceKind::Process => {
                    if terminate_process(&handle.external_id, true) {
                        report.processes_killed += 1;
                    }
                }
            }
        }

        if let Err(e) = self.runtime.system_prune().await {
            warn!(error = %e, "System prune failed");
        }
    }

    /// A handle vanishing between discovery and removal counts as
    /// removed.
    fn remove_ok(&self, result: Result<()>, handle: &ResourceHandle) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if is_missing_resource(&e) => {
                debug!(resource = %handle, "Already removed");
                true
            }
            Err(e) => {
                warn!(resource = %handle, error = %e, "Removal failed");
                false
            }
        }
    }
}

/// Signal a tracked process; TERM for graceful, KILL for emergency.
fn terminate_process(pid: &str, force: bool) -> bool {
    let mut cmd = std::process::Command::new("kill");
    if force {
        cmd.arg("-9");
    }
    cmd.arg(pid)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::test_support::{FakeRuntime, FakeState};

    fn coordinator(runtime: Arc<FakeRuntime>) -> CleanupCoordinator {
        CleanupCoordinator::new(
            runtime,
            Arc::new(ResourceRegistry::new("session=S")),
            Duration::from_secs(20),
        )
    }

    fn seeded_state() -> FakeState {
        let mut state = FakeState::default();
        state.containers.push(FakeRuntime::container("c1", "running"));
        state.containers.push(FakeRuntime::container("c2", "running"));
        state.containers.push(FakeRuntime::container("c3", "exited"));
        state.networks.insert("n1".to_string());
        state.volumes.insert("v1".to_string());
        state.volumes.insert("v2".to_string());
        state
    }

    #[tokio::test]
    async fn test_discovery_returns_all_session_handles() {
        let runtime = Arc::new(FakeRuntime::with_state(seeded_state()));
        let coordinator = coordinator(runtime);

        // 3 containers + 1 network + 2 volumes
        let handles = coordinator.discover().await.unwrap();
        assert_eq!(handles.len(), 6);
        assert_eq!(
            handles.iter().filter(|h| h.kind == ResourceKind::Container).count(),
            3
        );
        assert!(handles.iter().all(|h| h.session_tag == "session=S"));
    }

    #[tokio::test]
    async fn test_standard_pass_removes_everything_and_verifies() {
        let runtime = Arc::new(FakeRuntime::with_state(seeded_state()));
        let coordinator = coordinator(runtime.clone());

        let report = coordinator.run(false).await.unwrap();
        assert!(!report.emergency_used);
        assert_eq!(report.containers_removed, 3);
        assert_eq!(report.networks_removed, 1);
        assert_eq!(report.volumes_removed, 2);

        // Verification discovery comes back empty
        assert!(coordinator.discover().await.unwrap().is_empty());
        // Graceful path stopped the running containers before removal
        let state = runtime.state.lock().unwrap();
        assert_eq!(state.stops.len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::with_state(seeded_state()));
        let coordinator = coordinator(runtime);

        let first = coordinator.run(false).await.unwrap();
        assert!(first.total() > 0);

        // Second pass discovers zero resources and verifies trivially
        let second = coordinator.run(false).await.unwrap();
        assert_eq!(second.total(), 0);
        assert!(!second.emergency_used);
    }

    #[tokio::test]
    async fn test_restarting_unresponsive_container_goes_emergency() {
        let mut state = seeded_state();
        state.containers.push(FakeRuntime::container("stuck1", "restarting"));
        state.unresponsive.insert("stuck1".to_string());
        let runtime = Arc::new(FakeRuntime::with_state(state));
        let coordinator = coordinator(runtime.clone());

        // Classified stuck in discovery
        let handles = coordinator.discover().await.unwrap();
        let stuck = handles.iter().find(|h| h.external_id == "stuck1").unwrap();
        assert!(stuck.is_stuck());

        let report = coordinator.run(false).await.unwrap();
        assert!(report.emergency_used);

        // Graceful stop was skipped entirely; kills ran instead
        let state = runtime.state.lock().unwrap();
        assert!(state.stops.is_empty());
        assert!(!state.kills.is_empty());
        assert_eq!(state.prunes, 1);
    }

    #[tokio::test]
    async fn test_force_mode_skips_graceful() {
        let runtime = Arc::new(FakeRuntime::with_state(seeded_state()));
        let coordinator = coordinator(runtime.clone());

        let report = coordinator.run(true).await.unwrap();
        assert!(report.emergency_used);
        assert!(runtime.state.lock().unwrap().stops.is_empty());
    }

    #[tokio::test]
    async fn test_verification_failure_escalates_then_errors() {
        // A runtime whose removals never take effect: containers
        // survive every pass.
        struct StubbornRuntime(FakeRuntime);

        #[async_trait::async_trait]
        impl ContainerRuntime for StubbornRuntime {
            async fn list_containers(
                &self,
                label: &str,
            ) -> Result<Vec<crate::docker::ContainerInfo>> {
                self.0.list_containers(label).await
            }
            async fn list_networks(&self, label: &str) -> Result<Vec<String>> {
                self.0.list_networks(label).await
            }
            async fn list_volumes(&self, label: &str) -> Result<Vec<String>> {
                self.0.list_volumes(label).await
            }
            async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
                self.0.stop_container(id, timeout_secs).await
            }
            async fn kill_container(&self, id: &str) -> Result<()> {
                self.0.kill_container(id).await
            }
            async fn remove_container(&self, _id: &str, _force: bool) -> Result<()> {
                Ok(()) // claims success, removes nothing
            }
            async fn remove_network(&self, id: &str) -> Result<()> {
                self.0.remove_network(id).await
            }
            async fn remove_volume(&self, id: &str, force: bool) -> Result<()> {
                self.0.remove_volume(id, force).await
            }
            async fn probe_exec(&self, id: &str, timeout: Duration) -> Result<bool> {
                self.0.probe_exec(id, timeout).await
            }
            async fn remove_exited(&self, label: &str) -> Result<u32> {
                self.0.remove_exited(label).await
            }
            async fn prune_networks(&self) -> Result<()> {
                Ok(())
            }
            async fn system_prune(&self) -> Result<()> {
                Ok(())
            }
        }

        let mut state = FakeState::default();
        state.containers.push(FakeRuntime::container("undead", "running"));
        let runtime = Arc::new(StubbornRuntime(FakeRuntime::with_state(state)));
        let coordinator = CleanupCoordinator::new(
            runtime,
            Arc::new(ResourceRegistry::new("session=S")),
            Duration::from_secs(20),
        );

        let err = coordinator.run(false).await.unwrap_err();
        let orchestration = err.downcast_ref::<OrchestratorError>().unwrap();
        assert!(matches!(
            orchestration,
            OrchestratorError::CleanupVerificationFailed { remaining: 1 }
        ));
    }

    #[tokio::test]
    async fn test_vanished_handle_counts_as_removed() {
        let runtime = Arc::new(FakeRuntime::with_state(seeded_state()));
        let coordinator = coordinator(runtime.clone());

        let handles = coordinator.discover().await.unwrap();
        // Simulate another actor removing a container between discovery
        // and teardown
        runtime
            .state
            .lock()
            .unwrap()
            .containers
            .retain(|c| c.id != "c1");

        let mut report = CleanupReport::default();
        coordinator.graceful(&handles, &mut report).await;
        // FakeRuntime's remove is tolerant; the pass still accounts for
        // all three containers
        assert_eq!(report.containers_removed, 3);
    }
}
