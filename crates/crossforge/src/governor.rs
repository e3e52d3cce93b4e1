//! Background resource governor.
//!
//! Samples host and runtime usage on a fixed interval, compares each
//! sample against six independent thresholds, applies the matching soft
//! mitigation on violation, and escalates to emergency cleanup after a
//! streak of violating samples. Modeled as a cancellable task with an
//! explicit stop acknowledgment so tests can start and stop it
//! deterministically.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::{Disks, System};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::FailureCategory;
use crate::config::GovernorConfig;
use crate::docker::ContainerRuntime;
use crate::mitigate::Mitigator;
use crate::recovery::RecoverySession;

/// One point-in-time usage sample. Immutable once taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub container_count: u32,
    pub network_count: u32,
    pub volume_count: u32,
}

/// A single threshold breach within a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    Cpu(f64),
    Memory(f64),
    Disk(f64),
    Containers(u32),
    Networks(u32),
    Volumes(u32),
}

impl Violation {
    /// The mitigation category this violation maps to.
    #[must_use]
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Cpu(_) | Self::Memory(_) | Self::Disk(_) | Self::Volumes(_) => {
                FailureCategory::Resource
            }
            Self::Containers(_) => FailureCategory::Docker,
            Self::Networks(_) => FailureCategory::Network,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu(pct) => write!(f, "cpu {pct:.1}%"),
            Self::Memory(pct) => write!(f, "memory {pct:.1}%"),
            Self::Disk(pct) => write!(f, "disk {pct:.1}%"),
            Self::Containers(n) => write!(f, "{n} containers"),
            Self::Networks(n) => write!(f, "{n} networks"),
            Self::Volumes(n) => write!(f, "{n} volumes"),
        }
    }
}

/// Compare a sample against the configured thresholds.
///
/// Pure so the escalation logic is testable without a host.
#[must_use]
pub fn check_sample(sample: &ResourceSample, config: &GovernorConfig) -> Vec<Violation> {
    let mut violations = Vec::new();
    if sample.cpu_pct > config.cpu_limit_pct {
        violations.push(Violation::Cpu(sample.cpu_pct));
    }
    if sample.mem_pct > config.mem_limit_pct {
        violations.push(Violation::Memory(sample.mem_pct));
    }
    if sample.disk_pct > config.disk_limit_pct {
        violations.push(Violation::Disk(sample.disk_pct));
    }
    if sample.container_count > config.max_containers {
        violations.push(Violation::Containers(sample.container_count));
    }
    if sample.network_count > config.max_networks {
        violations.push(Violation::Networks(sample.network_count));
    }
    if sample.volume_count > config.max_volumes {
        violations.push(Violation::Volumes(sample.volume_count));
    }
    violations
}

/// Source of resource samples, separated out so tests can feed a
/// deterministic stream.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn sample(&self) -> Result<ResourceSample>;
}

/// Production source: host metrics via sysinfo plus runtime counts for
/// the session.
pub struct HostMetrics {
    runtime: Arc<dyn ContainerRuntime>,
    session_tag: String,
    system: Mutex<System>,
}

impl HostMetrics {
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, session_tag: impl Into<String>) -> Self {
        Self {
            runtime,
            session_tag: session_tag.into(),
            system: Mutex::new(System::new_all()),
        }
    }
}

#[async_trait]
impl MetricSource for HostMetrics {
    async fn sample(&self) -> Result<ResourceSample> {
        let (cpu_pct, mem_pct) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = f64::from(system.global_cpu_usage());
            let mem = if system.total_memory() == 0 {
                0.0
            } else {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            };
            (cpu, mem)
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
        let disk_pct = if total == 0 {
            0.0
        } else {
            (total - available) as f64 / total as f64 * 100.0
        };

        let container_count = self.runtime.list_containers(&self.session_tag).await?.len() as u32;
        let network_count = self.runtime.list_networks(&self.session_tag).await?.len() as u32;
        let volume_count = self.runtime.list_volumes(&self.session_tag).await?.len() as u32;

        Ok(ResourceSample {
            timestamp: Utc::now(),
            cpu_pct,
            mem_pct,
            disk_pct,
            container_count,
            network_count,
            volume_count,
        })
    }
}

/// The governor loop and its escalation state.
pub struct ResourceGovernor {
    config: GovernorConfig,
    source: Arc<dyn MetricSource>,
    mitigator: Arc<Mitigator>,
    session: Arc<Mutex<RecoverySession>>,
    /// Receiver side is serviced by the orchestrator, which runs the
    /// cleanup coordinator's emergency path
    emergency_tx: mpsc::Sender<()>,
    /// Time-ordered sample history for the session summary
    samples: Mutex<Vec<ResourceSample>>,
}

impl ResourceGovernor {
    #[must_use]
    pub fn new(
        config: GovernorConfig,
        source: Arc<dyn MetricSource>,
        mitigator: Arc<Mitigator>,
        session: Arc<Mutex<RecoverySession>>,
        emergency_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            config,
            source,
            mitigator,
            session,
            emergency_tx,
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Run until cancelled. Acknowledges the stop within one interval
    /// because the sleep races the token.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_secs = %self.config.interval_secs,
            max_violations = %self.config.max_violations,
            "Resource governor started"
        );
        let interval = std::time::Duration::from_secs(self.config.interval_secs);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("Resource governor stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Governor tick failed");
                    }
                }
            }
        }
    }

    /// Take one sample and apply the threshold/escalation rules.
    pub async fn tick(&self) -> Result<()> {
        let sample = self.source.sample().await?;
        let violations = check_sample(&sample, &self.config);
        self.samples.lock().await.push(sample.clone());

        if violations.is_empty() {
            let mut session = self.session.lock().await;
            if session.violation_streak > 0 {
                debug!("Clean sample; violation streak reset");
            }
            session.violation_streak = 0;
            return Ok(());
        }

        let streak = {
            let mut session = self.session.lock().await;
            session.violation_streak += 1;
            session.violation_streak
        };

        warn!(
            streak = %streak,
            violations = %violations.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Resource thresholds exceeded"
        );

        // Soft mitigation for the first (most severe by table order)
        // violation; same table the recovery controller uses.
        if let Some(violation) = violations.first() {
            self.mitigator.apply(violation.category()).await;
        }

        if streak >= self.config.max_violations {
            warn!(streak = %streak, "Violation streak limit hit; requesting emergency cleanup");
            if self.emergency_tx.send(()).await.is_err() {
                warn!("Emergency cleanup channel closed");
            }
            self.session.lock().await.violation_streak = 0;
        }

        Ok(())
    }

    /// All samples taken so far, oldest first.
    pub async fn samples(&self) -> Vec<ResourceSample> {
        self.samples.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::docker::test_support::FakeRuntime;
    use crate::mitigate::TimeoutScale;
    use std::collections::VecDeque;

    struct ScriptedMetrics {
        samples: std::sync::Mutex<VecDeque<ResourceSample>>,
    }

    impl ScriptedMetrics {
        fn new(samples: Vec<ResourceSample>) -> Self {
            Self {
                samples: std::sync::Mutex::new(samples.into()),
            }
        }
    }

    #[async_trait]
    impl MetricSource for ScriptedMetrics {
        async fn sample(&self) -> Result<ResourceSample> {
            self.samples
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    fn sample(cpu_pct: f64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now(),
            cpu_pct,
            mem_pct: 10.0,
            disk_pct: 10.0,
            container_count: 0,
            network_count: 0,
            volume_count: 0,
        }
    }

    fn governor_with(
        samples: Vec<ResourceSample>,
    ) -> (ResourceGovernor, mpsc::Receiver<()>, Arc<Mutex<RecoverySession>>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let mut orch_config: OrchestratorConfig = serde_json::from_str(
            r#"{"platforms": [{"name": "linux", "architectures": ["amd64"]}]}"#,
        )
        .unwrap();
        orch_config.build_dir = dir.path().join("dist");
        orch_config.log_dir = dir.path().join("logs");

        let runtime = Arc::new(FakeRuntime::default());
        let mitigator = Arc::new(Mitigator::new(
            runtime,
            &orch_config,
            "session=t",
            TimeoutScale::new(),
        ));
        let session = Arc::new(Mutex::new(RecoverySession::new("session=t")));
        let (tx, rx) = mpsc::channel(4);
        let governor = ResourceGovernor::new(
            orch_config.governor.clone(),
            Arc::new(ScriptedMetrics::new(samples)),
            mitigator,
            session.clone(),
            tx,
        );
        (governor, rx, session, dir)
    }

    #[test]
    fn test_check_sample_all_six_thresholds() {
        let config = GovernorConfig::default();
        let clean = sample(10.0);
        assert!(check_sample(&clean, &config).is_empty());

        let hot = ResourceSample {
            timestamp: Utc::now(),
            cpu_pct: 95.0,
            mem_pct: 95.0,
            disk_pct: 95.0,
            container_count: 100,
            network_count: 100,
            volume_count: 100,
        };
        let violations = check_sample(&hot, &config);
        assert_eq!(violations.len(), 6);
    }

    #[tokio::test]
    async fn test_five_hot_samples_fire_exactly_one_emergency() {
        // CPU_LIMIT = 80, MAX_VIOLATIONS = 5
        let (governor, mut rx, session, _dir) =
            governor_with((0..5).map(|_| sample(90.0)).collect());

        for _ in 0..5 {
            governor.tick().await.unwrap();
        }

        assert!(rx.try_recv().is_ok(), "expected one emergency invocation");
        assert!(rx.try_recv().is_err(), "expected exactly one invocation");
        // Streak resets to 0 immediately after escalation
        assert_eq!(session.lock().await.violation_streak, 0);
    }

    #[tokio::test]
    async fn test_clean_sample_resets_streak() {
        let mut script: Vec<ResourceSample> = (0..4).map(|_| sample(90.0)).collect();
        script.push(sample(10.0));
        script.push(sample(90.0));
        let (governor, mut rx, session, _dir) = governor_with(script);

        for _ in 0..4 {
            governor.tick().await.unwrap();
        }
        assert_eq!(session.lock().await.violation_streak, 4);

        // One clean sample resets unconditionally
        governor.tick().await.unwrap();
        assert_eq!(session.lock().await.violation_streak, 0);

        // The next violation starts a fresh streak; no emergency fired
        governor.tick().await.unwrap();
        assert_eq!(session.lock().await.violation_streak, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_acknowledged_within_one_interval() {
        let (governor, _rx, _session, _dir) = governor_with(vec![]);
        let token = CancellationToken::new();
        let stop_token = token.clone();

        let run = governor.run(stop_token);
        token.cancel();
        // Already-cancelled token: run() must return promptly
        tokio::time::timeout(std::time::Duration::from_secs(1), run)
            .await
            .expect("governor did not acknowledge stop");
    }

    #[tokio::test]
    async fn test_samples_are_recorded_in_order() {
        let (governor, _rx, _session, _dir) =
            governor_with(vec![sample(10.0), sample(20.0), sample(30.0)]);
        for _ in 0..3 {
            governor.tick().await.unwrap();
        }
        let samples = governor.samples().await;
        assert_eq!(samples.len(), 3);
        assert!((samples[0].cpu_pct - 10.0).abs() < f64::EPSILON);
        assert!((samples[2].cpu_pct - 30.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_host_metrics_counts_session_resources() {
        let mut mock = crate::docker::MockContainerRuntime::new();
        mock.expect_list_containers()
            .withf(|label| label == "session=t")
            .returning(|_| Ok(vec![FakeRuntime::container("c1", "running")]));
        mock.expect_list_networks()
            .returning(|_| Ok(vec!["n1".to_string(), "n2".to_string()]));
        mock.expect_list_volumes().returning(|_| Ok(Vec::new()));

        let metrics = HostMetrics::new(Arc::new(mock), "session=t");
        let sample = metrics.sample().await.unwrap();
        assert_eq!(sample.container_count, 1);
        assert_eq!(sample.network_count, 2);
        assert_eq!(sample.volume_count, 0);
        assert!(sample.cpu_pct >= 0.0);
        assert!(sample.mem_pct >= 0.0);
    }
}
