//! Job model and matrix planning.
//!
//! Expands the configured platforms, architectures and suites into a
//! deterministic, ordered list of jobs. Unsupported (platform, arch)
//! combinations are dropped with a warning, never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::config::OrchestratorConfig;

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Test,
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
    /// Reserved: never produced by the planner, which drops unsupported
    /// combinations outright. Persisted sessions from external tooling
    /// may carry it, and summaries tally it as non-failing.
    Skipped,
}

impl JobStatus {
    /// Terminal success states never transition back to `Pending`.
    #[must_use]
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Self::Passed | Self::Skipped)
    }
}

/// One unit of work in the matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Composite key: `{platform}-{arch}[-{suite}]-{kind}`
    pub id: String,
    /// Build or test
    pub kind: JobKind,
    /// Target platform name
    pub platform: String,
    /// Target architecture
    pub architecture: String,
    /// Suite name for test jobs
    pub suite: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Number of execution attempts so far
    pub attempt_count: u32,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the final attempt ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Log file of the most recent attempt
    pub log_reference: Option<PathBuf>,
    /// Effective timeout (seconds), resolved at planning time
    pub timeout_secs: u64,
}

impl Job {
    fn new(
        kind: JobKind,
        platform: &str,
        architecture: &str,
        suite: Option<&str>,
        timeout_secs: u64,
    ) -> Self {
        let id = match (kind, suite) {
            (JobKind::Build, _) => format!("{platform}-{architecture}-build"),
            (JobKind::Test, Some(s)) => format!("{platform}-{architecture}-{s}-test"),
            (JobKind::Test, None) => format!("{platform}-{architecture}-test"),
        };
        Self {
            id,
            kind,
            platform: platform.to_string(),
            architecture: architecture.to_string(),
            suite: suite.map(String::from),
            status: JobStatus::Pending,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            log_reference: None,
            timeout_secs,
        }
    }

    /// Mark the job as started (first attempt only).
    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if !self.status.is_terminal_success() {
            self.status = JobStatus::Running;
        }
    }

    /// Record a terminal status with end timestamp.
    pub fn finish(&mut self, status: JobStatus) {
        self.ended_at = Some(Utc::now());
        self.status = status;
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}, timeout {}s)", self.id, self.status, self.timeout_secs)
    }
}

/// Expand the configured matrix into a concrete job list.
///
/// Ordering is deterministic: platform list order, then architecture list
/// order, then suite list order. When the suite list is empty each
/// (platform, arch) pair yields a single build job; otherwise each pair
/// yields one test job per suite.
#[must_use]
pub fn plan(config: &OrchestratorConfig) -> Vec<Job> {
    let mut jobs = Vec::new();

    for platform in &config.platforms {
        let selected: Vec<&String> = match &config.architectures {
            Some(filter) => filter.iter().collect(),
            None => platform.architectures.iter().collect(),
        };

        for arch in selected {
            if !platform.architectures.contains(arch) {
                warn!(
                    platform = %platform.name,
                    arch = %arch,
                    "Dropping unsupported platform/architecture combination"
                );
                continue;
            }

            if config.suites.is_empty() {
                let timeout = platform.timeout_secs.unwrap_or(config.default_timeout_secs);
                jobs.push(Job::new(JobKind::Build, &platform.name, arch, None, timeout));
            } else {
                for suite in &config.suites {
                    let timeout = suite
                        .timeout_secs
                        .or(platform.timeout_secs)
                        .unwrap_or(config.default_timeout_secs);
                    jobs.push(Job::new(
                        JobKind::Test,
                        &platform.name,
                        arch,
                        Some(&suite.name),
                        timeout,
                    ));
                }
            }
        }
    }

    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PlatformConfig, SuiteConfig};

    fn config_with(
        platforms: Vec<PlatformConfig>,
        suites: Vec<SuiteConfig>,
        arch_filter: Option<Vec<String>>,
    ) -> OrchestratorConfig {
        let mut config: OrchestratorConfig = serde_json::from_str(
            r#"{"platforms": [{"name": "placeholder", "architectures": ["x"]}]}"#,
        )
        .unwrap();
        config.platforms = platforms;
        config.suites = suites;
        config.architectures = arch_filter;
        config
    }

    fn platform(name: &str, archs: &[&str]) -> PlatformConfig {
        PlatformConfig {
            name: name.to_string(),
            architectures: archs.iter().map(|a| (*a).to_string()).collect(),
            timeout_secs: None,
        }
    }

    #[test]
    fn test_two_platforms_one_arch_one_suite() {
        let config = config_with(
            vec![platform("alpine", &["x86_64"]), platform("debian", &["x86_64"])],
            vec![SuiteConfig {
                name: "smoke".to_string(),
                timeout_secs: None,
            }],
            None,
        );

        let jobs = plan(&config);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].platform, "alpine");
        assert_eq!(jobs[0].architecture, "x86_64");
        assert_eq!(jobs[1].platform, "debian");
        assert_eq!(jobs[1].architecture, "x86_64");
        assert!(jobs.iter().all(|j| j.kind == JobKind::Test));
    }

    #[test]
    fn test_unsupported_arch_dropped_silently() {
        let config = config_with(
            vec![platform("linux", &["amd64"]), platform("freebsd", &["amd64", "arm64"])],
            vec![],
            Some(vec!["arm64".to_string()]),
        );

        // linux does not support arm64; only freebsd-arm64 survives
        let jobs = plan(&config);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "freebsd-arm64-build");
    }

    #[test]
    fn test_deterministic_ordering() {
        let config = config_with(
            vec![platform("a", &["x", "y"]), platform("b", &["x"])],
            vec![
                SuiteConfig { name: "s1".to_string(), timeout_secs: None },
                SuiteConfig { name: "s2".to_string(), timeout_secs: None },
            ],
            None,
        );

        let first = plan(&config);
        let second = plan(&config);
        let ids: Vec<&str> = first.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "a-x-s1-test",
                "a-x-s2-test",
                "a-y-s1-test",
                "a-y-s2-test",
                "b-x-s1-test",
                "b-x-s2-test",
            ]
        );
        assert_eq!(
            second.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(),
            ids
        );
    }

    #[test]
    fn test_effective_timeout_resolution() {
        let mut config = config_with(
            vec![PlatformConfig {
                name: "slowos".to_string(),
                architectures: vec!["amd64".to_string()],
                timeout_secs: Some(600),
            }],
            vec![
                SuiteConfig { name: "quick".to_string(), timeout_secs: Some(60) },
                SuiteConfig { name: "full".to_string(), timeout_secs: None },
            ],
            None,
        );
        config.default_timeout_secs = 300;

        let jobs = plan(&config);
        assert_eq!(jobs[0].timeout_secs, 60); // suite override wins
        assert_eq!(jobs[1].timeout_secs, 600); // platform override next

        config.platforms[0].timeout_secs = None;
        let jobs = plan(&config);
        assert_eq!(jobs[1].timeout_secs, 300); // global default last
    }

    #[test]
    fn test_terminal_status_never_reverts() {
        let mut job = Job::new(JobKind::Build, "linux", "amd64", None, 300);
        job.finish(JobStatus::Passed);
        job.mark_started();
        assert_eq!(job.status, JobStatus::Passed);
    }
}
