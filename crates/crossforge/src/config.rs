//! Orchestrator configuration.
//!
//! Loaded from a JSON file (`crossforge.json` by default) and deserialized
//! with defaults for every optional field, so a minimal config only needs
//! the platform list.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enabled target platforms, in execution order
    pub platforms: Vec<PlatformConfig>,
    /// Test suites to run against each built artifact
    #[serde(default)]
    pub suites: Vec<SuiteConfig>,
    /// Optional architecture filter; when set, only these architectures run
    #[serde(default)]
    pub architectures: Option<Vec<String>>,
    /// Global default job timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Maximum execution attempts per job
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts (seconds)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Run-wide fatal threshold for failures of a single category
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Launch all jobs as background tasks instead of sequentially
    #[serde(default)]
    pub parallel: bool,
    /// Global session timeout (seconds); `None` means unbounded
    #[serde(default)]
    pub session_timeout_secs: Option<u64>,
    /// Total budget for a cleanup pass (seconds)
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,
    /// Directory for session state and the failure log
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory for per-attempt job logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Build output directory, discarded by the BUILD mitigation
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// Build entry point: program plus fixed arguments
    #[serde(default = "default_build_command")]
    pub build_command: Vec<String>,
    /// Test entry point: program plus fixed arguments
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
    /// Resource governor settings
    #[serde(default)]
    pub governor: GovernorConfig,
}

/// One target platform and its supported architectures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Platform name (e.g. "linux", "windows")
    pub name: String,
    /// Architectures this platform supports, in execution order
    pub architectures: Vec<String>,
    /// Per-platform timeout override (seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Suite name (e.g. "smoke", "integration")
    pub name: String,
    /// Per-suite timeout override (seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Resource governor thresholds and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Sampling interval (seconds)
    #[serde(default = "default_governor_interval_secs")]
    pub interval_secs: u64,
    /// CPU usage limit (percent)
    #[serde(default = "default_cpu_limit_pct")]
    pub cpu_limit_pct: f64,
    /// Memory usage limit (percent)
    #[serde(default = "default_mem_limit_pct")]
    pub mem_limit_pct: f64,
    /// Disk usage limit (percent)
    #[serde(default = "default_disk_limit_pct")]
    pub disk_limit_pct: f64,
    /// Maximum session-tagged containers
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,
    /// Maximum session-tagged networks
    #[serde(default = "default_max_networks")]
    pub max_networks: u32,
    /// Maximum session-tagged volumes
    #[serde(default = "default_max_volumes")]
    pub max_volumes: u32,
    /// Consecutive violating samples before emergency cleanup
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_governor_interval_secs(),
            cpu_limit_pct: default_cpu_limit_pct(),
            mem_limit_pct: default_mem_limit_pct(),
            disk_limit_pct: default_disk_limit_pct(),
            max_containers: default_max_containers(),
            max_networks: default_max_networks(),
            max_volumes: default_max_volumes(),
            max_violations: default_max_violations(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_error_threshold() -> u32 {
    5
}

fn default_cleanup_timeout_secs() -> u64 {
    60
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".crossforge/state")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".crossforge/logs")
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_build_command() -> Vec<String> {
    vec!["./scripts/build.sh".to_string()]
}

fn default_test_command() -> Vec<String> {
    vec!["./scripts/test.sh".to_string()]
}

fn default_governor_interval_secs() -> u64 {
    10
}

fn default_cpu_limit_pct() -> f64 {
    80.0
}

fn default_mem_limit_pct() -> f64 {
    85.0
}

fn default_disk_limit_pct() -> f64 {
    90.0
}

fn default_max_containers() -> u32 {
    20
}

fn default_max_networks() -> u32 {
    10
}

fn default_max_volumes() -> u32 {
    20
}

fn default_max_violations() -> u32 {
    5
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<()> {
        if self.platforms.is_empty() {
            anyhow::bail!("config must declare at least one platform");
        }
        for platform in &self.platforms {
            if platform.architectures.is_empty() {
                anyhow::bail!(
                    "platform '{}' declares no supported architectures",
                    platform.name
                );
            }
        }
        if self.default_timeout_secs == 0 {
            anyhow::bail!("default_timeout_secs must be positive");
        }
        Ok(())
    }
}
