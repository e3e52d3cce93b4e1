//! Failure classification.
//!
//! Maps a free-text failure message to a fixed category via an ordered
//! rule table. Classification is a pure function so call sites never
//! carry their own pattern matching.

use serde::{Deserialize, Serialize};

/// Failure category, in rule priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    Build,
    Network,
    Resource,
    Docker,
    Permission,
    Dependency,
    Config,
    Validation,
    Unknown,
}

/// Ordered rule table. Evaluated top to bottom, first match wins.
const RULES: &[(FailureCategory, &[&str])] = &[
    (FailureCategory::Timeout, &["timeout", "timed out"]),
    (FailureCategory::Build, &["build failed", "compilation"]),
    (FailureCategory::Network, &["network", "connection", "dns"]),
    (FailureCategory::Resource, &["memory", "disk", "resource"]),
    (FailureCategory::Docker, &["docker", "container"]),
    (FailureCategory::Permission, &["permission", "access denied"]),
    (FailureCategory::Dependency, &["not found", "missing"]),
    (FailureCategory::Config, &["config", "invalid"]),
    (FailureCategory::Validation, &["validation", "format"]),
];

/// Classify a failure message into a category.
///
/// Matching is case-insensitive substring search against the rule table.
#[must_use]
pub fn classify(message: &str) -> FailureCategory {
    let lowered = message.to_lowercase();
    for (category, patterns) in RULES {
        if patterns.iter().any(|p| lowered.contains(p)) {
            return *category;
        }
    }
    FailureCategory::Unknown
}

impl FailureCategory {
    /// Human-readable description, always shown alongside the raw message.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Timeout => "Operation exceeded its time limit",
            Self::Build => "Build or compilation failure",
            Self::Network => "Network connectivity problem",
            Self::Resource => "Host resource exhaustion (memory/disk)",
            Self::Docker => "Container runtime failure",
            Self::Permission => "Permission or access problem",
            Self::Dependency => "Missing tool or dependency",
            Self::Config => "Configuration problem",
            Self::Validation => "Output validation or format problem",
            Self::Unknown => "Unclassified failure",
        }
    }

    /// Recommended remediation steps for operators.
    #[must_use]
    pub fn remediations(self) -> &'static [&'static str] {
        match self {
            Self::Timeout => &[
                "Increase the job timeout in crossforge.json",
                "Check for hung container processes",
            ],
            Self::Build => &[
                "Inspect the job log for compiler errors",
                "Clear the build output directory and rebuild",
            ],
            Self::Network => &[
                "Verify DNS resolution and proxy settings",
                "Reset the container runtime network state",
            ],
            Self::Resource => &[
                "Free disk space or memory on the host",
                "Prune unused container runtime resources",
            ],
            Self::Docker => &[
                "Check that the container runtime daemon is running",
                "Remove exited containers from previous sessions",
            ],
            Self::Permission => &[
                "Check file ownership in the workspace",
                "Verify the runtime socket is accessible",
            ],
            Self::Dependency => &[
                "Install the missing tool on the host or image",
                "Check PATH inside the build container",
            ],
            Self::Config => &[
                "Validate crossforge.json against the documented schema",
            ],
            Self::Validation => &[
                "Inspect the artifact output format",
                "Re-run the suite with verbose logging",
            ],
            Self::Unknown => &["Inspect the job log for the root cause"],
        }
    }

    /// Ordered recovery-action identifiers applied before a retry.
    ///
    /// Static configuration shared by the recovery controller and the
    /// resource governor's soft-mitigation path.
    #[must_use]
    pub fn recovery_actions(self) -> &'static [&'static str] {
        match self {
            Self::Timeout => &["scale_timeouts"],
            Self::Build => &["clear_build_dir"],
            Self::Network => &["reset_networks"],
            Self::Resource => &["prune_system", "purge_old_logs"],
            Self::Docker => &["remove_exited_containers", "prune_system"],
            Self::Permission
            | Self::Config
            | Self::Dependency
            | Self::Validation
            | Self::Unknown => &["diagnostic_only"],
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "TIMEOUT",
            Self::Build => "BUILD",
            Self::Network => "NETWORK",
            Self::Resource => "RESOURCE",
            Self::Docker => "DOCKER",
            Self::Permission => "PERMISSION",
            Self::Dependency => "DEPENDENCY",
            Self::Config => "CONFIG",
            Self::Validation => "VALIDATION",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{name}")
    }
}
