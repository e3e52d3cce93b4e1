//! Resource handle registry.
//!
//! Typed identifiers for everything a session creates: containers,
//! networks, volumes and tracked child processes, all tagged with the
//! session label. Read by the governor and the cleanup coordinator;
//! mutated only during teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// What kind of resource a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    Network,
    Volume,
    Process,
}

/// Probed liveness of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Healthy,
    Unresponsive,
    Unknown,
}

/// A discovered, session-tagged resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    /// Runtime-assigned identifier (container id, network id, volume
    /// name, or pid)
    pub external_id: String,
    pub session_tag: String,
    pub discovered_at: DateTime<Utc>,
    pub liveness: Liveness,
    /// Runtime state string for containers ("running", "restarting", ...)
    pub runtime_state: Option<String>,
}

impl ResourceHandle {
    #[must_use]
    pub fn new(kind: ResourceKind, external_id: impl Into<String>, session_tag: &str) -> Self {
        Self {
            kind,
            external_id: external_id.into(),
            session_tag: session_tag.to_string(),
            discovered_at: Utc::now(),
            liveness: Liveness::Unknown,
            runtime_state: None,
        }
    }

    /// A container is stuck when its liveness probe failed and its
    /// runtime state is neither running nor cleanly exited.
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        if self.kind != ResourceKind::Container {
            return false;
        }
        if self.liveness != Liveness::Unresponsive {
            return false;
        }
        match self.runtime_state.as_deref() {
            Some("running" | "exited" | "created") => false,
            // restarting, dead, paused, removing, or missing state info
            _ => true,
        }
    }
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {} ({:?})", self.kind, self.external_id, self.liveness)
    }
}

/// Tracks child processes spawned during a session.
///
/// Container/network/volume discovery goes through the runtime boundary;
/// processes are the one resource only the orchestrator itself knows
/// about, so they are registered here at spawn time.
#[derive(Debug)]
pub struct ResourceRegistry {
    session_tag: String,
    processes: Mutex<Vec<u32>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new(session_tag: impl Into<String>) -> Self {
        Self {
            session_tag: session_tag.into(),
            processes: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn session_tag(&self) -> &str {
        &self.session_tag
    }

    /// Record a spawned child process.
    pub fn register_process(&self, pid: u32) {
        let mut procs = self.processes.lock().unwrap();
        if !procs.contains(&pid) {
            procs.push(pid);
        }
    }

    /// Forget a process that exited normally.
    pub fn forget_process(&self, pid: u32) {
        self.processes.lock().unwrap().retain(|p| *p != pid);
    }

    /// Handles for all still-tracked processes.
    #[must_use]
    pub fn process_handles(&self) -> Vec<ResourceHandle> {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .map(|pid| {
                let mut handle =
                    ResourceHandle::new(ResourceKind::Process, pid.to_string(), &self.session_tag);
                handle.liveness = if process_alive(*pid) {
                    Liveness::Healthy
                } else {
                    Liveness::Unknown
                };
                handle
            })
            .collect()
    }

    /// Drop all tracked processes (after teardown confirmed them gone).
    pub fn clear_processes(&self) {
        self.processes.lock().unwrap().clear();
    }
}

/// Check whether a pid still exists (signal 0 probe).
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
