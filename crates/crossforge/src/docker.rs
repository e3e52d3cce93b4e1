//! Container runtime boundary.
//!
//! Everything the orchestrator needs from the container runtime sits
//! behind [`ContainerRuntime`] so the recovery, governor and cleanup
//! paths can be tested without a daemon. The production implementation
//! shells out to the `docker` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime-assigned identifier
    pub id: String,
    /// Container name
    pub name: String,
    /// Runtime state string ("running", "exited", "restarting", "dead", ...)
    pub state: String,
}

/// Operations the orchestrator performs against the container runtime.
///
/// All listing operations filter by a session label so one orchestration
/// run never touches another run's resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers carrying the session label.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>>;

    /// List networks carrying the session label.
    async fn list_networks(&self, label: &str) -> Result<Vec<String>>;

    /// List volumes carrying the session label.
    async fn list_volumes(&self, label: &str) -> Result<Vec<String>>;

    /// Gracefully stop a container, waiting up to `timeout_secs`.
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()>;

    /// Hard-kill a container.
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Remove a container, optionally by force.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Remove a network.
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Remove a volume, optionally by force.
    async fn remove_volume(&self, id: &str, force: bool) -> Result<()>;

    /// Liveness probe: run a trivial command inside the container with a
    /// short deadline. Returns `false` when the probe hangs or fails.
    async fn probe_exec(&self, id: &str, timeout: Duration) -> Result<bool>;

    /// Remove exited containers carrying the session label. Returns the
    /// number removed.
    async fn remove_exited(&self, label: &str) -> Result<u32>;

    /// Prune unused networks.
    async fn prune_networks(&self) -> Result<()>;

    /// System-wide prune of unused runtime resources.
    async fn system_prune(&self) -> Result<()>;
}

/// Production implementation driving the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run a docker subcommand and return stdout lines.
    async fn run(&self, args: &[&str]) -> Result<Vec<String>> {
        debug!(args = ?args, "docker");
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .context("Failed to run docker")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let filter = format!("label={label}");
        let lines = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.State}}",
            ])
            .await?;

        Ok(lines
            .iter()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                Some(ContainerInfo {
                    id: parts.next()?.to_string(),
                    name: parts.next()?.to_string(),
                    state: parts.next()?.to_string(),
                })
            })
            .collect())
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>> {
        let filter = format!("label={label}");
        self.run(&["network", "ls", "--filter", &filter, "--format", "{{.ID}}"])
            .await
    }

    async fn list_volumes(&self, label: &str) -> Result<Vec<String>> {
        let filter = format!("label={label}");
        self.run(&["volume", "ls", "--filter", &filter, "--format", "{{.Name}}"])
            .await
    }

    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        let timeout = timeout_secs.to_string();
        self.run(&["stop", "--time", &timeout, id]).await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.run(&["kill", id]).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["rm", "-f", id]).await?;
        } else {
            self.run(&["rm", id]).await?;
        }
        Ok(())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.run(&["network", "rm", id]).await?;
        Ok(())
    }

    async fn remove_volume(&self, id: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["volume", "rm", "-f", id]).await?;
        } else {
            self.run(&["volume", "rm", id]).await?;
        }
        Ok(())
    }

    async fn probe_exec(&self, id: &str, timeout: Duration) -> Result<bool> {
        let probe = Command::new("docker")
            .args(["exec", id, "true"])
            .output();

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(output)) => Ok(output.status.success()),
            Ok(Err(e)) => {
                debug!(container = %id, error = %e, "Liveness probe spawn failed");
                Ok(false)
            }
            Err(_) => {
                debug!(container = %id, "Liveness probe timed out");
                Ok(false)
            }
        }
    }

    async fn remove_exited(&self, label: &str) -> Result<u32> {
        let filter = format!("label={label}");
        let ids = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--filter",
                "status=exited",
                "--format",
                "{{.ID}}",
            ])
            .await?;

        let mut removed = 0;
        for id in &ids {
            if self.run(&["rm", "-f", id]).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn prune_networks(&self) -> Result<()> {
        self.run(&["network", "prune", "-f"]).await?;
        Ok(())
    }

    async fn system_prune(&self) -> Result<()> {
        self.run(&["system", "prune", "-f"]).await?;
        Ok(())
    }
}

/// Whether a runtime error means the resource is already gone.
///
/// Handles can disappear between discovery and teardown; that is treated
/// as already-removed, not a failure.
#[must_use]
pub fn is_missing_resource(err: &anyhow::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("no such") || text.contains("not found")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_resource_detection() {
        assert!(is_missing_resource(&anyhow::anyhow!(
            "Error: No such container: abc123"
        )));
        assert!(is_missing_resource(&anyhow::anyhow!("network xyz not found")));
        assert!(!is_missing_resource(&anyhow::anyhow!("permission denied")));
    }
}
