// dumpship/src/utils/container.rs
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::find_executable;
use crate::config::ContainerId;
use crate::errors::{BackupError, Result};

/// Maps a container name pattern to the id of a container.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerResolver: Send + Sync {
    async fn resolve(&self, pattern: &str) -> Result<ContainerId>;
}

/// Asks the container CLI: `<cli> ps -aqf name=^<pattern>`.
pub struct CliContainerResolver {
    cli: String,
}

impl CliContainerResolver {
    pub fn new(cli: &str) -> Self {
        CliContainerResolver {
            cli: cli.to_string(),
        }
    }

    pub fn args(pattern: &str) -> Vec<String> {
        vec![
            "ps".to_string(),
            "-aqf".to_string(),
            format!("name=^{}", pattern),
        ]
    }
}

/// First id printed by `ps -q`. Later lines are other matches and are ignored.
pub fn parse_ps_output(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).find(|line| !line.is_empty())
}

#[async_trait]
impl ContainerResolver for CliContainerResolver {
    async fn resolve(&self, pattern: &str) -> Result<ContainerId> {
        if pattern.trim().is_empty() {
            return Err(BackupError::ContainerLookup {
                cli: self.cli.clone(),
                message: "empty container name pattern".to_string(),
            });
        }

        let program = find_executable(&self.cli)?;
        debug!(cli = %program.display(), pattern = %pattern, "Looking up container");
        let output = Command::new(program)
            .args(Self::args(pattern))
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackupError::ContainerLookup {
                cli: self.cli.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(first) = parse_ps_output(&stdout) else {
            return Err(BackupError::ContainerNotFound {
                pattern: pattern.to_string(),
            });
        };
        if stdout.lines().filter(|l| !l.trim().is_empty()).count() > 1 {
            warn!(pattern = %pattern, "Several containers match, using the first");
        }

        let id = ContainerId::new(first).ok_or_else(|| BackupError::ContainerLookup {
            cli: self.cli.clone(),
            message: format!("unexpected container id '{}'", first),
        })?;
        info!(container_id = %id, pattern = %pattern, "Resolved container");
        Ok(id)
    }
}
