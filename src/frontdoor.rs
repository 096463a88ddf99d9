//! Front-door refresh
//!
//! After the running set changes, the reverse proxy in front of the local
//! ports has to re-read its upstreams. That is a single fire-and-forget
//! trigger; failures are logged and never fail the caller.

use crate::config::FrontDoorConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait FrontDoor: Send + Sync {
    /// Best-effort; errors are reported for logging only
    async fn refresh(&self) -> anyhow::Result<()>;
}

/// Build the front door described by the configuration
pub fn from_config(config: &FrontDoorConfig) -> Box<dyn FrontDoor> {
    match config.refresh_command.as_deref().map(str::trim) {
        Some(cmd) if !cmd.is_empty() => {
            Box::new(CommandFrontDoor::new(cmd).with_timeout(config.refresh_timeout()))
        }
        _ => Box::new(NoopFrontDoor),
    }
}

/// Runs a reconfiguration command with no extra arguments
pub struct CommandFrontDoor {
    command: String,
    timeout: Duration,
}

impl CommandFrontDoor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FrontDoor for CommandFrontDoor {
    async fn refresh(&self) -> anyhow::Result<()> {
        let argv = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("invalid refresh command {:?}: {}", self.command, e))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty refresh command"))?;

        debug!(command = %self.command, "Refreshing front door");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("refresh command timed out after {}s", self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "refresh command exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }

        info!(command = %self.command, "Front door refreshed");
        Ok(())
    }
}

/// Used when no refresh command is configured
pub struct NoopFrontDoor;

#[async_trait]
impl FrontDoor for NoopFrontDoor {
    async fn refresh(&self) -> anyhow::Result<()> {
        debug!("No front door refresh command configured");
        Ok(())
    }
}

/// Counts refreshes; can be told to fail
#[derive(Default)]
pub struct RecordingFrontDoor {
    calls: Mutex<usize>,
    fail: Mutex<bool>,
}

impl RecordingFrontDoor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl FrontDoor for RecordingFrontDoor {
    async fn refresh(&self) -> anyhow::Result<()> {
        *self.calls.lock() += 1;
        if *self.fail.lock() {
            anyhow::bail!("simulated refresh failure");
        }
        Ok(())
    }
}

/// Refresh and log failure; never propagates
pub async fn refresh_logged(front_door: &dyn FrontDoor) {
    if let Err(e) = front_door.refresh().await {
        warn!(error = %e, "Front door refresh failed; local proxies keep serving");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_command_is_noop() {
        let config = FrontDoorConfig {
            refresh_command: Some("   ".to_string()),
            refresh_timeout_secs: 5,
        };
        assert!(from_config(&config).refresh().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_success_and_failure() {
        assert!(CommandFrontDoor::new("true").refresh().await.is_ok());

        let err = CommandFrontDoor::new("sh -c 'echo nope >&2; exit 2'")
            .refresh()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let door = CommandFrontDoor::new("sleep 5").with_timeout(Duration::from_millis(100));
        assert!(door.refresh().await.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_error() {
        let door = CommandFrontDoor::new("/no/such/update_upstreams.sh");
        assert!(door.refresh().await.is_err());
        // Logged, not propagated
        refresh_logged(&door).await;
    }

    #[tokio::test]
    async fn test_recording_front_door() {
        let door = RecordingFrontDoor::new();
        door.refresh().await.unwrap();
        door.set_failing(true);
        assert!(door.refresh().await.is_err());
        assert_eq!(door.calls(), 2);
    }
}
