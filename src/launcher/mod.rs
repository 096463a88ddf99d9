//! Process launcher
//!
//! Starts and kills the external proxy-serving process for one instance.
//! [`HelperLauncher`] shells out to the proxy helper script; [`fake::FakeLauncher`]
//! keeps everything in memory for tests.

pub mod fake;

use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::instance::Instance;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Reports whether something accepts TCP connections on a localhost port
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// Spawns and kills proxy processes
#[async_trait]
pub trait ProcessLauncher: PortProbe {
    /// Start the proxy for an instance. Returns once the helper has exited
    async fn spawn(&self, instance: &Instance) -> Result<(), LaunchError>;

    /// Force-kill whatever is bound to a local port. A free port is not an error
    async fn kill_port(&self, port: u16) -> Result<(), LaunchError>;
}

/// TCP connect to 127.0.0.1:port bounded by `timeout`
pub async fn tcp_probe(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Launcher that runs the external proxy helper
pub struct HelperLauncher {
    helper_path: PathBuf,
    /// e.g. "bash"; empty runs the helper directly
    interpreter: String,
    spawn_timeout: Duration,
    probe_timeout: Duration,
}

impl HelperLauncher {
    pub fn new(helper_path: impl Into<PathBuf>, interpreter: impl Into<String>) -> Self {
        Self {
            helper_path: helper_path.into(),
            interpreter: interpreter.into(),
            spawn_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &LauncherConfig) -> anyhow::Result<Self> {
        let helper_path = config.resolve_helper_path()?;
        if !helper_path.exists() {
            warn!(path = %helper_path.display(), "Proxy helper not found; spawns will fail until it exists");
        }
        Ok(Self::new(helper_path, config.helper_interpreter.clone())
            .with_spawn_timeout(config.spawn_timeout())
            .with_probe_timeout(config.probe_timeout()))
    }

    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn helper_path(&self) -> &Path {
        &self.helper_path
    }

    /// Positional arguments handed to the helper
    pub fn helper_args(instance: &Instance) -> Vec<String> {
        vec![
            instance.plan_id.clone(),
            instance.local_port.to_string(),
            instance.credentials.username.clone(),
            instance.credentials.password.clone(),
            instance.upstream_endpoint.host.clone(),
            instance.upstream_endpoint.auth_port.to_string(),
            instance.region_class.to_string(),
        ]
    }

    fn command(&self, instance: &Instance) -> Command {
        let mut cmd = if self.interpreter.is_empty() {
            Command::new(&self.helper_path)
        } else {
            let mut cmd = Command::new(&self.interpreter);
            cmd.arg(&self.helper_path);
            cmd
        };
        cmd.args(Self::helper_args(instance));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PortProbe for HelperLauncher {
    async fn probe(&self, port: u16) -> bool {
        tcp_probe(port, self.probe_timeout).await
    }
}

#[async_trait]
impl ProcessLauncher for HelperLauncher {
    async fn spawn(&self, instance: &Instance) -> Result<(), LaunchError> {
        let id = instance.id();

        if !self.helper_path.is_file() {
            error!(instance = %id, path = %self.helper_path.display(), "Spawn failed: proxy helper not found");
            return Err(LaunchError::HelperMissing {
                path: self.helper_path.clone(),
            });
        }

        info!(
            instance = %id,
            port = instance.local_port,
            region = %instance.region_class,
            upstream = %instance.upstream_endpoint.host,
            auth_port = instance.upstream_endpoint.auth_port,
            "Spawning proxy"
        );

        let child = self.command(instance).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LaunchError::HelperMissing {
                    path: PathBuf::from(if self.interpreter.is_empty() {
                        self.helper_path.to_string_lossy().into_owned()
                    } else {
                        self.interpreter.clone()
                    }),
                }
            } else {
                LaunchError::ExecutionFailed {
                    instance: id.clone(),
                    status: None,
                    output: e.to_string(),
                }
            }
        })?;

        let output = match tokio::time::timeout(self.spawn_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(LaunchError::ExecutionFailed {
                    instance: id,
                    status: None,
                    output: e.to_string(),
                })
            }
            Err(_) => {
                error!(instance = %id, timeout_secs = self.spawn_timeout.as_secs(), "Proxy helper timed out");
                return Err(LaunchError::Timeout {
                    instance: id,
                    after: self.spawn_timeout,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            error!(
                instance = %id,
                port = instance.local_port,
                status = ?output.status.code(),
                output = %combined.trim(),
                "Failed to spawn proxy"
            );
            return Err(LaunchError::ExecutionFailed {
                instance: id,
                status: output.status.code(),
                output: combined.trim().to_string(),
            });
        }

        debug!(instance = %id, output = %combined.trim(), "Proxy helper output");
        info!(instance = %id, port = instance.local_port, "Proxy started");
        Ok(())
    }

    async fn kill_port(&self, port: u16) -> Result<(), LaunchError> {
        // Listeners only; clients connected to the port (the front door) survive
        let output = Command::new("lsof")
            .args(lsof_listener_args(port))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| LaunchError::KillFailed {
                port,
                reason: format!("failed to run lsof: {}", e),
            })?;

        // lsof exits 1 with no output when nothing holds the port
        let pids = parse_pids(&String::from_utf8_lossy(&output.stdout));
        if pids.is_empty() {
            debug!(port, "No process bound to port");
            return Ok(());
        }

        for pid in pids {
            warn!(port, pid, "Killing stale process bound to port");
            send_kill(pid).map_err(|e| LaunchError::KillFailed {
                port,
                reason: format!("kill {}: {}", pid, e),
            })?;
        }
        Ok(())
    }
}

fn lsof_listener_args(port: u16) -> [String; 4] {
    [
        "-t".to_string(),
        format!("-iTCP:{}", port),
        "-sTCP:LISTEN".to_string(),
        "-nP".to_string(),
    ]
}

/// One pid per line, as printed by `lsof -t`
fn parse_pids(output: &str) -> Vec<i32> {
    let mut pids: Vec<i32> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .filter(|pid| *pid > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(unix)]
fn send_kill(pid: i32) -> std::io::Result<()> {
    let result = unsafe { libc::kill(pid, libc::SIGKILL) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_kill(pid: i32) -> std::io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "taskkill failed"))
    }
}
