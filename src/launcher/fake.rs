//! In-memory launcher for tests
//!
//! A successful spawn marks the instance's local port as bound so later probes
//! see it live, the way a real helper would leave a listening proxy behind.

use super::{PortProbe, ProcessLauncher};
use crate::error::LaunchError;
use crate::instance::Instance;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Default)]
struct FakeState {
    bound: HashSet<u16>,
    spawned: Vec<String>,
    killed: Vec<u16>,
    failing_spawns: HashSet<String>,
    failing_kills: HashSet<u16>,
    helper_missing: bool,
}

#[derive(Default)]
pub struct FakeLauncher {
    state: Mutex<FakeState>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend something is listening on `port`
    pub fn bind(&self, port: u16) {
        self.state.lock().bound.insert(port);
    }

    pub fn unbind(&self, port: u16) {
        self.state.lock().bound.remove(&port);
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.state.lock().bound.contains(&port)
    }

    /// Make spawns of the given instance id (e.g. `P1-usa`) fail
    pub fn fail_spawn_for(&self, instance_id: &str) {
        self.state.lock().failing_spawns.insert(instance_id.to_string());
    }

    pub fn fail_kill_for(&self, port: u16) {
        self.state.lock().failing_kills.insert(port);
    }

    pub fn set_helper_missing(&self, missing: bool) {
        self.state.lock().helper_missing = missing;
    }

    /// Instance ids spawned successfully, in order
    pub fn spawned(&self) -> Vec<String> {
        self.state.lock().spawned.clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().spawned.len()
    }

    pub fn killed(&self) -> Vec<u16> {
        self.state.lock().killed.clone()
    }
}

#[async_trait]
impl PortProbe for FakeLauncher {
    async fn probe(&self, port: u16) -> bool {
        self.is_bound(port)
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, instance: &Instance) -> Result<(), LaunchError> {
        let mut state = self.state.lock();
        let id = instance.id();

        if state.helper_missing {
            return Err(LaunchError::HelperMissing {
                path: PathBuf::from("create_proxy_plan.sh"),
            });
        }
        if state.failing_spawns.contains(&id) {
            return Err(LaunchError::ExecutionFailed {
                instance: id,
                status: Some(1),
                output: "simulated helper failure".to_string(),
            });
        }

        state.bound.insert(instance.local_port);
        state.spawned.push(id);
        Ok(())
    }

    async fn kill_port(&self, port: u16) -> Result<(), LaunchError> {
        let mut state = self.state.lock();
        if state.failing_kills.contains(&port) {
            return Err(LaunchError::KillFailed {
                port,
                reason: "simulated kill failure".to_string(),
            });
        }
        state.bound.remove(&port);
        state.killed.push(port);
        Ok(())
    }
}
