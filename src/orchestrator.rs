//! Lifecycle orchestrator
//!
//! Composes the allocator, journal, and launcher. Two entry points:
//!
//! - [`Orchestrator::provision`] creates instances for a freshly purchased plan
//!   (allocate, spawn, journal, in that order per region).
//! - [`Orchestrator::restore`] reconciles the running set with the journal after
//!   a crash or redeploy and heals missing regional siblings.
//!
//! There is no rollback: a region that fails does not unwind the regions
//! launched before it in the same call.

use crate::allocator::{PortAllocator, PortUsage};
use crate::config::{Config, RegionConfig, RestoreConfig};
use crate::error::{JournalError, LaunchError, OrchestratorError};
use crate::frontdoor::{refresh_logged, FrontDoor};
use crate::instance::{
    instance_id, local_host_for, unix_now, Credentials, Instance, PlanDescriptor, RegionClass,
    RegionDescriptor, UpstreamEndpoint,
};
use crate::journal::Journal;
use crate::launcher::{PortProbe, ProcessLauncher};
use crate::provider::{PlanParameters, UpstreamProvisioner};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How restore treats a journaled instance whose port is already bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorePolicy {
    /// true: kill whatever holds the port and relaunch.
    /// false: a bound port means the instance is live; leave it alone.
    pub force_relaunch: bool,
    /// Pause between killing a stale process and relaunching
    pub kill_settle: Duration,
}

impl Default for RestorePolicy {
    fn default() -> Self {
        Self {
            force_relaunch: false,
            kill_settle: Duration::from_secs(1),
        }
    }
}

impl From<&RestoreConfig> for RestorePolicy {
    fn from(config: &RestoreConfig) -> Self {
        Self {
            force_relaunch: config.force_relaunch,
            kill_settle: config.kill_settle(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntry {
    pub id: String,
    pub reason: String,
}

/// Outcome of one restore pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Instances (re)launched by this pass, including healed siblings
    pub restored: Vec<String>,
    /// Instances whose port was already bound and left running
    pub already_live: Vec<String>,
    pub failed: Vec<FailedEntry>,
    pub skipped_expired: Vec<String>,
}

impl RestoreReport {
    fn fail(&mut self, id: String, reason: impl ToString) {
        self.failed.push(FailedEntry {
            id,
            reason: reason.to_string(),
        });
    }
}

/// A provisioned plan and the instances launched for it
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub plan: PlanDescriptor,
    pub instances: Vec<Instance>,
}

pub struct Orchestrator {
    allocator: PortAllocator,
    journal: Arc<Journal>,
    launcher: Arc<dyn ProcessLauncher>,
    front_door: Arc<dyn FrontDoor>,
    regions: HashMap<RegionClass, RegionConfig>,
    base_domain: String,
    policy: RestorePolicy,
    /// One restore pass at a time
    restore_lock: Mutex<()>,
}

impl Orchestrator {
    /// Load the journal and seed the allocator from it
    pub async fn open<L>(
        config: &Config,
        launcher: Arc<L>,
        front_door: Arc<dyn FrontDoor>,
    ) -> Result<Self, OrchestratorError>
    where
        L: ProcessLauncher + 'static,
    {
        let probe: Arc<dyn PortProbe> = launcher.clone();
        let launcher: Arc<dyn ProcessLauncher> = launcher;
        let allocator = PortAllocator::from_regions(&config.regions, probe);
        let journal = Arc::new(Journal::new(&config.journal.path));

        let reader = Arc::clone(&journal);
        let entries = run_blocking(&journal, move || reader.load()).await?;
        allocator.seed(&entries).await;

        info!(
            journal = %journal.path().display(),
            entries = entries.len(),
            regions = config.regions.len(),
            force_relaunch = config.restore.force_relaunch,
            "Orchestrator ready"
        );

        Ok(Self {
            allocator,
            journal,
            launcher,
            front_door,
            regions: config.regions.clone(),
            base_domain: config.server.base_domain.clone(),
            policy: RestorePolicy::from(&config.restore),
            restore_lock: Mutex::new(()),
        })
    }

    pub fn with_policy(mut self, policy: RestorePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RestorePolicy {
        self.policy
    }

    /// Every journaled instance, expired ones included
    pub async fn instances(&self) -> Result<Vec<Instance>, OrchestratorError> {
        Ok(self.load_journal().await?)
    }

    async fn load_journal(&self) -> Result<Vec<Instance>, JournalError> {
        let journal = Arc::clone(&self.journal);
        run_blocking(&self.journal, move || journal.load()).await
    }

    async fn append_journal(&self, entries: Vec<Instance>) -> Result<(), JournalError> {
        let journal = Arc::clone(&self.journal);
        run_blocking(&self.journal, move || journal.append_all(&entries)).await
    }

    pub async fn usage(&self) -> Vec<PortUsage> {
        self.allocator.usage_all().await
    }

    /// Buy a plan from a reseller, then provision its regions
    pub async fn provision_with(
        &self,
        provisioner: &dyn UpstreamProvisioner,
        params: &PlanParameters,
    ) -> Result<Provisioned, OrchestratorError> {
        let plan = provisioner.provision_plan(params).await.map_err(|e| {
            warn!(provider = provisioner.name(), error = %e, "Upstream provisioning failed");
            e
        })?;

        info!(
            provider = provisioner.name(),
            plan_id = %plan.plan_id,
            regions = plan.regions.len(),
            "Upstream plan created"
        );

        let instances = self.provision(&plan).await?;
        Ok(Provisioned { plan, instances })
    }

    /// Allocate, spawn, and journal one instance per region of the plan
    pub async fn provision(&self, plan: &PlanDescriptor) -> Result<Vec<Instance>, OrchestratorError> {
        let mut launched: Vec<Instance> = Vec::with_capacity(plan.regions.len());

        for region in &plan.regions {
            match self.provision_region(plan, region).await {
                Ok(instance) => launched.push(instance),
                Err(e) if launched.is_empty() => return Err(e),
                Err(e) => {
                    let ids: Vec<String> = launched.iter().map(Instance::id).collect();
                    error!(
                        plan_id = %plan.plan_id,
                        region = %region.region_class,
                        launched = ?ids,
                        error = %e,
                        "Provision failed part way; earlier regions stay running"
                    );
                    refresh_logged(self.front_door.as_ref()).await;
                    return Err(OrchestratorError::PartialProvision {
                        plan_id: plan.plan_id.clone(),
                        launched: ids,
                        region: region.region_class,
                        source: Box::new(e),
                    });
                }
            }
        }

        if !launched.is_empty() {
            refresh_logged(self.front_door.as_ref()).await;
        }
        Ok(launched)
    }

    async fn provision_region(
        &self,
        plan: &PlanDescriptor,
        region: &RegionDescriptor,
    ) -> Result<Instance, OrchestratorError> {
        let region_class = region.region_class;
        let port = self.allocator.allocate(region_class).await?;

        let instance = Instance {
            plan_id: plan.plan_id.clone(),
            credentials: Credentials::new(plan.username.clone(), plan.password.clone()),
            region_class,
            upstream_endpoint: UpstreamEndpoint {
                host: region.upstream_host.clone(),
                port: region.upstream_port,
                auth_port: region.upstream_auth_port,
            },
            local_port: port,
            public_port: region.public_port,
            local_host: local_host_for(region_class, &self.base_domain),
            created_at: unix_now(),
            expires_at: plan.expires_at,
        };

        self.spawn_or_release(&instance).await?;

        // A running but unjournaled process is an operator problem; surface it
        if let Err(e) = self.append_journal(vec![instance.clone()]).await {
            error!(
                instance = %instance.id(),
                port,
                error = %e,
                "Proxy is running but could not be journaled"
            );
            return Err(e.into());
        }

        info!(
            instance = %instance.id(),
            port,
            public_port = instance.public_port,
            upstream = %instance.upstream_endpoint.host,
            "Instance provisioned"
        );
        Ok(instance)
    }

    /// Spawn, handing the port back to the allocator if the spawn fails
    async fn spawn_or_release(&self, instance: &Instance) -> Result<(), LaunchError> {
        if let Err(e) = self.launcher.spawn(instance).await {
            self.allocator
                .release(instance.region_class, instance.local_port)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Make the running set match the journal and heal missing siblings
    pub async fn restore(&self) -> Result<RestoreReport, OrchestratorError> {
        let _pass = self.restore_lock.lock().await;

        let entries = self.load_journal().await?;
        let now = unix_now();
        let mut report = RestoreReport::default();

        info!(entries = entries.len(), force_relaunch = self.policy.force_relaunch, "Restore started");

        // Regions each live plan already has (or is about to get)
        let mut present: HashSet<(String, RegionClass)> = entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| (e.plan_id.clone(), e.region_class))
            .collect();
        let mut seen: HashSet<(String, u16)> = HashSet::new();
        let mut additions: Vec<Instance> = Vec::new();

        for entry in &entries {
            let id = entry.id();

            if entry.is_expired(now) {
                debug!(instance = %id, expires_at = entry.expires_at, "Skipping expired instance");
                report.skipped_expired.push(id);
                continue;
            }
            if !seen.insert((id.clone(), entry.local_port)) {
                debug!(instance = %id, port = entry.local_port, "Duplicate journal entry");
                continue;
            }

            self.restore_entry(entry, &mut report).await;

            let Some(pair) = self.regions.get(&entry.region_class).and_then(|c| c.pair) else {
                continue;
            };
            if !present.insert((entry.plan_id.clone(), pair)) {
                continue;
            }

            let sibling_id = instance_id(&entry.plan_id, pair);
            match self.heal_sibling(entry, pair, now).await {
                Ok(Some(sibling)) => {
                    info!(instance = %sibling_id, port = sibling.local_port, "Healed missing sibling");
                    report.restored.push(sibling_id);
                    additions.push(sibling);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(instance = %sibling_id, error = %e, "Failed to heal missing sibling");
                    report.fail(sibling_id, e);
                }
            }
        }

        let added = additions.len();
        if let Err(e) = self.append_journal(additions).await {
            error!(added, error = %e, "Healed siblings are running but could not be journaled");
            return Err(e.into());
        }

        if !report.restored.is_empty() {
            refresh_logged(self.front_door.as_ref()).await;
        }

        info!(
            restored = report.restored.len(),
            already_live = report.already_live.len(),
            failed = report.failed.len(),
            skipped_expired = report.skipped_expired.len(),
            "Restore finished"
        );
        Ok(report)
    }

    /// One attempt per entry; failures are recorded, never retried
    async fn restore_entry(&self, entry: &Instance, report: &mut RestoreReport) {
        let id = entry.id();
        let port = entry.local_port;

        if self.launcher.probe(port).await {
            if !self.policy.force_relaunch {
                debug!(instance = %id, port, "Port already bound; treating instance as live");
                report.already_live.push(id);
                return;
            }

            warn!(instance = %id, port, "Port bound; killing occupant before relaunch");
            if let Err(e) = self.launcher.kill_port(port).await {
                error!(instance = %id, port, error = %e, "Could not reclaim port");
                report.fail(id, e);
                return;
            }
            tokio::time::sleep(self.policy.kill_settle).await;
        }

        match self.launcher.spawn(entry).await {
            Ok(()) => {
                info!(instance = %id, port, "Instance restored");
                report.restored.push(id);
            }
            Err(e) => {
                error!(instance = %id, port, error = %e, "Failed to restore instance");
                report.fail(id, e);
            }
        }
    }

    /// Synthesize and launch the counterpart of `entry` in region `pair`
    async fn heal_sibling(
        &self,
        entry: &Instance,
        pair: RegionClass,
        now: i64,
    ) -> Result<Option<Instance>, OrchestratorError> {
        let Some(template) = self.regions.get(&pair).and_then(|c| c.upstream.as_ref()) else {
            warn!(plan_id = %entry.plan_id, region = %pair, "No upstream template; cannot heal sibling");
            return Ok(None);
        };

        let port = self.allocator.allocate(pair).await?;
        let sibling = Instance {
            plan_id: entry.plan_id.clone(),
            credentials: entry.credentials.clone(),
            region_class: pair,
            upstream_endpoint: UpstreamEndpoint {
                host: template.host.clone(),
                port: template.port.unwrap_or(entry.upstream_endpoint.port),
                auth_port: entry.upstream_endpoint.auth_port,
            },
            local_port: port,
            public_port: template.public_port,
            local_host: local_host_for(pair, &self.base_domain),
            created_at: now,
            expires_at: entry.expires_at,
        };

        self.spawn_or_release(&sibling).await?;
        Ok(Some(sibling))
    }
}

/// Run journal file I/O on the blocking pool instead of an async worker
async fn run_blocking<T, F>(journal: &Journal, op: F) -> Result<T, JournalError>
where
    F: FnOnce() -> Result<T, JournalError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| JournalError::IoFailure {
            path: journal.path().to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
}
