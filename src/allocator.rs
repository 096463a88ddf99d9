//! Region port allocator
//!
//! Each region class owns a fixed, non-overlapping port partition. The
//! allocator hands out the lowest port in the partition that is neither
//! marked used in memory nor accepting connections on localhost. Its state
//! is a cache derived from the journal via [`PortAllocator::seed`].

use crate::config::RegionConfig;
use crate::error::AllocationError;
use crate::instance::{Instance, RegionClass};
use crate::launcher::PortProbe;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        (self.end as usize + 1).saturating_sub(self.start as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Port usage of one region partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortUsage {
    pub region: RegionClass,
    pub used: usize,
    pub total: usize,
    pub range: PortRange,
}

/// Hands out local ports per region partition
pub struct PortAllocator {
    partitions: HashMap<RegionClass, PortRange>,
    /// Used ports per region; held across the in-memory check and the probe
    used: Mutex<HashMap<RegionClass, BTreeSet<u16>>>,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(partitions: HashMap<RegionClass, PortRange>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            partitions,
            used: Mutex::new(HashMap::new()),
            probe,
        }
    }

    /// Build the partition table from region configuration
    pub fn from_regions(regions: &HashMap<RegionClass, RegionConfig>, probe: Arc<dyn PortProbe>) -> Self {
        let partitions = regions
            .iter()
            .map(|(region, cfg)| (*region, PortRange::new(cfg.range_start, cfg.range_end)))
            .collect();
        Self::new(partitions, probe)
    }

    pub fn partition(&self, region: RegionClass) -> Option<PortRange> {
        self.partitions.get(&region).copied()
    }

    /// Allocate the lowest free port in the region's partition
    pub async fn allocate(&self, region: RegionClass) -> Result<u16, AllocationError> {
        let range = self
            .partition(region)
            .ok_or(AllocationError::UnknownRegion(region))?;

        let mut used = self.used.lock().await;
        let taken = used.entry(region).or_default();

        for port in range.start..=range.end {
            if taken.contains(&port) {
                continue;
            }
            if self.probe.probe(port).await {
                debug!(%region, port, "Port free in memory but bound on localhost, skipping");
                continue;
            }
            taken.insert(port);
            debug!(%region, port, "Allocated port");
            return Ok(port);
        }

        warn!(%region, start = range.start, end = range.end, "Port partition exhausted");
        Err(AllocationError::ExhaustedRange {
            region,
            start: range.start,
            end: range.end,
        })
    }

    /// Mark a port free in memory. The caller must have stopped the process first
    pub async fn release(&self, region: RegionClass, port: u16) -> bool {
        let mut used = self.used.lock().await;
        let released = used.get_mut(&region).map(|s| s.remove(&port)).unwrap_or(false);
        if released {
            debug!(%region, port, "Released port");
        }
        released
    }

    /// Rebuild the used-set from a full instance list
    pub async fn seed(&self, entries: &[Instance]) {
        let mut used = self.used.lock().await;
        used.clear();
        for entry in entries {
            used.entry(entry.region_class)
                .or_default()
                .insert(entry.local_port);
        }
        info!(entries = entries.len(), "Port allocator seeded from journal");
    }

    /// (used, total) for one region
    pub async fn usage(&self, region: RegionClass) -> (usize, usize) {
        let used = self.used.lock().await;
        let count = used.get(&region).map(|s| s.len()).unwrap_or(0);
        let total = self.partition(region).map(|r| r.len()).unwrap_or(0);
        (count, total)
    }

    /// Usage of every configured partition, ordered by port range
    pub async fn usage_all(&self) -> Vec<PortUsage> {
        let used = self.used.lock().await;
        let mut usage: Vec<PortUsage> = self
            .partitions
            .iter()
            .map(|(region, range)| PortUsage {
                region: *region,
                used: used.get(region).map(|s| s.len()).unwrap_or(0),
                total: range.len(),
                range: *range,
            })
            .collect();
        usage.sort_by_key(|u| u.range.start);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Credentials, UpstreamEndpoint};
    use crate::launcher::fake::FakeLauncher;

    fn allocator_with(probe: Arc<FakeLauncher>, ranges: &[(RegionClass, u16, u16)]) -> PortAllocator {
        let partitions = ranges
            .iter()
            .map(|(r, s, e)| (*r, PortRange::new(*s, *e)))
            .collect();
        PortAllocator::new(partitions, probe)
    }

    fn entry(plan: &str, region: RegionClass, port: u16) -> Instance {
        Instance {
            plan_id: plan.to_string(),
            credentials: Credentials::new("u", "p"),
            region_class: region,
            upstream_endpoint: UpstreamEndpoint {
                host: "upstream.test".to_string(),
                port: 1,
                auth_port: 1,
            },
            local_port: port,
            public_port: 1337,
            local_host: String::new(),
            created_at: 0,
            expires_at: 0,
        }
    }

    #[tokio::test]
    async fn test_allocates_lowest_free_port_sequentially() {
        let alloc = allocator_with(Arc::new(FakeLauncher::new()), &[(RegionClass::Usa, 10000, 10004)]);

        assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), 10000);
        assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), 10001);
        assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), 10002);
    }

    #[tokio::test]
    async fn test_full_partition_then_exhausted() {
        let alloc = allocator_with(Arc::new(FakeLauncher::new()), &[(RegionClass::Usa, 10000, 11999)]);

        for expected in 10000u16..=11999 {
            assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), expected);
        }

        let err = alloc.allocate(RegionClass::Usa).await.unwrap_err();
        assert_eq!(
            err,
            AllocationError::ExhaustedRange {
                region: RegionClass::Usa,
                start: 10000,
                end: 11999
            }
        );
        assert_eq!(alloc.usage(RegionClass::Usa).await, (2000, 2000));
    }

    #[tokio::test]
    async fn test_exhausted_leaves_used_set_unchanged() {
        let alloc = allocator_with(Arc::new(FakeLauncher::new()), &[(RegionClass::Eu, 12000, 12002)]);
        let seeded: Vec<_> = (12000..=12002).map(|p| entry("P", RegionClass::Eu, p)).collect();
        alloc.seed(&seeded).await;

        assert!(alloc.allocate(RegionClass::Eu).await.is_err());
        assert_eq!(alloc.usage(RegionClass::Eu).await, (3, 3));
    }

    #[tokio::test]
    async fn test_skips_ports_bound_on_localhost() {
        let probe = Arc::new(FakeLauncher::new());
        probe.bind(10000);
        probe.bind(10001);
        let alloc = allocator_with(probe, &[(RegionClass::Usa, 10000, 10009)]);

        assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), 10002);
        // Probed-busy ports are not recorded as ours
        assert_eq!(alloc.usage(RegionClass::Usa).await, (1, 10));
    }

    #[tokio::test]
    async fn test_release_allows_reuse_of_low_port() {
        let alloc = allocator_with(Arc::new(FakeLauncher::new()), &[(RegionClass::Beta, 16000, 16009)]);

        let a = alloc.allocate(RegionClass::Beta).await.unwrap();
        let b = alloc.allocate(RegionClass::Beta).await.unwrap();
        assert_ne!(a, b);

        assert!(alloc.release(RegionClass::Beta, a).await);
        assert!(!alloc.release(RegionClass::Beta, a).await);
        assert_eq!(alloc.allocate(RegionClass::Beta).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_unknown_region() {
        let alloc = allocator_with(Arc::new(FakeLauncher::new()), &[(RegionClass::Usa, 10000, 10009)]);
        assert_eq!(
            alloc.allocate(RegionClass::Mobile).await.unwrap_err(),
            AllocationError::UnknownRegion(RegionClass::Mobile)
        );
        assert_eq!(alloc.usage(RegionClass::Mobile).await, (0, 0));
    }

    #[tokio::test]
    async fn test_seed_rebuilds_usage() {
        let alloc = allocator_with(
            Arc::new(FakeLauncher::new()),
            &[(RegionClass::Usa, 10000, 11999), (RegionClass::Eu, 12000, 13999)],
        );
        alloc.allocate(RegionClass::Usa).await.unwrap();

        alloc
            .seed(&[
                entry("P1", RegionClass::Eu, 12000),
                entry("P2", RegionClass::Eu, 12001),
                entry("P1", RegionClass::Usa, 10005),
            ])
            .await;

        assert_eq!(alloc.usage(RegionClass::Eu).await, (2, 2000));
        assert_eq!(alloc.usage(RegionClass::Usa).await, (1, 2000));
        // Seeding replaced the earlier allocation of 10000
        assert_eq!(alloc.allocate(RegionClass::Usa).await.unwrap(), 10000);

        let all = alloc.usage_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].region, RegionClass::Usa);
        assert_eq!(all[1].used, 2);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_collide() {
        let alloc = Arc::new(allocator_with(
            Arc::new(FakeLauncher::new()),
            &[(RegionClass::Datacenter, 22000, 22099)],
        ));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(async move {
                alloc.allocate(RegionClass::Datacenter).await.unwrap()
            }));
        }

        let mut ports = BTreeSet::new();
        for handle in handles {
            assert!(ports.insert(handle.await.unwrap()));
        }
        assert_eq!(ports.len(), 50);
        assert_eq!(*ports.iter().next_back().unwrap(), 22049);
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::new(10000, 11999);
        assert_eq!(range.len(), 2000);
        assert!(range.contains(10000));
        assert!(range.contains(11999));
        assert!(!range.contains(12000));
        assert!(!range.is_empty());
    }
}
