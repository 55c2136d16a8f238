use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::host::{Host, HostConfig, UpstreamStats};
use super::load_balancer::{new_load_balancer, LoadBalancer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    Simple,
    Eds,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    Random,
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub cluster_type: ClusterType,
    pub lb_policy: LbPolicy,
    pub connect_timeout_ms: u64,
    /// admission cap on concurrent upstream requests
    pub max_requests: u64,
    pub max_connections: u64,
    pub hosts: Vec<HostConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            cluster_type: ClusterType::Simple,
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout_ms: 3_000,
            max_requests: 1024,
            max_connections: 1024,
            hosts: Vec::new(),
        }
    }
}

/// Admission gate: `can_create` is checked before the counter is bumped,
/// so the pair races benignly under concurrency the way a stats-driven
/// limit is expected to.
#[derive(Debug)]
pub struct ResourceLimit {
    current: AtomicU64,
    max: u64,
}

impl ResourceLimit {
    pub fn new(max: u64) -> ResourceLimit {
        ResourceLimit {
            current: AtomicU64::new(0),
            max,
        }
    }

    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Relaxed) < self.max
    }

    pub fn increase(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrease(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

#[derive(Debug)]
pub struct ResourceManager {
    requests: ResourceLimit,
    connections: ResourceLimit,
}

impl ResourceManager {
    pub fn new(max_requests: u64, max_connections: u64) -> ResourceManager {
        ResourceManager {
            requests: ResourceLimit::new(max_requests),
            connections: ResourceLimit::new(max_connections),
        }
    }

    pub fn requests(&self) -> &ResourceLimit {
        &self.requests
    }

    pub fn connections(&self) -> &ResourceLimit {
        &self.connections
    }
}

/// Immutable cluster metadata plus its stats and admission sinks.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    cluster_type: ClusterType,
    lb_policy: LbPolicy,
    connect_timeout: Duration,
    stats: UpstreamStats,
    resource_manager: ResourceManager,
}

impl ClusterInfo {
    pub fn new(config: &ClusterConfig) -> Arc<ClusterInfo> {
        Arc::new(ClusterInfo {
            name: config.name.clone(),
            cluster_type: config.cluster_type,
            lb_policy: config.lb_policy,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            stats: UpstreamStats::default(),
            resource_manager: ResourceManager::new(config.max_requests, config.max_connections),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn lb_policy(&self) -> LbPolicy {
        self.lb_policy
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn stats(&self) -> &UpstreamStats {
        &self.stats
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }
}

/// An immutable slice of hosts. Host-set updates replace the whole
/// `Arc<HostSet>`, never the contents, so readers and snapshots are
/// isolated from later mutation.
#[derive(Debug, Default)]
pub struct HostSet {
    hosts: Vec<Arc<Host>>,
}

impl HostSet {
    pub fn new(hosts: Vec<Arc<Host>>) -> Arc<HostSet> {
        Arc::new(HostSet { hosts })
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn healthy_hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .filter(|h| h.healthy())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

pub type MemberUpdateCb = Box<dyn Fn(u32, &[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// A named set of interchangeable upstream endpoints sharing policy.
pub struct Cluster {
    info: Arc<ClusterInfo>,
    host_sets: StdRwLock<HashMap<u32, Arc<HostSet>>>,
    lb: StdRwLock<Arc<dyn LoadBalancer>>,
    member_update_cbs: StdRwLock<Vec<MemberUpdateCb>>,
}

impl Cluster {
    pub fn new(config: &ClusterConfig) -> Arc<Cluster> {
        let info = ClusterInfo::new(config);
        let empty = HostSet::new(Vec::new());
        let lb = new_load_balancer(config.lb_policy, empty.clone());
        let mut host_sets = HashMap::new();
        host_sets.insert(0, empty);
        Arc::new(Cluster {
            info,
            host_sets: StdRwLock::new(host_sets),
            lb: StdRwLock::new(lb),
            member_update_cbs: StdRwLock::new(Vec::new()),
        })
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.member_update_cbs
            .write()
            .expect("member update cb lock poisoned")
            .push(cb);
    }

    pub fn host_set(&self, priority: u32) -> Arc<HostSet> {
        self.host_sets
            .read()
            .expect("host set lock poisoned")
            .get(&priority)
            .cloned()
            .unwrap_or_else(|| HostSet::new(Vec::new()))
    }

    /// Replace the host slice of one priority with a fresh one built
    /// from `configs`. The prior slice is never edited in place; the
    /// balancer is rebuilt over the new set and member-update callbacks
    /// fire with the added/removed difference.
    pub fn update_hosts(&self, priority: u32, configs: &[HostConfig]) {
        let new_hosts: Vec<Arc<Host>> = configs
            .iter()
            .map(|hc| Host::new(hc, self.info.clone()))
            .collect();

        let old_set = self.host_set(priority);
        let added: Vec<Arc<Host>> = new_hosts
            .iter()
            .filter(|h| !old_set.hosts().iter().any(|o| o.address() == h.address()))
            .cloned()
            .collect();
        let removed: Vec<Arc<Host>> = old_set
            .hosts()
            .iter()
            .filter(|o| !new_hosts.iter().any(|h| h.address() == o.address()))
            .cloned()
            .collect();

        let new_set = HostSet::new(new_hosts);
        self.host_sets
            .write()
            .expect("host set lock poisoned")
            .insert(priority, new_set.clone());

        // selection runs over priority 0
        if priority == 0 {
            *self.lb.write().expect("lb lock poisoned") =
                new_load_balancer(self.info.lb_policy(), new_set);
        }

        debug!(
            "cluster {} priority {} hosts updated: +{} -{}",
            self.info.name(),
            priority,
            added.len(),
            removed.len()
        );
        let cbs = self
            .member_update_cbs
            .read()
            .expect("member update cb lock poisoned");
        for cb in cbs.iter() {
            cb(priority, &added, &removed);
        }
    }

    /// Capture an immutable view for the duration of one request.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            host_set: self.host_set(0),
            info: self.info.clone(),
            lb: self.lb.read().expect("lb lock poisoned").clone(),
        }
    }
}

/// Point-in-time triple of hosts, metadata and balancer. Host updates
/// after the snapshot was taken are invisible through it.
#[derive(Clone)]
pub struct ClusterSnapshot {
    host_set: Arc<HostSet>,
    info: Arc<ClusterInfo>,
    lb: Arc<dyn LoadBalancer>,
}

impl ClusterSnapshot {
    pub fn host_set(&self) -> &Arc<HostSet> {
        &self.host_set
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.lb
    }

    pub fn choose_host(&self, ctx: &super::LbContext) -> Option<Arc<Host>> {
        self.lb.choose_host(ctx)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cluster::LbContext;

    fn host_configs(addrs: &[&str]) -> Vec<HostConfig> {
        addrs
            .iter()
            .map(|a| HostConfig {
                address: a.to_string(),
                weight: 1,
            })
            .collect()
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let cluster = Cluster::new(&ClusterConfig {
            name: "c".to_string(),
            ..Default::default()
        });
        cluster.update_hosts(0, &host_configs(&["127.0.0.1:1", "127.0.0.1:2"]));

        let snapshot = cluster.snapshot();
        assert_eq!(snapshot.host_set().len(), 2);

        cluster.update_hosts(0, &host_configs(&["127.0.0.1:3"]));
        // the old snapshot still sees the hosts it captured
        assert_eq!(snapshot.host_set().len(), 2);
        assert_eq!(cluster.snapshot().host_set().len(), 1);

        let host = snapshot.choose_host(&LbContext::default()).unwrap();
        assert!(host.address().ends_with(":1") || host.address().ends_with(":2"));
    }

    #[test]
    fn test_member_update_callbacks_fire_with_diff() {
        let cluster = Cluster::new(&ClusterConfig {
            name: "c".to_string(),
            ..Default::default()
        });
        let added_count = Arc::new(AtomicUsize::new(0));
        let removed_count = Arc::new(AtomicUsize::new(0));
        let (a, r) = (added_count.clone(), removed_count.clone());
        cluster.add_member_update_cb(Box::new(move |_, added, removed| {
            a.fetch_add(added.len(), Ordering::SeqCst);
            r.fetch_add(removed.len(), Ordering::SeqCst);
        }));

        cluster.update_hosts(0, &host_configs(&["127.0.0.1:1", "127.0.0.1:2"]));
        assert_eq!(added_count.load(Ordering::SeqCst), 2);
        assert_eq!(removed_count.load(Ordering::SeqCst), 0);

        cluster.update_hosts(0, &host_configs(&["127.0.0.1:2", "127.0.0.1:3"]));
        assert_eq!(added_count.load(Ordering::SeqCst), 3);
        assert_eq!(removed_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_admission_limit() {
        let limit = ResourceLimit::new(2);
        assert!(limit.can_create());
        limit.increase();
        limit.increase();
        assert!(!limit.can_create());
        limit.decrease();
        assert!(limit.can_create());
    }
}
