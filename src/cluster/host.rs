use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ClusterInfo;

pub const MIN_HOST_WEIGHT: u32 = 1;
pub const MAX_HOST_WEIGHT: u32 = 128;

/// Monotonic or gauge-style atomic counter for stats sinks.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Upstream traffic counters, kept once per host and once per cluster.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub upstream_request_total: Counter,
    pub upstream_request_active: Counter,
    pub upstream_request_timeout: Counter,
    pub upstream_request_pending_overflow: Counter,
    pub upstream_request_local_reset: Counter,
    pub upstream_request_remote_reset: Counter,
    pub upstream_request_failure_eject: Counter,
    pub upstream_connection_total: Counter,
    pub upstream_connection_active: Counter,
    pub upstream_connection_con_fail: Counter,
    pub upstream_connection_local_close_with_active_request: Counter,
    pub upstream_connection_remote_close_with_active_request: Counter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    MIN_HOST_WEIGHT
}

/// One upstream endpoint. Hosts are reference counted so a host handed
/// out by a load balancer stays valid for the whole request even if the
/// cluster's host set is replaced meanwhile.
#[derive(Debug)]
pub struct Host {
    address: String,
    weight: u32,
    health: AtomicBool,
    cluster_info: Arc<ClusterInfo>,
    stats: UpstreamStats,
}

impl Host {
    pub fn new(config: &HostConfig, cluster_info: Arc<ClusterInfo>) -> Arc<Host> {
        Arc::new(Host {
            address: config.address.clone(),
            weight: config.weight.clamp(MIN_HOST_WEIGHT, MAX_HOST_WEIGHT),
            health: AtomicBool::new(true),
            cluster_info,
            stats: UpstreamStats::default(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn healthy(&self) -> bool {
        self.health.load(Ordering::Relaxed)
    }

    pub fn set_health(&self, healthy: bool) {
        self.health.store(healthy, Ordering::Relaxed);
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.cluster_info
    }

    pub fn stats(&self) -> &UpstreamStats {
        &self.stats
    }
}
