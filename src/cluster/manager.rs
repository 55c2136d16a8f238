use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::pool::{pool_factory, ConnectionPool};
use crate::protocol::ProtocolName;
use crate::{AppError, AppResult};

use super::cluster::{Cluster, ClusterConfig, ClusterSnapshot};
use super::host::{Host, HostConfig};
use super::load_balancer::LbContext;

struct PrimaryCluster {
    cluster: Arc<Cluster>,
    added_via_api: bool,
}

/// Live view of every upstream cluster plus the per-protocol caches of
/// endpoint connection pools.
pub struct ClusterManager {
    primary_clusters: DashMap<String, PrimaryCluster>,
    pools: DashMap<ProtocolName, Arc<DashMap<String, Arc<dyn ConnectionPool>>>>,
}

impl ClusterManager {
    pub fn new(configs: &[ClusterConfig]) -> Arc<ClusterManager> {
        let cm = Arc::new(ClusterManager {
            primary_clusters: DashMap::new(),
            pools: DashMap::new(),
        });
        for config in configs {
            cm.add_or_update_cluster(config, false);
        }
        cm
    }

    /// Install or replace a cluster. A statically configured cluster is
    /// never replaced through the dynamic path.
    pub fn add_or_update_cluster(&self, config: &ClusterConfig, via_api: bool) -> bool {
        if let Some(existing) = self.primary_clusters.get(&config.name) {
            if via_api && !existing.added_via_api {
                warn!(
                    "cluster {} is statically configured, dynamic update refused",
                    config.name
                );
                return false;
            }
        }
        let cluster = Cluster::new(config);
        if !config.hosts.is_empty() {
            cluster.update_hosts(0, &config.hosts);
        }
        self.primary_clusters.insert(
            config.name.clone(),
            PrimaryCluster {
                cluster,
                added_via_api: via_api,
            },
        );
        debug!("cluster {} installed (via_api: {})", config.name, via_api);
        true
    }

    pub fn cluster_exists(&self, name: &str) -> bool {
        self.primary_clusters.contains_key(name)
    }

    /// Replace one priority's host slice. Copy-on-write inside the
    /// cluster keeps handed-out snapshots intact.
    pub fn update_hosts(&self, name: &str, priority: u32, hosts: &[HostConfig]) -> AppResult<()> {
        let Some(pc) = self.primary_clusters.get(name) else {
            return Err(AppError::UnknownCluster(name.to_string()));
        };
        pc.cluster.update_hosts(priority, hosts);
        Ok(())
    }

    /// Only clusters added through the dynamic api may be removed.
    pub fn remove_cluster(&self, name: &str) -> AppResult<()> {
        let Some(pc) = self.primary_clusters.get(name) else {
            return Err(AppError::UnknownCluster(name.to_string()));
        };
        if !pc.added_via_api {
            return Err(AppError::IllegalState(format!(
                "cluster {} was not added via the dynamic api",
                name
            )));
        }
        drop(pc);
        self.primary_clusters.remove(name);
        debug!("cluster {} removed", name);
        Ok(())
    }

    /// Capture an immutable snapshot of one cluster.
    pub fn get(&self, name: &str) -> Option<ClusterSnapshot> {
        self.primary_clusters
            .get(name)
            .map(|pc| pc.cluster.snapshot())
    }

    /// Snapshot the cluster, select a host, and find or lazily create
    /// the `(protocol, endpoint)` pool. Creation is at-most-once per
    /// key: concurrent creators resolve through the map entry and only
    /// one pool object survives.
    pub fn pool_for(
        &self,
        cluster: &str,
        protocol: ProtocolName,
        ctx: &LbContext,
    ) -> AppResult<(Arc<Host>, Arc<dyn ConnectionPool>)> {
        let snapshot = self
            .get(cluster)
            .ok_or_else(|| AppError::UnknownCluster(cluster.to_string()))?;
        let host = snapshot
            .choose_host(ctx)
            .ok_or_else(|| AppError::NoHealthyUpstream(cluster.to_string()))?;
        let factory = pool_factory(protocol).ok_or_else(|| {
            AppError::IllegalState(format!("no pool factory for protocol {}", protocol))
        })?;

        let by_addr = self
            .pools
            .entry(protocol)
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();
        let pool = by_addr
            .entry(host.address().to_string())
            .or_insert_with(|| factory(host.clone()))
            .clone();
        Ok((host, pool))
    }

    /// Destroy every cached pool, cancelling their in-flight streams.
    pub fn shutdown(&self) {
        for by_addr in self.pools.iter() {
            for pool in by_addr.value().iter() {
                pool.value().destroy();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::protocol::bolt;

    fn cluster_config(name: &str, addrs: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            hosts: addrs
                .iter()
                .map(|a| HostConfig {
                    address: a.to_string(),
                    weight: 1,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_static_cluster_refuses_dynamic_replace_and_remove() {
        let cm = ClusterManager::new(&[cluster_config("static", &["127.0.0.1:1"])]);
        assert!(cm.cluster_exists("static"));
        assert!(!cm.add_or_update_cluster(&cluster_config("static", &[]), true));
        assert!(cm.remove_cluster("static").is_err());

        assert!(cm.add_or_update_cluster(&cluster_config("dynamic", &[]), true));
        assert!(cm.remove_cluster("dynamic").is_ok());
        assert!(!cm.cluster_exists("dynamic"));
    }

    #[test]
    fn test_get_unknown_cluster_is_none() {
        let cm = ClusterManager::new(&[]);
        assert!(cm.get("missing").is_none());
        assert!(matches!(
            cm.update_hosts("missing", 0, &[]),
            Err(AppError::UnknownCluster(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_pool_for_creates_exactly_one_pool() {
        bolt::register();
        let cm = ClusterManager::new(&[cluster_config("c", &["127.0.0.1:19999"])]);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cm = cm.clone();
            handles.push(tokio::spawn(async move {
                let (_, pool) = cm.pool_for("c", bolt::PROTOCOL_NAME, &LbContext::default()).unwrap();
                Arc::as_ptr(&pool) as *const () as usize
            }));
        }
        let mut pointers = HashSet::new();
        for handle in handles {
            pointers.insert(handle.await.unwrap());
        }
        assert_eq!(pointers.len(), 1, "all callers must observe the same pool");
    }
}
