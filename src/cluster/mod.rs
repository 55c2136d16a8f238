mod cluster;
mod host;
mod load_balancer;
mod manager;

pub use cluster::{
    Cluster, ClusterConfig, ClusterInfo, ClusterSnapshot, ClusterType, HostSet, LbPolicy,
    MemberUpdateCb, ResourceLimit, ResourceManager,
};
pub use host::{Counter, Host, HostConfig, UpstreamStats, MAX_HOST_WEIGHT, MIN_HOST_WEIGHT};
pub use load_balancer::{new_load_balancer, LbContext, LoadBalancer};
pub use manager::ClusterManager;
