use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rand::Rng;

use super::cluster::{HostSet, LbPolicy};
use super::host::Host;

/// Request-scoped context offered to balancers. The built-in policies
/// ignore it; hashing policies would consume it.
#[derive(Debug, Default)]
pub struct LbContext {
    pub downstream_addr: Option<String>,
}

pub trait LoadBalancer: Send + Sync {
    /// `None` when the host set is empty or every host is unhealthy.
    fn choose_host(&self, ctx: &LbContext) -> Option<Arc<Host>>;
}

/// Balancers are built over an immutable host-set snapshot; a rebuilt
/// set gets a rebuilt balancer.
pub fn new_load_balancer(policy: LbPolicy, hosts: Arc<HostSet>) -> Arc<dyn LoadBalancer> {
    match policy {
        LbPolicy::Random => Arc::new(RandomLb { hosts }),
        LbPolicy::RoundRobin => Arc::new(RoundRobinLb {
            hosts,
            counter: AtomicUsize::new(0),
        }),
        LbPolicy::WeightedRoundRobin => Arc::new(WeightedRoundRobinLb {
            current: StdMutex::new(vec![0; hosts.len()]),
            hosts,
        }),
        LbPolicy::LeastRequest => Arc::new(LeastRequestLb { hosts }),
    }
}

struct RandomLb {
    hosts: Arc<HostSet>,
}

impl LoadBalancer for RandomLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let healthy = self.hosts.healthy_hosts();
        if healthy.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..healthy.len());
        Some(healthy[idx].clone())
    }
}

struct RoundRobinLb {
    hosts: Arc<HostSet>,
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let healthy = self.hosts.healthy_hosts();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].clone())
    }
}

/// Smooth weighted round robin: each pick raises every current weight by
/// its effective weight, takes the max and lowers it by the total. The
/// long-run pick distribution matches the weight ratios.
struct WeightedRoundRobinLb {
    hosts: Arc<HostSet>,
    current: StdMutex<Vec<i64>>,
}

impl LoadBalancer for WeightedRoundRobinLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let hosts = self.hosts.hosts();
        let mut current = self.current.lock().expect("wrr state lock poisoned");
        let mut total: i64 = 0;
        let mut best: Option<usize> = None;
        for (i, host) in hosts.iter().enumerate() {
            if !host.healthy() {
                continue;
            }
            let weight = host.weight() as i64;
            current[i] += weight;
            total += weight;
            match best {
                Some(b) if current[b] >= current[i] => {}
                _ => best = Some(i),
            }
        }
        let best = best?;
        current[best] -= total;
        Some(hosts[best].clone())
    }
}

/// Power-of-two-choices over the active request counters.
struct LeastRequestLb {
    hosts: Arc<HostSet>,
}

impl LoadBalancer for LeastRequestLb {
    fn choose_host(&self, _ctx: &LbContext) -> Option<Arc<Host>> {
        let healthy = self.hosts.healthy_hosts();
        match healthy.len() {
            0 => None,
            1 => Some(healthy[0].clone()),
            n => {
                let mut rng = rand::thread_rng();
                let first = rng.gen_range(0..n);
                let mut second = rng.gen_range(0..n - 1);
                if second >= first {
                    second += 1;
                }
                let a = &healthy[first];
                let b = &healthy[second];
                if a.stats().upstream_request_active.count()
                    <= b.stats().upstream_request_active.count()
                {
                    Some(a.clone())
                } else {
                    Some(b.clone())
                }
            }
        }
    }
}
