use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One header value applied by a rewrite level. `append` joins with a
/// comma when the header already exists instead of replacing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderValueConfig {
    pub key: String,
    pub value: String,
    pub append: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub value: String,
    /// interpret `value` as an anchored regular expression
    pub regex: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteMatchConfig {
    pub prefix: Option<String>,
    pub path: Option<String>,
    pub regex: Option<String>,
    pub case_sensitive: Option<bool>,
    pub headers: Vec<HeaderMatchConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightedClusterConfig {
    pub name: String,
    pub weight: u32,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub retry_on: bool,
    pub num_retries: u32,
    pub retry_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteActionConfig {
    pub cluster_name: String,
    pub weighted_clusters: Vec<WeightedClusterConfig>,
    pub host_rewrite: Option<String>,
    pub prefix_rewrite: Option<String>,
    pub timeout_ms: u64,
    pub retry_policy: Option<RetryPolicyConfig>,
}

impl Default for RouteActionConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            weighted_clusters: Vec::new(),
            host_rewrite: None,
            prefix_rewrite: None,
            timeout_ms: 60_000,
            retry_policy: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    #[serde(rename = "match")]
    pub route_match: RouteMatchConfig,
    pub route: RouteActionConfig,
    pub request_headers_to_add: Vec<HeaderValueConfig>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<HeaderValueConfig>,
    pub response_headers_to_remove: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualHostConfig {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteConfig>,
    pub request_headers_to_add: Vec<HeaderValueConfig>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<HeaderValueConfig>,
    pub response_headers_to_remove: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub router_config_name: String,
    pub virtual_hosts: Vec<VirtualHostConfig>,
    pub request_headers_to_add: Vec<HeaderValueConfig>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<HeaderValueConfig>,
    pub response_headers_to_remove: Vec<String>,
}
