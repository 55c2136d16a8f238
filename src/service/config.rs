extern crate config as rs_config;

use std::path::Path;
use std::process::exit;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::router::RouterConfig;
use crate::AppResult;

pub static GLOBAL_CONFIG: OnceCell<ProxyConfig> = OnceCell::new();

pub fn global_config() -> &'static ProxyConfig {
    GLOBAL_CONFIG.get_or_init(ProxyConfig::default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    pub conn_read_buffer_size: usize,
    /// frames larger than this are rejected at decode time
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 8900,
            max_connection: 1024,
            conn_read_buffer_size: 16 * 1024,
            max_frame_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// protocol terminated on the downstream listener
    pub downstream_protocol: String,
    /// fallback when a route does not carry its own timeout
    pub global_timeout_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            downstream_protocol: "bolt".to_string(),
            global_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub connect_timeout_ms: u64,
    /// read-idle interval that triggers a heartbeat on multiplexed
    /// upstream connections, 0 disables the keepalive
    pub heartbeat_interval_ms: u64,
    /// per endpoint connection cap for stream-per-request pools
    pub per_host_max_connections: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            heartbeat_interval_ms: 15_000,
            per_host_max_connections: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHandlerPool {
    pub channel_capacity: usize,
    pub num_channels: usize,
    /// seconds between worker liveness checks
    pub monitor_interval: u64,
    /// milliseconds the monitor waits on a worker handle
    pub worker_check_timeout: u64,
}

impl Default for RequestHandlerPool {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_channels: 4,
            monitor_interval: 5,
            worker_check_timeout: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub network: NetworkConfig,
    pub proxy: ProxySection,
    pub upstream: UpstreamConfig,
    pub request_handler_pool: RequestHandlerPool,
    pub clusters: Vec<ClusterConfig>,
    pub router: RouterConfig,
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.global_timeout_ms)
    }

    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ProxyConfig> {
        let path_str = path.as_ref().to_str().unwrap_or_default();
        let config = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()
            .unwrap_or_else(|err| {
                eprintln!("error in reading config files: {:?}", err);
                exit(1);
            });

        let proxy_config: ProxyConfig = config.try_deserialize().unwrap_or_else(|err| {
            eprintln!("error in deserializing config: {:?}", err);
            exit(1);
        });

        Ok(proxy_config)
    }
}
