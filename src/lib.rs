pub mod cluster;
pub mod network;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod service;
pub mod stream;
pub mod utils;

pub use service::{
    global_config,
    AppError,
    AppResult,
    Bootstrap,
    ProxyConfig,
    Server,
    Shutdown,
    GLOBAL_CONFIG,
};
pub use cluster::ClusterManager;
pub use router::Routers;
