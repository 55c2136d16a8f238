mod msgpool;
mod multiplex;
mod per_request;

pub use msgpool::{MsgConnPool, MsgConnPoolBuilder, RECONNECT_BACKOFF};
pub use multiplex::MultiplexPool;
pub use per_request::PerRequestPool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use tokio::time;

use crate::cluster::Host;
use crate::protocol::{BoxFrame, Protocol, ProtocolName};
use crate::proxy::RequestCtx;
use crate::stream::StreamConnection;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Init,
    Connecting,
    Ready,
    Draining,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailure {
    Overflow,
    ConnectionFailure,
    Destroyed,
}

impl From<PoolFailure> for AppError {
    fn from(reason: PoolFailure) -> AppError {
        match reason {
            PoolFailure::Overflow => AppError::Overflow,
            PoolFailure::ConnectionFailure => {
                AppError::ConnectFailure("pool could not open a connection".to_string())
            }
            PoolFailure::Destroyed => AppError::PoolDestroyed,
        }
    }
}

/// Owner of the connections to one endpoint, mediating admission and
/// reuse. One pool exists per `(cluster, endpoint, protocol)`.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn protocol(&self) -> ProtocolName;

    fn host(&self) -> Arc<Host>;

    fn state(&self) -> PoolState;

    async fn new_stream(&self, ctx: &RequestCtx) -> Result<PooledStream, PoolFailure>;

    /// Close the live connections; safe to call repeatedly.
    fn close(&self);

    /// Close and refuse any further streams; in-flight streams observe a
    /// termination reset.
    fn destroy(&self);
}

pub type PoolFactory = fn(Arc<Host>) -> Arc<dyn ConnectionPool>;

static POOL_FACTORIES: Lazy<StdRwLock<HashMap<ProtocolName, PoolFactory>>> =
    Lazy::new(|| StdRwLock::new(HashMap::new()));

/// Register the pool profile used for a protocol's upstream
/// connections. Duplicate names replace the prior factory.
pub fn register_pool_factory(protocol: ProtocolName, factory: PoolFactory) {
    POOL_FACTORIES
        .write()
        .expect("pool factory registry lock poisoned")
        .insert(protocol, factory);
}

pub fn pool_factory(protocol: &str) -> Option<PoolFactory> {
    POOL_FACTORIES
        .read()
        .expect("pool factory registry lock poisoned")
        .get(protocol)
        .copied()
}

/// Accounting token for one upstream stream. Construction bumps the
/// request counters and admission gauge, drop releases them; since drop
/// runs exactly once the counters can never leak on any exit path.
pub struct StreamGuard {
    host: Arc<Host>,
    client_active: Option<Arc<AtomicU64>>,
}

impl StreamGuard {
    pub fn new(host: Arc<Host>, client_active: Option<Arc<AtomicU64>>) -> StreamGuard {
        host.stats().upstream_request_total.inc();
        host.stats().upstream_request_active.inc();
        let info = host.cluster_info();
        info.stats().upstream_request_total.inc();
        info.stats().upstream_request_active.inc();
        info.resource_manager().requests().increase();
        if let Some(active) = &client_active {
            active.fetch_add(1, Ordering::Relaxed);
        }
        StreamGuard {
            host,
            client_active,
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.host.stats().upstream_request_active.dec();
        let info = self.host.cluster_info();
        info.stats().upstream_request_active.dec();
        info.resource_manager().requests().decrease();
        if let Some(active) = &self.client_active {
            active.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// One admitted upstream stream. `request` drives the full exchange:
/// write, await the correlated response, and on expiry reset the
/// upstream stream before surfacing the timeout.
pub struct PooledStream {
    stream_conn: Arc<StreamConnection>,
    host: Arc<Host>,
    _guard: StreamGuard,
    on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl PooledStream {
    pub fn new(
        stream_conn: Arc<StreamConnection>,
        host: Arc<Host>,
        guard: StreamGuard,
        on_complete: Option<Box<dyn FnOnce(bool) + Send>>,
    ) -> PooledStream {
        PooledStream {
            stream_conn,
            host,
            _guard: guard,
            on_complete,
        }
    }

    pub async fn request(mut self, frame: BoxFrame, timeout: Duration) -> AppResult<BoxFrame> {
        let (local_id, rx) = match self.stream_conn.send_request(frame).await {
            Ok(pair) => pair,
            Err(e) => {
                self.finish(false);
                return Err(e);
            }
        };

        match time::timeout(timeout, rx).await {
            Err(_) => {
                self.stream_conn.reset(local_id);
                self.host.stats().upstream_request_timeout.inc();
                self.host.stats().upstream_request_local_reset.inc();
                let info = self.host.cluster_info();
                info.stats().upstream_request_timeout.inc();
                info.stats().upstream_request_local_reset.inc();
                self.finish(false);
                Err(AppError::RequestTimeout)
            }
            Ok(Err(_)) => {
                self.host.stats().upstream_request_failure_eject.inc();
                self.host
                    .cluster_info()
                    .stats()
                    .upstream_request_failure_eject
                    .inc();
                self.finish(false);
                Err(AppError::StreamReset(
                    "upstream connection terminated".to_string(),
                ))
            }
            Ok(Ok(response)) => {
                self.finish(true);
                Ok(response)
            }
        }
    }

    pub async fn request_oneway(mut self, frame: BoxFrame) -> AppResult<()> {
        let result = self.stream_conn.send_oneway(frame).await;
        self.finish(result.is_ok());
        result
    }

    fn finish(&mut self, ok: bool) {
        if let Some(complete) = self.on_complete.take() {
            complete(ok);
        }
    }
}

/// Keep-alive source for message pools: yields the bytes to write on a
/// read-idle window.
pub trait KeepAlive: Send + Sync {
    fn keep_alive_data(&self) -> Bytes;

    fn stop(&self);
}

/// Raw inbound data hook for message pools, re-installed after every
/// reconnect.
pub trait ReadFilter: Send + Sync {
    fn on_data(&self, buf: &mut bytes::BytesMut);
}

/// Codec-backed keep-alive: every trigger is a fresh heartbeat frame
/// with its own id.
pub struct HeartbeatKeepAlive {
    codec: Arc<dyn Protocol>,
    next_id: AtomicU64,
    stopped: std::sync::atomic::AtomicBool,
}

impl HeartbeatKeepAlive {
    pub fn new(codec: Arc<dyn Protocol>) -> HeartbeatKeepAlive {
        HeartbeatKeepAlive {
            codec,
            next_id: AtomicU64::new(1),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl KeepAlive for HeartbeatKeepAlive {
    fn keep_alive_data(&self) -> Bytes {
        if self.stopped.load(Ordering::Relaxed) {
            return Bytes::new();
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.heartbeat_trigger(id);
        match self.codec.encode(frame.as_ref()) {
            Ok(buf) => buf.freeze(),
            Err(_) => Bytes::new(),
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
