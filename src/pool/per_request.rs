use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::Host;
use crate::network::{Connection, ConnectionEvent};
use crate::protocol::{Protocol, ProtocolName};
use crate::proxy::RequestCtx;
use crate::service::global_config;
use crate::stream::StreamConnection;
use crate::utils::spawn_logged;

use super::{ConnectionPool, PoolFailure, PoolState, PooledStream, StreamGuard};

struct PoolClient {
    conn: Arc<Connection>,
    stream_conn: Arc<StreamConnection>,
}

/// Free-list pool for protocols that dedicate a connection to each
/// in-flight request. A completed stream returns its client to the
/// list; a closed one is discarded.
pub struct PerRequestPool {
    host: StdRwLock<Arc<Host>>,
    codec: Arc<dyn Protocol>,
    idle: StdMutex<Vec<Arc<PoolClient>>>,
    total: AtomicU32,
    max_connections: u32,
    destroyed: AtomicBool,
    self_weak: Weak<PerRequestPool>,
}

impl PerRequestPool {
    pub fn new(host: Arc<Host>, codec: Arc<dyn Protocol>) -> Arc<PerRequestPool> {
        let max_connections = global_config().upstream.per_host_max_connections;
        Arc::new_cyclic(|self_weak| PerRequestPool {
            host: StdRwLock::new(host),
            codec,
            idle: StdMutex::new(Vec::new()),
            total: AtomicU32::new(0),
            max_connections,
            destroyed: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    fn current_host(&self) -> Arc<Host> {
        self.host.read().expect("pool host lock poisoned").clone()
    }

    fn pop_idle(&self) -> Option<Arc<PoolClient>> {
        let mut idle = self.idle.lock().expect("pool idle lock poisoned");
        while let Some(client) = idle.pop() {
            if client.stream_conn.is_active() {
                return Some(client);
            }
            // closed while parked
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        None
    }

    fn recycle(&self, client: Arc<PoolClient>, reusable: bool) {
        if reusable && client.stream_conn.is_active() && !self.destroyed.load(Ordering::Acquire) {
            self.idle
                .lock()
                .expect("pool idle lock poisoned")
                .push(client);
            return;
        }
        self.total.fetch_sub(1, Ordering::Relaxed);
        let conn = client.conn.clone();
        spawn_logged("per-request pool discard", async move {
            conn.close(ConnectionEvent::LocalClose).await;
        });
    }

    async fn open_client(&self) -> Result<Arc<PoolClient>, PoolFailure> {
        let host = self.current_host();
        if self.total.fetch_add(1, Ordering::Relaxed) >= self.max_connections {
            self.total.fetch_sub(1, Ordering::Relaxed);
            host.stats().upstream_request_pending_overflow.inc();
            host.cluster_info()
                .stats()
                .upstream_request_pending_overflow
                .inc();
            return Err(PoolFailure::Overflow);
        }
        match Connection::connect(host.address(), host.cluster_info().connect_timeout()).await {
            Ok(conn) => {
                let stream_conn = StreamConnection::new_client(conn.clone(), self.codec.clone());
                spawn_logged("upstream stream dispatch", stream_conn.clone().dispatch());
                host.stats().upstream_connection_total.inc();
                host.cluster_info().stats().upstream_connection_total.inc();
                Ok(Arc::new(PoolClient { conn, stream_conn }))
            }
            Err(e) => {
                debug!("connect to {} failed: {}", host.address(), e);
                self.total.fetch_sub(1, Ordering::Relaxed);
                host.stats().upstream_connection_con_fail.inc();
                host.cluster_info().stats().upstream_connection_con_fail.inc();
                Err(PoolFailure::ConnectionFailure)
            }
        }
    }
}

#[async_trait]
impl ConnectionPool for PerRequestPool {
    fn protocol(&self) -> ProtocolName {
        self.codec.name()
    }

    fn host(&self) -> Arc<Host> {
        self.current_host()
    }

    fn state(&self) -> PoolState {
        if self.destroyed.load(Ordering::Acquire) {
            PoolState::Destroyed
        } else if self.total.load(Ordering::Relaxed) > 0 {
            PoolState::Ready
        } else {
            PoolState::Init
        }
    }

    async fn new_stream(&self, _ctx: &RequestCtx) -> Result<PooledStream, PoolFailure> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PoolFailure::Destroyed);
        }
        let client = match self.pop_idle() {
            Some(client) => client,
            None => self.open_client().await?,
        };

        let host = self.current_host();
        let guard = StreamGuard::new(host.clone(), None);
        let pool = self.self_weak.clone();
        let recycled = client.clone();
        let on_complete = Box::new(move |ok: bool| {
            if let Some(pool) = pool.upgrade() {
                pool.recycle(recycled, ok);
            }
        });
        Ok(PooledStream::new(
            client.stream_conn.clone(),
            host,
            guard,
            Some(on_complete),
        ))
    }

    fn close(&self) {
        let drained: Vec<Arc<PoolClient>> = {
            let mut idle = self.idle.lock().expect("pool idle lock poisoned");
            idle.drain(..).collect()
        };
        for client in drained {
            self.total.fetch_sub(1, Ordering::Relaxed);
            let conn = client.conn.clone();
            spawn_logged("per-request pool close", async move {
                conn.close(ConnectionEvent::LocalClose).await;
            });
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::cluster::{ClusterConfig, ClusterInfo, HostConfig};
    use crate::protocol::bolt::{BoltProtocol, BoltRequest, BoltResponse, RESPONSE_STATUS_SUCCESS};
    use crate::protocol::{Frame, Header};

    fn test_host(addr: &str) -> Arc<Host> {
        let info = ClusterInfo::new(&ClusterConfig {
            name: "test".to_string(),
            ..Default::default()
        });
        Host::new(
            &HostConfig {
                address: addr.to_string(),
                weight: 1,
            },
            info,
        )
    }

    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let codec = BoltProtocol;
                    let mut buf = BytesMut::new();
                    loop {
                        match crate::protocol::Protocol::decode(&codec, &mut buf) {
                            Ok(Some(frame)) => {
                                let response = BoltResponse::new(
                                    frame.request_id() as u32,
                                    RESPONSE_STATUS_SUCCESS,
                                    Bytes::new(),
                                    Header::new(),
                                    Bytes::from_static(b"ok"),
                                );
                                let data =
                                    crate::protocol::Protocol::encode(&codec, &response).unwrap();
                                if socket.write_all(&data).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {
                                if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                                    return;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                });
            }
        });
        addr
    }

    fn request_frame(id: u32) -> Box<BoltRequest> {
        Box::new(BoltRequest::new(
            id,
            Bytes::from_static(b"svc"),
            1000,
            Header::new(),
            Bytes::from_static(b"ping"),
        ))
    }

    #[tokio::test]
    async fn test_client_is_reused_after_completion() {
        let addr = echo_upstream().await;
        let pool = PerRequestPool::new(test_host(&addr), Arc::new(BoltProtocol));
        let ctx = RequestCtx::default();

        let stream = pool.new_stream(&ctx).await.unwrap();
        let response = stream
            .request(request_frame(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.request_id(), 1);
        assert_eq!(pool.total.load(Ordering::Relaxed), 1);
        assert_eq!(pool.idle.lock().unwrap().len(), 1, "client parked as idle");

        let stream = pool.new_stream(&ctx).await.unwrap();
        assert_eq!(pool.idle.lock().unwrap().len(), 0, "idle client reused");
        let response = stream
            .request(request_frame(2), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.request_id(), 2);
        assert_eq!(
            pool.total.load(Ordering::Relaxed),
            1,
            "no extra connection was opened"
        );
    }

    #[tokio::test]
    async fn test_destroyed_pool_refuses_streams() {
        let addr = echo_upstream().await;
        let pool = PerRequestPool::new(test_host(&addr), Arc::new(BoltProtocol));
        pool.destroy();
        assert_eq!(
            pool.new_stream(&RequestCtx::default()).await.err(),
            Some(PoolFailure::Destroyed)
        );
    }
}
