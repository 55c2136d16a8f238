use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::Host;
use crate::network::{Connection, ConnectionEvent, ConnectionEventListener};
use crate::protocol::{Protocol, ProtocolName};
use crate::proxy::RequestCtx;
use crate::service::global_config;
use crate::stream::StreamConnection;
use crate::utils::spawn_logged;
use crate::AppError;

use super::{ConnectionPool, PoolFailure, PoolState, PooledStream, StreamGuard};

/// One live multiplexed client carrying every stream to the endpoint.
pub(crate) struct ActiveClient {
    conn: Arc<Connection>,
    stream_conn: Arc<StreamConnection>,
    pub(crate) goaway: AtomicBool,
    total_streams: AtomicU64,
    active_requests: Arc<AtomicU64>,
}

impl ActiveClient {
    pub(crate) fn total_streams(&self) -> u64 {
        self.total_streams.load(Ordering::Relaxed)
    }

    pub(crate) fn active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Mark the client as draining; the next stream gets a fresh one.
    pub fn on_goaway(&self) {
        self.goaway.store(true, Ordering::Release);
    }
}

/// Single-connection multiplexed pool. All streams ride one active
/// client; a drained (goaway) or closed client is replaced on the next
/// `new_stream`.
pub struct MultiplexPool {
    host: StdRwLock<Arc<Host>>,
    codec: Arc<dyn Protocol>,
    pub(crate) client: StdMutex<Option<Arc<ActiveClient>>>,
    destroyed: AtomicBool,
    self_weak: Weak<MultiplexPool>,
}

struct ClientListener {
    pool: Weak<MultiplexPool>,
    client: Weak<ActiveClient>,
}

impl ConnectionEventListener for ClientListener {
    fn on_event(&self, event: ConnectionEvent) {
        // the pool may be long gone when a stale connection reports in
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        pool.on_connection_event(&self.client, event);
    }
}

impl MultiplexPool {
    pub fn new(host: Arc<Host>, codec: Arc<dyn Protocol>) -> Arc<MultiplexPool> {
        Arc::new_cyclic(|self_weak| MultiplexPool {
            host: StdRwLock::new(host),
            codec,
            client: StdMutex::new(None),
            destroyed: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    pub fn update_host(&self, host: Arc<Host>) {
        *self.host.write().expect("pool host lock poisoned") = host;
    }

    fn current_host(&self) -> Arc<Host> {
        self.host.read().expect("pool host lock poisoned").clone()
    }

    fn on_connection_event(&self, client: &Weak<ActiveClient>, event: ConnectionEvent) {
        let host = self.current_host();
        if event.is_close() {
            if let Some(client) = client.upgrade() {
                if client.active_requests() > 0 {
                    match event {
                        ConnectionEvent::LocalClose => {
                            host.stats()
                                .upstream_connection_local_close_with_active_request
                                .inc();
                            host.cluster_info()
                                .stats()
                                .upstream_connection_local_close_with_active_request
                                .inc();
                        }
                        ConnectionEvent::RemoteClose => {
                            host.stats()
                                .upstream_connection_remote_close_with_active_request
                                .inc();
                            host.cluster_info()
                                .stats()
                                .upstream_connection_remote_close_with_active_request
                                .inc();
                        }
                        _ => {}
                    }
                }
                host.stats().upstream_connection_active.dec();
                host.cluster_info().stats().upstream_connection_active.dec();

                // clear the slot only if it still holds this client
                let mut slot = self.client.lock().expect("pool client lock poisoned");
                let holds_client = slot
                    .as_ref()
                    .map(|current| Arc::ptr_eq(current, &client))
                    .unwrap_or(false);
                if holds_client {
                    *slot = None;
                }
            }
        }
    }

    async fn connect_client(&self) -> Result<Arc<ActiveClient>, PoolFailure> {
        let host = self.current_host();
        let conn = match Connection::connect(host.address(), host.cluster_info().connect_timeout())
            .await
        {
            Ok(conn) => conn,
            Err(AppError::ConnectTimeout(addr)) => {
                debug!("connect to {} timed out", addr);
                host.stats().upstream_request_timeout.inc();
                host.cluster_info().stats().upstream_request_timeout.inc();
                return Err(PoolFailure::ConnectionFailure);
            }
            Err(e) => {
                debug!("connect to {} failed: {}", host.address(), e);
                host.stats().upstream_connection_con_fail.inc();
                host.cluster_info().stats().upstream_connection_con_fail.inc();
                return Err(PoolFailure::ConnectionFailure);
            }
        };

        let heartbeat_ms = global_config().upstream.heartbeat_interval_ms;
        if heartbeat_ms > 0 {
            conn.set_read_timeout(Some(Duration::from_millis(heartbeat_ms)));
        }

        let stream_conn = StreamConnection::new_client(conn.clone(), self.codec.clone());
        let client = Arc::new(ActiveClient {
            conn: conn.clone(),
            stream_conn: stream_conn.clone(),
            goaway: AtomicBool::new(false),
            total_streams: AtomicU64::new(0),
            active_requests: Arc::new(AtomicU64::new(0)),
        });
        conn.add_event_listener(Arc::new(ClientListener {
            pool: self.self_weak.clone(),
            client: Arc::downgrade(&client),
        }));
        if heartbeat_ms > 0 {
            conn.add_event_listener(Arc::new(ClientKeepAlive {
                stream_conn: Arc::downgrade(&stream_conn),
            }));
        }
        spawn_logged("upstream stream dispatch", stream_conn.clone().dispatch());

        host.stats().upstream_connection_total.inc();
        host.stats().upstream_connection_active.inc();
        host.cluster_info().stats().upstream_connection_total.inc();
        host.cluster_info().stats().upstream_connection_active.inc();

        Ok(client)
    }

    fn take_reusable_client(&self) -> Option<Arc<ActiveClient>> {
        let mut slot = self.client.lock().expect("pool client lock poisoned");
        let current = slot.clone()?;
        if current.goaway.load(Ordering::Acquire) || !current.stream_conn.is_active() {
            *slot = None;
            return None;
        }
        Some(current)
    }
}

#[async_trait]
impl ConnectionPool for MultiplexPool {
    fn protocol(&self) -> ProtocolName {
        self.codec.name()
    }

    fn host(&self) -> Arc<Host> {
        self.current_host()
    }

    fn state(&self) -> PoolState {
        if self.destroyed.load(Ordering::Acquire) {
            return PoolState::Destroyed;
        }
        match self.client.lock().expect("pool client lock poisoned").as_ref() {
            Some(client) if client.goaway.load(Ordering::Acquire) => PoolState::Draining,
            Some(_) => PoolState::Ready,
            None => PoolState::Init,
        }
    }

    async fn new_stream(&self, _ctx: &RequestCtx) -> Result<PooledStream, PoolFailure> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PoolFailure::Destroyed);
        }

        let host = self.current_host();
        if !host.cluster_info().resource_manager().requests().can_create() {
            host.stats().upstream_request_pending_overflow.inc();
            host.cluster_info()
                .stats()
                .upstream_request_pending_overflow
                .inc();
            return Err(PoolFailure::Overflow);
        }

        let client = match self.take_reusable_client() {
            Some(client) => client,
            None => {
                // connect outside the slot lock; a concurrent creator
                // may win the install race, in which case the extra
                // connection is discarded
                let fresh = self.connect_client().await?;
                if self.destroyed.load(Ordering::Acquire) {
                    let conn = fresh.conn.clone();
                    spawn_logged("discard connection", async move {
                        conn.close(ConnectionEvent::LocalClose).await;
                    });
                    return Err(PoolFailure::Destroyed);
                }
                let winner = {
                    let mut slot = self.client.lock().expect("pool client lock poisoned");
                    match slot.clone() {
                        Some(winner) => Some(winner),
                        None => {
                            *slot = Some(fresh.clone());
                            None
                        }
                    }
                };
                match winner {
                    Some(winner) => {
                        let conn = fresh.conn.clone();
                        spawn_logged("discard connection", async move {
                            conn.close(ConnectionEvent::LocalClose).await;
                        });
                        winner
                    }
                    None => fresh,
                }
            }
        };

        client.total_streams.fetch_add(1, Ordering::Relaxed);
        let guard = StreamGuard::new(host.clone(), Some(client.active_requests.clone()));
        Ok(PooledStream::new(
            client.stream_conn.clone(),
            host,
            guard,
            None,
        ))
    }

    fn close(&self) {
        let client = self
            .client
            .lock()
            .expect("pool client lock poisoned")
            .clone();
        if let Some(client) = client {
            let conn = client.conn.clone();
            spawn_logged("pool close", async move {
                conn.close(ConnectionEvent::LocalClose).await;
            });
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.close();
    }
}

/// Writes a fresh heartbeat whenever the upstream connection is
/// read-idle; a failed heartbeat round trip surfaces through the normal
/// close events.
struct ClientKeepAlive {
    stream_conn: Weak<StreamConnection>,
}

impl ConnectionEventListener for ClientKeepAlive {
    fn on_event(&self, event: ConnectionEvent) {
        if event != ConnectionEvent::OnReadTimeout {
            return;
        }
        let Some(stream_conn) = self.stream_conn.upgrade() else {
            return;
        };
        spawn_logged("upstream heartbeat", async move {
            let trigger = stream_conn.codec().heartbeat_trigger(0);
            match stream_conn.send_request(trigger).await {
                Ok((local_id, rx)) => {
                    let wait = tokio::time::timeout(Duration::from_secs(5), rx).await;
                    if wait.is_err() || matches!(wait, Ok(Err(_))) {
                        stream_conn.reset(local_id);
                        debug!("upstream heartbeat went unanswered, closing");
                        stream_conn
                            .connection()
                            .close(ConnectionEvent::OnReadErrClose)
                            .await;
                    }
                }
                Err(e) => {
                    debug!("upstream heartbeat write failed: {}", e);
                    stream_conn
                        .connection()
                        .close(ConnectionEvent::OnReadErrClose)
                        .await;
                }
            }
        });
    }
}
