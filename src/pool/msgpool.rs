use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

use crate::network::{ConnState, Connection, ConnectionEvent, ConnectionEventListener};
use crate::service::global_config;
use crate::utils::spawn_logged;
use crate::{AppError, AppResult};

use super::{KeepAlive, PoolState, ReadFilter};

/// Sleep applied before the n-th reconnect attempt; the last entry
/// repeats for every attempt past it.
pub const RECONNECT_BACKOFF: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

pub type KeepAliveFactory = Box<dyn Fn() -> Arc<dyn KeepAlive> + Send + Sync>;

/// Single long-lived message connection with keepalive and automatic
/// reconnect. Unlike the stream pools this one hands out no streams;
/// callers `write` raw message bytes and install read filters for the
/// inbound direction.
pub struct MsgConnPool {
    addr: String,
    auto_reconnect: bool,
    /// -1 removes the bound
    max_tries: i64,
    connect_timeout: Duration,
    read_timeout: Duration,
    keepalive_factory: KeepAliveFactory,
    read_filters: Vec<Arc<dyn ReadFilter>>,

    client: StdRwLock<Option<Arc<Connection>>>,
    keepalive: StdMutex<Option<Arc<dyn KeepAlive>>>,
    try_count: AtomicU32,
    /// serialises reconnect attempts so concurrent close events collapse
    reconnect_lock: Mutex<()>,
    destroyed: AtomicBool,
    self_weak: Weak<MsgConnPool>,
}

pub struct MsgConnPoolBuilder {
    addr: String,
    auto_reconnect: bool,
    max_tries: i64,
    connect_timeout: Duration,
    read_timeout: Duration,
    keepalive_factory: KeepAliveFactory,
    read_filters: Vec<Arc<dyn ReadFilter>>,
}

impl MsgConnPoolBuilder {
    pub fn new(addr: impl Into<String>) -> MsgConnPoolBuilder {
        MsgConnPoolBuilder {
            addr: addr.into(),
            auto_reconnect: true,
            max_tries: -1,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(15),
            keepalive_factory: Box::new(|| Arc::new(NoopKeepAlive)),
            read_filters: Vec::new(),
        }
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_tries(mut self, max_tries: i64) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn keepalive(mut self, factory: KeepAliveFactory) -> Self {
        self.keepalive_factory = factory;
        self
    }

    pub fn read_filter(mut self, filter: Arc<dyn ReadFilter>) -> Self {
        self.read_filters.push(filter);
        self
    }

    /// Build the pool and kick off the first connect attempt.
    pub fn build(self) -> Arc<MsgConnPool> {
        let pool = Arc::new_cyclic(|self_weak| MsgConnPool {
            addr: self.addr,
            auto_reconnect: self.auto_reconnect,
            max_tries: self.max_tries,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            keepalive_factory: self.keepalive_factory,
            read_filters: self.read_filters,
            client: StdRwLock::new(None),
            keepalive: StdMutex::new(None),
            try_count: AtomicU32::new(0),
            reconnect_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        });
        pool.schedule_reconnect();
        pool
    }
}

struct NoopKeepAlive;

impl KeepAlive for NoopKeepAlive {
    fn keep_alive_data(&self) -> bytes::Bytes {
        bytes::Bytes::new()
    }

    fn stop(&self) {}
}

impl MsgConnPool {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn try_count(&self) -> u32 {
        self.try_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PoolState {
        if self.destroyed.load(Ordering::Acquire) {
            return PoolState::Destroyed;
        }
        if self.available() {
            return PoolState::Ready;
        }
        if self.try_count() > 0 {
            PoolState::Connecting
        } else {
            PoolState::Init
        }
    }

    fn active_client(&self) -> Option<Arc<Connection>> {
        let client = self.client.read().expect("msg pool client lock poisoned");
        match client.as_ref() {
            Some(conn) if conn.state() == ConnState::Active => Some(conn.clone()),
            _ => None,
        }
    }

    /// Whether a request written now would go out on a live connection.
    pub fn available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire) && self.active_client().is_some()
    }

    /// Write message bytes; fails unless the connection is active.
    pub async fn write(&self, data: &[u8]) -> AppResult<()> {
        match self.active_client() {
            Some(conn) => conn.write(data).await,
            None => Err(AppError::ConnectionNotReady(self.addr.clone())),
        }
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let client = self
            .client
            .read()
            .expect("msg pool client lock poisoned")
            .clone();
        if let Some(conn) = client {
            spawn_logged("msg pool destroy", async move {
                conn.close(ConnectionEvent::LocalClose).await;
            });
        }
    }

    /// Queue one reconnect attempt. Attempts are serialised behind the
    /// reconnect lock; the backoff entry for the current try count is
    /// slept before connecting and the counter resets to zero only on
    /// success.
    fn schedule_reconnect(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let Some(pool) = self.self_weak.upgrade() else {
            return;
        };
        spawn_logged("msg pool reconnect", async move {
            let _serialised = pool.reconnect_lock.lock().await;
            if pool.destroyed.load(Ordering::Acquire) || pool.available() {
                return;
            }
            let tries = pool.try_count.load(Ordering::Acquire);
            if pool.max_tries >= 0 && (tries as i64) >= pool.max_tries {
                warn!(
                    "msg pool {} stopped reconnecting after {} tries",
                    pool.addr, tries
                );
                return;
            }
            let idx = (tries as usize).min(RECONNECT_BACKOFF.len() - 1);
            time::sleep(RECONNECT_BACKOFF[idx]).await;
            pool.try_count.fetch_add(1, Ordering::AcqRel);
            if pool.destroyed.load(Ordering::Acquire) {
                return;
            }
            pool.init_connection().await;
        });
    }

    async fn init_connection(&self) {
        match Connection::connect(&self.addr, self.connect_timeout).await {
            Err(e) => {
                warn!(
                    "msg pool {} connect failed on try {}: {}",
                    self.addr,
                    self.try_count(),
                    e
                );
                if self.auto_reconnect {
                    self.schedule_reconnect();
                }
            }
            Ok(conn) => {
                // the pool may have been destroyed while connecting
                if self.destroyed.load(Ordering::Acquire) {
                    conn.close(ConnectionEvent::LocalClose).await;
                    return;
                }
                conn.set_read_timeout(Some(self.read_timeout));
                conn.add_event_listener(Arc::new(MsgClientListener {
                    pool: self.self_weak.clone(),
                    conn: Arc::downgrade(&conn),
                }));

                // re-arm the keepalive, stopping the previous one
                let keepalive = (self.keepalive_factory)();
                {
                    let mut slot = self.keepalive.lock().expect("keepalive lock poisoned");
                    if let Some(prev) = slot.replace(keepalive.clone()) {
                        prev.stop();
                    }
                }
                conn.add_event_listener(Arc::new(KeepAliveListener {
                    conn: Arc::downgrade(&conn),
                    keepalive,
                }));

                // re-install the read filters on the fresh connection
                spawn_logged(
                    "msg pool read",
                    read_loop(conn.clone(), self.read_filters.clone()),
                );

                *self.client.write().expect("msg pool client lock poisoned") = Some(conn);
                info!(
                    "msg pool {} connected after {} tries",
                    self.addr,
                    self.try_count()
                );
                self.try_count.store(0, Ordering::Release);
            }
        }
    }
}

async fn read_loop(conn: Arc<Connection>, filters: Vec<Arc<dyn ReadFilter>>) {
    let Some(mut reader) = conn.take_reader() else {
        return;
    };
    let mut buf = BytesMut::with_capacity(global_config().network.conn_read_buffer_size);
    loop {
        let read = match conn.read_timeout() {
            Some(timeout) => match time::timeout(timeout, reader.read_buf(&mut buf)).await {
                Err(_) => {
                    conn.fire_event(ConnectionEvent::OnReadTimeout);
                    continue;
                }
                Ok(r) => r,
            },
            None => reader.read_buf(&mut buf).await,
        };
        match read {
            Ok(0) => {
                conn.close(ConnectionEvent::RemoteClose).await;
                return;
            }
            Ok(n) => {
                conn.record_bytes_read(n);
                for filter in &filters {
                    filter.on_data(&mut buf);
                }
            }
            Err(e) => {
                debug!("msg pool read error: {}", e);
                conn.close(ConnectionEvent::OnReadErrClose).await;
                return;
            }
        }
    }
}

/// Re-enters the reconnect path on any close event.
struct MsgClientListener {
    pool: Weak<MsgConnPool>,
    conn: Weak<Connection>,
}

impl ConnectionEventListener for MsgClientListener {
    fn on_event(&self, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if pool.destroyed.load(Ordering::Acquire) {
            return;
        }
        // drop the slot if it still refers to the closed connection
        if let Some(closed) = self.conn.upgrade() {
            let mut slot = pool.client.write().expect("msg pool client lock poisoned");
            let holds_closed = slot
                .as_ref()
                .map(|current| Arc::ptr_eq(current, &closed))
                .unwrap_or(false);
            if holds_closed {
                *slot = None;
            }
        }
        if pool.auto_reconnect {
            warn!("msg pool {} reconnecting after {:?}", pool.addr, event);
            pool.schedule_reconnect();
        }
    }
}

/// On a read-idle window, writes the keepalive bytes; a failed write
/// closes the connection so the close event re-enters the reconnect
/// path above.
struct KeepAliveListener {
    conn: Weak<Connection>,
    keepalive: Arc<dyn KeepAlive>,
}

impl ConnectionEventListener for KeepAliveListener {
    fn on_event(&self, event: ConnectionEvent) {
        if event != ConnectionEvent::OnReadTimeout {
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        let data = self.keepalive.keep_alive_data();
        if data.is_empty() {
            return;
        }
        spawn_logged("msg pool keepalive", async move {
            if conn.write(&data).await.is_err() {
                conn.close(ConnectionEvent::OnReadErrClose).await;
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_table_is_monotone() {
        for window in RECONNECT_BACKOFF.windows(2) {
            assert!(window[0] <= window[1]);
        }
        assert_eq!(RECONNECT_BACKOFF[0], Duration::ZERO);
        assert_eq!(RECONNECT_BACKOFF[4], Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_write_fails_when_not_connected() {
        // nothing listens on the target port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = MsgConnPoolBuilder::new(addr)
            .auto_reconnect(false)
            .max_tries(1)
            .build();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pool.available());
        assert!(matches!(
            pool.write(b"data").await,
            Err(AppError::ConnectionNotReady(_))
        ));
        pool.destroy();
    }
}
