use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use crate::{AppError, AppResult};

use super::{ConnState, ConnectionEvent, ConnectionEventListener};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const STATE_CONNECTING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One TCP connection with a serialised writer lane and a takeable read
/// half. The read loop is owned by whoever drives the connection (the
/// stream layer or a raw pool read task); writes from any task funnel
/// through the internal lock so frames are never interleaved.
pub struct Connection {
    id: u64,
    peer_addr: String,
    state: AtomicU8,
    reader: StdMutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    listeners: StdRwLock<Vec<Arc<dyn ConnectionEventListener>>>,
    /// read idle window in millis, 0 disables the timeout
    read_timeout_ms: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn from_stream(stream: TcpStream) -> Arc<Connection> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (reader, writer) = stream.into_split();
        Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            state: AtomicU8::new(STATE_ACTIVE),
            reader: StdMutex::new(Some(reader)),
            writer: Mutex::new(Some(BufWriter::new(writer))),
            listeners: StdRwLock::new(Vec::new()),
            read_timeout_ms: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Establish an upstream connection within `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> AppResult<Arc<Connection>> {
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => Err(AppError::ConnectTimeout(addr.to_string())),
            Ok(Err(e)) => Err(AppError::ConnectFailure(format!("{}: {}", addr, e))),
            Ok(Ok(stream)) => Ok(Connection::from_stream(stream)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ConnState::Connecting,
            STATE_ACTIVE => ConnState::Active,
            _ => ConnState::Closed,
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        let millis = timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.read_timeout_ms.store(millis, Ordering::Relaxed);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ConnectionEventListener>) {
        self.listeners
            .write()
            .expect("connection listener lock poisoned")
            .push(listener);
    }

    pub(crate) fn fire_event(&self, event: ConnectionEvent) {
        let listeners = self
            .listeners
            .read()
            .expect("connection listener lock poisoned")
            .clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    /// Hand the read half to the task that will own the read loop. Each
    /// connection has exactly one logical reader.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .take()
    }

    pub(crate) fn record_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub async fn write(&self, data: &[u8]) -> AppResult<()> {
        if self.state() != ConnState::Active {
            return Err(AppError::ConnectionNotReady(self.peer_addr.clone()));
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(AppError::ConnectionNotReady(self.peer_addr.clone()));
        };
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;
        drop(guard);

        match result {
            Ok(()) => {
                self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.close(ConnectionEvent::OnWriteErrClose).await;
                Err(AppError::DetailedIoError(format!(
                    "write to {} failed: {}",
                    self.peer_addr, e
                )))
            }
        }
    }

    /// Close the connection and notify listeners with `event`. Repeated
    /// closes are no-ops; exactly one event is fired.
    pub async fn close(&self, event: ConnectionEvent) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(
            "connection {} to {} closed: {:?}",
            self.id, self.peer_addr, event
        );
        self.fire_event(event);
    }
}
