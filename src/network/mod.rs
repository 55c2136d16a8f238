mod connection;

pub use connection::Connection;

/// Connection lifecycle events delivered to registered listeners. Pools
/// drive their accounting and reconnect logic from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    ConnectTimeout,
    ConnectFailed,
    RemoteClose,
    LocalClose,
    OnReadErrClose,
    OnWriteErrClose,
    OnWriteTimeout,
    OnReadTimeout,
}

impl ConnectionEvent {
    pub fn is_close(self) -> bool {
        matches!(
            self,
            ConnectionEvent::RemoteClose
                | ConnectionEvent::LocalClose
                | ConnectionEvent::OnReadErrClose
                | ConnectionEvent::OnWriteErrClose
                | ConnectionEvent::OnWriteTimeout
        )
    }

    pub fn is_connect_failure(self) -> bool {
        matches!(
            self,
            ConnectionEvent::ConnectTimeout | ConnectionEvent::ConnectFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Active,
    Closed,
}

pub trait ConnectionEventListener: Send + Sync {
    fn on_event(&self, event: ConnectionEvent);
}
