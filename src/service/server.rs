use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error};

use crate::network::{Connection, ConnectionEvent};
use crate::protocol::Protocol;
use crate::proxy::{start_request_handlers, ProxyHandler, ProxyTask, RequestCtx};
use crate::stream::{StreamConnection, StreamRequest};
use crate::utils::spawn_logged;
use crate::{AppError, AppResult};

use super::{global_config, Shutdown};

/// Downstream TCP server: accepts connections under a permit cap and
/// wires each one into the stream layer and the shared request worker
/// pool.
pub struct Server {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    handler: Arc<ProxyHandler>,
    codec: Arc<dyn Protocol>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        limit_connections: Arc<Semaphore>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: Arc<ProxyHandler>,
        codec: Arc<dyn Protocol>,
    ) -> Server {
        Server {
            listener,
            limit_connections,
            notify_shutdown,
            shutdown_complete_tx,
            handler,
            codec,
        }
    }

    /// Accept loop. Each connection gets its own dispatch task (the
    /// single logical reader) and a handler task that feeds decoded
    /// requests into the worker pool.
    pub async fn run(&self) -> AppResult<()> {
        let pool_config = &global_config().request_handler_pool;
        let task_tx = start_request_handlers(
            self.handler.clone(),
            pool_config,
            self.notify_shutdown.clone(),
        );
        let channel_capacity = pool_config.channel_capacity;

        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .expect("connection semaphore closed");

            let socket = self.accept().await?;
            let conn = Connection::from_stream(socket);
            debug!(
                "accepted connection {} from {}",
                conn.id(),
                conn.peer_addr()
            );

            let (request_tx, request_rx) = mpsc::channel(channel_capacity);
            let stream_conn =
                StreamConnection::new_server(conn, self.codec.clone(), request_tx);
            spawn_logged("downstream dispatch", stream_conn.clone().dispatch());

            let mut handler = ConnectionHandler {
                notify_shutdown: self.notify_shutdown.clone(),
                _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
                stream_conn,
                request_rx,
                task_tx: task_tx.clone(),
                protocol: self.codec.name().to_string(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.handle_connection().await {
                    error!("connection error: {:?}", err);
                }
                // whether gracefully or unexpectedly closed, release the permit
                drop(permit);
            });
        }
    }

    async fn accept(&self) -> AppResult<TcpStream> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

struct ConnectionHandler {
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
    stream_conn: Arc<StreamConnection>,
    request_rx: mpsc::Receiver<StreamRequest>,
    task_tx: async_channel::Sender<ProxyTask>,
    protocol: String,
}

impl ConnectionHandler {
    async fn handle_connection(&mut self) -> AppResult<()> {
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        loop {
            let maybe_request = tokio::select! {
                request = self.request_rx.recv() => request,
                _ = shutdown.recv() => {
                    debug!("connection handler exits after shutdown signal");
                    self.stream_conn
                        .connection()
                        .close(ConnectionEvent::LocalClose)
                        .await;
                    return Ok(());
                }
            };

            // the dispatch task dropped its sink, the connection is gone
            let Some(request) = maybe_request else {
                break;
            };

            let conn = self.stream_conn.connection();
            let task = ProxyTask {
                ctx: RequestCtx {
                    connection_id: conn.id(),
                    stream_id: request.stream_id,
                    downstream_addr: conn.peer_addr().to_string(),
                    protocol: self.protocol.clone(),
                },
                frame: request.frame,
                stream_conn: self.stream_conn.clone(),
            };

            if let Err(e) = self.task_tx.send(task).await {
                error!("failed to enqueue request: {:?}", e);
                return Err(AppError::ChannelSendError(e.to_string()));
            }
        }
        debug!("connection handler exit read loop");

        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!("connection handler dropped");
    }
}
