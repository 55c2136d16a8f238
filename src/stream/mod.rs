// Copyright 2025 The meshgate Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::network::{ConnState, Connection, ConnectionEvent};
use crate::protocol::{BoxFrame, Protocol, StreamType};
use crate::service::global_config;
use crate::{AppError, AppResult};

/// One decoded request handed to the receive sink, identified by the
/// local stream id the response must be sent back on.
#[derive(Debug)]
pub struct StreamRequest {
    pub stream_id: u64,
    pub frame: BoxFrame,
}

/// State of one in-flight exchange. Exactly one entry exists per
/// `(connection, local_id)` and it is removed in exactly one place:
/// response delivery or reset.
enum StreamEntry {
    /// server role: the peer id to restore before the response is written
    ServerStream { peer_id: u64 },
    /// client role: the caller-visible id to restore on delivery, plus
    /// the waiting receiver
    ClientStream {
        origin_id: u64,
        tx: oneshot::Sender<BoxFrame>,
    },
}

/// Turns one bidirectional byte stream into correlated request/response
/// streams. Stream ids are rewritten independently in each direction: a
/// monotone local counter keys the table on this side while the peer's
/// original id travels with the table entry.
pub struct StreamConnection {
    conn: Arc<Connection>,
    codec: Arc<dyn Protocol>,
    streams: DashMap<u64, StreamEntry>,
    next_stream_id: AtomicU64,
    request_sink: StdMutex<Option<mpsc::Sender<StreamRequest>>>,
}

impl StreamConnection {
    /// Server role: decoded requests are pushed into `sink`.
    pub fn new_server(
        conn: Arc<Connection>,
        codec: Arc<dyn Protocol>,
        sink: mpsc::Sender<StreamRequest>,
    ) -> Arc<StreamConnection> {
        Arc::new(StreamConnection {
            conn,
            codec,
            streams: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
            request_sink: StdMutex::new(Some(sink)),
        })
    }

    /// Client role: responses are correlated back to `send_request`
    /// callers; inbound requests are not expected.
    pub fn new_client(conn: Arc<Connection>, codec: Arc<dyn Protocol>) -> Arc<StreamConnection> {
        Arc::new(StreamConnection {
            conn,
            codec,
            streams: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
            request_sink: StdMutex::new(None),
        })
    }

    /// Both roles on one connection.
    pub fn new_duplex(
        conn: Arc<Connection>,
        codec: Arc<dyn Protocol>,
        sink: mpsc::Sender<StreamRequest>,
    ) -> Arc<StreamConnection> {
        StreamConnection::new_server(conn, codec, sink)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn codec(&self) -> &Arc<dyn Protocol> {
        &self.codec
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read loop. Decodes frames until the peer closes or the codec
    /// reports an impossible byte sequence, in which case the connection
    /// is torn down with `OnReadErrClose`.
    pub async fn dispatch(self: Arc<Self>) {
        let Some(mut reader) = self.conn.take_reader() else {
            error!(
                "connection {} read half already taken",
                self.conn.id()
            );
            return;
        };
        let mut buf = BytesMut::with_capacity(global_config().network.conn_read_buffer_size);

        loop {
            loop {
                match self.codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_frame(frame).await {
                            debug!(
                                "connection {} stopped handling frames: {}",
                                self.conn.id(),
                                e
                            );
                            self.teardown(ConnectionEvent::LocalClose).await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("connection {} decode error: {}", self.conn.id(), e);
                        self.teardown(ConnectionEvent::OnReadErrClose).await;
                        return;
                    }
                }
            }

            let read = match self.conn.read_timeout() {
                Some(timeout) => match time::timeout(timeout, reader.read_buf(&mut buf)).await {
                    Err(_) => {
                        self.conn.fire_event(ConnectionEvent::OnReadTimeout);
                        continue;
                    }
                    Ok(r) => r,
                },
                None => reader.read_buf(&mut buf).await,
            };

            match read {
                Ok(0) => {
                    trace!("connection {} closed by peer", self.conn.id());
                    self.teardown(ConnectionEvent::RemoteClose).await;
                    return;
                }
                Ok(n) => self.conn.record_bytes_read(n),
                Err(e) => {
                    debug!("connection {} read error: {}", self.conn.id(), e);
                    self.teardown(ConnectionEvent::OnReadErrClose).await;
                    return;
                }
            }
        }
    }

    async fn on_frame(&self, mut frame: BoxFrame) -> AppResult<()> {
        match frame.stream_type() {
            StreamType::Request | StreamType::OnewayRequest => {
                // heartbeats are answered here, the upper layers never
                // see them
                if frame.is_heartbeat() {
                    let reply = self.codec.heartbeat_reply(frame.request_id());
                    let data = self.codec.encode(reply.as_ref())?;
                    return self.conn.write(&data).await;
                }

                let sink = self
                    .request_sink
                    .lock()
                    .expect("request sink lock poisoned")
                    .clone();
                let Some(sink) = sink else {
                    warn!(
                        "connection {} received a request but has no server role",
                        self.conn.id()
                    );
                    return Ok(());
                };

                let local_id = self.next_stream_id();
                if frame.stream_type() == StreamType::Request {
                    self.streams.insert(
                        local_id,
                        StreamEntry::ServerStream {
                            peer_id: frame.request_id(),
                        },
                    );
                }
                frame.set_request_id(local_id);
                sink.send(StreamRequest {
                    stream_id: local_id,
                    frame,
                })
                .await
                .map_err(|e| AppError::ChannelSendError(e.to_string()))
            }
            StreamType::Response => {
                let id = frame.request_id();
                match self.streams.remove(&id) {
                    Some((_, StreamEntry::ClientStream { origin_id, tx })) => {
                        frame.set_request_id(origin_id);
                        // receiver may have timed out already
                        let _ = tx.send(frame);
                    }
                    Some((key, entry @ StreamEntry::ServerStream { .. })) => {
                        self.streams.insert(key, entry);
                        warn!(
                            "connection {} received a response on server stream {}",
                            self.conn.id(),
                            id
                        );
                    }
                    None => {
                        debug!(
                            "connection {} dropped response for unknown stream {}",
                            self.conn.id(),
                            id
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Client egress: allocate a local id, rewrite the outgoing frame,
    /// record the mapping and write the encoded bytes. The returned
    /// receiver yields the response carrying the caller's original id.
    pub async fn send_request(
        &self,
        mut frame: BoxFrame,
    ) -> AppResult<(u64, oneshot::Receiver<BoxFrame>)> {
        let origin_id = frame.request_id();
        let local_id = self.next_stream_id();
        frame.set_request_id(local_id);

        let (tx, rx) = oneshot::channel();
        self.streams
            .insert(local_id, StreamEntry::ClientStream { origin_id, tx });

        let data = self.codec.encode(frame.as_ref())?;
        if let Err(e) = self.conn.write(&data).await {
            self.streams.remove(&local_id);
            return Err(e);
        }
        Ok((local_id, rx))
    }

    /// Oneway egress: the id is rewritten for uniqueness on this
    /// connection but no response is expected and nothing is recorded.
    pub async fn send_oneway(&self, mut frame: BoxFrame) -> AppResult<()> {
        frame.set_request_id(self.next_stream_id());
        let data = self.codec.encode(frame.as_ref())?;
        self.conn.write(&data).await
    }

    /// Server egress: restore the peer's original id from the table,
    /// encode and write. The table entry is removed here.
    pub async fn send_response(&self, stream_id: u64, mut frame: BoxFrame) -> AppResult<()> {
        let Some((_, entry)) = self.streams.remove(&stream_id) else {
            return Err(AppError::IllegalState(format!(
                "no stream {} to respond on",
                stream_id
            )));
        };
        match entry {
            StreamEntry::ServerStream { peer_id } => {
                frame.set_request_id(peer_id);
                let data = self.codec.encode(frame.as_ref())?;
                self.conn.write(&data).await
            }
            client_entry => {
                self.streams.insert(stream_id, client_entry);
                Err(AppError::IllegalState(format!(
                    "stream {} is not a server stream",
                    stream_id
                )))
            }
        }
    }

    /// Drop the table entry for a stream. Used by timeout and reset
    /// paths; a response arriving later is discarded by `on_frame`.
    pub fn reset(&self, stream_id: u64) -> bool {
        self.streams.remove(&stream_id).is_some()
    }

    /// Close the connection and cancel every in-flight stream. Client
    /// waiters observe the cancellation as their sender being dropped.
    async fn teardown(&self, event: ConnectionEvent) {
        self.request_sink
            .lock()
            .expect("request sink lock poisoned")
            .take();
        self.conn.close(event).await;
        self.streams.clear();
    }

    pub fn is_active(&self) -> bool {
        self.conn.state() == ConnState::Active
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::protocol::bolt::{
        BoltProtocol, BoltRequest, BoltResponse, CMD_CODE_HEARTBEAT, RESPONSE_STATUS_SUCCESS,
    };
    use crate::protocol::Header;

    async fn read_one_frame(
        socket: &mut TcpStream,
        codec: &Arc<dyn Protocol>,
        buf: &mut BytesMut,
    ) -> BoxFrame {
        loop {
            if let Some(frame) = codec.decode(buf).unwrap() {
                return frame;
            }
            let n = socket.read_buf(buf).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
        }
    }

    fn sample_request(id: u32) -> BoltRequest {
        let mut header = Header::new();
        header.add(b"k", b"v");
        BoltRequest::new(
            id,
            Bytes::from_static(b"com.example.EchoService"),
            1000,
            header,
            Bytes::from_static(b"hello"),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_is_hijacked_without_upper_callback() {
        let codec: Arc<dyn Protocol> = Arc::new(BoltProtocol);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (sink, mut requests) = mpsc::channel(8);
        let server_codec = codec.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let conn = Connection::from_stream(socket);
            let stream_conn = StreamConnection::new_server(conn, server_codec, sink);
            stream_conn.dispatch().await;
        });

        let mut client = TcpStream::connect(&addr).await.unwrap();
        let heartbeat = codec.heartbeat_trigger(7);
        client
            .write_all(&codec.encode(heartbeat.as_ref()).unwrap())
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let reply = read_one_frame(&mut client, &codec, &mut buf).await;
        let reply = reply.as_any().downcast_ref::<BoltResponse>().unwrap();
        assert_eq!(reply.cmd_code, CMD_CODE_HEARTBEAT);
        assert_eq!(reply.request_id, 7);
        assert_eq!(reply.status, RESPONSE_STATUS_SUCCESS);

        // the heartbeat never reached the receive sink
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_rewrites_and_restores_stream_ids() {
        let codec: Arc<dyn Protocol> = Arc::new(BoltProtocol);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (sink, mut requests) = mpsc::channel(8);
        let server_codec = codec.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let conn = Connection::from_stream(socket);
            let stream_conn = StreamConnection::new_server(conn, server_codec, sink);
            let dispatcher = stream_conn.clone();
            tokio::spawn(dispatcher.dispatch());

            while let Some(request) = requests.recv().await {
                // the ingress frame carries the rewritten local id
                assert_eq!(request.frame.request_id(), request.stream_id);
                let response = BoltResponse::new(
                    999, // overwritten by the stream layer
                    RESPONSE_STATUS_SUCCESS,
                    Bytes::new(),
                    Header::new(),
                    Bytes::from_static(b"pong"),
                );
                stream_conn
                    .send_response(request.stream_id, Box::new(response))
                    .await
                    .unwrap();
            }
        });

        let mut client = TcpStream::connect(&addr).await.unwrap();
        client
            .write_all(&codec.encode(&sample_request(42)).unwrap())
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        let reply = read_one_frame(&mut client, &codec, &mut buf).await;
        assert_eq!(reply.request_id(), 42, "downstream id must be restored");
    }

    #[tokio::test]
    async fn test_client_correlates_responses_and_restores_origin_id() {
        let codec: Arc<dyn Protocol> = Arc::new(BoltProtocol);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // upstream echoes every request as a success response
        let upstream_codec = codec.clone();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            loop {
                let frame = read_one_frame(&mut socket, &upstream_codec, &mut buf).await;
                let response = BoltResponse::new(
                    frame.request_id() as u32,
                    RESPONSE_STATUS_SUCCESS,
                    Bytes::new(),
                    Header::new(),
                    Bytes::from_static(b"pong"),
                );
                socket
                    .write_all(&upstream_codec.encode(&response).unwrap())
                    .await
                    .unwrap();
            }
        });

        let conn = Connection::connect(&addr, Duration::from_secs(1)).await.unwrap();
        let stream_conn = StreamConnection::new_client(conn, codec.clone());
        tokio::spawn(stream_conn.clone().dispatch());

        let (local_id, rx) = stream_conn
            .send_request(Box::new(sample_request(42)))
            .await
            .unwrap();
        assert_ne!(local_id, 42, "upstream id must be locally allocated");
        assert_eq!(stream_conn.active_streams(), 1);

        let response = rx.await.unwrap();
        assert_eq!(response.request_id(), 42, "origin id restored on delivery");
        assert_eq!(
            stream_conn.active_streams(),
            0,
            "entry removed on response receipt"
        );
    }

    #[tokio::test]
    async fn test_reset_removes_entry_and_late_response_is_dropped() {
        let codec: Arc<dyn Protocol> = Arc::new(BoltProtocol);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // upstream accepts and stays silent
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = Connection::connect(&addr, Duration::from_secs(1)).await.unwrap();
        let stream_conn = StreamConnection::new_client(conn, codec);
        tokio::spawn(stream_conn.clone().dispatch());

        let (local_id, _rx) = stream_conn
            .send_request(Box::new(sample_request(1)))
            .await
            .unwrap();
        assert!(stream_conn.reset(local_id));
        assert!(!stream_conn.reset(local_id), "second reset is a no-op");
        assert_eq!(stream_conn.active_streams(), 0);
    }
}
