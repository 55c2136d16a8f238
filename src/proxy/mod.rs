mod worker;

pub use worker::start_request_handlers;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::{ClusterManager, LbContext};
use crate::pool::PooledStream;
use crate::protocol::{BoxFrame, Frame, Protocol, ProtocolName, StreamType};
use crate::router::{Routers, AUTHORITY_HEADER, METHOD_HEADER, PATH_HEADER};
use crate::stream::StreamConnection;
use crate::{AppError, AppResult};

/// Request-scoped values threaded through the forwarding pipeline.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    pub connection_id: u64,
    pub stream_id: u64,
    pub downstream_addr: String,
    pub protocol: String,
}

/// One downstream request queued for the worker pool.
pub struct ProxyTask {
    pub ctx: RequestCtx,
    pub frame: BoxFrame,
    pub stream_conn: Arc<StreamConnection>,
}

/// The glue between the four subsystems: receive, route, select a
/// cluster, acquire a pool, open the upstream stream and mirror the
/// response; every failure is converted into a hijacked response.
pub struct ProxyHandler {
    protocol: ProtocolName,
    codec: Arc<dyn Protocol>,
    router: Arc<Routers>,
    cluster_manager: Arc<ClusterManager>,
}

impl ProxyHandler {
    pub fn new(
        codec: Arc<dyn Protocol>,
        router: Arc<Routers>,
        cluster_manager: Arc<ClusterManager>,
    ) -> Arc<ProxyHandler> {
        Arc::new(ProxyHandler {
            protocol: codec.name(),
            codec,
            router,
            cluster_manager,
        })
    }

    pub async fn handle(&self, task: ProxyTask) {
        let ProxyTask {
            ctx,
            frame,
            stream_conn,
        } = task;
        let stream_type = frame.stream_type();

        match self.forward(&ctx, frame).await {
            Ok(Some(response)) => {
                if let Err(e) = stream_conn.send_response(ctx.stream_id, response).await {
                    warn!(
                        "failed to write response for stream {} on connection {}: {}",
                        ctx.stream_id, ctx.connection_id, e
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                // a oneway sender is not listening for anything
                if stream_type == StreamType::OnewayRequest {
                    debug!(
                        "oneway request on connection {} dropped: {}",
                        ctx.connection_id, err
                    );
                    return;
                }
                self.hijack(&ctx, &stream_conn, &err).await;
            }
        }
    }

    /// Synthesise a proxy-originated response for a failed exchange.
    async fn hijack(&self, ctx: &RequestCtx, stream_conn: &Arc<StreamConnection>, err: &AppError) {
        let status = self.codec.map_status(err.proxy_status());
        warn!(
            "stream {} on connection {} hijacked with status {}: {}",
            ctx.stream_id, ctx.connection_id, status, err
        );
        let reply = self.codec.hijack_reply(status);
        if let Err(e) = stream_conn.send_response(ctx.stream_id, reply).await {
            debug!(
                "hijack write failed for stream {} on connection {}: {}",
                ctx.stream_id, ctx.connection_id, e
            );
        }
    }

    async fn forward(&self, ctx: &RequestCtx, mut frame: BoxFrame) -> AppResult<Option<BoxFrame>> {
        self.synthesize_routing_headers(ctx, frame.as_mut());

        let route = self
            .router
            .match_route(frame.header())
            .ok_or(AppError::RouteNotFound)?;
        let cluster_name = route.select_cluster();
        route.finalize_request_headers(frame.header_mut());
        let timeout = route.timeout();
        let retries = route
            .retry_policy()
            .map(|rp| rp.num_retries)
            .unwrap_or(0);

        // only the connect phase retries; once a stream is open the
        // request is in flight and must not be replayed
        let mut attempt = 0;
        let pooled = loop {
            match self.acquire_stream(ctx, &cluster_name).await {
                Ok(pooled) => break pooled,
                Err(e @ (AppError::ConnectFailure(_) | AppError::ConnectTimeout(_))) => {
                    if attempt >= retries {
                        return Err(e);
                    }
                    attempt += 1;
                    debug!(
                        "retrying upstream connect for cluster {} (attempt {})",
                        cluster_name, attempt
                    );
                }
                Err(e) => return Err(e),
            }
        };

        match frame.stream_type() {
            StreamType::OnewayRequest => {
                pooled.request_oneway(frame).await?;
                Ok(None)
            }
            _ => {
                let mut response = pooled.request(frame, timeout).await?;
                route.finalize_response_headers(response.header_mut());
                Ok(Some(response))
            }
        }
    }

    async fn acquire_stream(&self, ctx: &RequestCtx, cluster: &str) -> AppResult<PooledStream> {
        let (_host, pool) =
            self.cluster_manager
                .pool_for(cluster, self.protocol, &LbContext::default())?;
        pool.new_stream(ctx).await.map_err(AppError::from)
    }

    /// Derive the routing view of a request: authority from the codec's
    /// service name (downstream address as fallback), a default path,
    /// the method name and any codec-provided metas.
    fn synthesize_routing_headers(&self, ctx: &RequestCtx, frame: &mut dyn Frame) {
        let service = self.codec.service_name(&*frame);
        let method = self.codec.method_name(&*frame);
        let metas = self.codec.request_metas(&*frame);

        let headers = frame.header_mut();
        if headers.get(PATH_HEADER).is_none() {
            headers.set(PATH_HEADER, b"/");
        }
        let authority = service.unwrap_or_else(|| ctx.downstream_addr.clone());
        headers.set(AUTHORITY_HEADER, authority.as_bytes());
        if let Some(method) = method {
            headers.set(METHOD_HEADER, method.as_bytes());
        }
        for (key, value) in metas {
            headers.set(key.as_bytes(), value.as_bytes());
        }
    }
}
