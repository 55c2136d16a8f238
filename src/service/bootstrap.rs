use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info};

use crate::cluster::ClusterManager;
use crate::protocol::{self, bolt};
use crate::proxy::ProxyHandler;
use crate::router::Routers;
use crate::service::Server;
use crate::AppError::{self, IllegalState};
use crate::{global_config, AppResult};

/// Process bring-up and graceful teardown for the proxy.
pub struct Bootstrap;

impl Bootstrap {
    pub fn start(rt: &Runtime) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        // built-in codecs and their pool profiles
        bolt::register();

        let config = global_config();
        let cluster_manager = ClusterManager::new(&config.clusters);
        let router = Routers::new(&config.router)?;

        rt.block_on(Self::run_proxy(
            cluster_manager.clone(),
            router,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        ))?;

        // the listener has stopped, fan the shutdown signal out
        notify_shutdown
            .send(())
            .map_err(|e| AppError::ChannelSendError(e.to_string()))?;
        // pool teardown spawns close tasks and must run on the runtime
        rt.block_on(async {
            cluster_manager.shutdown();
        });
        drop(shutdown_complete_tx);
        debug!("waiting for shutdown complete...");
        rt.block_on(async {
            shutdown_complete_rx.recv().await;
        });

        info!("proxy shutdown complete");
        Ok(())
    }

    async fn run_proxy(
        cluster_manager: Arc<ClusterManager>,
        router: Arc<Routers>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<()> {
        let network = &global_config().network;
        let listen_address = format!("{}:{}", network.ip, network.port);

        let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, e
            );
            error!(error_msg);
            IllegalState(error_msg)
        })?;
        info!("proxy listening on {}", listen_address);

        let protocol_name = &global_config().proxy.downstream_protocol;
        let codec = protocol::protocol(protocol_name).ok_or_else(|| {
            IllegalState(format!("unknown downstream protocol: {}", protocol_name))
        })?;

        let handler = ProxyHandler::new(codec.clone(), router, cluster_manager);
        let server = Server::new(
            listener,
            Arc::new(Semaphore::new(network.max_connection)),
            notify_shutdown.clone(),
            shutdown_complete_tx,
            handler,
            codec,
        );

        info!("proxy startup complete");
        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            _ = signal::ctrl_c() => {
                info!("get shutdown signal");
            }
        }

        Ok(())
    }
}
