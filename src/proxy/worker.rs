use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use crate::service::{RequestHandlerPool, Shutdown};
use crate::utils::panic_message;

use super::{ProxyHandler, ProxyTask};

/// Start the shared request worker pool: a bounded channel fanned out
/// to N workers, plus a monitor that logs panic payloads and respawns
/// dead workers. Handling requests means running downstream-controlled
/// bytes through codecs and filters, so a panic here must never take
/// the whole handler population with it.
pub fn start_request_handlers(
    handler: Arc<ProxyHandler>,
    config: &RequestHandlerPool,
    notify_shutdown: broadcast::Sender<()>,
) -> async_channel::Sender<ProxyTask> {
    let (task_tx, task_rx) = async_channel::bounded(config.channel_capacity);
    let num_workers = config.num_channels;
    let monitor_interval = config.monitor_interval;
    let worker_check_timeout = config.worker_check_timeout;

    tokio::spawn(async move {
        let mut workers: HashMap<usize, JoinHandle<()>> = HashMap::with_capacity(num_workers);
        for id in 0..num_workers {
            workers.insert(id, spawn_worker(id, task_rx.clone(), handler.clone()));
        }

        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("request handler monitor received shutdown signal");
                    break;
                }
                _ = time::sleep(Duration::from_secs(monitor_interval)) => {}
            }

            for id in 0..num_workers {
                let Some(mut handle) = workers.remove(&id) else {
                    continue;
                };
                match time::timeout(Duration::from_millis(worker_check_timeout), &mut handle).await
                {
                    Ok(Ok(())) => {
                        info!("request handler worker {} exited normally", id);
                    }
                    Ok(Err(join_error)) => {
                        if join_error.is_panic() {
                            let payload = join_error.into_panic();
                            error!(
                                "request handler worker {} panicked: {}",
                                id,
                                panic_message(payload.as_ref())
                            );
                            workers.insert(id, spawn_worker(id, task_rx.clone(), handler.clone()));
                        } else {
                            error!("request handler worker {} failed for unknown reasons", id);
                        }
                    }
                    // still running
                    Err(_) => {
                        workers.insert(id, handle);
                    }
                }
            }
        }
        debug!("request handler monitor exited");
    });

    task_tx
}

fn spawn_worker(
    id: usize,
    task_rx: async_channel::Receiver<ProxyTask>,
    handler: Arc<ProxyHandler>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("request handler worker {} started", id);
        while let Ok(task) = task_rx.recv().await {
            handler.handle(task).await;
        }
        debug!("request handler worker {} exited", id);
    })
}
