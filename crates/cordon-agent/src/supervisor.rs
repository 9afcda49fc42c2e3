//! Wires the metadata pollers, event store, and reconciler together and
//! runs them to completion (or until a shutdown signal arrives).

use std::sync::Arc;
use std::time::Duration;

use cordon_store::EventStore;
use cordon_types::event::InterruptionEvent;
use cordon_types::AgentConfig;
use kube::Client as KubeClient;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::metadata::MetadataClient;
use crate::metrics::Metrics;
use crate::monitor::{
    to_interruption_event, CancellationTracker, DuplicateErrorBreaker, Monitor,
    ScheduledMaintenanceMonitor, SpotItnMonitor,
};
use crate::node::{KubeNodeAdapter, NodeAdapter};
use crate::reconciler::Reconciler;

const DUPLICATE_ERROR_THRESHOLD: u32 = 3;
/// Monitors publish one notice or cancellation at a time; a size-1
/// channel is enough to decouple polling cadence from store ingestion
/// without ever buffering a backlog of stale notices.
const INGRESS_CHANNEL_CAPACITY: usize = 1;

pub struct Supervisor {
    config: Arc<AgentConfig>,
    store: Arc<EventStore>,
    metrics: Metrics,
    reconciler: Arc<Reconciler>,
    monitors: Vec<Arc<dyn Monitor>>,
}

impl Supervisor {
    pub async fn bootstrap(config: AgentConfig) -> Result<Self, crate::error::AgentError> {
        let config = Arc::new(config);
        let store = Arc::new(EventStore::new());
        let metrics = Metrics::new();

        let mut webhook_http_builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(proxy_url) = &config.webhook_proxy {
            let proxy =
                reqwest::Proxy::all(proxy_url).map_err(crate::error::MetadataError::Request)?;
            webhook_http_builder = webhook_http_builder.proxy(proxy);
        }
        let http = webhook_http_builder
            .build()
            .map_err(crate::error::MetadataError::Request)?;

        let kube_client = KubeClient::try_default()
            .await
            .map_err(crate::error::NodeError::Api)?;
        let node_adapter: Arc<dyn NodeAdapter> = Arc::new(KubeNodeAdapter::new(kube_client));

        let metadata_client =
            MetadataClient::new(config.metadata_endpoint.clone(), config.metadata_tries)
                .map_err(crate::error::AgentError::Metadata)?;

        let mut monitors: Vec<Arc<dyn Monitor>> = Vec::new();
        if config.enable_spot_itn {
            monitors.push(Arc::new(SpotItnMonitor::new(
                metadata_client.clone(),
                config.node_name.clone(),
            )));
        }
        if config.enable_scheduled_maintenance {
            monitors.push(Arc::new(ScheduledMaintenanceMonitor::new(
                metadata_client.clone(),
            )));
        }

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&node_adapter),
            metadata_client,
            metrics.clone(),
            http,
        ));

        Ok(Self {
            config,
            store,
            metrics,
            reconciler,
            monitors,
        })
    }

    /// Runs the agent until `shutdown` is signaled. Recovers reboot state
    /// before starting any pollers, then runs monitor, reconcile, and
    /// uncordon loops concurrently plus the metrics server.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), crate::error::AgentError> {
        if let Err(err) = self.reconciler.handle_reboot_uncordon().await {
            error!(error = %err, "startup reboot-uncordon check failed");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();

        let (event_tx, event_rx) = mpsc::channel::<InterruptionEvent>(INGRESS_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = mpsc::channel::<String>(INGRESS_CHANNEL_CAPACITY);

        for monitor in self.monitors.clone() {
            let node_name = self.config.node_name.clone();
            let poll_interval = self.config.poll_interval;
            let event_tx = event_tx.clone();
            let cancel_tx = cancel_tx.clone();
            let metrics = self.metrics.clone();
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                run_monitor_loop(
                    monitor,
                    event_tx,
                    cancel_tx,
                    node_name,
                    poll_interval,
                    metrics,
                    &mut shutdown,
                )
                .await;
            });
        }
        drop(event_tx);
        drop(cancel_tx);

        {
            let store = Arc::clone(&self.store);
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                run_store_ingress_loop(store, event_rx, cancel_rx, &mut shutdown).await;
            });
        }

        {
            let reconciler = Arc::clone(&self.reconciler);
            let interval = self.config.reconcile_interval;
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                run_reconcile_loop(reconciler, interval, &mut shutdown).await;
            });
        }

        {
            let reconciler = Arc::clone(&self.reconciler);
            let interval = self.config.reconcile_interval;
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                run_uncordon_loop(reconciler, interval, &mut shutdown).await;
            });
        }

        if self.config.enable_prometheus {
            let metrics = self.metrics.clone();
            let port = self.config.prometheus_port;
            let mut shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(err) = run_metrics_server(metrics, port, &mut shutdown).await {
                    error!(error = %err, "metrics server exited with an error");
                }
            });
        }

        let _ = shutdown.changed().await;
        info!("shutdown signal received, waiting for tasks to finish");
        while tasks.join_next().await.is_some() {}

        Ok(())
    }
}

async fn run_monitor_loop(
    monitor: Arc<dyn Monitor>,
    event_tx: mpsc::Sender<InterruptionEvent>,
    cancel_tx: mpsc::Sender<String>,
    node_name: String,
    poll_interval: Duration,
    metrics: Metrics,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    let mut breaker = DuplicateErrorBreaker::new(DUPLICATE_ERROR_THRESHOLD);
    let mut cancellation = CancellationTracker::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = monitor.poll().await;
                if breaker.observe(&result) {
                    error!(kind = %monitor.kind(), "monitor failed repeatedly, giving up");
                    std::process::exit(1);
                }
                match result {
                    Ok(active) => {
                        for cancelled_id in cancellation.observe(&active) {
                            info!(kind = %monitor.kind(), event_id = %cancelled_id, "notice no longer outstanding, cancelling");
                            if cancel_tx.send(cancelled_id).await.is_err() {
                                return;
                            }
                        }
                        for meta in active {
                            info!(kind = %monitor.kind(), event_id = %meta.event_id, "interruption notice received");
                            if event_tx.send(to_interruption_event(meta, &node_name)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        error!(kind = %monitor.kind(), error = %err, "poll failed");
                        metrics.poll_error_inc(&monitor.kind().to_string());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Owns the store's only writer side: every monitor publishes through
/// `event_rx`/`cancel_rx` rather than touching the store directly, so
/// ingestion order and backpressure both live in one place.
async fn run_store_ingress_loop(
    store: Arc<EventStore>,
    mut event_rx: mpsc::Receiver<InterruptionEvent>,
    mut cancel_rx: mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => store.add(event),
                    None => return,
                }
            }
            id = cancel_rx.recv() => {
                match id {
                    Some(id) => store.cancel(&id),
                    None => return,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// A cordon or drain failure is unrecoverable for this process: the node
/// is left in an unknown state, so rather than retrying blind the process
/// exits non-zero and lets the orchestrator restart it.
async fn run_reconcile_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = reconciler.reconcile_once().await {
                    error!(error = %err, "reconcile tick failed, exiting");
                    std::process::exit(1);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_uncordon_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = reconciler.reconcile_uncordon_once().await {
                    error!(error = %err, "uncordon tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_metrics_server(
    metrics: Metrics,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "metrics server listening");
    let router = crate::metrics::router(metrics);
    let mut shutdown_for_signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_for_signal.changed().await;
        })
        .await
}
