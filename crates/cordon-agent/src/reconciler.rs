//! Turns store state for the local node into cordon/drain/uncordon
//! actions against the Kubernetes API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cordon_store::EventStore;
use cordon_types::AgentConfig;
use tracing::{error, info, warn};

use crate::error::AgentError;
use crate::metadata::MetadataClient;
use crate::metrics::{Metrics, Outcome};
use crate::node::NodeAdapter;
use crate::webhook::{self, WebhookConfig};

pub struct Reconciler {
    config: Arc<AgentConfig>,
    store: Arc<EventStore>,
    node_adapter: Arc<dyn NodeAdapter>,
    metadata_client: MetadataClient,
    metrics: Metrics,
    http: reqwest::Client,
    /// Set once this agent has cordoned the node, so the uncordon watcher
    /// only acts on nodes it (or a previous instance, recovered via
    /// labels) actually cordoned.
    cordoned: AtomicBool,
}

impl Reconciler {
    pub fn new(
        config: Arc<AgentConfig>,
        store: Arc<EventStore>,
        node_adapter: Arc<dyn NodeAdapter>,
        metadata_client: MetadataClient,
        metrics: Metrics,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            store,
            node_adapter,
            metadata_client,
            metrics,
            http,
            cordoned: AtomicBool::new(false),
        }
    }

    /// Run once before the monitor loops start: a node carrying an
    /// `action` label from a previous run of this agent may have since
    /// rebooted (e.g. completing a scheduled maintenance event). If so,
    /// uncordon it immediately rather than waiting for a cancellation
    /// notice that may never come, and tell the store to ignore the
    /// event-id that prior run already handled so the monitor's next
    /// poll can't re-admit it.
    pub async fn handle_reboot_uncordon(&self) -> Result<(), AgentError> {
        let node_name = &self.config.node_name;

        if !self
            .node_adapter
            .is_labeled_with_action(node_name)
            .await
            .map_err(AgentError::Node)?
        {
            return Ok(());
        }

        let event_id = self
            .node_adapter
            .get_event_id(node_name)
            .await
            .map_err(AgentError::Node)?;

        let uncordoned = self
            .node_adapter
            .uncordon_if_rebooted(node_name)
            .await
            .map_err(AgentError::Node)?;

        if uncordoned {
            self.metrics
                .node_action_inc("uncordon", node_name, Outcome::Success);
            if let Some(id) = event_id {
                self.store.ignore(&id);
            }
        }
        Ok(())
    }

    /// One tick of the drain-or-cordon loop.
    pub async fn reconcile_once(&self) -> Result<(), AgentError> {
        let now = Utc::now();
        let node_name = self.config.node_name.clone();

        let Some(event) = self.store.get_active_event(&node_name, now) else {
            return Ok(());
        };

        if self.cordoned.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(hook) = &event.pre_drain_hook {
            if let Err(err) = hook(&event) {
                warn!(node = %node_name, error = %err, "pre-drain hook failed");
            }
        }

        let action = if self.config.cordon_only {
            "cordon"
        } else {
            "cordon-and-drain"
        };

        let outcome = self.node_adapter.cordon(&node_name, &event, action).await;
        let metric_outcome = match &outcome {
            Ok(()) => Outcome::Success,
            Err(_) => Outcome::Error,
        };
        self.metrics
            .node_action_inc("cordon", &node_name, metric_outcome);

        match outcome {
            Ok(()) => {
                info!(node = %node_name, "cordoned node");
                self.cordoned.store(true, Ordering::SeqCst);
            }
            Err(err) => {
                error!(node = %node_name, error = %err, "cordon failed");
                return Err(AgentError::Node(err));
            }
        }

        if !self.config.cordon_only {
            let drain_outcome = self
                .node_adapter
                .drain(
                    &node_name,
                    self.config.pod_termination_grace_period,
                    self.config.dry_run,
                )
                .await;
            let metric_outcome = match &drain_outcome {
                Ok(()) => Outcome::Success,
                Err(_) => Outcome::Error,
            };
            self.metrics
                .node_action_inc("drain", &node_name, metric_outcome);
            if let Err(err) = drain_outcome {
                error!(node = %node_name, error = %err, "drain failed");
                return Err(AgentError::Node(err));
            }
        }

        self.store.mark_all_as_drained(&node_name);
        self.send_webhook(&node_name, action, &event).await;

        Ok(())
    }

    /// One tick of the uncordon watcher: once every event this agent
    /// cordoned for has been cancelled or drained, undo the cordon.
    pub async fn reconcile_uncordon_once(&self) -> Result<(), AgentError> {
        let node_name = self.config.node_name.clone();
        if !self.cordoned.load(Ordering::SeqCst) {
            return Ok(());
        }

        let now = Utc::now();
        if !self.store.should_uncordon(&node_name, now) {
            return Ok(());
        }

        match self.node_adapter.uncordon(&node_name).await {
            Ok(()) => {
                info!(node = %node_name, "uncordoned node after cancellation");
                self.metrics
                    .node_action_inc("uncordon", &node_name, Outcome::Success);
                self.cordoned.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                warn!(node = %node_name, error = %err, "uncordon failed");
                self.metrics
                    .node_action_inc("uncordon", &node_name, Outcome::Error);
                Err(AgentError::Node(err))
            }
        }
    }

    async fn send_webhook(
        &self,
        node_name: &str,
        action: &str,
        event: &cordon_types::event::InterruptionEvent,
    ) {
        let (Some(url), Some(template)) = (&self.config.webhook_url, &self.config.webhook_template)
        else {
            return;
        };

        let node_metadata = match self.metadata_client.get_node_metadata().await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(node = node_name, error = %err, "failed to fetch instance metadata for webhook, posting without it");
                Default::default()
            }
        };

        let config = WebhookConfig {
            url,
            template,
            headers: &self.config.webhook_headers,
        };

        if let Err(err) = webhook::post(&self.http, &node_metadata, event, action, &config).await {
            warn!(node = node_name, error = %err, "webhook notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::routing::post;
    use axum::Router;
    use cordon_types::event::{EventKind, EventState, InterruptionEvent};

    use crate::error::NodeError;

    #[derive(Default)]
    struct MockNodeAdapter {
        cordon_calls: Mutex<Vec<(String, String)>>,
        drain_calls: Mutex<Vec<String>>,
        fail_cordon: bool,
        fail_drain: bool,
        labeled_with_action: bool,
        event_id: Option<String>,
        rebooted: bool,
    }

    #[async_trait]
    impl NodeAdapter for MockNodeAdapter {
        async fn cordon(
            &self,
            node_name: &str,
            _event: &InterruptionEvent,
            action: &str,
        ) -> Result<(), NodeError> {
            self.cordon_calls
                .lock()
                .unwrap()
                .push((node_name.to_string(), action.to_string()));
            if self.fail_cordon {
                return Err(NodeError::MissingBootId(node_name.to_string()));
            }
            Ok(())
        }

        async fn drain(
            &self,
            node_name: &str,
            _grace_period: Duration,
            _dry_run: bool,
        ) -> Result<(), NodeError> {
            self.drain_calls.lock().unwrap().push(node_name.to_string());
            if self.fail_drain {
                return Err(NodeError::MissingBootId(node_name.to_string()));
            }
            Ok(())
        }

        async fn uncordon(&self, _node_name: &str) -> Result<(), NodeError> {
            Ok(())
        }

        async fn uncordon_if_rebooted(&self, _node_name: &str) -> Result<bool, NodeError> {
            Ok(self.rebooted)
        }

        async fn is_labeled_with_action(&self, _node_name: &str) -> Result<bool, NodeError> {
            Ok(self.labeled_with_action)
        }

        async fn get_event_id(&self, _node_name: &str) -> Result<Option<String>, NodeError> {
            Ok(self.event_id.clone())
        }
    }

    fn test_event(id: &str, node: &str) -> InterruptionEvent {
        InterruptionEvent {
            event_id: id.to_string(),
            kind: EventKind::SpotItn,
            node_name: node.to_string(),
            description: "spot instance terminate scheduled".to_string(),
            state: EventState::Open,
            start_time: Utc::now() - chrono::Duration::seconds(1),
            received_at: Utc::now(),
            pre_drain_hook: None,
        }
    }

    fn test_config(webhook_url: Option<String>) -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            node_name: "n1".to_string(),
            metadata_endpoint: "http://127.0.0.1:1".to_string(),
            poll_interval: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(1),
            dry_run: false,
            enable_scheduled_maintenance: true,
            enable_spot_itn: true,
            cordon_only: false,
            pod_termination_grace_period: Duration::from_secs(1),
            metadata_tries: 1,
            webhook_url,
            webhook_template: Some(r#"{"node":"{{node_name}}","action":"{{action}}"}"#.to_string()),
            webhook_headers: HashMap::new(),
            webhook_proxy: None,
            enable_prometheus: false,
            prometheus_port: 9092,
            json_logging: false,
        })
    }

    async fn spawn_counting_webhook() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_for_handler = Arc::clone(&hits);
        let router = Router::new().route(
            "/webhook",
            post(move || {
                let hits = Arc::clone(&hits_for_handler);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}/webhook"), hits)
    }

    #[tokio::test]
    async fn reconcile_once_cordons_drains_and_posts_webhook_exactly_once() {
        let (webhook_url, hits) = spawn_counting_webhook().await;
        let config = test_config(Some(webhook_url));
        let store = Arc::new(EventStore::new());
        store.add(test_event("spot-itn/n1", "n1"));
        let mock = Arc::new(MockNodeAdapter::default());
        let node_adapter: Arc<dyn NodeAdapter> = Arc::clone(&mock);
        let metadata_client = MetadataClient::new(config.metadata_endpoint.clone(), 1).unwrap();
        let http = reqwest::Client::new();

        let reconciler = Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            node_adapter,
            metadata_client,
            Metrics::new(),
            http,
        );

        reconciler.reconcile_once().await.unwrap();
        // second tick is a no-op: the node is already cordoned.
        reconciler.reconcile_once().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            mock.cordon_calls.lock().unwrap().as_slice(),
            [("n1".to_string(), "cordon-and-drain".to_string())]
        );
        assert_eq!(mock.drain_calls.lock().unwrap().as_slice(), ["n1".to_string()]);
        assert!(store.active_events_for_node("n1", Utc::now()).is_empty());
    }

    #[tokio::test]
    async fn reconcile_once_returns_err_when_cordon_fails() {
        let config = test_config(None);
        let store = Arc::new(EventStore::new());
        store.add(test_event("spot-itn/n1", "n1"));
        let node_adapter: Arc<dyn NodeAdapter> = Arc::new(MockNodeAdapter {
            fail_cordon: true,
            ..Default::default()
        });
        let metadata_client = MetadataClient::new(config.metadata_endpoint.clone(), 1).unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            node_adapter,
            metadata_client,
            Metrics::new(),
            reqwest::Client::new(),
        );

        assert!(reconciler.reconcile_once().await.is_err());
    }

    #[tokio::test]
    async fn reboot_uncordon_ignores_the_recorded_event_id() {
        let config = test_config(None);
        let store = Arc::new(EventStore::new());
        let node_adapter: Arc<dyn NodeAdapter> = Arc::new(MockNodeAdapter {
            labeled_with_action: true,
            event_id: Some("spot-itn/n1".to_string()),
            rebooted: true,
            ..Default::default()
        });
        let metadata_client = MetadataClient::new(config.metadata_endpoint.clone(), 1).unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            node_adapter,
            metadata_client,
            Metrics::new(),
            reqwest::Client::new(),
        );

        reconciler.handle_reboot_uncordon().await.unwrap();

        // the event-id from the prior run is now ignored: re-adding it
        // never makes it actionable again.
        store.add(test_event("spot-itn/n1", "n1"));
        assert!(store.get_active_event("n1", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn pre_drain_hook_failure_does_not_block_cordon() {
        let config = test_config(None);
        let store = Arc::new(EventStore::new());
        let hook_called = Arc::new(AtomicUsize::new(0));
        let hook_called_for_closure = Arc::clone(&hook_called);
        let mut event = test_event("spot-itn/n1", "n1");
        event.pre_drain_hook = Some(Arc::new(move |_event| {
            hook_called_for_closure.fetch_add(1, Ordering::SeqCst);
            Err("hook backend unreachable".to_string())
        }));
        store.add(event);
        let node_adapter: Arc<dyn NodeAdapter> = Arc::new(MockNodeAdapter::default());
        let metadata_client = MetadataClient::new(config.metadata_endpoint.clone(), 1).unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&store),
            node_adapter,
            metadata_client,
            Metrics::new(),
            reqwest::Client::new(),
        );

        reconciler.reconcile_once().await.unwrap();

        assert_eq!(hook_called.load(Ordering::SeqCst), 1);
        assert!(store.active_events_for_node("n1", Utc::now()).is_empty());
    }
}
