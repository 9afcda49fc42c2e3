//! Kubernetes node and pod operations: cordon, drain, and uncordon.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cordon_types::event::InterruptionEvent;
use cordon_types::node_metadata::{
    NodeActionRecord, LABEL_ACTION, LABEL_BOOT_ID, LABEL_EVENT_ID, TAINT_KEY,
};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::{info, warn};

use crate::error::NodeError;

const FIELD_MANAGER: &str = "cordon-agent";

/// Everything the reconciler needs from the Kubernetes API, abstracted
/// behind a trait so tests can swap in a fake.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    async fn cordon(
        &self,
        node_name: &str,
        event: &InterruptionEvent,
        action: &str,
    ) -> Result<(), NodeError>;
    async fn drain(
        &self,
        node_name: &str,
        grace_period: Duration,
        dry_run: bool,
    ) -> Result<(), NodeError>;
    async fn uncordon(&self, node_name: &str) -> Result<(), NodeError>;
    async fn uncordon_if_rebooted(&self, node_name: &str) -> Result<bool, NodeError>;
    /// Read-side accessor for reboot-restart recovery: whether the node
    /// still carries an `action` label from a previous run.
    async fn is_labeled_with_action(&self, node_name: &str) -> Result<bool, NodeError>;
    /// Read-side accessor for reboot-restart recovery: the `event-id`
    /// label recorded alongside `action`, if any.
    async fn get_event_id(&self, node_name: &str) -> Result<Option<String>, NodeError>;
}

pub struct KubeNodeAdapter {
    client: kube::Client,
}

impl KubeNodeAdapter {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    async fn current_boot_id(&self, node_name: &str) -> Result<String, NodeError> {
        let node = self.nodes().get(node_name).await?;
        node.status
            .and_then(|s| s.node_info)
            .map(|info| info.boot_id)
            .ok_or_else(|| NodeError::MissingBootId(node_name.to_string()))
    }

    /// Reads the agent's own labels off the node object in one round
    /// trip. Backs both read-side `NodeAdapter` accessors.
    async fn node_action_record(&self, node_name: &str) -> Result<NodeActionRecord, NodeError> {
        let node = self.nodes().get(node_name).await?;
        let labels = node.metadata.labels.unwrap_or_default();
        Ok(NodeActionRecord {
            action: labels.get(LABEL_ACTION).cloned(),
            event_id: labels.get(LABEL_EVENT_ID).cloned(),
            boot_id: labels.get(LABEL_BOOT_ID).cloned(),
        })
    }

    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, NodeError> {
        let field_selector = format!("spec.nodeName={node_name}");
        let pods = self
            .pods()
            .list(&ListParams::default().fields(&field_selector))
            .await?;
        Ok(pods.items)
    }

    /// Evicts one pod via the `policy/v1` Eviction subresource, issued
    /// as a raw request since the convenience wrapper's signature
    /// varies across `kube` releases.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: i64,
    ) -> Result<(), NodeError> {
        let body = serde_json::to_vec(&json!({
            "apiVersion": "policy/v1",
            "kind": "Eviction",
            "metadata": { "name": name, "namespace": namespace },
            "deleteOptions": { "gracePeriodSeconds": grace_period_seconds },
        }))
        .expect("eviction body is always serializable");

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!(
                "/api/v1/namespaces/{namespace}/pods/{name}/eviction"
            ))
            .header("Content-Type", "application/json")
            .body(body)
            .expect("eviction request is always well-formed");

        let _: serde_json::Value = self.client.request(request).await?;
        Ok(())
    }
}

/// A pod created directly by the kubelet for a static manifest, not
/// owned by any controller -- draining can neither evict nor reschedule
/// it, so it's left alone.
fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
}

/// DaemonSet pods are recreated by their controller on every node
/// regardless of cordon state, so evicting them accomplishes nothing
/// and only adds noise.
fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"))
}

fn is_already_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

#[async_trait]
impl NodeAdapter for KubeNodeAdapter {
    async fn cordon(
        &self,
        node_name: &str,
        event: &InterruptionEvent,
        action: &str,
    ) -> Result<(), NodeError> {
        let boot_id = self.current_boot_id(node_name).await.ok();

        let mut labels = serde_json::Map::new();
        labels.insert(LABEL_ACTION.to_string(), json!(action));
        labels.insert(LABEL_EVENT_ID.to_string(), json!(event.event_id.clone()));
        if let Some(boot_id) = boot_id {
            labels.insert(LABEL_BOOT_ID.to_string(), json!(boot_id));
        }

        let patch = json!({
            "spec": { "unschedulable": true },
            "metadata": {
                "labels": labels,
            },
        });

        self.nodes()
            .patch(
                node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?;

        let taint_patch = json!({
            "spec": {
                "taints": [{
                    "key": TAINT_KEY,
                    "value": action,
                    "effect": "NoSchedule",
                    "timeAdded": Utc::now().to_rfc3339(),
                }],
            },
        });
        self.nodes()
            .patch(
                node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(taint_patch),
            )
            .await?;

        info!(node = node_name, event_id = %event.event_id, "node cordoned");
        Ok(())
    }

    async fn drain(
        &self,
        node_name: &str,
        grace_period: Duration,
        dry_run: bool,
    ) -> Result<(), NodeError> {
        let pods = self.pods_on_node(node_name).await?;
        let grace_period_seconds = grace_period.as_secs() as i64;

        for pod in pods {
            if is_mirror_pod(&pod) || is_daemonset_pod(&pod) || is_already_terminal(&pod) {
                continue;
            }
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();

            if dry_run {
                info!(node = node_name, pod = %name, "dry-run: would evict pod");
                continue;
            }

            if let Err(err) = self
                .evict_pod(&namespace, &name, grace_period_seconds)
                .await
            {
                warn!(node = node_name, pod = %name, error = %err, "pod eviction failed");
            }
        }

        info!(node = node_name, "drain complete");
        Ok(())
    }

    async fn uncordon(&self, node_name: &str) -> Result<(), NodeError> {
        let mut labels = serde_json::Map::new();
        labels.insert(LABEL_ACTION.to_string(), serde_json::Value::Null);
        labels.insert(LABEL_EVENT_ID.to_string(), serde_json::Value::Null);
        labels.insert(LABEL_BOOT_ID.to_string(), serde_json::Value::Null);

        let patch = json!({
            "spec": { "unschedulable": false },
            "metadata": {
                "labels": labels,
            },
        });

        self.nodes()
            .patch(
                node_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?;

        info!(node = node_name, "node uncordoned");
        Ok(())
    }

    async fn uncordon_if_rebooted(&self, node_name: &str) -> Result<bool, NodeError> {
        let node = self.nodes().get(node_name).await?;

        let recorded_boot_id = node
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_BOOT_ID))
            .cloned();
        let Some(recorded_boot_id) = recorded_boot_id else {
            return Ok(false);
        };

        let current_boot_id = self.current_boot_id(node_name).await?;
        if current_boot_id == recorded_boot_id {
            return Ok(false);
        }

        self.uncordon(node_name).await?;
        info!(node = node_name, "uncordoned after detected reboot");
        Ok(true)
    }

    async fn is_labeled_with_action(&self, node_name: &str) -> Result<bool, NodeError> {
        Ok(self.node_action_record(node_name).await?.action.is_some())
    }

    async fn get_event_id(&self, node_name: &str) -> Result<Option<String>, NodeError> {
        Ok(self.node_action_record(node_name).await?.event_id)
    }
}
