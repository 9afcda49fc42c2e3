//! In-process counters and the `/metrics` endpoint that exposes them in
//! Prometheus text-exposition format.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

const ACTIONS_METRIC_NAME: &str = "cordon_agent_node_actions_total";
const POLL_ERRORS_METRIC_NAME: &str = "cordon_agent_poll_errors_total";

#[derive(Clone, Default)]
pub struct Metrics {
    counts: Arc<Mutex<HashMap<(String, String, String), u64>>>,
    /// Transient metadata-poll failures per monitor `kind`, mirroring
    /// the original agent's `metrics.ErrorEventsInc`.
    poll_errors: Arc<Mutex<HashMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one occurrence of `action` on `node`, tagged with whether
    /// it succeeded.
    pub fn node_action_inc(&self, action: &str, node: &str, outcome: Outcome) {
        let key = (action.to_string(), node.to_string(), outcome.as_str().to_string());
        let mut counts = self.counts.lock().expect("metrics mutex poisoned");
        *counts.entry(key).or_insert(0) += 1;
    }

    /// Records one transient poll failure for the Monitor tagged `kind`.
    pub fn poll_error_inc(&self, kind: &str) {
        let mut poll_errors = self.poll_errors.lock().expect("metrics mutex poisoned");
        *poll_errors.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn render(&self) -> String {
        let mut out = String::new();

        let counts = self.counts.lock().expect("metrics mutex poisoned");
        out.push_str(&format!(
            "# HELP {ACTIONS_METRIC_NAME} Count of node actions taken by the agent.\n"
        ));
        out.push_str(&format!("# TYPE {ACTIONS_METRIC_NAME} counter\n"));
        for ((action, node, outcome), count) in counts.iter() {
            out.push_str(&format!(
                "{ACTIONS_METRIC_NAME}{{action=\"{action}\",node=\"{node}\",outcome=\"{outcome}\"}} {count}\n"
            ));
        }
        drop(counts);

        let poll_errors = self.poll_errors.lock().expect("metrics mutex poisoned");
        out.push_str(&format!(
            "# HELP {POLL_ERRORS_METRIC_NAME} Count of transient metadata poll failures.\n"
        ));
        out.push_str(&format!("# TYPE {POLL_ERRORS_METRIC_NAME} counter\n"));
        for (kind, count) in poll_errors.iter() {
            out.push_str(&format!(
                "{POLL_ERRORS_METRIC_NAME}{{kind=\"{kind}\"}} {count}\n"
            ));
        }

        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics.render(),
    )
}

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_output_includes_recorded_counts() {
        let metrics = Metrics::new();
        metrics.node_action_inc("cordon", "n1", Outcome::Success);
        metrics.node_action_inc("cordon", "n1", Outcome::Success);
        metrics.node_action_inc("drain", "n1", Outcome::Error);

        let rendered = metrics.render();
        assert!(rendered.contains(
            "cordon_agent_node_actions_total{action=\"cordon\",node=\"n1\",outcome=\"success\"} 2"
        ));
        assert!(rendered.contains(
            "cordon_agent_node_actions_total{action=\"drain\",node=\"n1\",outcome=\"error\"} 1"
        ));
    }

    #[test]
    fn rendered_output_includes_poll_error_counts() {
        let metrics = Metrics::new();
        metrics.poll_error_inc("spot-itn");
        metrics.poll_error_inc("spot-itn");

        let rendered = metrics.render();
        assert!(rendered.contains("cordon_agent_poll_errors_total{kind=\"spot-itn\"} 2"));
    }
}
