//! HTTP client for the instance metadata service: spot interruption
//! notices, scheduled-maintenance events, and static instance attributes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cordon_types::event::EventKind;
use cordon_types::node_metadata::{InstanceMetadata, NoticeRecord};
use serde::Deserialize;

use crate::error::MetadataError;

const SPOT_ITN_PATH: &str = "/latest/meta-data/spot/instance-action";
const SCHEDULED_MAINTENANCE_PATH: &str = "/latest/meta-data/events/maintenance/scheduled";
const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const INSTANCE_TYPE_PATH: &str = "/latest/meta-data/instance-type";
const AVAILABILITY_ZONE_PATH: &str = "/latest/meta-data/placement/availability-zone";
const HOSTNAME_PATH: &str = "/latest/meta-data/hostname";

#[derive(Debug, Deserialize)]
struct SpotItnResponse {
    action: String,
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ScheduledMaintenanceEvent {
    #[serde(rename = "NotBefore")]
    not_before: DateTime<Utc>,
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "EventId")]
    event_id: String,
    /// "completed" or "canceled" once the provider has resolved the
    /// event. Treated identically to the event vanishing from the list
    /// entirely: both mean it's no longer outstanding.
    #[serde(rename = "State", default)]
    state: Option<String>,
}

impl ScheduledMaintenanceEvent {
    fn is_resolved(&self) -> bool {
        matches!(
            self.state.as_deref(),
            Some("completed") | Some("canceled") | Some("cancelled")
        )
    }
}

/// Thin wrapper over the raw metadata HTTP surface. Kept separate from
/// [`crate::monitor::Monitor`] so the polling cadence, dedup, and circuit
/// breaker live in one place and the transport lives in another.
#[derive(Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
    /// Bounded retry budget for transient failures; each fetch operation
    /// makes at most this many attempts before surfacing the last error.
    tries: u32,
}

impl MetadataClient {
    pub fn new(base_url: String, tries: u32) -> Result<Self, MetadataError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url,
            tries,
        })
    }

    /// Issues one GET, retrying only transport errors and 5xx responses
    /// up to `self.tries` times. A well-formed "absent" (404) or other
    /// non-server-error response is returned immediately without retry.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, MetadataError> {
        let attempts = self.tries.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_err = Some(MetadataError::UnexpectedStatus(response.status()));
                }
                Ok(response) => return Ok(response),
                Err(err) => last_err = Some(MetadataError::Request(err)),
            }
            if attempt + 1 < attempts {
                continue;
            }
        }

        Err(last_err.expect("loop runs at least once and always records an error before exhausting attempts"))
    }

    /// Fetches the static instance attributes used to decorate log lines
    /// and webhook payloads. Unlike the per-source notice endpoints,
    /// there is no "absent" case: any non-success response is an error.
    pub async fn get_node_metadata(&self) -> Result<InstanceMetadata, MetadataError> {
        let instance_id = self.fetch_text(INSTANCE_ID_PATH).await?;
        let instance_type = self.fetch_text(INSTANCE_TYPE_PATH).await?;
        let availability_zone = self.fetch_text(AVAILABILITY_ZONE_PATH).await?;
        let hostname = self.fetch_text(HOSTNAME_PATH).await?;

        Ok(InstanceMetadata {
            instance_id,
            instance_type,
            availability_zone,
            hostname,
        })
    }

    async fn fetch_text(&self, path: &str) -> Result<String, MetadataError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.get_with_retry(&url).await?;
        if !response.status().is_success() {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }
        Ok(response.text().await?)
    }

    /// Polls for an active spot interruption notice. An empty vec means
    /// no notice is outstanding right now, which is the overwhelmingly
    /// common response and not an error. At most one element is ever
    /// returned: an instance can only have one spot interruption
    /// outstanding at a time.
    pub async fn poll_spot_itn(&self, node_name: &str) -> Result<Vec<NoticeRecord>, MetadataError> {
        let url = format!("{}{}", self.base_url, SPOT_ITN_PATH);
        let response = self.get_with_retry(&url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }

        let body = response.text().await?;
        let parsed: SpotItnResponse =
            serde_json::from_str(&body).map_err(MetadataError::Decode)?;

        Ok(vec![NoticeRecord {
            kind: EventKind::SpotItn,
            event_id: format!("spot-itn/{node_name}"),
            description: format!("spot instance {} scheduled", parsed.action),
            start_time: parsed.time,
        }])
    }

    /// Polls for all currently outstanding scheduled-maintenance events,
    /// excluding any the provider has explicitly marked completed or
    /// canceled -- the caller's disappearance-based cancellation
    /// tracking handles those identically to events that vanish from
    /// the list outright.
    pub async fn poll_scheduled_maintenance(&self) -> Result<Vec<NoticeRecord>, MetadataError> {
        let url = format!("{}{}", self.base_url, SCHEDULED_MAINTENANCE_PATH);
        let response = self.get_with_retry(&url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(MetadataError::UnexpectedStatus(response.status()));
        }

        let body = response.text().await?;
        let events: Vec<ScheduledMaintenanceEvent> =
            serde_json::from_str(&body).map_err(MetadataError::Decode)?;

        Ok(events
            .into_iter()
            .filter(|e| !e.is_resolved())
            .map(|e| NoticeRecord {
                kind: EventKind::ScheduledMaintenance,
                event_id: format!("scheduled-maintenance/{}", e.event_id),
                description: e.code,
                start_time: e.not_before,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_itn_response_decodes_action_and_time() {
        let raw = r#"{"action":"terminate","time":"2026-07-27T00:00:00Z"}"#;
        let parsed: SpotItnResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.action, "terminate");
    }

    #[test]
    fn scheduled_maintenance_excludes_resolved_events() {
        let raw = r#"[
            {"NotBefore":"2026-08-01T00:00:00Z","Code":"system-reboot","EventId":"e2","State":"completed"},
            {"NotBefore":"2026-07-30T00:00:00Z","Code":"system-reboot","EventId":"e1"}
        ]"#;
        let events: Vec<ScheduledMaintenanceEvent> = serde_json::from_str(raw).unwrap();
        let active: Vec<_> = events.into_iter().filter(|e| !e.is_resolved()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event_id, "e1");
    }

    #[test]
    fn scheduled_maintenance_defaults_to_unresolved_when_state_absent() {
        let raw = r#"{"NotBefore":"2026-08-01T00:00:00Z","Code":"system-reboot","EventId":"e1"}"#;
        let event: ScheduledMaintenanceEvent = serde_json::from_str(raw).unwrap();
        assert!(!event.is_resolved());
    }
}
