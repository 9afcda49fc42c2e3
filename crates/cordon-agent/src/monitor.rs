//! Pollers: independent tasks that watch one metadata source and feed
//! normalized events into the [`cordon_store::EventStore`].

use std::collections::HashSet;

use async_trait::async_trait;
use cordon_types::event::{EventKind, EventState, InterruptionEvent};
use cordon_types::node_metadata::NoticeRecord;

use crate::error::MetadataError;
use crate::metadata::MetadataClient;

/// One independent source of interruption notices for the local node.
#[async_trait]
pub trait Monitor: Send + Sync {
    fn kind(&self) -> EventKind;

    /// A single poll of every notice currently outstanding from this
    /// source. An empty vec means a quiet node, not an error.
    async fn poll(&self) -> Result<Vec<NoticeRecord>, MetadataError>;
}

pub struct SpotItnMonitor {
    client: MetadataClient,
    node_name: String,
}

impl SpotItnMonitor {
    pub fn new(client: MetadataClient, node_name: String) -> Self {
        Self { client, node_name }
    }
}

#[async_trait]
impl Monitor for SpotItnMonitor {
    fn kind(&self) -> EventKind {
        EventKind::SpotItn
    }

    async fn poll(&self) -> Result<Vec<NoticeRecord>, MetadataError> {
        self.client.poll_spot_itn(&self.node_name).await
    }
}

pub struct ScheduledMaintenanceMonitor {
    client: MetadataClient,
}

impl ScheduledMaintenanceMonitor {
    pub fn new(client: MetadataClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Monitor for ScheduledMaintenanceMonitor {
    fn kind(&self) -> EventKind {
        EventKind::ScheduledMaintenance
    }

    async fn poll(&self) -> Result<Vec<NoticeRecord>, MetadataError> {
        self.client.poll_scheduled_maintenance().await
    }
}

/// Normalizes a raw metadata record into a store-ready event for
/// `node_name`.
pub fn to_interruption_event(meta: NoticeRecord, node_name: &str) -> InterruptionEvent {
    InterruptionEvent {
        event_id: meta.event_id,
        kind: meta.kind,
        node_name: node_name.to_string(),
        description: meta.description,
        state: EventState::Open,
        start_time: meta.start_time,
        received_at: chrono::Utc::now(),
        pre_drain_hook: None,
    }
}

/// Detects cancellation by disappearance: an event id present in one
/// poll and absent from the next is treated as cancelled, mirroring the
/// provider's own convention of simply omitting resolved notices.
#[derive(Default)]
pub struct CancellationTracker {
    known_ids: HashSet<String>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs this poll's active ids against the last one observed.
    /// Returns ids that were active before and are no longer present.
    pub fn observe(&mut self, active: &[NoticeRecord]) -> Vec<String> {
        let new_ids: HashSet<String> = active.iter().map(|m| m.event_id.clone()).collect();
        let cancelled: Vec<String> = self.known_ids.difference(&new_ids).cloned().collect();
        self.known_ids = new_ids;
        cancelled
    }
}

/// Tracks consecutive identical poll failures for one monitor. A monitor
/// that starts failing in a new way resets the streak; a monitor that
/// keeps returning the exact same error is almost certainly wedged
/// rather than transiently flaky, and the supervisor gives up on it.
pub struct DuplicateErrorBreaker {
    threshold: u32,
    last_error: Option<(std::mem::Discriminant<MetadataError>, String)>,
    streak: u32,
}

impl DuplicateErrorBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last_error: None,
            streak: 0,
        }
    }

    /// Record a poll outcome. Returns `true` once the same error has
    /// repeated `threshold` times in a row.
    pub fn observe<T>(&mut self, result: &Result<T, MetadataError>) -> bool {
        match result {
            Ok(_) => {
                self.last_error = None;
                self.streak = 0;
                false
            }
            Err(e) => {
                let signature = (std::mem::discriminant(e), e.to_string());
                if self.last_error.as_ref() == Some(&signature) {
                    self.streak += 1;
                } else {
                    self.last_error = Some(signature);
                    self.streak = 1;
                }
                self.streak >= self.threshold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn meta(id: &str) -> NoticeRecord {
        NoticeRecord {
            kind: EventKind::ScheduledMaintenance,
            event_id: id.to_string(),
            description: "system-reboot".to_string(),
            start_time: Utc::now(),
        }
    }

    #[test]
    fn breaker_trips_after_threshold_identical_errors() {
        let mut breaker = DuplicateErrorBreaker::new(3);
        let err = || -> Result<Vec<NoticeRecord>, MetadataError> {
            Err(MetadataError::UnexpectedStatus(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        };

        assert!(!breaker.observe(&err()));
        assert!(!breaker.observe(&err()));
        assert!(breaker.observe(&err()));
    }

    #[test]
    fn breaker_resets_on_success() {
        let mut breaker = DuplicateErrorBreaker::new(2);
        let err = || -> Result<Vec<NoticeRecord>, MetadataError> {
            Err(MetadataError::UnexpectedStatus(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        };

        assert!(!breaker.observe(&err()));
        breaker.observe(&Ok(Vec::<NoticeRecord>::new()));
        assert!(!breaker.observe(&err()));
    }

    #[test]
    fn breaker_does_not_trip_on_differing_errors() {
        let mut breaker = DuplicateErrorBreaker::new(2);
        assert!(!breaker.observe(&Result::<Vec<NoticeRecord>, _>::Err(
            MetadataError::UnexpectedStatus(reqwest::StatusCode::SERVICE_UNAVAILABLE)
        )));
        assert!(!breaker.observe(&Result::<Vec<NoticeRecord>, _>::Err(
            MetadataError::UnexpectedStatus(reqwest::StatusCode::BAD_GATEWAY)
        )));
    }

    #[test]
    fn cancellation_tracker_reports_disappeared_ids() {
        let mut tracker = CancellationTracker::new();
        assert_eq!(tracker.observe(&[meta("a"), meta("b")]), Vec::<String>::new());
        let mut cancelled = tracker.observe(&[meta("a")]);
        cancelled.sort();
        assert_eq!(cancelled, vec!["b".to_string()]);
        assert_eq!(tracker.observe(&[meta("a")]), Vec::<String>::new());
    }

    #[test]
    fn cancellation_tracker_reports_nothing_on_first_poll() {
        let mut tracker = CancellationTracker::new();
        assert!(tracker.observe(&[]).is_empty());
    }
}
