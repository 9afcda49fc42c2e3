use chrono::{DateTime, Utc};

use crate::event::EventKind;

/// The raw, source-specific interruption notice polled from a metadata
/// endpoint, before it's normalized into an [`crate::event::InterruptionEvent`].
#[derive(Clone, Debug, PartialEq)]
pub struct NoticeRecord {
    pub kind: EventKind,
    pub event_id: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
}

/// Static instance attributes fetched to decorate log lines and webhook
/// payloads. Distinct from [`NoticeRecord`]: this never changes over the
/// life of the instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub hostname: String,
}

/// Persisted node-side bookkeeping, round-tripped through Kubernetes
/// labels and a taint so an agent restart can recover in-flight state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeActionRecord {
    pub action: Option<String>,
    pub event_id: Option<String>,
    pub boot_id: Option<String>,
}

pub const LABEL_ACTION: &str = "cordon-agent/action";
pub const LABEL_EVENT_ID: &str = "cordon-agent/event-id";
pub const LABEL_BOOT_ID: &str = "cordon-agent/boot-id";
pub const TAINT_KEY: &str = "cordon-agent/interruption";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_keys_are_namespaced_under_the_agent() {
        for key in [LABEL_ACTION, LABEL_EVENT_ID, LABEL_BOOT_ID, TAINT_KEY] {
            assert!(key.starts_with("cordon-agent/"));
        }
    }
}
