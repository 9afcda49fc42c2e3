use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of an interruption notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    SpotItn,
    ScheduledMaintenance,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpotItn => "spot-itn",
            Self::ScheduledMaintenance => "scheduled-maintenance",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an [`InterruptionEvent`].
///
/// Transitions are monotonic along `Open -> Drained` and `Open ->
/// Cancelled`. There is no transition out of a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    Open,
    Cancelled,
    Drained,
}

impl EventState {
    /// True for `Cancelled` and `Drained`, the two states a transition
    /// never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Drained)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Drained => write!(f, "drained"),
        }
    }
}

/// Invoked once, before cordon, with the event that triggered it.
///
/// Failures are advisory: the reconciler logs and meters them but proceeds
/// with cordon/drain regardless. `String` rather than a structured error
/// because hooks are user-supplied closures with no fixed error taxonomy.
pub type PreDrainHook = Arc<dyn Fn(&InterruptionEvent) -> Result<(), String> + Send + Sync>;

/// A normalized interruption notice, deduplicated by `event_id`.
///
/// `event_id` is supplied by the originating source and is unique per
/// (source, underlying notice); the event store is the sole place that
/// enforces that uniqueness.
#[derive(Clone)]
pub struct InterruptionEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub node_name: String,
    pub description: String,
    pub state: EventState,
    /// Instant at or after which this event is actionable. Events with a
    /// future `start_time` are held by the store until then.
    pub start_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub pre_drain_hook: Option<PreDrainHook>,
}

impl fmt::Debug for InterruptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptionEvent")
            .field("event_id", &self.event_id)
            .field("kind", &self.kind)
            .field("node_name", &self.node_name)
            .field("description", &self.description)
            .field("state", &self.state)
            .field("start_time", &self.start_time)
            .field("received_at", &self.received_at)
            .field("pre_drain_hook", &self.pre_drain_hook.is_some())
            .finish()
    }
}

impl InterruptionEvent {
    /// Whether this event is open and its `start_time` has arrived.
    pub fn is_actionable(&self, now: DateTime<Utc>) -> bool {
        self.state == EventState::Open && self.start_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(state: EventState) -> InterruptionEvent {
        InterruptionEvent {
            event_id: "e1".to_string(),
            kind: EventKind::SpotItn,
            node_name: "n1".to_string(),
            description: "test".to_string(),
            state,
            start_time: Utc::now(),
            received_at: Utc::now(),
            pre_drain_hook: None,
        }
    }

    #[test]
    fn terminal_states_are_cancelled_and_drained_only() {
        assert!(!EventState::Open.is_terminal());
        assert!(EventState::Cancelled.is_terminal());
        assert!(EventState::Drained.is_terminal());
    }

    #[test]
    fn actionable_requires_open_and_start_time_in_past() {
        let now = Utc::now();
        let mut ev = event(EventState::Open);
        ev.start_time = now - chrono::Duration::seconds(1);
        assert!(ev.is_actionable(now));

        ev.start_time = now + chrono::Duration::seconds(60);
        assert!(!ev.is_actionable(now));

        ev.start_time = now - chrono::Duration::seconds(1);
        ev.state = EventState::Drained;
        assert!(!ev.is_actionable(now));
    }

    #[test]
    fn event_kind_display_matches_wire_tags() {
        assert_eq!(EventKind::SpotItn.to_string(), "spot-itn");
        assert_eq!(
            EventKind::ScheduledMaintenance.to_string(),
            "scheduled-maintenance"
        );
    }
}
