//! The deduplicating interruption-event store.
//!
//! `EventStore` is the single source of truth the pollers feed and the
//! reconciler drains from. All state lives behind one mutex; operations
//! are short, synchronous critical sections with no `.await` inside the
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cordon_types::event::{EventState, InterruptionEvent};

#[derive(Default)]
struct State {
    events: HashMap<String, InterruptionEvent>,
    /// `event_id`s that have been drained at least once. Never cleared:
    /// once an id is known to the process it stays known, so a duplicate
    /// notice replayed after drain can never resurrect a drained event.
    drained_set: HashSet<String>,
    /// `event_id`s the store refuses to admit at all, seeded by
    /// reboot-restart recovery so the event that was just handled on a
    /// prior run is never re-admitted when the Monitor re-observes it.
    ignore_set: HashSet<String>,
}

/// In-memory, mutex-guarded event store keyed by `event_id`.
pub struct EventStore {
    state: Mutex<State>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Insert a newly observed event. A no-op if `event_id` is already
    /// known, whether open, cancelled, or drained, or if it's in the
    /// ignore-set -- pollers call this on every tick and must be safe to
    /// call repeatedly for the same notice.
    pub fn add(&self, event: InterruptionEvent) {
        let mut state = self.state.lock().expect("event store mutex poisoned");
        if state.drained_set.contains(&event.event_id) || state.ignore_set.contains(&event.event_id)
        {
            return;
        }
        state.events.entry(event.event_id.clone()).or_insert(event);
    }

    /// Add `event_id` to the ignore-set and drop any matching `open`
    /// event. Used by reboot-restart recovery to ensure the event a
    /// prior run already handled is never re-admitted.
    pub fn ignore(&self, event_id: &str) {
        let mut state = self.state.lock().expect("event store mutex poisoned");
        state.ignore_set.insert(event_id.to_string());
        if let Some(event) = state.events.get(event_id) {
            if event.state == EventState::Open {
                state.events.remove(event_id);
            }
        }
    }

    /// Transition an open event to `Cancelled`. A no-op if the event is
    /// unknown or already in a terminal state: a cancellation racing a
    /// drain must never resurrect or rewind a drained event.
    pub fn cancel(&self, event_id: &str) {
        let mut state = self.state.lock().expect("event store mutex poisoned");
        if let Some(event) = state.events.get_mut(event_id) {
            if event.state == EventState::Open {
                event.state = EventState::Cancelled;
            }
        }
    }

    /// All events actionable right now for `node_name`: open, not
    /// cancelled, and whose `start_time` has arrived. Ordered by
    /// `received_at` ascending so callers that need a single
    /// deterministic pick (see [`Self::get_active_event`]) can just take
    /// the first element.
    pub fn active_events_for_node(
        &self,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Vec<InterruptionEvent> {
        let state = self.state.lock().expect("event store mutex poisoned");
        let mut active: Vec<InterruptionEvent> = state
            .events
            .values()
            .filter(|e| e.node_name == node_name && e.is_actionable(now))
            .cloned()
            .collect();
        active.sort_by_key(|e| e.received_at);
        active
    }

    /// The single event the reconciler should act on for `node_name`
    /// right now: the oldest (by `received_at`) actionable event, or
    /// `None` if there isn't one. The returned event stays `open`; the
    /// caller marks it drained only after the action succeeds.
    pub fn get_active_event(
        &self,
        node_name: &str,
        now: DateTime<Utc>,
    ) -> Option<InterruptionEvent> {
        self.active_events_for_node(node_name, now)
            .into_iter()
            .next()
    }

    /// Every node with at least one event actionable right now.
    pub fn nodes_with_active_events(&self, now: DateTime<Utc>) -> HashSet<String> {
        let state = self.state.lock().expect("event store mutex poisoned");
        state
            .events
            .values()
            .filter(|e| e.is_actionable(now))
            .map(|e| e.node_name.clone())
            .collect()
    }

    /// Mark every open or cancelled event for `node_name` as drained, and
    /// remember their ids so late duplicate notices are ignored. Called
    /// once per node per successful drain.
    pub fn mark_all_as_drained(&self, node_name: &str) {
        let mut state = self.state.lock().expect("event store mutex poisoned");
        let ids: Vec<String> = state
            .events
            .values()
            .filter(|e| e.node_name == node_name)
            .map(|e| e.event_id.clone())
            .collect();
        for id in ids {
            if let Some(event) = state.events.get_mut(&id) {
                event.state = EventState::Drained;
            }
            state.drained_set.insert(id);
        }
    }

    /// True if `node_name` has no open, actionable events remaining --
    /// i.e. every event for it is cancelled or drained. A node with no
    /// events at all is, vacuously, eligible for uncordon; callers only
    /// act on this after having cordoned the node in the first place.
    pub fn should_uncordon(&self, node_name: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().expect("event store mutex poisoned");
        !state
            .events
            .values()
            .any(|e| e.node_name == node_name && e.is_actionable(now))
    }

    #[cfg(test)]
    fn event_state(&self, event_id: &str) -> Option<EventState> {
        let state = self.state.lock().expect("event store mutex poisoned");
        state.events.get(event_id).map(|e| e.state)
    }
}
