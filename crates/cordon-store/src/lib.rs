//! The deduplicating interruption-event store shared between pollers and
//! the reconciler.

pub mod store;

pub use store::EventStore;
