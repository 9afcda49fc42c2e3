//! Shared vocabulary for the interruption-event lifecycle: the event and
//! state types the store and agent crates both speak, plus configuration
//! loading.

pub mod config;
pub mod event;
pub mod node_metadata;

pub use config::{AgentConfig, ConfigError};
pub use event::{EventKind, EventState, InterruptionEvent, PreDrainHook};
pub use node_metadata::{InstanceMetadata, NodeActionRecord, NoticeRecord};
