//! The per-node agent: polls for spot-interruption and scheduled-
//! maintenance notices, deduplicates them, and reconciles the local
//! node's cordon/drain/uncordon state in response.

pub mod error;
pub mod metadata;
pub mod metrics;
pub mod monitor;
pub mod node;
pub mod reconciler;
pub mod supervisor;
pub mod webhook;

pub use error::AgentError;
pub use supervisor::Supervisor;
