//! vmpull Core - Foundational Types
//!
//! Error taxonomy, configuration and pull progress events shared by the
//! runtime and CLI crates.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{PruneConfig, PullConfig, RetryConfig, StorageConfig};
pub use error::{Result, VmError};
pub use event::{EventEmitter, EventPayload, PullEvent};

/// vmpull version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
