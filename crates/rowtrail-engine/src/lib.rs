//! Core pipeline crate: batch assembly, the staged two-phase commit
//! against the audit store, startup recovery, and the lifecycle
//! supervisor.

pub mod config;
pub mod handler;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod supervisor;

pub use config::{Config, ConfigError};
pub use handler::{Handler, SharedHandler};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use schema::SchemaCache;
pub use sink::{Sink, SinkError};
pub use supervisor::Supervisor;
