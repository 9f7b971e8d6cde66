//! Shared model types for the rowtrail audit pipeline.
//!
//! Pure data types used by the store backends, the batcher, and the
//! recovery logic. Kept in a leaf crate so the storage and engine
//! crates can share them without circular dependencies.

pub mod batch;
pub mod event;
pub mod position;
pub mod time;

pub use batch::{BatchStatus, StagingBatch, StagingSummary};
pub use event::{AuditEvent, EventMeta, FieldDelta, LogPosition, OpKind, SourceRef};
pub use position::{OffsetRecord, SourcePosition};
