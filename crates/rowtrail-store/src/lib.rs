//! Audit-store contract and backends.
//!
//! [`AuditStore`] defines the storage operations the commit pipeline
//! needs: offset loading, batch staging, the atomic events+offset
//! commit and its non-atomic fallback, and the staging reconciliation
//! used by startup recovery. Two backends ship: [`MongoStore`] for
//! production and [`MemoryStore`] for tests and single-node
//! experiments.

mod classify;
pub mod error;
mod memory;
mod mongo;
mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use store::AuditStore;
