//! Replication-log reader boundary.
//!
//! The engine consumes row changes through the [`ChangeObserver`]
//! callback contract and drives a [`ReplicationReader`]; everything
//! source-specific stays behind those two traits. The shipped reader
//! tails a PostgreSQL logical replication slot, decoding the pgoutput
//! wire format.

pub mod error;
pub mod filter;
pub mod lsn;
pub mod observer;
pub mod postgres;
pub mod wal;

pub use error::ReaderError;
pub use filter::TableFilter;
pub use lsn::Lsn;
pub use observer::{
    ChangeObserver, ColumnMeta, FieldImage, ReplicationReader, ResumeFrom, RowChange, RowEvent,
    RowImage, TableRef,
};
pub use postgres::{PostgresReader, PostgresReaderConfig};
