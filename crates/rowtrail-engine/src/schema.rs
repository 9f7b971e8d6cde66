//! In-process table schema cache.
//!
//! Tracks the last seen column list per table, purely to detect when a
//! table's shape changed so the handler can flush before mixing
//! metadata. Contents are never trusted across a schema-change
//! notification; row translation itself is bounds-checked and does not
//! depend on this cache being right.

use std::collections::HashMap;

/// `(schema, table)` to ordered column names.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: HashMap<(String, String), Vec<String>>,
}

impl SchemaCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the columns observed for a table. Returns `true` when a
    /// cached entry existed and differed, i.e. the table changed shape
    /// between notifications.
    pub fn observe(&mut self, schema: &str, table: &str, columns: &[String]) -> bool {
        let key = (schema.to_string(), table.to_string());
        match self.tables.get(&key) {
            Some(cached) if cached == columns => false,
            Some(_) => {
                self.tables.insert(key, columns.to_vec());
                true
            }
            None => {
                self.tables.insert(key, columns.to_vec());
                false
            }
        }
    }

    /// Drop a table's entry. Returns whether one existed.
    pub fn invalidate(&mut self, schema: &str, table: &str) -> bool {
        self.tables
            .remove(&(schema.to_string(), table.to_string()))
            .is_some()
    }

    #[must_use]
    pub fn get(&self, schema: &str, table: &str) -> Option<&[String]> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .map(Vec::as_slice)
    }
}
