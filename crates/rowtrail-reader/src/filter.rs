//! Include/exclude table filtering on qualified `schema.table` names.

use regex::Regex;

use crate::observer::TableRef;

/// Regex-based table filter. A table passes when it matches the
/// include pattern (or none is set) and does not match the exclude
/// pattern.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl TableFilter {
    /// Compile the configured patterns.
    ///
    /// # Errors
    ///
    /// Returns the regex error for an invalid pattern.
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            include: include.map(Regex::new).transpose()?,
            exclude: exclude.map(Regex::new).transpose()?,
        })
    }

    /// A filter that passes every table.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allows(&self, table: &TableRef) -> bool {
        let qualified = table.to_string();
        let included = self
            .include
            .as_ref()
            .map_or(true, |re| re.is_match(&qualified));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|re| re.is_match(&qualified));
        included && !excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(schema: &str, name: &str) -> TableRef {
        TableRef::new(schema, name)
    }

    #[test]
    fn default_allows_everything() {
        assert!(TableFilter::allow_all().allows(&t("public", "users")));
    }

    #[test]
    fn include_restricts() {
        let filter = TableFilter::new(Some(r"^public\..*"), None).unwrap();
        assert!(filter.allows(&t("public", "users")));
        assert!(!filter.allows(&t("billing", "invoices")));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter = TableFilter::new(
            Some(r".*\..*"),
            Some(r"^(pg_catalog|information_schema)\..*"),
        )
        .unwrap();
        assert!(filter.allows(&t("public", "users")));
        assert!(!filter.allows(&t("pg_catalog", "pg_class")));
        assert!(!filter.allows(&t("information_schema", "tables")));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(TableFilter::new(Some("("), None).is_err());
    }
}
