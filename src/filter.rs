//! Event filtering.
//!
//! [`TableFilter`] decides which row changes and DDL events the sink drops
//! before routing. Rules are glob patterns matched against the qualified
//! `schema.table` name, plus an optional list of ignored transaction start
//! timestamps.

use crate::{Error, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Declarative filter rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Glob patterns over `schema.table`; a match drops the event.
    #[serde(default)]
    pub ignore_tables: Vec<String>,
    /// Transactions whose events are dropped wholesale by start timestamp.
    #[serde(default)]
    pub ignore_txn_start_ts: Vec<u64>,
}

/// Compiled event filter.
///
/// Matching is pure: the same event always produces the same decision.
#[derive(Debug, Default)]
pub struct TableFilter {
    ignore_tables: Vec<Pattern>,
    ignore_txn_start_ts: Vec<u64>,
}

impl TableFilter {
    /// Compiles filter rules.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any glob pattern is malformed.
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let mut ignore_tables = Vec::with_capacity(config.ignore_tables.len());
        for rule in &config.ignore_tables {
            let pattern = Pattern::new(rule)
                .map_err(|e| Error::Config(format!("invalid filter pattern '{rule}': {e}")))?;
            ignore_tables.push(pattern);
        }
        Ok(Self {
            ignore_tables,
            ignore_txn_start_ts: config.ignore_txn_start_ts.clone(),
        })
    }

    /// Whether a row change event should be dropped.
    pub fn should_ignore_dml(&self, start_ts: u64, schema: &str, table: &str) -> bool {
        self.is_ignored_txn(start_ts) || self.matches_table(schema, table)
    }

    /// Whether a DDL event should be dropped.
    pub fn should_ignore_ddl(&self, start_ts: u64, schema: &str, table: &str) -> bool {
        self.is_ignored_txn(start_ts) || self.matches_table(schema, table)
    }

    fn is_ignored_txn(&self, start_ts: u64) -> bool {
        self.ignore_txn_start_ts.contains(&start_ts)
    }

    fn matches_table(&self, schema: &str, table: &str) -> bool {
        let qualified = format!("{schema}.{table}");
        self.ignore_tables.iter().any(|p| p.matches(&qualified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = TableFilter::new(&FilterConfig::default()).unwrap();
        assert!(!filter.should_ignore_dml(1, "app", "users"));
        assert!(!filter.should_ignore_ddl(1, "app", "users"));
    }

    #[test]
    fn test_table_glob_rule() {
        let filter = TableFilter::new(&FilterConfig {
            ignore_tables: vec!["app.audit_*".to_string()],
            ignore_txn_start_ts: vec![],
        })
        .unwrap();

        assert!(filter.should_ignore_dml(1, "app", "audit_log"));
        assert!(!filter.should_ignore_dml(1, "app", "users"));
        assert!(!filter.should_ignore_dml(1, "other", "audit_log"));
    }

    #[test]
    fn test_schema_wide_rule() {
        let filter = TableFilter::new(&FilterConfig {
            ignore_tables: vec!["scratch.*".to_string()],
            ignore_txn_start_ts: vec![],
        })
        .unwrap();

        assert!(filter.should_ignore_ddl(7, "scratch", "anything"));
        assert!(!filter.should_ignore_ddl(7, "app", "anything"));
    }

    #[test]
    fn test_ignored_txn_start_ts() {
        let filter = TableFilter::new(&FilterConfig {
            ignore_tables: vec![],
            ignore_txn_start_ts: vec![42],
        })
        .unwrap();

        assert!(filter.should_ignore_dml(42, "app", "users"));
        assert!(!filter.should_ignore_dml(43, "app", "users"));
    }

    #[test]
    fn test_malformed_pattern_rejected() {
        let err = TableFilter::new(&FilterConfig {
            ignore_tables: vec!["app.[".to_string()],
            ignore_txn_start_ts: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
