//! Row event routing.
//!
//! [`Dispatcher`] maps each row change event to a partition index using a
//! first-match-wins rule list. Hashing uses Murmur2, the same function as
//! Kafka's `DefaultPartitioner`, so downstream consumers can replicate the
//! assignment from the message key alone.

use crate::model::RowChangedEvent;
use crate::{Error, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};

/// Routing kind applied to rows matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Hash of the commit timestamp. Spreads a hot table across partitions
    /// at the cost of per-row ordering.
    Ts,
    /// Hash of the handle-key columns. The same row always lands on the
    /// same partition, preserving per-row causal order.
    #[serde(rename = "rowid")]
    RowId,
    /// Hash of `schema.table`. Per-table FIFO.
    Table,
    /// `rowid` when the table has a handle key, `table` otherwise.
    #[default]
    Default,
}

/// One routing rule: glob matchers over `schema.table` plus the kind to
/// apply. Declared in configuration, compiled by [`Dispatcher::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRule {
    pub matcher: Vec<String>,
    #[serde(default)]
    pub partition: PartitionKind,
}

#[derive(Debug)]
struct CompiledRule {
    matcher: Vec<Pattern>,
    kind: PartitionKind,
}

/// Deterministic row-to-partition router.
#[derive(Debug)]
pub struct Dispatcher {
    rules: Vec<CompiledRule>,
    partition_num: i32,
}

impl Dispatcher {
    /// Compiles the rule list for a topic with `partition_num` partitions.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any matcher glob is malformed or the
    /// partition count is not positive.
    pub fn new(rules: &[DispatchRule], partition_num: i32) -> Result<Self> {
        if partition_num <= 0 {
            return Err(Error::Config(format!(
                "dispatcher requires a positive partition count, got {partition_num}"
            )));
        }
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut matcher = Vec::with_capacity(rule.matcher.len());
            for glob in &rule.matcher {
                let pattern = Pattern::new(glob).map_err(|e| {
                    Error::Config(format!("invalid dispatch matcher '{glob}': {e}"))
                })?;
                matcher.push(pattern);
            }
            compiled.push(CompiledRule {
                matcher,
                kind: rule.partition,
            });
        }
        Ok(Self {
            rules: compiled,
            partition_num,
        })
    }

    /// Returns the partition index in `[0, partition_num)` for a row.
    ///
    /// Pure: the result depends only on the row and the configured rules.
    pub fn dispatch(&self, row: &RowChangedEvent) -> i32 {
        let kind = self.resolve_kind(row);
        let hash = match kind {
            PartitionKind::Ts => murmur2(&row.commit_ts.to_be_bytes()),
            PartitionKind::RowId => hash_handle_key(row),
            PartitionKind::Table => murmur2(row.table.to_string().as_bytes()),
            // resolve_kind never returns Default
            PartitionKind::Default => unreachable!(),
        };
        ((hash & 0x7fff_ffff) % self.partition_num as u32) as i32
    }

    fn resolve_kind(&self, row: &RowChangedEvent) -> PartitionKind {
        let qualified = row.table.to_string();
        let kind = self
            .rules
            .iter()
            .find(|rule| rule.matcher.iter().any(|p| p.matches(&qualified)))
            .map(|rule| rule.kind)
            .unwrap_or(PartitionKind::Default);
        match kind {
            PartitionKind::Default => {
                if row.has_handle_key() {
                    PartitionKind::RowId
                } else {
                    PartitionKind::Table
                }
            }
            other => other,
        }
    }
}

fn hash_handle_key(row: &RowChangedEvent) -> u32 {
    let mut buf = Vec::new();
    buf.extend_from_slice(row.table.to_string().as_bytes());
    for column in row.handle_key_columns() {
        buf.push(0);
        buf.extend_from_slice(column.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(column.value.to_string().as_bytes());
    }
    murmur2(&buf)
}

/// Murmur2, 32-bit, as used by Kafka's `DefaultPartitioner`.
fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, RowOperation, TableName};
    use serde_json::json;

    fn row(schema: &str, table: &str, commit_ts: u64, columns: Vec<Column>) -> RowChangedEvent {
        RowChangedEvent {
            start_ts: commit_ts - 1,
            commit_ts,
            table: TableName::new(schema, table),
            op: RowOperation::Insert,
            columns,
        }
    }

    #[test]
    fn test_murmur2_deterministic() {
        assert_eq!(murmur2(b"order-123"), murmur2(b"order-123"));
        assert_ne!(murmur2(b"order-123"), murmur2(b"order-124"));
    }

    #[test]
    fn test_dispatch_is_deterministic() {
        let d = Dispatcher::new(&[], 6).unwrap();
        let r = row(
            "app",
            "orders",
            100,
            vec![Column::new("id", json!(7)).handle_key()],
        );
        let first = d.dispatch(&r);
        for _ in 0..10 {
            assert_eq!(d.dispatch(&r), first);
        }
        assert!((0..6).contains(&first));
    }

    #[test]
    fn test_rowid_same_key_same_partition() {
        let d = Dispatcher::new(
            &[DispatchRule {
                matcher: vec!["app.*".to_string()],
                partition: PartitionKind::RowId,
            }],
            4,
        )
        .unwrap();

        let r1 = row(
            "app",
            "orders",
            100,
            vec![Column::new("id", json!(7)).handle_key()],
        );
        let r2 = row(
            "app",
            "orders",
            250,
            vec![
                Column::new("id", json!(7)).handle_key(),
                Column::new("amount", json!(19.5)),
            ],
        );
        assert_eq!(d.dispatch(&r1), d.dispatch(&r2));
    }

    #[test]
    fn test_table_routing_groups_by_table() {
        let d = Dispatcher::new(
            &[DispatchRule {
                matcher: vec!["*.*".to_string()],
                partition: PartitionKind::Table,
            }],
            4,
        )
        .unwrap();

        let r1 = row("app", "orders", 100, vec![]);
        let r2 = row("app", "orders", 900, vec![]);
        assert_eq!(d.dispatch(&r1), d.dispatch(&r2));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let d = Dispatcher::new(
            &[
                DispatchRule {
                    matcher: vec!["app.orders".to_string()],
                    partition: PartitionKind::Table,
                },
                DispatchRule {
                    matcher: vec!["app.*".to_string()],
                    partition: PartitionKind::Ts,
                },
            ],
            8,
        )
        .unwrap();

        // Both rows match the first rule, which routes by table.
        let r1 = row("app", "orders", 100, vec![]);
        let r2 = row("app", "orders", 101, vec![]);
        assert_eq!(d.dispatch(&r1), d.dispatch(&r2));
    }

    #[test]
    fn test_default_falls_back_by_handle_key() {
        let d = Dispatcher::new(&[], 4).unwrap();

        // Without a handle key, default degrades to table routing.
        let r1 = row("app", "logs", 100, vec![Column::new("msg", json!("a"))]);
        let r2 = row("app", "logs", 200, vec![Column::new("msg", json!("b"))]);
        assert_eq!(d.dispatch(&r1), d.dispatch(&r2));

        // With a handle key, rows with the same key stay together.
        let r3 = row(
            "app",
            "users",
            100,
            vec![Column::new("id", json!(1)).handle_key()],
        );
        let r4 = row(
            "app",
            "users",
            300,
            vec![Column::new("id", json!(1)).handle_key()],
        );
        assert_eq!(d.dispatch(&r3), d.dispatch(&r4));
    }

    #[test]
    fn test_malformed_matcher_rejected() {
        let err = Dispatcher::new(
            &[DispatchRule {
                matcher: vec!["app.[".to_string()],
                partition: PartitionKind::Table,
            }],
            4,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_partition_in_range() {
        let d = Dispatcher::new(&[], 3).unwrap();
        for ts in 0..100u64 {
            let r = row("app", "t", ts + 1, vec![]);
            let p = d.dispatch(&r);
            assert!((0..3).contains(&p));
        }
    }
}
