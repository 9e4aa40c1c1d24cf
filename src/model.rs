use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

/// A single column value within a row change.
///
/// `handle_key` marks columns that form the row's handle (primary key or
/// unique not-null index); the dispatcher hashes these for `rowid` routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub handle_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
            handle_key: false,
        }
    }

    pub fn handle_key(mut self) -> Self {
        self.handle_key = true;
        self
    }
}

/// A logical row change produced by the upstream CDC pipeline.
///
/// The sink core reads `start_ts` (filtering), `commit_ts` and `table`
/// (routing); everything else passes through to the encoder opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowChangedEvent {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub table: TableName,
    pub op: RowOperation,
    pub columns: Vec<Column>,
}

impl RowChangedEvent {
    /// Columns flagged as part of the row handle, in declaration order.
    pub fn handle_key_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.handle_key)
    }

    pub fn has_handle_key(&self) -> bool {
        self.columns.iter().any(|c| c.handle_key)
    }
}

/// A schema change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlEvent {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub table: TableName,
    pub query: String,
}
