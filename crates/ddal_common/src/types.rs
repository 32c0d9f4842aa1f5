use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a logical table within the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Stable position of a column within its table's row layout.
/// Rows are indexed by `ColumnId`, never by column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId(pub u32);

impl ColumnId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifier handed out to each shard worker for registry bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tbl:{}", self.0)
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// SQL data types a column may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Text,
    Timestamp,
    Date,
    /// DECIMAL(precision, scale).
    Decimal(u8, u8),
    Bytea,
}

impl DataType {
    /// SQL spelling used in diagnostics.
    pub fn sql_name(&self) -> String {
        match self {
            DataType::Boolean => "BOOLEAN".into(),
            DataType::Int32 => "INT".into(),
            DataType::Int64 => "BIGINT".into(),
            DataType::Float64 => "DOUBLE".into(),
            DataType::Text => "VARCHAR".into(),
            DataType::Timestamp => "TIMESTAMP".into(),
            DataType::Date => "DATE".into(),
            DataType::Decimal(p, s) => format!("DECIMAL({},{})", p, s),
            DataType::Bytea => "BYTEA".into(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// The DML statement kinds this layer executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for DmlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmlKind::Insert => write!(f, "INSERT"),
            DmlKind::Update => write!(f, "UPDATE"),
            DmlKind::Delete => write!(f, "DELETE"),
        }
    }
}
