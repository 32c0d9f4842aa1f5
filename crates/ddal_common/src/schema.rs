use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::datum::{Datum, OwnedRow};
use crate::error::{ConversionError, MetadataError};
use crate::types::{ColumnId, DataType, TableId};

/// Column definition in a logical table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default_value: Option<Datum>,
}

impl ColumnDef {
    pub fn new(id: u32, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: ColumnId(id),
            name: name.into(),
            data_type,
            nullable: true,
            default_value: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: Datum) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Convert `value` to this column's declared type, enforcing NOT NULL.
    pub fn convert(&self, value: Datum) -> Result<Datum, ConversionError> {
        if value.is_null() {
            if !self.nullable {
                return Err(ConversionError::NullNotAllowed(self.name.clone()));
            }
            return Ok(Datum::Null);
        }
        value.convert_to(&self.data_type, &self.name)
    }
}

/// Logical table schema metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Build a schema, renumbering column ids to their positions.
    pub fn new(id: TableId, name: impl Into<String>, mut columns: Vec<ColumnDef>) -> Self {
        for (i, col) in columns.iter_mut().enumerate() {
            col.id = ColumnId(i as u32);
        }
        Self {
            id,
            name: name.into(),
            columns,
        }
    }

    /// Find column index by name (case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.get(id.index())
    }

    /// Resolve column names to ids, preserving the given order.
    pub fn resolve_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ColumnId>, MetadataError> {
        names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                self.find_column(n)
                    .map(|idx| self.columns[idx].id)
                    .ok_or_else(|| MetadataError::UnknownColumn {
                        table: self.name.clone(),
                        column: n.to_string(),
                    })
            })
            .collect()
    }

    /// A fresh row pre-populated with every column's default (NULL when none).
    pub fn template_row(&self) -> OwnedRow {
        OwnedRow::new(
            self.columns
                .iter()
                .map(|c| c.default_value.clone().unwrap_or(Datum::Null))
                .collect(),
        )
    }
}

/// Lookup seam over logical table metadata.
pub trait TableMetaProvider: Send + Sync {
    fn table(&self, name: &str) -> Result<&TableSchema, MetadataError>;
}

/// In-memory catalog of logical tables, keyed by lowercase name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    tables: HashMap<String, TableSchema>,
    next_table_id: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            next_table_id: 1,
        }
    }

    pub fn next_table_id(&mut self) -> TableId {
        let id = TableId(self.next_table_id);
        self.next_table_id += 1;
        id
    }

    /// Register a table built from `columns`, assigning the next table id.
    pub fn create_table(&mut self, name: &str, columns: Vec<ColumnDef>) -> TableId {
        let id = self.next_table_id();
        self.add_table(TableSchema::new(id, name, columns));
        id
    }

    pub fn add_table(&mut self, schema: TableSchema) {
        self.tables.insert(schema.name.to_lowercase(), schema);
    }

    pub fn find_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }
}

impl TableMetaProvider for Catalog {
    fn table(&self, name: &str) -> Result<&TableSchema, MetadataError> {
        self.find_table(name)
            .ok_or_else(|| MetadataError::UnknownTable(name.to_string()))
    }
}
