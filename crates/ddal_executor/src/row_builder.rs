//! Builds typed logical rows from value lists.

use ddal_common::datum::{Datum, OwnedRow};
use ddal_common::error::{ConversionError, DdalError, DdalResult, MetadataError};
use ddal_common::schema::TableSchema;
use ddal_common::types::ColumnId;

use crate::expression::Expression;

/// Converts one value list at a time into a full-width `OwnedRow` for a
/// fixed target column list. Unlisted columns and `DEFAULT` slots keep the
/// template row's default.
#[derive(Debug, Clone)]
pub struct RowBuilder {
    schema: TableSchema,
    columns: Vec<ColumnId>,
}

impl RowBuilder {
    pub fn new(schema: TableSchema, columns: Vec<ColumnId>) -> DdalResult<Self> {
        if let Some(bad) = columns.iter().find(|c| schema.column(**c).is_none()) {
            return Err(MetadataError::UnknownColumn {
                table: schema.name.clone(),
                column: bad.to_string(),
            }
            .into());
        }
        Ok(Self { schema, columns })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn columns(&self) -> &[ColumnId] {
        &self.columns
    }

    /// Build from a literal VALUES row. `row_number` is 1-based.
    pub fn build(
        &self,
        exprs: &[Option<Expression>],
        params: &[Datum],
        row_number: usize,
    ) -> DdalResult<OwnedRow> {
        self.build_inner(exprs.len(), |i| match &exprs[i] {
            Some(e) => e.value(params).map(Some),
            None => Ok(None),
        })
        .map_err(|e| DdalError::from(e).with_row(row_number, Expression::list_sql(exprs)))
    }

    /// Build from pushed values (INSERT ... SELECT).
    pub fn build_values(&self, values: Vec<Datum>, row_number: usize) -> DdalResult<OwnedRow> {
        let source = OwnedRow::new(values);
        self.build_inner(source.len(), |i| Ok(Some(source.values[i].clone())))
            .map_err(|e| DdalError::from(e).with_row(row_number, source.to_string()))
    }

    fn build_inner<F>(&self, provided: usize, mut value_at: F) -> Result<OwnedRow, ConversionError>
    where
        F: FnMut(usize) -> Result<Option<Datum>, ConversionError>,
    {
        if provided != self.columns.len() {
            return Err(ConversionError::ColumnCountMismatch {
                expected: self.columns.len(),
                got: provided,
            });
        }
        let mut row = self.schema.template_row();
        for (i, col) in self.columns.iter().enumerate() {
            let Some(value) = value_at(i)? else {
                continue;
            };
            // Column ids were validated in `new`.
            if let Some(def) = self.schema.column(*col) {
                row.set(col.index(), def.convert(value)?);
            }
        }
        for def in &self.schema.columns {
            if !def.nullable && row.get(def.id.index()).map_or(true, Datum::is_null) {
                return Err(ConversionError::NullNotAllowed(def.name.clone()));
            }
        }
        Ok(row)
    }
}
