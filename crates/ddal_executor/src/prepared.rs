//! Prepared DML statements as produced by the parser.
//!
//! Columns are already resolved to `ColumnId`s; value lists are expressions
//! evaluated against the bound parameters at execution time.

use ddal_common::datum::Datum;
use ddal_common::error::DdalResult;
use ddal_common::types::ColumnId;

use crate::expression::Expression;

/// Push-style consumer of rows (INSERT ... SELECT).
pub trait ResultTarget {
    fn add_row(&mut self, values: Vec<Datum>) -> DdalResult<()>;

    fn row_count(&self) -> u64;
}

/// Upstream producer that pushes its rows into a `ResultTarget`.
pub trait RowSource: Send {
    fn query(&mut self, target: &mut dyn ResultTarget) -> DdalResult<()>;
}

/// A materialised row source.
#[derive(Debug, Clone, Default)]
pub struct VecRowSource {
    rows: Vec<Vec<Datum>>,
}

impl VecRowSource {
    pub fn new(rows: Vec<Vec<Datum>>) -> Self {
        Self { rows }
    }
}

impl RowSource for VecRowSource {
    fn query(&mut self, target: &mut dyn ResultTarget) -> DdalResult<()> {
        for row in &self.rows {
            target.add_row(row.clone())?;
        }
        Ok(())
    }
}

pub struct Insert {
    pub table: String,
    pub columns: Vec<ColumnId>,
    /// Literal VALUES rows. `None` marks a `DEFAULT` slot.
    pub rows: Vec<Vec<Option<Expression>>>,
    /// Set for INSERT ... SELECT; takes precedence over `rows`.
    pub query: Option<Box<dyn RowSource>>,
    pub params: Vec<Datum>,
    /// 1-based row currently being built; diagnostics only.
    pub current_row: usize,
}

impl Insert {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnId>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            query: None,
            params: Vec::new(),
            current_row: 0,
        }
    }

    pub fn values(mut self, row: Vec<Option<Expression>>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn select(mut self, source: impl RowSource + 'static) -> Self {
        self.query = Some(Box::new(source));
        self
    }

    pub fn bind(mut self, params: Vec<Datum>) -> Self {
        self.params = params;
        self
    }
}

impl std::fmt::Debug for Insert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Insert")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("rows", &self.rows.len())
            .field("query", &self.query.is_some())
            .field("current_row", &self.current_row)
            .finish()
    }
}

/// `UPDATE table SET col = expr, ... WHERE col = expr AND ...`
#[derive(Debug, Clone)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(ColumnId, Expression)>,
    /// Conjunction of equality predicates; empty matches every row.
    pub condition: Vec<(ColumnId, Expression)>,
    pub params: Vec<Datum>,
}

impl Update {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            condition: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn set(mut self, col: ColumnId, value: Expression) -> Self {
        self.assignments.push((col, value));
        self
    }

    pub fn filter(mut self, col: ColumnId, value: Expression) -> Self {
        self.condition.push((col, value));
        self
    }

    pub fn bind(mut self, params: Vec<Datum>) -> Self {
        self.params = params;
        self
    }
}

/// `DELETE FROM table WHERE col = expr AND ...`
#[derive(Debug, Clone)]
pub struct Delete {
    pub table: String,
    pub condition: Vec<(ColumnId, Expression)>,
    pub params: Vec<Datum>,
}

impl Delete {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            condition: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn filter(mut self, col: ColumnId, value: Expression) -> Self {
        self.condition.push((col, value));
        self
    }

    pub fn bind(mut self, params: Vec<Datum>) -> Self {
        self.params = params;
        self
    }
}
