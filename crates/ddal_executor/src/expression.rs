//! Value expressions as handed over by the parser.
//!
//! Only the shapes a DML value list can carry are modelled: literals,
//! positional parameters, unary minus and casts.

use std::fmt;

use ddal_common::datum::Datum;
use ddal_common::error::ConversionError;
use ddal_common::types::DataType;

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Datum),
    /// 1-based positional parameter (`?1`, `?2`, ...).
    Parameter(usize),
    Negate(Box<Expression>),
    Cast(Box<Expression>, DataType),
}

impl Expression {
    pub fn literal(value: impl Into<Datum>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn negate(inner: Expression) -> Self {
        Expression::Negate(Box::new(inner))
    }

    pub fn cast(inner: Expression, target: DataType) -> Self {
        Expression::Cast(Box::new(inner), target)
    }

    /// Evaluate against bound parameters.
    pub fn value(&self, params: &[Datum]) -> Result<Datum, ConversionError> {
        match self {
            Expression::Literal(d) => Ok(d.clone()),
            Expression::Parameter(idx) => idx
                .checked_sub(1)
                .and_then(|i| params.get(i))
                .cloned()
                .ok_or(ConversionError::ParameterMissing(*idx)),
            Expression::Negate(inner) => {
                let v = inner.value(params)?;
                negate(v, &self.sql())
            }
            Expression::Cast(inner, target) => inner.value(params)?.convert_to(target, &self.sql()),
        }
    }

    /// Fold to a literal once parameters are bound.
    pub fn optimize(&self, params: &[Datum]) -> Result<Expression, ConversionError> {
        self.value(params).map(Expression::Literal)
    }

    pub fn is_constant(&self) -> bool {
        match self {
            Expression::Literal(_) => true,
            Expression::Parameter(_) => false,
            Expression::Negate(inner) | Expression::Cast(inner, _) => inner.is_constant(),
        }
    }

    /// SQL source text of this expression.
    pub fn sql(&self) -> String {
        match self {
            Expression::Literal(d) => d.to_sql_literal(),
            Expression::Parameter(idx) => format!("?{}", idx),
            Expression::Negate(inner) => format!("-{}", inner.sql()),
            Expression::Cast(inner, target) => format!("CAST({} AS {})", inner.sql(), target),
        }
    }

    /// Render one row of a VALUES list, e.g. `(1, 'a', DEFAULT)`.
    pub fn list_sql(exprs: &[Option<Expression>]) -> String {
        let items: Vec<String> = exprs
            .iter()
            .map(|e| e.as_ref().map_or_else(|| "DEFAULT".to_string(), Expression::sql))
            .collect();
        format!("({})", items.join(", "))
    }
}

fn negate(value: Datum, sql: &str) -> Result<Datum, ConversionError> {
    let overflow = || ConversionError::Overflow {
        column: sql.to_string(),
        value: sql.to_string(),
    };
    match value {
        Datum::Null => Ok(Datum::Null),
        Datum::Int32(v) => v.checked_neg().map(Datum::Int32).ok_or_else(overflow),
        Datum::Int64(v) => v.checked_neg().map(Datum::Int64).ok_or_else(overflow),
        Datum::Float64(v) => Ok(Datum::Float64(-v)),
        Datum::Decimal(m, s) => m.checked_neg().map(|m| Datum::Decimal(m, s)).ok_or_else(overflow),
        other => Err(ConversionError::TypeMismatch {
            column: sql.to_string(),
            expected: "numeric".into(),
            got: other
                .data_type()
                .map(|t| t.sql_name())
                .unwrap_or_else(|| "NULL".into()),
        }),
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}
