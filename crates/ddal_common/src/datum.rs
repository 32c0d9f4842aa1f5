use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ConversionError;
use crate::types::DataType;

/// A single scalar value carried by a logical row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Date(i32),      // days since Unix epoch (1970-01-01)
    /// Fixed-point decimal: mantissa × 10^(-scale).
    Decimal(i128, u8),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Date(_) => Some(DataType::Date),
            Datum::Decimal(_, scale) => Some(DataType::Decimal(38, *scale)),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            Datum::Decimal(m, s) => Some(*m as f64 / 10f64.powi(*s as i32)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// SQL equality: NULL never equals anything, numeric types compare by value.
    pub fn sql_eq(&self, other: &Datum) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        self == other
    }

    /// Render as a SQL literal, e.g. `'O''Brien'`, `12.50`, `NULL`.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Datum::Null => "NULL".into(),
            Datum::Boolean(b) => if *b { "TRUE".into() } else { "FALSE".into() },
            Datum::Int32(v) => v.to_string(),
            Datum::Int64(v) => v.to_string(),
            Datum::Float64(v) => v.to_string(),
            Datum::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Datum::Timestamp(_) => format!("TIMESTAMP '{}'", self),
            Datum::Date(_) => format!("DATE '{}'", self),
            Datum::Decimal(m, s) => decimal_to_string(*m, *s),
            Datum::Bytea(_) => format!("'{}'", self),
        }
    }

    /// Create a Decimal from a string like "123.45" or "-0.001".
    pub fn parse_decimal(s: &str) -> Option<Datum> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (int_part, frac_part) = if let Some(dot_pos) = s.find('.') {
            (&s[..dot_pos], &s[dot_pos + 1..])
        } else {
            (s, "")
        };
        let scale = frac_part.len() as u8;
        let combined = format!("{}{}", int_part, frac_part);
        let mantissa: i128 = combined.parse().ok()?;
        Some(Datum::Decimal(mantissa, scale))
    }

    /// Convert this value to `target`, naming `column` in any error.
    ///
    /// NULL converts to NULL; nullability is the column's concern.
    pub fn convert_to(self, target: &DataType, column: &str) -> Result<Datum, ConversionError> {
        if self.is_null() {
            return Ok(Datum::Null);
        }
        let mismatch = |got: &Datum| ConversionError::TypeMismatch {
            column: column.to_string(),
            expected: target.sql_name(),
            got: got
                .data_type()
                .map(|t| t.sql_name())
                .unwrap_or_else(|| "NULL".into()),
        };
        let overflow = |value: String| ConversionError::Overflow {
            column: column.to_string(),
            value,
        };
        let invalid = |value: &str| ConversionError::InvalidLiteral {
            column: column.to_string(),
            target: target.sql_name(),
            value: value.to_string(),
        };

        match (target, self) {
            (DataType::Boolean, Datum::Boolean(b)) => Ok(Datum::Boolean(b)),
            (DataType::Boolean, Datum::Int32(v)) => Ok(Datum::Boolean(v != 0)),
            (DataType::Boolean, Datum::Int64(v)) => Ok(Datum::Boolean(v != 0)),
            (DataType::Boolean, Datum::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "1" | "yes" | "on" => Ok(Datum::Boolean(true)),
                "f" | "false" | "0" | "no" | "off" => Ok(Datum::Boolean(false)),
                _ => Err(invalid(&s)),
            },

            (DataType::Int32, Datum::Int32(v)) => Ok(Datum::Int32(v)),
            (DataType::Int32, Datum::Int64(v)) => i32::try_from(v)
                .map(Datum::Int32)
                .map_err(|_| overflow(v.to_string())),
            (DataType::Int32, Datum::Float64(v)) => {
                let r = v.round();
                if r >= i32::MIN as f64 && r <= i32::MAX as f64 {
                    Ok(Datum::Int32(r as i32))
                } else {
                    Err(overflow(v.to_string()))
                }
            }
            (DataType::Int32, Datum::Text(s)) => s.trim().parse::<i32>().map(Datum::Int32).map_err(|_| invalid(&s)),

            (DataType::Int64, Datum::Int32(v)) => Ok(Datum::Int64(v as i64)),
            (DataType::Int64, Datum::Int64(v)) => Ok(Datum::Int64(v)),
            (DataType::Int64, Datum::Float64(v)) => {
                let r = v.round();
                if r >= i64::MIN as f64 && r <= i64::MAX as f64 {
                    Ok(Datum::Int64(r as i64))
                } else {
                    Err(overflow(v.to_string()))
                }
            }
            (DataType::Int64, Datum::Text(s)) => s.trim().parse::<i64>().map(Datum::Int64).map_err(|_| invalid(&s)),

            (DataType::Float64, Datum::Float64(v)) => Ok(Datum::Float64(v)),
            (DataType::Float64, d @ (Datum::Int32(_) | Datum::Int64(_) | Datum::Decimal(_, _))) => {
                d.as_f64().map(Datum::Float64).ok_or_else(|| mismatch(&d))
            }
            (DataType::Float64, Datum::Text(s)) => s.trim().parse::<f64>().map(Datum::Float64).map_err(|_| invalid(&s)),

            (DataType::Decimal(precision, scale), d) => {
                let (mantissa, from_scale) = match d {
                    Datum::Decimal(m, s) => (m, s),
                    Datum::Int32(v) => (v as i128, 0),
                    Datum::Int64(v) => (v as i128, 0),
                    Datum::Float64(v) => match Datum::parse_decimal(&format!("{:.*}", *scale as usize, v)) {
                        Some(Datum::Decimal(m, s)) => (m, s),
                        _ => return Err(invalid(&v.to_string())),
                    },
                    Datum::Text(s) => match Datum::parse_decimal(&s) {
                        Some(Datum::Decimal(m, sc)) => (m, sc),
                        _ => return Err(invalid(&s)),
                    },
                    other => return Err(mismatch(&other)),
                };
                let rescaled = decimal_rescale(mantissa, from_scale, *scale)
                    .ok_or_else(|| overflow(decimal_to_string(mantissa, from_scale)))?;
                if decimal_digits(rescaled) > *precision as u32 {
                    return Err(overflow(decimal_to_string(mantissa, from_scale)));
                }
                Ok(Datum::Decimal(rescaled, *scale))
            }

            (DataType::Text, Datum::Text(s)) => Ok(Datum::Text(s)),
            (DataType::Text, Datum::Bytea(b)) => Err(mismatch(&Datum::Bytea(b))),
            (DataType::Text, d) => Ok(Datum::Text(d.to_string())),

            (DataType::Date, Datum::Date(d)) => Ok(Datum::Date(d)),
            (DataType::Date, Datum::Timestamp(us)) => Ok(Datum::Date(us.div_euclid(86_400_000_000) as i32)),
            (DataType::Date, Datum::Text(s)) => parse_date(&s).map(Datum::Date).ok_or_else(|| invalid(&s)),

            (DataType::Timestamp, Datum::Timestamp(us)) => Ok(Datum::Timestamp(us)),
            (DataType::Timestamp, Datum::Date(d)) => Ok(Datum::Timestamp(d as i64 * 86_400_000_000)),
            (DataType::Timestamp, Datum::Text(s)) => {
                parse_timestamp(&s).map(Datum::Timestamp).ok_or_else(|| invalid(&s))
            }

            (DataType::Bytea, Datum::Bytea(b)) => Ok(Datum::Bytea(b)),
            (DataType::Bytea, Datum::Text(s)) => Ok(Datum::Bytea(s.into_bytes())),

            (_, other) => Err(mismatch(&other)),
        }
    }
}

fn parse_date(s: &str) -> Option<i32> {
    let date = chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)?;
    Some(date.signed_duration_since(epoch).num_days() as i32)
}

fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    let parsed = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(parsed.and_utc().timestamp_micros())
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => {
                let secs = us.div_euclid(1_000_000);
                let nsecs = (us.rem_euclid(1_000_000) * 1000) as u32;
                match chrono::DateTime::from_timestamp(secs, nsecs) {
                    Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
                    None => write!(f, "{}", us),
                }
            }
            Datum::Date(days) => {
                let epoch =
                    chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(chrono::NaiveDate::MIN);
                if let Some(d) = epoch.checked_add_signed(chrono::Duration::days(*days as i64)) {
                    write!(f, "{}", d.format("%Y-%m-%d"))
                } else {
                    write!(f, "{}", days)
                }
            }
            Datum::Decimal(m, s) => write!(f, "{}", decimal_to_string(*m, *s)),
            Datum::Bytea(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Structural equality: `Null == Null` so template rows and buffered rows
/// compare predictably. Use [`Datum::sql_eq`] for predicate evaluation.
impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Boolean(a), Datum::Boolean(b)) => a == b,
            (Datum::Int32(a), Datum::Int32(b)) => a == b,
            (Datum::Int64(a), Datum::Int64(b)) => a == b,
            (Datum::Int32(a), Datum::Int64(b)) => (*a as i64) == *b,
            (Datum::Int64(a), Datum::Int32(b)) => *a == (*b as i64),
            (Datum::Float64(a), Datum::Float64(b)) => a == b,
            (Datum::Float64(a), Datum::Int32(b)) => *a == (*b as f64),
            (Datum::Float64(a), Datum::Int64(b)) => *a == (*b as f64),
            (Datum::Int32(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Int64(a), Datum::Float64(b)) => (*a as f64) == *b,
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Timestamp(a), Datum::Timestamp(b)) => a == b,
            (Datum::Date(a), Datum::Date(b)) => a == b,
            (Datum::Decimal(a, sa), Datum::Decimal(b, sb)) => {
                let (na, nb) = decimal_normalize(*a, *sa, *b, *sb);
                na == nb
            }
            (Datum::Decimal(a, sa), Datum::Int64(b)) => *a == *b as i128 * 10i128.pow(*sa as u32),
            (Datum::Int64(a), Datum::Decimal(b, sb)) => *a as i128 * 10i128.pow(*sb as u32) == *b,
            (Datum::Bytea(a), Datum::Bytea(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Explicit type tags: Int32(x) == Int64(x) must hash identically.
        match self {
            Datum::Null => 0u8.hash(state),
            Datum::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Datum::Int32(v) => {
                2u8.hash(state);
                (*v as i64).hash(state);
            }
            Datum::Int64(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Datum::Float64(v) => {
                3u8.hash(state);
                v.to_bits().hash(state);
            }
            Datum::Text(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Datum::Timestamp(us) => {
                5u8.hash(state);
                us.hash(state);
            }
            Datum::Date(days) => {
                6u8.hash(state);
                days.hash(state);
            }
            Datum::Decimal(m, s) => {
                7u8.hash(state);
                let (nm, ns) = decimal_trim(*m, *s);
                nm.hash(state);
                ns.hash(state);
            }
            Datum::Bytea(bytes) => {
                8u8.hash(state);
                bytes.hash(state);
            }
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int64(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int32(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Boolean(v)
    }
}

/// A logical row: a fixed-width sequence of datums indexed by column position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn set(&mut self, idx: usize, value: Datum) -> bool {
        match self.values.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for OwnedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v.to_sql_literal())?;
        }
        write!(f, ")")
    }
}

// ── Decimal helper functions ────────────────────────────────────────────

/// Convert a (mantissa, scale) decimal to its string representation.
/// e.g. (12345, 2) → "123.45", (-1, 3) → "-0.001", (100, 0) → "100"
pub fn decimal_to_string(mantissa: i128, scale: u8) -> String {
    if scale == 0 {
        return mantissa.to_string();
    }
    let negative = mantissa < 0;
    let s = mantissa.unsigned_abs().to_string();
    let scale = scale as usize;
    let result = if s.len() <= scale {
        format!("0.{}{}", "0".repeat(scale - s.len()), s)
    } else {
        let (int_part, frac_part) = s.split_at(s.len() - scale);
        format!("{}.{}", int_part, frac_part)
    };
    if negative {
        format!("-{}", result)
    } else {
        result
    }
}

fn decimal_normalize(a: i128, sa: u8, b: i128, sb: u8) -> (i128, i128) {
    if sa == sb {
        (a, b)
    } else if sa > sb {
        (a, b * 10i128.pow((sa - sb) as u32))
    } else {
        (a * 10i128.pow((sb - sa) as u32), b)
    }
}

/// Rescale a mantissa to `to` fractional digits, rounding half away from zero.
fn decimal_rescale(mantissa: i128, from: u8, to: u8) -> Option<i128> {
    if from == to {
        Some(mantissa)
    } else if from < to {
        mantissa.checked_mul(10i128.checked_pow((to - from) as u32)?)
    } else {
        let div = 10i128.checked_pow((from - to) as u32)?;
        let q = mantissa / div;
        let r = (mantissa % div).abs();
        if r * 2 >= div {
            Some(if mantissa < 0 { q - 1 } else { q + 1 })
        } else {
            Some(q)
        }
    }
}

fn decimal_digits(mantissa: i128) -> u32 {
    let abs = mantissa.unsigned_abs();
    if abs == 0 {
        1
    } else {
        abs.ilog10() + 1
    }
}

fn decimal_trim(mut mantissa: i128, mut scale: u8) -> (i128, u8) {
    if mantissa == 0 {
        return (0, 0);
    }
    while scale > 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        scale -= 1;
    }
    (mantissa, scale)
}
