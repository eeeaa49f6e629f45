// =====================================================
// COMMON DATABASE TYPES AND STRUCTURES
// =====================================================

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// --- Row Access ---

/// Index-based, nullable access to one row of a result set.
///
/// Implemented by the SQL Server and PostgreSQL drivers' row types and by
/// `Vec<CellValue>` for in-memory rows, so lookups and table decoders never
/// depend on a particular driver.
pub trait ColumnReader {
    fn get_i32(&self, index: usize) -> Result<Option<i32>, String>;
    fn get_i64(&self, index: usize) -> Result<Option<i64>, String>;
    fn get_decimal(&self, index: usize) -> Result<Option<Decimal>, String>;
    fn get_string(&self, index: usize) -> Result<Option<String>, String>;
    fn get_datetime(&self, index: usize) -> Result<Option<NaiveDateTime>, String>;
    fn get_bool(&self, index: usize) -> Result<Option<bool>, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Decimal(Decimal),
    Text(String),
    DateTime(NaiveDateTime),
    Bool(bool),
}

impl From<i32> for CellValue {
    fn from(value: i32) -> Self {
        CellValue::Int(value as i64)
    }
}

impl From<Decimal> for CellValue {
    fn from(value: Decimal) -> Self {
        CellValue::Decimal(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(value: NaiveDateTime) -> Self {
        CellValue::DateTime(value)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CellValue::Null)
    }
}

fn cell<'a>(row: &'a [CellValue], index: usize) -> Result<&'a CellValue, String> {
    row.get(index)
        .ok_or_else(|| format!("Column index {} out of range ({} columns)", index, row.len()))
}

fn mismatch(index: usize, expected: &str, found: &CellValue) -> String {
    format!("Column {} is not {}: {:?}", index, expected, found)
}

impl ColumnReader for Vec<CellValue> {
    fn get_i32(&self, index: usize) -> Result<Option<i32>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::Int(v) => i32::try_from(*v)
                .map(Some)
                .map_err(|_| format!("Column {} value {} does not fit in int4", index, v)),
            other => Err(mismatch(index, "an integer", other)),
        }
    }

    fn get_i64(&self, index: usize) -> Result<Option<i64>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::Int(v) => Ok(Some(*v)),
            other => Err(mismatch(index, "an integer", other)),
        }
    }

    fn get_decimal(&self, index: usize) -> Result<Option<Decimal>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::Decimal(v) => Ok(Some(*v)),
            CellValue::Int(v) => Ok(Some(Decimal::from(*v))),
            other => Err(mismatch(index, "a decimal", other)),
        }
    }

    fn get_string(&self, index: usize) -> Result<Option<String>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::Text(v) => Ok(Some(v.clone())),
            other => Err(mismatch(index, "text", other)),
        }
    }

    fn get_datetime(&self, index: usize) -> Result<Option<NaiveDateTime>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::DateTime(v) => Ok(Some(*v)),
            other => Err(mismatch(index, "a timestamp", other)),
        }
    }

    fn get_bool(&self, index: usize) -> Result<Option<bool>, String> {
        match cell(self, index)? {
            CellValue::Null => Ok(None),
            CellValue::Bool(v) => Ok(Some(*v)),
            CellValue::Int(v) => Ok(Some(*v != 0)),
            other => Err(mismatch(index, "a boolean", other)),
        }
    }
}

// --- Target Column Types ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgType {
    Int4,
    Int8,
    Numeric,
    Text,
    Bool,
    TimestampTz,
}

impl PgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PgType::Int4 => "integer",
            PgType::Int8 => "bigint",
            PgType::Numeric => "numeric",
            PgType::Text => "text",
            PgType::Bool => "boolean",
            PgType::TimestampTz => "timestamptz",
        }
    }
}

/// One typed, nullable value bound for a target column.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Int4(Option<i32>),
    Int8(Option<i64>),
    Numeric(Option<Decimal>),
    Text(Option<String>),
    Bool(Option<bool>),
    TimestampTz(Option<DateTime<Utc>>),
}

impl PgValue {
    pub fn pg_type(&self) -> PgType {
        match self {
            PgValue::Int4(_) => PgType::Int4,
            PgValue::Int8(_) => PgType::Int8,
            PgValue::Numeric(_) => PgType::Numeric,
            PgValue::Text(_) => PgType::Text,
            PgValue::Bool(_) => PgType::Bool,
            PgValue::TimestampTz(_) => PgType::TimestampTz,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            PgValue::Int4(v) => v.is_none(),
            PgValue::Int8(v) => v.is_none(),
            PgValue::Numeric(v) => v.is_none(),
            PgValue::Text(v) => v.is_none(),
            PgValue::Bool(v) => v.is_none(),
            PgValue::TimestampTz(v) => v.is_none(),
        }
    }
}

// --- Lookup Keys ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Int(i64),
    Decimal(Decimal),
    Text(String),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Decimal(v) => write!(f, "{}", v),
            KeyPart::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Set/map key of any arity. Decimal parts are normalized so `5.00` and
/// `5` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(Vec<KeyPart>);

impl CompositeKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        let parts = parts
            .into_iter()
            .map(|part| match part {
                KeyPart::Decimal(d) => KeyPart::Decimal(d.normalize()),
                other => other,
            })
            .collect();
        CompositeKey(parts)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, part) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

impl From<i32> for CompositeKey {
    fn from(value: i32) -> Self {
        CompositeKey(vec![KeyPart::Int(value as i64)])
    }
}

impl From<i64> for CompositeKey {
    fn from(value: i64) -> Self {
        CompositeKey(vec![KeyPart::Int(value)])
    }
}

impl From<(i32, i32)> for CompositeKey {
    fn from((a, b): (i32, i32)) -> Self {
        CompositeKey(vec![KeyPart::Int(a as i64), KeyPart::Int(b as i64)])
    }
}

impl From<(i32, i32, i32)> for CompositeKey {
    fn from((a, b, c): (i32, i32, i32)) -> Self {
        CompositeKey(vec![
            KeyPart::Int(a as i64),
            KeyPart::Int(b as i64),
            KeyPart::Int(c as i64),
        ])
    }
}

impl From<Decimal> for CompositeKey {
    fn from(value: Decimal) -> Self {
        CompositeKey::new(vec![KeyPart::Decimal(value)])
    }
}

impl From<&str> for CompositeKey {
    fn from(value: &str) -> Self {
        CompositeKey(vec![KeyPart::Text(value.to_string())])
    }
}
