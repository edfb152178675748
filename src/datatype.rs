// used for binding values to and decoding values from SQLite
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};

// used for temporal values
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
// used for decimal numbers
use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive};
// used for the document representation of a value
use serde_json::{Number, Value as Json};

// used to print out readable forms of a value
use std::fmt;
// used for parsing values out of text
use std::str::FromStr;
// used for the type-dispatched comparison
use std::cmp::Ordering;

use crate::error::{PolystoreError, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

// ------------- Logical Types -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogicalType {
    Boolean,
    Integer,
    Float,
    Decimal,
    Text,
    Date,
    DateTime,
}

impl LogicalType {
    /// The declared column type used when creating SQLite tables.
    pub fn sql_type(&self) -> &'static str {
        match self {
            LogicalType::Boolean | LogicalType::Integer => "integer",
            LogicalType::Float => "real",
            LogicalType::Decimal => "numeric",
            LogicalType::Text | LogicalType::Date | LogicalType::DateTime => "text",
        }
    }
    pub fn is_numeric(&self) -> bool {
        matches!(self, LogicalType::Integer | LogicalType::Float | LogicalType::Decimal)
    }
    pub fn is_temporal(&self) -> bool {
        matches!(self, LogicalType::Date | LogicalType::DateTime)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            LogicalType::Boolean => "Boolean",
            LogicalType::Integer => "Integer",
            LogicalType::Float => "Float",
            LogicalType::Decimal => "Decimal",
            LogicalType::Text => "Text",
            LogicalType::Date => "Date",
            LogicalType::DateTime => "DateTime",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LogicalType {
    type Err = PolystoreError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(LogicalType::Boolean),
            "integer" | "int" | "i64" => Ok(LogicalType::Integer),
            "float" | "double" | "f64" => Ok(LogicalType::Float),
            "decimal" | "numeric" => Ok(LogicalType::Decimal),
            "text" | "string" => Ok(LogicalType::Text),
            "date" => Ok(LogicalType::Date),
            "datetime" | "timestamp" => Ok(LogicalType::DateTime),
            other => Err(PolystoreError::Config(format!("unknown logical type '{}'", other))),
        }
    }
}

// ------------- Values -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(BigDecimal),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(LogicalType::Boolean),
            Value::Int(_) => Some(LogicalType::Integer),
            Value::Float(_) => Some(LogicalType::Float),
            Value::Decimal(_) => Some(LogicalType::Decimal),
            Value::Text(_) => Some(LogicalType::Text),
            Value::Date(_) => Some(LogicalType::Date),
            Value::DateTime(_) => Some(LogicalType::DateTime),
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Compares two values of compatible logical types. Numbers compare
    /// numerically across Integer, Float and Decimal, text lexically and
    /// temporal values chronologically. Nulls are only equal to nulls;
    /// incompatible types yield `None`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Decimal(b)) => Some(BigDecimal::from(*a).cmp(b)),
            (Value::Decimal(a), Value::Int(b)) => Some(a.cmp(&BigDecimal::from(*b))),
            (Value::Float(a), Value::Decimal(b)) => BigDecimal::from_f64(*a).map(|a| a.cmp(b)),
            (Value::Decimal(a), Value::Float(b)) => BigDecimal::from_f64(*b).map(|b| a.cmp(&b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::DateTime(b)) => Some(a.and_time(NaiveTime::MIN).cmp(b)),
            (Value::DateTime(a), Value::Date(b)) => Some(a.cmp(&b.and_time(NaiveTime::MIN))),
            _ => None,
        }
    }

    /// Total order used where every pair must be ordered: nulls first,
    /// then compatible values by `compare`, then by type rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match self.compare(other) {
            Some(ordering) => ordering,
            None => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) | Value::DateTime(_) => 4,
        }
    }

    /// Converts the value into the given logical type, parsing text where
    /// necessary. Used when terms are built against column metadata.
    pub fn coerce(self, logical_type: LogicalType) -> Result<Value> {
        if self.logical_type().is_none_or(|t| t == logical_type) {
            return Ok(self);
        }
        let failed = |value: &Value| {
            PolystoreError::shape(logical_type, format!("column cannot hold the value {}", value))
        };
        let converted = match (&self, logical_type) {
            (Value::Int(i), LogicalType::Float) => Some(Value::Float(*i as f64)),
            (Value::Int(i), LogicalType::Decimal) => Some(Value::Decimal(BigDecimal::from(*i))),
            (Value::Int(0), LogicalType::Boolean) => Some(Value::Bool(false)),
            (Value::Int(1), LogicalType::Boolean) => Some(Value::Bool(true)),
            (Value::Float(f), LogicalType::Decimal) => BigDecimal::from_f64(*f).map(Value::Decimal),
            (Value::Float(f), LogicalType::Integer) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
            (Value::Decimal(d), LogicalType::Float) => d.to_f64().map(Value::Float),
            (Value::Decimal(d), LogicalType::Integer) if d.is_integer() => d.to_i64().map(Value::Int),
            (Value::Date(d), LogicalType::DateTime) => Some(Value::DateTime(d.and_time(NaiveTime::MIN))),
            (Value::Text(s), target) => parse_text(s, target),
            _ => None,
        };
        converted.ok_or_else(|| failed(&self))
    }

    // ------------- JSON -------------
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number(Number::from(*i)),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::Decimal(d) => d
                .to_f64()
                .and_then(Number::from_f64)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(d.to_string())),
            Value::Text(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(d.format(DATE_FORMAT).to_string()),
            Value::DateTime(d) => Json::String(d.format(DATETIME_FORMAT).to_string()),
        }
    }
    pub fn from_json(json: &Json, logical_type: LogicalType) -> Result<Value> {
        let corrupt = || PolystoreError::DataCorruption {
            message: format!("document value {} is not a {}", json, logical_type),
        };
        match (json, logical_type) {
            (Json::Null, _) => Ok(Value::Null),
            (Json::Bool(b), LogicalType::Boolean) => Ok(Value::Bool(*b)),
            (Json::Number(n), LogicalType::Integer) => n.as_i64().map(Value::Int).ok_or_else(corrupt),
            (Json::Number(n), LogicalType::Float) => n.as_f64().map(Value::Float).ok_or_else(corrupt),
            (Json::Number(n), LogicalType::Decimal) => BigDecimal::from_str(&n.to_string())
                .map(Value::Decimal)
                .map_err(|_| corrupt()),
            (Json::String(s), target) => Value::Text(s.clone()).coerce(target).map_err(|_| corrupt()),
            _ => Err(corrupt()),
        }
    }

    // ------------- SQLite -------------
    /// Decodes a stored SQLite value given the declared logical type of its column.
    pub fn decode(value: ValueRef<'_>, logical_type: LogicalType) -> Result<Value> {
        let corrupt = |found: String| PolystoreError::DataCorruption {
            message: format!("cannot decode {} as {}", found, logical_type),
        };
        match (logical_type, value) {
            (_, ValueRef::Null) => Ok(Value::Null),
            (LogicalType::Boolean, ValueRef::Integer(i)) => Ok(Value::Bool(i != 0)),
            (LogicalType::Integer, ValueRef::Integer(i)) => Ok(Value::Int(i)),
            (LogicalType::Integer, ValueRef::Real(f)) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
            (LogicalType::Float, ValueRef::Integer(i)) => Ok(Value::Float(i as f64)),
            (LogicalType::Float, ValueRef::Real(f)) => Ok(Value::Float(f)),
            (LogicalType::Decimal, ValueRef::Integer(i)) => Ok(Value::Decimal(BigDecimal::from(i))),
            (LogicalType::Decimal, ValueRef::Real(f)) => BigDecimal::from_f64(f)
                .map(Value::Decimal)
                .ok_or_else(|| corrupt(f.to_string())),
            (target, ValueRef::Text(bytes)) => {
                let text = std::str::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
                Value::Text(text.to_string())
                    .coerce(target)
                    .map_err(|_| corrupt(format!("'{}'", text)))
            }
            (_, other) => Err(corrupt(other.data_type().to_string())),
        }
    }
}

fn parse_text(s: &str, target: LogicalType) -> Option<Value> {
    let s = s.trim();
    match target {
        LogicalType::Boolean => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        LogicalType::Integer => s.parse::<i64>().ok().map(Value::Int),
        LogicalType::Float => s.parse::<f64>().ok().map(Value::Float),
        LogicalType::Decimal => BigDecimal::from_str(s).ok().map(Value::Decimal),
        LogicalType::Text => Some(Value::Text(s.to_string())),
        LogicalType::Date => NaiveDate::parse_from_str(s, DATE_FORMAT).ok().map(Value::Date),
        LogicalType::DateTime => NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, DATE_FORMAT)
                    .ok()
                    .map(|d| d.and_time(NaiveTime::MIN))
            })
            .map(Value::DateTime),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::DateTime(d) => write!(f, "{}", d.format(DATETIME_FORMAT)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Decimal(d) => ToSqlOutput::Owned(SqlValue::Text(d.to_string())),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Date(d) => ToSqlOutput::Owned(SqlValue::Text(d.format(DATE_FORMAT).to_string())),
            Value::DateTime(d) => {
                ToSqlOutput::Owned(SqlValue::Text(d.format(DATETIME_FORMAT).to_string()))
            }
        })
    }
}

// ------------- Conversions -------------
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Self {
        Value::Decimal(d)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Self {
        Value::DateTime(d)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(option: Option<T>) -> Self {
        option.map(Into::into).unwrap_or(Value::Null)
    }
}
