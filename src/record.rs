use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::datatype::Value;
use crate::error::Result;

// ------------- Record -------------
/// One decoded row: named values in projection order. Columns pulled in
/// through a join are named `family.column`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }
    /// Sets `column`, replacing an existing value in place.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((column, value)),
        }
    }
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
    /// Display text of a column; null and missing columns render as "".
    pub fn text(&self, column: &str) -> String {
        match self.get(column) {
            None | Some(Value::Null) => String::new(),
            Some(value) => value.to_string(),
        }
    }
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }
    pub fn into_fields(self) -> Vec<(String, Value)> {
        self.fields
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (column, value) in iter {
            record.set(column, value);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (column, value) in &self.fields {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

// ------------- Row types -------------
/// Column access shared by every materialized row type.
pub trait Row {
    fn value(&self, column: &str) -> Option<&Value>;
}

impl Row for Record {
    fn value(&self, column: &str) -> Option<&Value> {
        self.get(column)
    }
}

/// Builds the row type a query materializes from a decoded record.
pub trait FromRecord: Sized {
    fn from_record(record: Record) -> Result<Self>;
}

impl FromRecord for Record {
    fn from_record(record: Record) -> Result<Self> {
        Ok(record)
    }
}

/// A base-table record wrapped together with the extra columns a join
/// brought in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Joined {
    base: Record,
    joined: Record,
}

impl Joined {
    pub fn base(&self) -> &Record {
        &self.base
    }
    pub fn joined(&self) -> &Record {
        &self.joined
    }
    /// The joined columns of one family, without their qualifier.
    pub fn family(&self, family: &str) -> Record {
        self.joined
            .fields()
            .iter()
            .filter_map(|(column, value)| match column.split_once('.') {
                Some((f, field)) if f == family => Some((field.to_string(), value.clone())),
                _ => None,
            })
            .collect()
    }
}

impl FromRecord for Joined {
    fn from_record(record: Record) -> Result<Self> {
        let mut joined = Joined::default();
        for (column, value) in record.into_fields() {
            if column.contains('.') {
                joined.joined.set(column, value);
            } else {
                joined.base.set(column, value);
            }
        }
        Ok(joined)
    }
}

impl Row for Joined {
    fn value(&self, column: &str) -> Option<&Value> {
        if column.contains('.') {
            self.joined.get(column)
        } else {
            self.base.get(column)
        }
    }
}

impl Serialize for Joined {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = self.base.fields().iter().chain(self.joined.fields());
        let mut map = serializer.serialize_map(Some(self.base.len() + self.joined.len()))?;
        for (column, value) in fields {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}
