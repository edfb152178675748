//! Materialized query results.
//!
//! A [`ResultSet`] is finite, ordered and re-iterable. Sorting dispatches on
//! the decoded value type of the sort column; null (or missing) values sort
//! before every non-null value in ascending order, and descending order is
//! the ascending comparator reversed.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::json;

use crate::datatype::Value;
use crate::error::{PolystoreError, Result};
use crate::record::{FromRecord, Record, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet<T = Record> {
    columns: Vec<String>,
    rows: Vec<T>,
}

impl<T> ResultSet<T> {
    pub fn new(columns: Vec<String>, rows: Vec<T>) -> Self {
        Self { columns, rows }
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn get(&self, index: usize) -> Option<&T> {
        self.rows.get(index)
    }
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.rows.iter()
    }
    pub fn rows(&self) -> &[T] {
        &self.rows
    }
    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }
    pub(crate) fn truncate(&mut self, len: usize) {
        self.rows.truncate(len);
    }
}

impl<T: Row> ResultSet<T> {
    /// Sorts ascending by `column`, nulls first.
    pub fn sort(&mut self, column: &str) {
        self.rows
            .sort_by(|a, b| compare_nullable(a.value(column), b.value(column)));
    }
    /// Sorts by the exact reverse of the ascending comparator.
    pub fn sort_desc(&mut self, column: &str) {
        self.rows
            .sort_by(|a, b| compare_nullable(b.value(column), a.value(column)));
    }
    /// The first row whose `column` equals `value`; a null `value` finds the
    /// first row whose column is null.
    pub fn find_first(&self, column: &str, value: &Value) -> Option<&T> {
        self.rows.iter().find(|row| match row.value(column) {
            None | Some(Value::Null) => value.is_null(),
            Some(found) => found.compare(value) == Some(Ordering::Equal),
        })
    }
    /// The rows passing `test`, leaving this result set untouched.
    pub fn filter(&self, test: impl Fn(&T) -> bool) -> ResultSet<T>
    where
        T: Clone,
    {
        ResultSet {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|row| test(row)).cloned().collect(),
        }
    }
}

impl ResultSet<Record> {
    /// Converts every record into the requested row type.
    pub fn materialize<T: FromRecord>(self) -> Result<ResultSet<T>> {
        let rows = self
            .rows
            .into_iter()
            .map(T::from_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(ResultSet { columns: self.columns, rows })
    }
}

impl<T: Serialize> ResultSet<T> {
    /// Renders through an external encoder hook.
    pub fn render(&self, encoder: &impl Encoder) -> Result<String> {
        encoder.encode(&self.columns, &self.rows)
    }
}

impl<'a, T> IntoIterator for &'a ResultSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl<T> IntoIterator for ResultSet<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;
    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Ascending comparator with the null-first rule; two nulls are equal.
pub fn compare_nullable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.total_cmp(b),
    }
}

// ------------- Encoding hooks -------------
/// Renders rows to a string interchange format.
pub trait Encoder {
    fn encode<T: Serialize>(&self, columns: &[String], rows: &[T]) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `[{"col": value, ...}, ...]`
    #[default]
    Objects,
    /// `{"columns": [...], "rows": [{...}, ...], "count": n}`
    Tree,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder {
    pub layout: Layout,
    pub pretty: bool,
}

impl Encoder for JsonEncoder {
    fn encode<T: Serialize>(&self, columns: &[String], rows: &[T]) -> Result<String> {
        let document = match self.layout {
            Layout::Objects => serde_json::to_value(rows),
            Layout::Tree => serde_json::to_value(rows)
                .map(|rows| json!({ "columns": columns, "count": rows.as_array().map_or(0, Vec::len), "rows": rows })),
        }
        .map_err(|e| PolystoreError::backend("json", e))?;
        let text = if self.pretty {
            serde_json::to_string_pretty(&document)
        } else {
            serde_json::to_string(&document)
        };
        text.map_err(|e| PolystoreError::backend("json", e))
    }
}
