//! Record/column metadata.
//!
//! The query core only reads metadata: to resolve projections and to convert
//! term values into the logical type of the column they are compared with.
//! [`Catalog`] is a keeper that owns one [`Schema`] per table and hands out
//! shared references to it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex};

use seahash::SeaHasher;

use crate::datatype::{LogicalType, Value};
use crate::error::{PolystoreError, Result};
use crate::operator::Operator;
use crate::part::{Input, Term};

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

// ------------- Column -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    logical_type: LogicalType,
    position: usize,
    nullable: bool,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn logical_type(&self) -> LogicalType {
        self.logical_type
    }
    pub fn position(&self) -> usize {
        self.position
    }
    pub fn nullable(&self) -> bool {
        self.nullable
    }
}

// ------------- Schema -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    columns: Vec<Column>,
    primary_key: String,
    indexes: Vec<String>,
}

impl Schema {
    /// A schema with no columns whose primary key is named `id`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            primary_key: String::from("id"),
            indexes: Vec::new(),
        }
    }
    pub fn column(mut self, name: impl Into<String>, logical_type: LogicalType) -> Self {
        let position = self.columns.len();
        self.columns.push(Column {
            name: name.into(),
            logical_type,
            position,
            nullable: true,
        });
        self
    }
    pub fn required(mut self, name: impl Into<String>, logical_type: LogicalType) -> Self {
        self = self.column(name, logical_type);
        if let Some(column) = self.columns.last_mut() {
            column.nullable = false;
        }
        self
    }
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = name.into();
        self
    }
    /// Declares a secondary index over one column.
    pub fn index(mut self, name: impl Into<String>) -> Self {
        self.indexes.push(name.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
    pub fn key(&self) -> &str {
        &self.primary_key
    }
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }
    pub fn is_indexed(&self, column: &str) -> bool {
        self.indexes.iter().any(|i| i == column)
    }
    pub fn get(&self, column: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == column)
    }
    /// Resolves a possibly `table.`-qualified column name of this schema.
    pub fn require(&self, column: &str) -> Result<&Column> {
        let field = match column.split_once('.') {
            Some((table, field)) if table == self.table => field,
            Some(_) => column,
            None => column,
        };
        self.get(field).ok_or_else(|| PolystoreError::UnknownColumn {
            table: self.table.clone(),
            column: column.to_string(),
        })
    }

    /// Builds a term against this schema, converting every scalar into the
    /// logical type of the column before the shape checks run.
    pub fn term(&self, column: &str, operator: Operator, value: impl Into<Input>) -> Result<Term> {
        let input = value.into();
        match operator {
            // the pattern stays text whatever the column type
            Operator::Like | Operator::ILike => {
                self.require(column)?;
                Term::new(column, operator, input)
            }
            // a point column pair "x,y" compared with plain numbers
            Operator::Within => {
                for axis in column.split(',') {
                    self.require(axis.trim())?;
                }
                Term::new(column, operator, input)
            }
            _ => {
                let logical_type = self.require(column)?.logical_type();
                let input = input.try_map(|v| if v.is_null() { Ok(v) } else { v.coerce(logical_type) })?;
                Term::new(column, operator, input)
            }
        }
    }

    /// Converts `value` for storage in `column`.
    pub fn convert(&self, column: &str, value: Value) -> Result<Value> {
        let column = self.require(column)?;
        if value.is_null() && !column.nullable() {
            return Err(PolystoreError::shape(
                column.name(),
                format!("is not nullable in {}", self.table),
            ));
        }
        value.coerce(column.logical_type())
    }
}

// ------------- Metadata -------------
/// Supplies the schema of a table or collection.
pub trait MetadataProvider {
    fn schema(&self, table: &str) -> Result<Arc<Schema>>;
}

#[derive(Debug, Default)]
pub struct Catalog {
    kept: Mutex<HashMap<String, Arc<Schema>, OtherHasher>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }
    /// Keeps `schema` unless a schema for the same table is already kept.
    /// Returns the kept schema and whether it was previously kept.
    pub fn keep(&self, schema: Schema) -> Result<(Arc<Schema>, bool)> {
        let mut kept = self
            .kept
            .lock()
            .map_err(|e| PolystoreError::Lock(e.to_string()))?;
        match kept.entry(schema.table.clone()) {
            Entry::Occupied(e) => Ok((Arc::clone(e.get()), true)),
            Entry::Vacant(e) => Ok((Arc::clone(e.insert(Arc::new(schema))), false)),
        }
    }
    pub fn len(&self) -> usize {
        self.kept.lock().map(|kept| kept.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataProvider for Catalog {
    fn schema(&self, table: &str) -> Result<Arc<Schema>> {
        let kept = self
            .kept
            .lock()
            .map_err(|e| PolystoreError::Lock(e.to_string()))?;
        kept.get(table)
            .cloned()
            .ok_or_else(|| PolystoreError::UnknownTable(table.to_string()))
    }
}
