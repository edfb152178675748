//! Storage backends.
//!
//! Every backend turns a [`BoundQuery`] into its own native request and runs
//! it. The contract shared by all of them:
//!
//! * rows are fetched over the window `[from, from + fetch_limit)`, one row
//!   past the requested window, so the caller can tell whether the window
//!   reached the end;
//! * ordering puts nulls first ascending and last descending;
//! * aggregates ignore the window and the grouping.

use std::fmt;
use std::sync::Arc;

use crate::datatype::{LogicalType, Value};
use crate::error::{PolystoreError, Result};
use crate::part::Dialect;
use crate::query::{Aggregate, BoundQuery};
use crate::record::Record;
use crate::result::ResultSet;
use crate::schema::MetadataProvider;

pub mod document;
pub mod keyvalue;
pub mod relational;

pub use document::DocumentBackend;
pub use keyvalue::KeyValueBackend;
pub use relational::{ANSI, RelationalBackend, SqlDialect};

/// Shared, thread-safe schema source handed to every backend.
pub type Metadata = Arc<dyn MetadataProvider + Send + Sync>;

pub trait Backend {
    /// The compiled, backend-native form of a query.
    type Native: fmt::Debug;

    fn name(&self) -> &'static str;
    /// The dialect used for the textual form of a compiled filter.
    fn dialect(&self) -> &dyn Dialect {
        &ANSI
    }
    fn compile(&self, query: &BoundQuery<'_>) -> Result<Self::Native>;
    fn compile_aggregate(&self, query: &BoundQuery<'_>, aggregate: &Aggregate) -> Result<Self::Native>;
    fn fetch(&mut self, native: &Self::Native) -> Result<ResultSet<Record>>;
    fn fetch_value(&mut self, native: &Self::Native) -> Result<Value>;
    /// Stores one record in `table`, converting every field to its column type.
    fn insert(&mut self, table: &str, record: &Record) -> Result<()>;
}

/// Output columns of a query: every column of the base table followed by
/// every column of each joined table (as `table.column`), unless an explicit
/// projection names them.
pub(crate) fn output_columns(
    metadata: &Metadata,
    query: &BoundQuery<'_>,
) -> Result<Vec<OutputColumn>> {
    let compiled = query.compiled();
    let base = metadata.schema(compiled.table())?;
    if compiled.projection().is_empty() {
        let mut columns: Vec<OutputColumn> = base
            .columns()
            .iter()
            .map(|c| OutputColumn {
                name: c.name().to_string(),
                family: None,
                field: c.name().to_string(),
                logical_type: c.logical_type(),
            })
            .collect();
        for join in compiled.joins() {
            let schema = metadata.schema(&join.table)?;
            columns.extend(schema.columns().iter().map(|c| OutputColumn {
                name: format!("{}.{}", join.table, c.name()),
                family: Some(join.table.clone()),
                field: c.name().to_string(),
                logical_type: c.logical_type(),
            }));
        }
        return Ok(columns);
    }
    compiled
        .projection()
        .iter()
        .map(|name| resolve_column(metadata, query, name))
        .collect()
}

/// Resolves `name` against the base table, or against a joined table when
/// it is qualified with that table's name.
pub(crate) fn resolve_column(metadata: &Metadata, query: &BoundQuery<'_>, name: &str) -> Result<OutputColumn> {
    let compiled = query.compiled();
    match name.split_once('.') {
        Some((family, field)) if family != compiled.table() => {
            if !compiled.joins().iter().any(|j| j.table == family) {
                return Err(PolystoreError::UnknownTable(family.to_string()));
            }
            let schema = metadata.schema(family)?;
            Ok(OutputColumn {
                name: name.to_string(),
                family: Some(family.to_string()),
                field: field.to_string(),
                logical_type: schema.require(field)?.logical_type(),
            })
        }
        _ => {
            let base = metadata.schema(compiled.table())?;
            let column = base.require(name)?;
            Ok(OutputColumn {
                name: column.name().to_string(),
                family: None,
                field: column.name().to_string(),
                logical_type: column.logical_type(),
            })
        }
    }
}

/// The logical type `aggregate` yields over `query`. SUM and AVG need a
/// numeric column.
pub(crate) fn aggregate_type(
    metadata: &Metadata,
    query: &BoundQuery<'_>,
    aggregate: &Aggregate,
) -> Result<LogicalType> {
    let Some(name) = aggregate.column() else {
        return Ok(LogicalType::Integer);
    };
    let column_type = resolve_column(metadata, query, name)?.logical_type;
    Ok(match aggregate {
        Aggregate::Sum(_) | Aggregate::Avg(_) if !column_type.is_numeric() => {
            return Err(PolystoreError::shape(aggregate.name(), format!("{} is not numeric", name)));
        }
        Aggregate::Avg(_) => LogicalType::Float,
        _ => column_type,
    })
}

/// One projected column: the name it is reported under, the joined table it
/// comes from (`None` for the base table), and its logical type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    pub family: Option<String>,
    pub field: String,
    pub logical_type: LogicalType,
}
