// used for persistence
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, params_from_iter};
use tracing::{debug, trace};

use super::{Backend, Metadata, OutputColumn, aggregate_type, output_columns};
use crate::datatype::{LogicalType, Value};
use crate::error::{PolystoreError, Result};
use crate::operator::Operator;
use crate::part::{Connective, Dialect, Operand, Part, Predicate, Term};
use crate::query::{Aggregate, BoundQuery, CompiledFilter};
use crate::record::Record;
use crate::result::ResultSet;
use crate::schema::Schema;

const BACKEND: &str = "relational";

/// Unscoped SQL rendering, the textual form of a filter for every backend.
pub static ANSI: SqlDialect = SqlDialect { scope: None };

// ------------- Dialect -------------
/// Renders parts as SQL boolean expressions with `?` placeholders.
/// Unqualified columns are qualified with the scope table, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlDialect {
    scope: Option<String>,
}

impl SqlDialect {
    pub fn scoped(table: impl Into<String>) -> Self {
        Self {
            scope: Some(table.into()),
        }
    }
}

impl Dialect for SqlDialect {
    fn parametrized(&self, part: &Part) -> Result<String> {
        let mut out = String::new();
        let mut aliases = 0;
        render_part(part, self.scope.as_deref(), &mut aliases, &mut out)?;
        Ok(out)
    }
}

pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column(name: &str, scope: Option<&str>) -> String {
    match (name.split_once('.'), scope) {
        (Some((table, field)), _) => format!("{}.{}", quote(table), quote(field)),
        (None, Some(table)) => format!("{}.{}", quote(table), quote(name)),
        (None, None) => quote(name),
    }
}

fn render_part(part: &Part, scope: Option<&str>, aliases: &mut usize, out: &mut String) -> Result<()> {
    match part {
        Part::Term(term) => render_term(term, scope, aliases, out),
        Part::Predicate(predicate) => render_predicate(predicate, scope, aliases, out),
    }
}

fn render_predicate(predicate: &Predicate, scope: Option<&str>, aliases: &mut usize, out: &mut String) -> Result<()> {
    let separator = match predicate.connective() {
        _ if predicate.is_empty() => {
            out.push_str(if predicate.connective() == Connective::Or { "1 = 0" } else { "1 = 1" });
            return Ok(());
        }
        Connective::Or => " OR ",
        Connective::And | Connective::None => " AND ",
    };
    for (i, part) in predicate.parts().iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        match part {
            Part::Predicate(nested) if nested.len() > 1 => {
                out.push('(');
                render_predicate(nested, scope, aliases, out)?;
                out.push(')');
            }
            _ => render_part(part, scope, aliases, out)?,
        }
    }
    Ok(())
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn render_term(term: &Term, scope: Option<&str>, aliases: &mut usize, out: &mut String) -> Result<()> {
    let operator = term.operator();
    if operator == Operator::Within {
        let axes: Vec<&str> = term.column().split(',').map(str::trim).collect();
        let [x, y] = axes.as_slice() else {
            return Err(PolystoreError::shape(operator, "requires an \"x,y\" column pair"));
        };
        out.push_str(&format!("within({}, {}, ?, ?, ?)", column(x, scope), column(y, scope)));
        return Ok(());
    }
    let lhs = column(term.column(), scope);
    match (operator, term.operand()) {
        (Operator::IsNull | Operator::IsNotNull, _) => {
            out.push_str(&format!("{} {}", lhs, operator.token()));
        }
        (Operator::ILike, Operand::Scalar(_)) => {
            out.push_str(&format!("LOWER({}) LIKE LOWER(?)", lhs));
        }
        (Operator::Between, Operand::Range(..)) => {
            out.push_str(&format!("{} BETWEEN ? AND ?", lhs));
        }
        (Operator::In, Operand::List(values)) if values.is_empty() => out.push_str("1 = 0"),
        (Operator::NotIn, Operand::List(values)) if values.is_empty() => out.push_str("1 = 1"),
        (Operator::In | Operator::NotIn, Operand::List(values)) => {
            out.push_str(&format!("{} {} ({})", lhs, operator.token(), placeholders(values.len())));
        }
        (Operator::In | Operator::NotIn, Operand::Nested(nested)) => {
            let (table, alias) = subquery_source(term, aliases)?;
            out.push_str(&format!(
                "{} {} (SELECT {} FROM {} AS {} WHERE ",
                lhs,
                operator.token(),
                column(term.nested_column(), Some(&alias)),
                quote(table),
                quote(&alias)
            ));
            render_part(nested, Some(&alias), aliases, out)?;
            out.push(')');
        }
        (Operator::Exists | Operator::NotExists, Operand::Nested(nested)) => {
            let (table, alias) = subquery_source(term, aliases)?;
            out.push_str(&format!(
                "{} (SELECT 1 FROM {} AS {} WHERE {} = {} AND (",
                operator.token(),
                quote(table),
                quote(&alias),
                lhs,
                column(term.nested_column(), Some(&alias))
            ));
            render_part(nested, Some(&alias), aliases, out)?;
            out.push_str("))");
        }
        (_, Operand::Scalar(_)) => {
            out.push_str(&format!("{} {} ?", lhs, operator.token()));
        }
        (operator, operand) => {
            return Err(PolystoreError::shape(
                operator,
                format!("cannot be rendered over {:?}", operand),
            ));
        }
    }
    Ok(())
}

fn subquery_source<'t>(term: &'t Term, aliases: &mut usize) -> Result<(&'t str, String)> {
    let table = term
        .table()
        .ok_or_else(|| PolystoreError::shape(term.operator(), "subquery has no table"))?;
    *aliases += 1;
    Ok((table, format!("s{}", aliases)))
}

// ------------- Statements -------------
/// A prepared-to-be SQL statement with its positional parameters and the
/// logical types of its output columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub columns: Vec<(String, LogicalType)>,
}

/// SQLite through a borrowed connection. Statements are prepared per
/// execution and finalized before the call returns.
pub struct RelationalBackend<'db> {
    db: &'db Connection,
    metadata: Metadata,
}

impl<'db> RelationalBackend<'db> {
    pub fn new(connection: &'db Connection, metadata: Metadata) -> Result<RelationalBackend<'db>> {
        connection.create_scalar_function(
            "within",
            5,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let x: Option<f64> = ctx.get(0)?;
                let y: Option<f64> = ctx.get(1)?;
                let cx: f64 = ctx.get(2)?;
                let cy: f64 = ctx.get(3)?;
                let radius: f64 = ctx.get(4)?;
                Ok(match (x, y) {
                    (Some(x), Some(y)) => Some((x - cx).powi(2) + (y - cy).powi(2) <= radius * radius),
                    _ => None,
                })
            },
        )?;
        // LIKE is case sensitive everywhere, ILIKE lowers both sides
        connection.execute_batch("pragma case_sensitive_like = on;")?;
        Ok(RelationalBackend {
            db: connection,
            metadata,
        })
    }

    pub fn connection(&self) -> &'db Connection {
        self.db
    }

    /// Creates the table and secondary indexes of `schema` unless they exist.
    pub fn create_table(&self, schema: &Schema) -> Result<()> {
        let mut definitions: Vec<String> = schema
            .columns()
            .iter()
            .map(|c| {
                format!(
                    "{} {}{}",
                    quote(c.name()),
                    c.logical_type().sql_type(),
                    if c.nullable() { " null" } else { " not null" }
                )
            })
            .collect();
        if schema.get(schema.key()).is_some() {
            definitions.push(format!(
                "constraint {} primary key ({})",
                quote(&format!("{}_key", schema.table())),
                quote(schema.key())
            ));
        }
        let mut sql = format!(
            "create table if not exists {} (\n    {}\n);\n",
            quote(schema.table()),
            definitions.join(",\n    ")
        );
        for index in schema.indexes() {
            sql.push_str(&format!(
                "create index if not exists {} on {} ({});\n",
                quote(&format!("{}_{}", schema.table(), index)),
                quote(schema.table()),
                quote(index)
            ));
        }
        debug!(table = schema.table(), "creating table");
        self.db.execute_batch(&sql)?;
        Ok(())
    }

    fn from_clause(&self, query: &BoundQuery<'_>) -> String {
        let compiled = query.compiled();
        let mut from = quote(compiled.table());
        for join in compiled.joins() {
            from.push_str(&format!(
                " LEFT JOIN {} ON {} = {}",
                quote(&join.table),
                column(&join.local_column, Some(compiled.table())),
                column(&join.foreign_column, Some(&join.table))
            ));
        }
        from
    }

    fn where_clause(&self, query: &BoundQuery<'_>) -> Result<(String, Vec<Value>)> {
        let compiled = query.compiled();
        Ok(match compiled.filter() {
            CompiledFilter::None => (String::new(), Vec::new()),
            CompiledFilter::Predicate { predicate, .. } => {
                let part = Part::Predicate(predicate.clone());
                let text = SqlDialect::scoped(compiled.table()).parametrized(&part)?;
                (format!(" WHERE {}", text), query.positional())
            }
            CompiledFilter::Raw { text } => (format!(" WHERE {}", text), Vec::new()),
            CompiledFilter::Named { positional_text, .. } if positional_text.trim().is_empty() => {
                (String::new(), Vec::new())
            }
            CompiledFilter::Named { positional_text, .. } => {
                (format!(" WHERE {}", positional_text), query.positional())
            }
        })
    }
}

fn expression(output: &OutputColumn, table: &str) -> String {
    column(&output.field, Some(output.family.as_deref().unwrap_or(table)))
}

impl<'db> Backend for RelationalBackend<'db> {
    type Native = SqlStatement;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn compile(&self, query: &BoundQuery<'_>) -> Result<SqlStatement> {
        let compiled = query.compiled();
        let table = compiled.table();
        let outputs = output_columns(&self.metadata, query)?;
        let select = outputs
            .iter()
            .map(|o| format!("{} AS {}", expression(o, table), quote(&o.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let (filter, parameters) = self.where_clause(query)?;
        let mut sql = format!("SELECT {} FROM {}{}", select, self.from_clause(query), filter);
        if !compiled.grouping().is_empty() {
            let grouping = compiled
                .grouping()
                .iter()
                .map(|g| column(g, Some(table)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" GROUP BY {}", grouping));
        }
        if !compiled.ordering().is_empty() {
            let ordering = compiled
                .ordering()
                .iter()
                .map(|o| {
                    let direction = match o.direction {
                        crate::query::Direction::Ascending => "ASC",
                        crate::query::Direction::Descending => "DESC",
                    };
                    format!("{} {}", column(&o.column, Some(table)), direction)
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {}", ordering));
        }
        let window = compiled.window();
        match window.fetch_limit() {
            Some(limit) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, window.from())),
            None if window.from() > 0 => sql.push_str(&format!(" LIMIT -1 OFFSET {}", window.from())),
            None => (),
        }
        Ok(SqlStatement {
            sql,
            parameters,
            columns: outputs.into_iter().map(|o| (o.name, o.logical_type)).collect(),
        })
    }

    fn compile_aggregate(&self, query: &BoundQuery<'_>, aggregate: &Aggregate) -> Result<SqlStatement> {
        let table = query.compiled().table();
        let logical_type = aggregate_type(&self.metadata, query, aggregate)?;
        let target = match aggregate.column() {
            None => "*".to_string(),
            Some(name) => column(name, Some(table)),
        };
        let (filter, parameters) = self.where_clause(query)?;
        let sql = format!(
            "SELECT {}({}) FROM {}{}",
            aggregate.name(),
            target,
            self.from_clause(query),
            filter
        );
        Ok(SqlStatement {
            sql,
            parameters,
            columns: vec![(aggregate.to_string(), logical_type)],
        })
    }

    fn fetch(&mut self, native: &SqlStatement) -> Result<ResultSet<Record>> {
        trace!(sql = %native.sql, parameters = native.parameters.len(), "executing");
        let mut statement = self.db.prepare(&native.sql)?;
        let mut rows = statement.query(params_from_iter(native.parameters.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, (name, logical_type)) in native.columns.iter().enumerate() {
                record.set(name.clone(), Value::decode(row.get_ref(i)?, *logical_type)?);
            }
            records.push(record);
        }
        let columns = native.columns.iter().map(|(name, _)| name.clone()).collect();
        Ok(ResultSet::new(columns, records))
    }

    fn fetch_value(&mut self, native: &SqlStatement) -> Result<Value> {
        trace!(sql = %native.sql, "executing aggregate");
        let logical_type = native
            .columns
            .first()
            .map(|(_, t)| *t)
            .unwrap_or(LogicalType::Integer);
        let mut statement = self.db.prepare(&native.sql)?;
        let mut rows = statement.query(params_from_iter(native.parameters.iter()))?;
        match rows.next()? {
            Some(row) => Value::decode(row.get_ref(0)?, logical_type),
            None => Ok(Value::Null),
        }
    }

    fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        let schema = self.metadata.schema(table)?;
        let mut names = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());
        for (name, value) in record.fields() {
            values.push(schema.convert(name, value.clone())?);
            names.push(quote(name));
        }
        let sql = format!(
            "insert into {} ({}) values ({})",
            quote(table),
            names.join(", "),
            placeholders(values.len())
        );
        self.db.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }
}
