//! The query front-end.
//!
//! A [`Query`] is a mutable builder: a root predicate (or a raw filter text),
//! a projection, joins, grouping, ordering and a half-open row window. It
//! compiles into an immutable [`CompiledQuery`], which is bound once per
//! execution into a [`BoundQuery`] carrying the concrete arguments, so state
//! never leaks from one execution into the next.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::datatype::Value;
use crate::error::{PolystoreError, Result};
use crate::part::{Dialect, Part, Predicate};
use crate::record::{FromRecord, Record};
use crate::result::ResultSet;

lazy_static! {
    static ref PARAMETER_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

/// A left-outer join of `table` on `local_column = table.foreign_column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: String,
    pub local_column: String,
    pub foreign_column: String,
}

// ------------- Window -------------
/// Half-open row window `[from, to)`; no `to` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    from: usize,
    to: Option<usize>,
}

impl Window {
    pub fn new(from: usize, to: Option<usize>) -> Result<Window> {
        if let Some(to) = to {
            if to < from {
                return Err(PolystoreError::Range(format!(
                    "end {} lies before start {}",
                    to, from
                )));
            }
        }
        Ok(Window { from, to })
    }
    pub fn from(&self) -> usize {
        self.from
    }
    pub fn to(&self) -> Option<usize> {
        self.to
    }
    pub fn max_rows(&self) -> Option<usize> {
        self.to.map(|to| to - self.from)
    }
    /// Rows a backend fetches: one beyond the window, so that the presence
    /// of a next page can be told without a second round trip.
    pub fn fetch_limit(&self) -> Option<usize> {
        self.max_rows().map(|max| max + 1)
    }
}

// ------------- Aggregates -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Aggregate {
    pub fn name(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum(_) => "SUM",
            Aggregate::Avg(_) => "AVG",
            Aggregate::Min(_) => "MIN",
            Aggregate::Max(_) => "MAX",
        }
    }
    pub fn column(&self) -> Option<&str> {
        match self {
            Aggregate::Count => None,
            Aggregate::Sum(c) | Aggregate::Avg(c) | Aggregate::Min(c) | Aggregate::Max(c) => Some(c),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.column().unwrap_or("*"))
    }
}

// ------------- Query -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Built,
    Compiled,
    Executed,
    Closed,
}

#[derive(Debug)]
pub struct Query {
    table: String,
    predicate: Option<Predicate>,
    filter: Option<String>,
    filter_derived: bool,
    projection: Vec<String>,
    joins: Vec<Join>,
    grouping: Vec<String>,
    ordering: Vec<OrderBy>,
    window: Window,
    declared: Option<Vec<String>>,
    state: QueryState,
    eof: Option<bool>,
}

impl Clone for Query {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            predicate: self.predicate.clone(),
            filter: self.filter.clone(),
            filter_derived: self.filter_derived,
            projection: self.projection.clone(),
            joins: self.joins.clone(),
            grouping: self.grouping.clone(),
            ordering: self.ordering.clone(),
            window: self.window,
            declared: self.declared.clone(),
            state: match self.state {
                QueryState::Built => QueryState::Built,
                _ => QueryState::Compiled,
            },
            eof: None,
        }
    }
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: None,
            filter: None,
            filter_derived: false,
            projection: Vec::new(),
            joins: Vec::new(),
            grouping: Vec::new(),
            ordering: Vec::new(),
            window: Window::default(),
            declared: None,
            state: QueryState::Built,
            eof: None,
        }
    }
    /// Builder form of [`Query::set_predicate`].
    pub fn filtered(mut self, predicate: impl Into<Part>) -> Self {
        self.set_predicate(predicate);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn state(&self) -> QueryState {
        self.state
    }
    fn touch(&mut self) {
        if self.state != QueryState::Closed {
            self.state = QueryState::Built;
        }
    }

    /// Filters by `part`, leaving named-parameter mode.
    pub fn set_predicate(&mut self, part: impl Into<Part>) {
        let predicate = match part.into() {
            Part::Predicate(predicate) => predicate,
            term => Predicate::all([term]),
        };
        self.predicate = Some(predicate);
        self.declared = None;
        self.filter = None;
        self.filter_derived = false;
        self.touch();
    }
    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }
    /// Mutable access to the predicate tree; any compiled text is dropped.
    pub fn predicate_mut(&mut self) -> Option<&mut Predicate> {
        if self.filter_derived {
            self.filter = None;
            self.filter_derived = false;
        }
        self.touch();
        self.predicate.as_mut()
    }
    /// Filters by backend-native text instead of a predicate.
    pub fn set_filter(&mut self, text: impl Into<String>) {
        self.filter = Some(text.into());
        self.filter_derived = false;
        self.predicate = None;
        self.touch();
    }
    /// The raw filter, or the parametrized text of the predicate once compiled.
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Registers comma-separated parameter names and switches the query to
    /// named-parameter mode, dropping the predicate and any text compiled
    /// from it.
    pub fn declare_parameters(&mut self, names: &str) -> Result<()> {
        let mut declared: Vec<String> = Vec::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !PARAMETER_NAME.is_match(name) || declared.iter().any(|d| d == name) {
                return Err(PolystoreError::InvalidParameterName(name.to_string()));
            }
            declared.push(name.to_string());
        }
        if self.filter_derived {
            self.filter = None;
            self.filter_derived = false;
        }
        self.predicate = None;
        self.declared = Some(declared);
        self.touch();
        Ok(())
    }
    pub fn declared_parameters(&self) -> Option<&[String]> {
        self.declared.as_deref()
    }

    pub fn select<S: Into<String>>(&mut self, columns: impl IntoIterator<Item = S>) -> &mut Self {
        self.projection = columns.into_iter().map(Into::into).collect();
        self.touch();
        self
    }
    /// Projected columns; empty means every column of the table and its joins.
    pub fn projection(&self) -> &[String] {
        &self.projection
    }
    pub fn join(
        &mut self,
        table: impl Into<String>,
        local_column: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> &mut Self {
        self.joins.push(Join {
            table: table.into(),
            local_column: local_column.into(),
            foreign_column: foreign_column.into(),
        });
        self.touch();
        self
    }
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }
    pub fn group_by(&mut self, column: impl Into<String>) -> &mut Self {
        self.grouping.push(column.into());
        self.touch();
        self
    }
    pub fn grouping(&self) -> &[String] {
        &self.grouping
    }
    pub fn order_by(&mut self, column: impl Into<String>, direction: Direction) -> &mut Self {
        self.ordering.push(OrderBy {
            column: column.into(),
            direction,
        });
        self.touch();
        self
    }
    /// Replaces the ordering with one parsed from `"col [ASC|DESC], ..."`.
    pub fn set_ordering(&mut self, text: &str) -> Result<()> {
        let mut ordering = Vec::new();
        for item in text.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let mut words = item.split_whitespace();
            let column = words.next().unwrap_or_default().to_string();
            let direction = match words.next().map(str::to_ascii_uppercase).as_deref() {
                None | Some("ASC") | Some("ASCENDING") => Direction::Ascending,
                Some("DESC") | Some("DESCENDING") => Direction::Descending,
                Some(other) => {
                    return Err(PolystoreError::shape(
                        "ORDER BY",
                        format!("unknown direction '{}'", other),
                    ));
                }
            };
            if words.next().is_some() {
                return Err(PolystoreError::shape("ORDER BY", format!("cannot parse '{}'", item)));
            }
            ordering.push(OrderBy { column, direction });
        }
        self.ordering = ordering;
        self.touch();
        Ok(())
    }
    pub fn ordering(&self) -> &[OrderBy] {
        &self.ordering
    }
    pub fn set_range(&mut self, from: usize, to: Option<usize>) -> Result<()> {
        self.window = Window::new(from, to)?;
        self.touch();
        Ok(())
    }
    pub fn range(&self) -> Window {
        self.window
    }
    pub fn max_rows(&self) -> Option<usize> {
        self.window.max_rows()
    }

    /// Whether the last execution reached the end of the matching rows.
    pub fn eof(&self) -> bool {
        self.eof.unwrap_or(false)
    }

    pub fn compile(&mut self, dialect: &dyn Dialect) -> Result<CompiledQuery> {
        if self.state == QueryState::Closed {
            return Err(PolystoreError::Closed);
        }
        let filter = match (&self.declared, &self.predicate) {
            (Some(names), _) => {
                let text = self.filter.clone().unwrap_or_default();
                let (positional_text, order) = positional_template(&text, names)?;
                CompiledFilter::Named {
                    text,
                    names: names.clone(),
                    positional_text,
                    order,
                }
            }
            (None, Some(predicate)) => {
                let part = Part::Predicate(predicate.clone());
                let text = part.parametrized_text(dialect)?;
                self.filter = Some(text.clone());
                self.filter_derived = true;
                CompiledFilter::Predicate {
                    parameters: predicate.parameters(),
                    predicate: predicate.clone(),
                    text,
                }
            }
            (None, None) => match &self.filter {
                Some(text) => CompiledFilter::Raw { text: text.clone() },
                None => CompiledFilter::None,
            },
        };
        self.state = QueryState::Compiled;
        debug!(table = %self.table, filter = ?self.filter, "compiled query");
        Ok(CompiledQuery {
            table: self.table.clone(),
            projection: self.projection.clone(),
            joins: self.joins.clone(),
            grouping: self.grouping.clone(),
            ordering: self.ordering.clone(),
            window: self.window,
            filter,
        })
    }

    pub fn execute<B: Backend>(&mut self, backend: &mut B) -> Result<ResultSet> {
        self.execute_with_array(backend, &[])
    }
    pub fn execute_with_array<B: Backend>(
        &mut self,
        backend: &mut B,
        arguments: &[Value],
    ) -> Result<ResultSet> {
        let compiled = self.compile(backend.dialect())?;
        let page = compiled.bind(arguments)?.execute(backend)?;
        self.finish(page)
    }
    pub fn execute_with_map<B: Backend>(
        &mut self,
        backend: &mut B,
        arguments: &HashMap<String, Value>,
    ) -> Result<ResultSet> {
        let compiled = self.compile(backend.dialect())?;
        let page = compiled.bind_map(arguments)?.execute(backend)?;
        self.finish(page)
    }
    fn finish(&mut self, page: Page<Record>) -> Result<ResultSet> {
        self.eof = Some(page.eof);
        self.state = QueryState::Executed;
        Ok(page.result_set)
    }

    /// Computes `aggregate` over every row the filter (and joins) select,
    /// ignoring the row window.
    pub fn aggregate<B: Backend>(&mut self, backend: &mut B, aggregate: &Aggregate) -> Result<Value> {
        let compiled = self.compile(backend.dialect())?;
        compiled.bind(&[])?.aggregate(backend, aggregate)
    }
    pub fn count<B: Backend>(&mut self, backend: &mut B) -> Result<i64> {
        match self.aggregate(backend, &Aggregate::Count)? {
            Value::Int(count) => Ok(count),
            other => Err(PolystoreError::DataCorruption {
                message: format!("count returned {}", other),
            }),
        }
    }

    /// Releases cursor state; a closed query no longer compiles.
    pub fn close(&mut self) {
        self.eof = None;
        self.state = QueryState::Closed;
    }
}

/// Rewrites `:name` references outside quotes into positional placeholders,
/// returning the rewritten text and, per placeholder, the index of the
/// declared parameter it refers to.
fn positional_template(text: &str, names: &[String]) -> Result<(String, Vec<usize>)> {
    let mut out = String::with_capacity(text.len());
    let mut order = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == ':' && chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                let mut name = String::new();
                while let Some(n) = chars.peek().copied().filter(|n| n.is_ascii_alphanumeric() || *n == '_') {
                    name.push(n);
                    chars.next();
                }
                let index = names
                    .iter()
                    .position(|declared| *declared == name)
                    .ok_or(PolystoreError::UnknownParameter(name))?;
                order.push(index);
                out.push(crate::part::PLACEHOLDER);
            }
            None => out.push(c),
        }
    }
    Ok((out, order))
}

// ------------- Compiled -------------
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledFilter {
    None,
    Predicate {
        predicate: Predicate,
        text: String,
        parameters: Vec<Value>,
    },
    Raw {
        text: String,
    },
    Named {
        text: String,
        names: Vec<String>,
        positional_text: String,
        order: Vec<usize>,
    },
}

/// An immutable compiled query; bind it once per execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    table: String,
    projection: Vec<String>,
    joins: Vec<Join>,
    grouping: Vec<String>,
    ordering: Vec<OrderBy>,
    window: Window,
    filter: CompiledFilter,
}

impl CompiledQuery {
    pub fn table(&self) -> &str {
        &self.table
    }
    pub fn projection(&self) -> &[String] {
        &self.projection
    }
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }
    pub fn grouping(&self) -> &[String] {
        &self.grouping
    }
    pub fn ordering(&self) -> &[OrderBy] {
        &self.ordering
    }
    pub fn window(&self) -> Window {
        self.window
    }
    pub fn filter(&self) -> &CompiledFilter {
        &self.filter
    }
    pub fn predicate(&self) -> Option<&Predicate> {
        match &self.filter {
            CompiledFilter::Predicate { predicate, .. } => Some(predicate),
            _ => None,
        }
    }
    fn declared(&self) -> &[String] {
        match &self.filter {
            CompiledFilter::Named { names, .. } => names,
            _ => &[],
        }
    }

    /// Binds declared parameters positionally.
    pub fn bind(&self, arguments: &[Value]) -> Result<BoundQuery<'_>> {
        let declared = self.declared();
        if arguments.len() != declared.len() {
            return Err(PolystoreError::ParameterCount {
                expected: declared.len(),
                found: arguments.len(),
            });
        }
        Ok(BoundQuery {
            compiled: self,
            arguments: arguments.to_vec(),
        })
    }
    /// Binds declared parameters by name.
    pub fn bind_map(&self, arguments: &HashMap<String, Value>) -> Result<BoundQuery<'_>> {
        let declared = self.declared();
        if let Some(unknown) = arguments.keys().find(|k| !declared.contains(k)) {
            return Err(PolystoreError::UnknownParameter(unknown.clone()));
        }
        let bound = declared
            .iter()
            .map(|name| arguments.get(name).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or(PolystoreError::ParameterCount {
                expected: declared.len(),
                found: arguments.len(),
            })?;
        Ok(BoundQuery {
            compiled: self,
            arguments: bound,
        })
    }
}

// ------------- Bound -------------
/// A compiled query together with the arguments of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery<'c> {
    compiled: &'c CompiledQuery,
    arguments: Vec<Value>,
}

/// One executed window of rows and whether it is the last.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T = Record> {
    pub result_set: ResultSet<T>,
    pub eof: bool,
}

impl<'c> BoundQuery<'c> {
    pub fn compiled(&self) -> &'c CompiledQuery {
        self.compiled
    }
    /// Declared-parameter arguments in declaration order.
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.compiled
            .declared()
            .iter()
            .position(|declared| declared == name)
            .and_then(|index| self.arguments.get(index))
    }
    /// The parameter vector aligned with the placeholders of the filter text.
    pub fn positional(&self) -> Vec<Value> {
        match &self.compiled.filter {
            CompiledFilter::Predicate { parameters, .. } => parameters.clone(),
            CompiledFilter::Named { order, .. } => order
                .iter()
                .filter_map(|index| self.arguments.get(*index).cloned())
                .collect(),
            CompiledFilter::Raw { .. } | CompiledFilter::None => Vec::new(),
        }
    }

    pub fn execute<B: Backend + ?Sized>(&self, backend: &mut B) -> Result<Page<Record>> {
        let native = backend.compile(self)?;
        debug!(backend = backend.name(), native = ?native, "compiled native request");
        let mut result_set = backend.fetch(&native)?;
        let eof = match self.compiled.window.max_rows() {
            Some(max) if result_set.len() > max => {
                result_set.truncate(max);
                false
            }
            _ => true,
        };
        info!(
            backend = backend.name(),
            table = %self.compiled.table,
            rows = result_set.len(),
            eof,
            "query executed"
        );
        Ok(Page { result_set, eof })
    }
    pub fn execute_as<T: FromRecord, B: Backend + ?Sized>(&self, backend: &mut B) -> Result<Page<T>> {
        let page = self.execute(backend)?;
        Ok(Page {
            result_set: page.result_set.materialize()?,
            eof: page.eof,
        })
    }
    pub fn aggregate<B: Backend + ?Sized>(&self, backend: &mut B, aggregate: &Aggregate) -> Result<Value> {
        let native = backend.compile_aggregate(self, aggregate)?;
        debug!(backend = backend.name(), native = ?native, "compiled aggregate");
        let value = backend.fetch_value(&native)?;
        info!(backend = backend.name(), table = %self.compiled.table, %aggregate, %value, "aggregate computed");
        Ok(value)
    }
}
