//! Terms and predicates, the two kinds of [`Part`] a filter tree is built from.
//!
//! A [`Term`] is one atomic condition. A [`Predicate`] joins an ordered list
//! of parts under a single connective. Both flatten to the same positional
//! parameter vector: depth first, left to right, one entry per scalar value.
//! A backend that emits one placeholder per scalar in that same walk order
//! has its placeholders and the parameter vector aligned one to one.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};

use crate::datatype::Value;
use crate::error::{PolystoreError, Result};
use crate::operator::Operator;

/// The single placeholder character used in parametrized text.
pub const PLACEHOLDER: char = '?';

// ------------- Input -------------
/// A value handed to a term constructor, before it is checked against the
/// operator's arity.
#[derive(Debug, Clone)]
pub enum Input {
    Null,
    Scalar(Value),
    List(Vec<Value>),
    Part(Part),
}

impl Input {
    /// Applies `f` to every scalar, leaving nested parts untouched.
    pub fn try_map(self, mut f: impl FnMut(Value) -> Result<Value>) -> Result<Input> {
        Ok(match self {
            Input::Null => Input::Null,
            Input::Scalar(v) => Input::Scalar(f(v)?),
            Input::List(values) => {
                Input::List(values.into_iter().map(f).collect::<Result<Vec<_>>>()?)
            }
            Input::Part(part) => Input::Part(part),
        })
    }
}

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Scalar(v)
    }
}
impl From<bool> for Input {
    fn from(v: bool) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<i32> for Input {
    fn from(v: i32) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<i64> for Input {
    fn from(v: i64) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<f64> for Input {
    fn from(v: f64) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<&str> for Input {
    fn from(v: &str) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<String> for Input {
    fn from(v: String) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<NaiveDate> for Input {
    fn from(v: NaiveDate) -> Self {
        Input::Scalar(v.into())
    }
}
impl From<NaiveDateTime> for Input {
    fn from(v: NaiveDateTime) -> Self {
        Input::Scalar(v.into())
    }
}
impl<T: Into<Value>> From<Vec<T>> for Input {
    fn from(values: Vec<T>) -> Self {
        Input::List(values.into_iter().map(Into::into).collect())
    }
}
impl<T: Into<Value>, const N: usize> From<[T; N]> for Input {
    fn from(values: [T; N]) -> Self {
        Input::List(values.into_iter().map(Into::into).collect())
    }
}
impl From<Part> for Input {
    fn from(part: Part) -> Self {
        Input::Part(part)
    }
}
impl From<Term> for Input {
    fn from(term: Term) -> Self {
        Input::Part(Part::Term(term))
    }
}
impl From<Predicate> for Input {
    fn from(predicate: Predicate) -> Self {
        Input::Part(Part::Predicate(predicate))
    }
}

// ------------- Operand -------------
/// The validated value holder of a term. Its shape always matches the
/// operator's arity, so compilers match on it instead of re-deriving shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Empty,
    Scalar(Value),
    Range(Value, Value),
    List(Vec<Value>),
    Point { x: Value, y: Value, radius: Value },
    Nested(Box<Part>),
}

// ------------- Term -------------
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    column: String,
    operator: Operator,
    operand: Operand,
    table: Option<String>,
    nested_column: Option<String>,
}

impl Term {
    /// Builds a term, failing with a shape error when `value` does not fit
    /// the operator's arity.
    pub fn new(
        column: impl Into<String>,
        operator: Operator,
        value: impl Into<Input>,
    ) -> Result<Term> {
        let input = value.into();
        let operand = match operator {
            Operator::Between => match input {
                Input::List(mut values) if values.len() == 2 => {
                    let high = values.pop();
                    let low = values.pop();
                    match (low, high) {
                        (Some(low), Some(high)) => Operand::Range(low, high),
                        _ => return Err(PolystoreError::shape(operator, "requires exactly two values")),
                    }
                }
                _ => return Err(PolystoreError::shape(operator, "requires exactly two values")),
            },
            Operator::In | Operator::NotIn => match input {
                Input::Null | Input::Scalar(Value::Null) => Operand::List(Vec::new()),
                Input::List(values) => Operand::List(values),
                Input::Part(part) => Operand::Nested(Box::new(part)),
                Input::Scalar(_) => {
                    return Err(PolystoreError::shape(
                        operator,
                        "requires a collection or a nested part, not a single value",
                    ));
                }
            },
            Operator::IsNull | Operator::IsNotNull => match input {
                Input::Null | Input::Scalar(Value::Null) => Operand::Empty,
                _ => return Err(PolystoreError::shape(operator, "takes no value")),
            },
            Operator::Exists | Operator::NotExists => {
                return Err(PolystoreError::shape(
                    operator,
                    "requires a table reference and a correlating predicate",
                ));
            }
            Operator::Within => match input {
                Input::List(values)
                    if values.len() == 3 && values.iter().all(|v| v.as_f64().is_some()) =>
                {
                    let mut values = values.into_iter();
                    match (values.next(), values.next(), values.next()) {
                        (Some(x), Some(y), Some(radius)) => Operand::Point { x, y, radius },
                        _ => return Err(PolystoreError::shape(operator, "requires x, y and radius")),
                    }
                }
                _ => return Err(PolystoreError::shape(operator, "requires numeric x, y and radius")),
            },
            _ => match input {
                Input::Null => Operand::Scalar(Value::Null),
                Input::Scalar(value) => {
                    if matches!(operator, Operator::Like | Operator::ILike) && value.as_str().is_none() {
                        return Err(PolystoreError::shape(operator, "requires a text pattern"));
                    }
                    Operand::Scalar(value)
                }
                Input::List(_) => {
                    return Err(PolystoreError::shape(
                        operator,
                        "takes a single value, not a collection",
                    ));
                }
                Input::Part(_) => {
                    return Err(PolystoreError::shape(operator, "does not accept a nested part"));
                }
            },
        };
        Ok(Term {
            column: column.into(),
            operator,
            operand,
            table: None,
            nested_column: None,
        })
    }

    /// Builds a term from an operator token; unknown tokens fail fast.
    pub fn parse(column: impl Into<String>, token: &str, value: impl Into<Input>) -> Result<Term> {
        Term::new(column, Operator::from_token(token)?, value)
    }

    pub fn is_null(column: impl Into<String>) -> Term {
        Term {
            column: column.into(),
            operator: Operator::IsNull,
            operand: Operand::Empty,
            table: None,
            nested_column: None,
        }
    }

    pub fn is_not_null(column: impl Into<String>) -> Term {
        Term {
            operator: Operator::IsNotNull,
            ..Term::is_null(column)
        }
    }

    /// Builds a subquery term: `outer_column` of the enclosing table is
    /// correlated with `nested_column` (default: the same name) of `table`,
    /// and `nested` restricts the rows of `table`.
    pub fn subquery(
        outer_column: impl Into<String>,
        operator: Operator,
        table: impl Into<String>,
        nested_column: Option<&str>,
        nested: impl Into<Part>,
    ) -> Result<Term> {
        if !operator.accepts_subquery() {
            return Err(PolystoreError::shape(operator, "does not accept a nested part"));
        }
        Ok(Term {
            column: outer_column.into(),
            operator,
            operand: Operand::Nested(Box::new(nested.into())),
            table: Some(table.into()),
            nested_column: nested_column.map(str::to_string),
        })
    }

    pub fn exists(
        outer_column: impl Into<String>,
        table: impl Into<String>,
        nested_column: Option<&str>,
        nested: impl Into<Part>,
    ) -> Result<Term> {
        Term::subquery(outer_column, Operator::Exists, table, nested_column, nested)
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }
    pub fn column(&self) -> &str {
        &self.column
    }
    /// The table qualifier of a `table.column` name, if any.
    pub fn qualifier(&self) -> Option<&str> {
        self.column.split_once('.').map(|(table, _)| table)
    }
    /// The column name without its table qualifier.
    pub fn field(&self) -> &str {
        self.column
            .split_once('.')
            .map(|(_, field)| field)
            .unwrap_or(&self.column)
    }
    /// The correlating column of the referenced table; defaults to the
    /// outer column name.
    pub fn nested_column(&self) -> &str {
        self.nested_column.as_deref().unwrap_or_else(|| self.field())
    }
    pub fn operator(&self) -> Operator {
        self.operator
    }
    pub fn token(&self) -> &'static str {
        self.operator.token()
    }
    pub fn operand(&self) -> &Operand {
        &self.operand
    }
    pub fn nested(&self) -> Option<&Part> {
        match &self.operand {
            Operand::Nested(part) => Some(part),
            _ => None,
        }
    }
    /// The scalar values held directly by this term, in declaration order.
    pub fn values(&self) -> Vec<&Value> {
        match &self.operand {
            Operand::Empty | Operand::Nested(_) => Vec::new(),
            Operand::Scalar(v) => vec![v],
            Operand::Range(low, high) => vec![low, high],
            Operand::List(values) => values.iter().collect(),
            Operand::Point { x, y, radius } => vec![x, y, radius],
        }
    }
    pub fn value_count(&self) -> usize {
        match &self.operand {
            Operand::Nested(_) => 1,
            _ => self.values().len(),
        }
    }
    pub fn parameters(&self) -> Vec<Value> {
        let mut parameters = Vec::new();
        self.collect_parameters(&mut parameters);
        parameters
    }
    fn collect_parameters(&self, out: &mut Vec<Value>) {
        match &self.operand {
            Operand::Nested(part) => part.collect_parameters(out),
            _ if self.operator.is_null_test() => (),
            _ => out.extend(self.values().into_iter().cloned()),
        }
    }
}

// ------------- Predicate -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    None,
    And,
    Or,
}

impl fmt::Display for Connective {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Connective::None => write!(f, "none"),
            Connective::And => write!(f, "AND"),
            Connective::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    connective: Connective,
    parts: Vec<Part>,
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::new()
    }
}

impl Predicate {
    /// An empty, terminal predicate. It accepts children only through
    /// [`Predicate::and`] or [`Predicate::or`].
    pub fn new() -> Self {
        Self {
            connective: Connective::None,
            parts: Vec::new(),
        }
    }
    /// A conjunction of `parts`.
    pub fn all<P: Into<Part>>(parts: impl IntoIterator<Item = P>) -> Self {
        Self {
            connective: Connective::And,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }
    /// A disjunction of `parts`.
    pub fn any<P: Into<Part>>(parts: impl IntoIterator<Item = P>) -> Self {
        Self {
            connective: Connective::Or,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }
    /// Appends a child under the connective already in use.
    pub fn add(&mut self, part: impl Into<Part>) -> Result<&mut Self> {
        if self.connective == Connective::None {
            return Err(PolystoreError::Connective(
                "a terminal predicate accepts no children until and() or or() sets its connective"
                    .to_string(),
            ));
        }
        self.parts.push(part.into());
        Ok(self)
    }
    pub fn and(&mut self, part: impl Into<Part>) -> Result<&mut Self> {
        self.join(Connective::And, part.into())
    }
    pub fn or(&mut self, part: impl Into<Part>) -> Result<&mut Self> {
        self.join(Connective::Or, part.into())
    }
    fn join(&mut self, connective: Connective, part: Part) -> Result<&mut Self> {
        match self.connective {
            Connective::None => self.connective = connective,
            existing if existing != connective => {
                return Err(PolystoreError::Connective(format!(
                    "predicate is already joined by {}, cannot add a part with {}",
                    existing, connective
                )));
            }
            _ => (),
        }
        self.parts.push(part);
        Ok(self)
    }
    pub fn connective(&self) -> Connective {
        self.connective
    }
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
    pub fn parts_mut(&mut self) -> &mut Vec<Part> {
        &mut self.parts
    }
    pub fn len(&self) -> usize {
        self.parts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
    pub fn parameters(&self) -> Vec<Value> {
        let mut parameters = Vec::new();
        self.collect_parameters(&mut parameters);
        parameters
    }
    fn collect_parameters(&self, out: &mut Vec<Value>) {
        for part in &self.parts {
            part.collect_parameters(out);
        }
    }
}

// ------------- Part -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Term(Term),
    Predicate(Predicate),
}

impl From<Term> for Part {
    fn from(term: Term) -> Self {
        Part::Term(term)
    }
}
impl From<Predicate> for Part {
    fn from(predicate: Predicate) -> Self {
        Part::Predicate(predicate)
    }
}

impl Part {
    pub fn parameters(&self) -> Vec<Value> {
        let mut parameters = Vec::new();
        self.collect_parameters(&mut parameters);
        parameters
    }
    fn collect_parameters(&self, out: &mut Vec<Value>) {
        match self {
            Part::Term(term) => term.collect_parameters(out),
            Part::Predicate(predicate) => predicate.collect_parameters(out),
        }
    }
    /// Renders the part with one placeholder per scalar, in parameter order.
    pub fn parametrized_text(&self, dialect: &dyn Dialect) -> Result<String> {
        dialect.parametrized(self)
    }
    /// Human-readable rendering with the parameters substituted. Never use
    /// this text for execution.
    pub fn text(&self, dialect: &dyn Dialect) -> Result<String> {
        replace_parameters(&dialect.parametrized(self)?, &self.parameters())
    }
    /// Visits every term of this tree depth first, left to right, without
    /// descending into the nested parts of subquery terms.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Term)) {
        match self {
            Part::Term(term) => visit(term),
            Part::Predicate(predicate) => {
                for part in predicate.parts() {
                    part.walk(visit);
                }
            }
        }
    }
    pub fn terms(&self) -> Vec<&Term> {
        let mut terms = Vec::new();
        self.walk(&mut |term| terms.push(term));
        terms
    }
    pub fn as_term(&self) -> Option<&Term> {
        match self {
            Part::Term(term) => Some(term),
            Part::Predicate(_) => None,
        }
    }
    pub fn as_predicate(&self) -> Option<&Predicate> {
        match self {
            Part::Term(_) => None,
            Part::Predicate(predicate) => Some(predicate),
        }
    }
}

// ------------- Rendering -------------
/// A backend's textual rendering of a part.
pub trait Dialect {
    /// Renders `part` with exactly one [`PLACEHOLDER`] per scalar, in the
    /// order of [`Part::parameters`].
    fn parametrized(&self, part: &Part) -> Result<String>;
}

/// Walks `template`, invoking `on_placeholder` for every placeholder that is
/// outside a quoted literal or identifier and copying everything else.
fn scan_template(template: &str, mut on_placeholder: impl FnMut(&mut String) -> Result<()>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut quote: Option<char> = None;
    for c in template.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == PLACEHOLDER => on_placeholder(&mut out)?,
            None => out.push(c),
        }
    }
    Ok(out)
}

/// Substitutes `parameters` into the placeholders of `template` in order,
/// quoting text and rendering null literally. For display only.
pub fn replace_parameters(template: &str, parameters: &[Value]) -> Result<String> {
    let mut remaining = parameters.iter();
    let mut used = 0;
    let text = scan_template(template, |out| {
        used += 1;
        let value = remaining.next().ok_or(PolystoreError::ParameterCount {
            expected: used,
            found: parameters.len(),
        })?;
        out.push_str(&literal(value));
        Ok(())
    })?;
    if used != parameters.len() {
        return Err(PolystoreError::ParameterCount {
            expected: used,
            found: parameters.len(),
        });
    }
    Ok(text)
}

/// Counts the placeholders of `template` that lie outside quoted text.
pub fn count_placeholders(template: &str) -> usize {
    let mut count = 0;
    let _ = scan_template(template, |_| {
        count += 1;
        Ok(())
    });
    count
}

fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Text(_) | Value::Date(_) | Value::DateTime(_) => {
            format!("'{}'", value.to_string().replace('\'', "''"))
        }
        other => other.to_string(),
    }
}
