//! The key-value backend.
//!
//! Rows live in an ordered map per table, addressed by a row id. The primary
//! key maps to the row id and every secondary index maps a value to the
//! bitmap of row ids holding it. A query must resolve to one access path:
//! primary key lookups, then secondary index lookups, then secondary index
//! range scans. Whatever the access path does not cover is evaluated row by
//! row as a residual filter.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use bigdecimal::BigDecimal;
use roaring::RoaringTreemap;
use tracing::{debug, trace};

use super::{Backend, Metadata, aggregate_type, output_columns};
use crate::datatype::{LogicalType, Value};
use crate::error::{PolystoreError, Result};
use crate::operator::Operator;
use crate::part::{Connective, Operand, Part, Predicate, Term};
use crate::query::{Aggregate, BoundQuery, CompiledFilter, Direction, OrderBy, Window};
use crate::record::Record;
use crate::result::{ResultSet, compare_nullable};
use crate::schema::{OtherHasher, Schema};

const BACKEND: &str = "keyvalue";

fn unsupported(message: impl Into<String>) -> PolystoreError {
    PolystoreError::unsupported(BACKEND, message)
}

// ------------- Keys -------------
/// A value ordered by [`Value::total_cmp`], so it can key an ordered map.
#[derive(Debug, Clone)]
pub struct IndexKey(pub Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for IndexKey {}
impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn bound_key(bound: &Bound<Value>) -> Bound<IndexKey> {
    match bound {
        Bound::Included(v) => Bound::Included(IndexKey(v.clone())),
        Bound::Excluded(v) => Bound::Excluded(IndexKey(v.clone())),
        Bound::Unbounded => Bound::Unbounded,
    }
}

// ------------- Store -------------
#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<u64, Record>,
    next_id: u64,
    primary: BTreeMap<IndexKey, u64>,
    secondary: HashMap<String, BTreeMap<IndexKey, RoaringTreemap>, OtherHasher>,
}

impl Table {
    fn unindex(&mut self, id: u64, record: &Record) {
        for (column, index) in self.secondary.iter_mut() {
            let key = IndexKey(record.get(column).cloned().unwrap_or(Value::Null));
            if let Some(ids) = index.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    index.remove(&key);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyValueStore {
    tables: HashMap<String, Table, OtherHasher>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` under its primary key, replacing a previous record
    /// with the same key. Returns the row id.
    pub fn put(&mut self, schema: &Schema, record: Record) -> Result<u64> {
        let key = match record.get(schema.key()) {
            None | Some(Value::Null) => {
                return Err(PolystoreError::shape(
                    schema.key(),
                    format!("primary key of {} must not be null", schema.table()),
                ));
            }
            Some(key) => IndexKey(key.clone()),
        };
        let table = self.tables.entry(schema.table().to_string()).or_default();
        for index in schema.indexes() {
            table.secondary.entry(index.clone()).or_default();
        }
        let id = match table.primary.get(&key).copied() {
            Some(id) => {
                if let Some(previous) = table.rows.remove(&id) {
                    table.unindex(id, &previous);
                }
                id
            }
            None => {
                let id = table.next_id;
                table.next_id += 1;
                table.primary.insert(key, id);
                id
            }
        };
        for (column, index) in table.secondary.iter_mut() {
            let value = record.get(column).cloned().unwrap_or(Value::Null);
            index.entry(IndexKey(value)).or_default().insert(id);
        }
        table.rows.insert(id, record);
        Ok(id)
    }

    pub fn get(&self, table: &str, key: &Value) -> Option<&Record> {
        let table = self.tables.get(table)?;
        let id = table.primary.get(&IndexKey(key.clone()))?;
        table.rows.get(id)
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }

    fn ids(&self, table: &str, access: &Access) -> Result<Vec<u64>> {
        let Some(table) = self.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(match access {
            Access::Scan => table.rows.keys().copied().collect(),
            Access::PrimaryKey(keys) => keys
                .iter()
                .filter_map(|k| table.primary.get(&IndexKey(k.clone())).copied())
                .collect::<RoaringTreemap>()
                .iter()
                .collect(),
            Access::KeyRange { low, high } => table
                .primary
                .range((bound_key(low), bound_key(high)))
                .map(|(_, id)| *id)
                .collect(),
            Access::IndexEq { column, values } => {
                let index = secondary(table, column)?;
                let mut ids = RoaringTreemap::new();
                for value in values {
                    if let Some(found) = index.get(&IndexKey(value.clone())) {
                        ids |= found;
                    }
                }
                ids.iter().collect()
            }
            Access::IndexRange { column, low, high } => {
                let index = secondary(table, column)?;
                let mut ids = RoaringTreemap::new();
                for (_, found) in index.range((bound_key(low), bound_key(high))) {
                    ids |= found;
                }
                ids.iter().collect()
            }
        })
    }
}

fn secondary<'t>(table: &'t Table, column: &str) -> Result<&'t BTreeMap<IndexKey, RoaringTreemap>> {
    table
        .secondary
        .get(column)
        .ok_or_else(|| unsupported(format!("{} is not indexed", column)))
}

// ------------- Plans -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    Scan,
    PrimaryKey(Vec<Value>),
    KeyRange { low: Bound<Value>, high: Bound<Value> },
    IndexEq { column: String, values: Vec<Value> },
    IndexRange { column: String, low: Bound<Value>, high: Bound<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyValuePlan {
    pub table: String,
    pub access: Access,
    pub residual: Option<Predicate>,
    pub columns: Vec<(String, LogicalType)>,
    pub ordering: Vec<OrderBy>,
    pub window: Window,
    pub aggregate: Option<Aggregate>,
}

/// Chooses the access path of a filter and returns what remains of it.
pub fn plan_access(schema: &Schema, predicate: &Predicate) -> Result<(Access, Option<Predicate>)> {
    let part = Part::Predicate(predicate.clone());
    check_part(&part)?;
    let mut conjuncts: Vec<Part> = Vec::new();
    flatten(part, &mut conjuncts);
    if conjuncts.is_empty() {
        return Ok((Access::Scan, None));
    }
    let mut best: Option<(u8, usize, Access)> = None;
    for (position, conjunct) in conjuncts.iter().enumerate() {
        if let Some((rank, access)) = access_for(schema, conjunct) {
            if best.as_ref().is_none_or(|(r, _, _)| rank < *r) {
                best = Some((rank, position, access));
            }
        }
    }
    let Some((_, position, access)) = best else {
        return Err(unsupported(format!(
            "no condition on the primary key or an indexed column of {}",
            schema.table()
        )));
    };
    conjuncts.remove(position);
    let residual = if conjuncts.is_empty() {
        None
    } else {
        Some(Predicate::all(conjuncts))
    };
    Ok((access, residual))
}

fn flatten(part: Part, out: &mut Vec<Part>) {
    match part {
        Part::Predicate(p) if p.connective() != Connective::Or => {
            for child in p.parts().iter().cloned() {
                flatten(child, out);
            }
        }
        Part::Predicate(p) if p.len() == 1 => {
            if let Some(only) = p.parts().first().cloned() {
                flatten(only, out);
            }
        }
        other => out.push(other),
    }
}

/// Rejects subqueries and disjunctions spanning more than one column.
fn check_part(part: &Part) -> Result<()> {
    match part {
        Part::Term(term) => {
            if term.operator().is_existence() || term.nested().is_some() {
                return Err(unsupported(format!("{} needs a subquery", term.operator())));
            }
            Ok(())
        }
        Part::Predicate(predicate) => {
            if predicate.connective() == Connective::Or {
                let mut columns: Vec<&str> = part.terms().iter().map(|t| t.column()).collect();
                columns.dedup();
                if columns.len() > 1 {
                    return Err(unsupported(format!(
                        "OR across columns {}",
                        columns.join(", ")
                    )));
                }
            }
            predicate.parts().iter().try_for_each(check_part)
        }
    }
}

fn is_key(schema: &Schema, column: &str) -> bool {
    let field = column.rsplit('.').next().unwrap_or(column);
    field == schema.key()
}

fn field(column: &str) -> String {
    column.rsplit('.').next().unwrap_or(column).to_string()
}

/// The access path a single conjunct offers, ranked: 0 primary key lookup,
/// 1 secondary lookup, 2 primary key range, 3 secondary range.
fn access_for(schema: &Schema, part: &Part) -> Option<(u8, Access)> {
    match part {
        Part::Term(term) => term_access(schema, term),
        Part::Predicate(predicate) => {
            // a single-column disjunction of lookups unions their values
            let mut values = Vec::new();
            let mut column = None;
            for term in part.terms() {
                match term_access(schema, term)? {
                    (0, Access::PrimaryKey(v)) => values.extend(v),
                    (1, Access::IndexEq { values: v, .. }) => values.extend(v),
                    _ => return None,
                }
                column = Some(term.column().to_string());
            }
            let column = column.filter(|_| predicate.connective() == Connective::Or)?;
            if is_key(schema, &column) {
                Some((0, Access::PrimaryKey(values)))
            } else {
                Some((1, Access::IndexEq { column: field(&column), values }))
            }
        }
    }
}

fn term_access(schema: &Schema, term: &Term) -> Option<(u8, Access)> {
    let key = is_key(schema, term.column());
    let indexed = schema.is_indexed(&field(term.column()));
    if !key && !indexed {
        return None;
    }
    let lookup = |values: Vec<Value>| {
        let values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
        if key {
            (0, Access::PrimaryKey(values))
        } else {
            (1, Access::IndexEq { column: field(term.column()), values })
        }
    };
    let range = |low: Bound<Value>, high: Bound<Value>| {
        // null is the least key; a range never reaches it
        let low = match low {
            Bound::Unbounded => Bound::Excluded(Value::Null),
            bounded => bounded,
        };
        if key {
            (2, Access::KeyRange { low, high })
        } else {
            (3, Access::IndexRange { column: field(term.column()), low, high })
        }
    };
    match (term.operator(), term.operand()) {
        (_, Operand::Scalar(Value::Null)) => None,
        (Operator::Equal, Operand::Scalar(v)) => Some(lookup(vec![v.clone()])),
        (Operator::In, Operand::List(values)) => Some(lookup(values.clone())),
        (Operator::LessThan, Operand::Scalar(v)) => Some(range(Bound::Unbounded, Bound::Excluded(v.clone()))),
        (Operator::LessOrEqual, Operand::Scalar(v)) => Some(range(Bound::Unbounded, Bound::Included(v.clone()))),
        (Operator::GreaterThan, Operand::Scalar(v)) => Some(range(Bound::Excluded(v.clone()), Bound::Unbounded)),
        (Operator::GreaterOrEqual, Operand::Scalar(v)) => {
            Some(range(Bound::Included(v.clone()), Bound::Unbounded))
        }
        (Operator::Between, Operand::Range(low, high)) if low.total_cmp(high) != Ordering::Greater => {
            Some(range(Bound::Included(low.clone()), Bound::Included(high.clone())))
        }
        _ => None,
    }
}

// ------------- Backend -------------
pub struct KeyValueBackend {
    store: KeyValueStore,
    metadata: Metadata,
}

impl KeyValueBackend {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            store: KeyValueStore::new(),
            metadata,
        }
    }
    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    fn plan(&self, query: &BoundQuery<'_>, aggregate: Option<&Aggregate>) -> Result<KeyValuePlan> {
        let compiled = query.compiled();
        if !compiled.joins().is_empty() {
            return Err(unsupported("joins"));
        }
        if !compiled.grouping().is_empty() {
            return Err(unsupported("grouping"));
        }
        let schema = self.metadata.schema(compiled.table())?;
        let (access, residual) = match compiled.filter() {
            CompiledFilter::None => (Access::Scan, None),
            CompiledFilter::Predicate { predicate, .. } => plan_access(&schema, predicate)?,
            CompiledFilter::Raw { .. } | CompiledFilter::Named { .. } => {
                return Err(unsupported("filters must be predicates"));
            }
        };
        let columns = output_columns(&self.metadata, query)?
            .into_iter()
            .map(|o| (o.name, o.logical_type))
            .collect();
        debug!(table = compiled.table(), access = ?access, residual = residual.is_some(), "planned");
        Ok(KeyValuePlan {
            table: compiled.table().to_string(),
            access,
            residual,
            columns,
            ordering: compiled.ordering().to_vec(),
            window: compiled.window(),
            aggregate: aggregate.cloned(),
        })
    }

    fn select(&self, plan: &KeyValuePlan) -> Result<Vec<&Record>> {
        let ids = self.store.ids(&plan.table, &plan.access)?;
        trace!(table = %plan.table, candidates = ids.len(), "fetched candidates");
        let Some(table) = self.store.tables.get(&plan.table) else {
            return Ok(Vec::new());
        };
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(record) = table.rows.get(&id) else {
                continue;
            };
            if let Some(residual) = &plan.residual {
                if !residual.matches(record)? {
                    continue;
                }
            }
            selected.push(record);
        }
        Ok(selected)
    }
}

impl Backend for KeyValueBackend {
    type Native = KeyValuePlan;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn compile(&self, query: &BoundQuery<'_>) -> Result<KeyValuePlan> {
        self.plan(query, None)
    }

    fn compile_aggregate(&self, query: &BoundQuery<'_>, aggregate: &Aggregate) -> Result<KeyValuePlan> {
        aggregate_type(&self.metadata, query, aggregate)?;
        self.plan(query, Some(aggregate))
    }

    fn fetch(&mut self, plan: &KeyValuePlan) -> Result<ResultSet<Record>> {
        let mut selected = self.select(plan)?;
        // stable sorts over whole rows, least significant key first
        for order in plan.ordering.iter().rev() {
            let column = field(&order.column);
            selected.sort_by(|a, b| {
                let ascending = compare_nullable(a.get(&column), b.get(&column));
                match order.direction {
                    Direction::Ascending => ascending,
                    Direction::Descending => ascending.reverse(),
                }
            });
        }
        let from = plan.window.from();
        let take = plan.window.fetch_limit().unwrap_or(usize::MAX);
        let columns: Vec<String> = plan.columns.iter().map(|(name, _)| name.clone()).collect();
        let rows: Vec<Record> = selected
            .into_iter()
            .skip(from)
            .take(take)
            .map(|record| {
                columns
                    .iter()
                    .map(|c| (c.clone(), record.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect();
        Ok(ResultSet::new(columns, rows))
    }

    fn fetch_value(&mut self, plan: &KeyValuePlan) -> Result<Value> {
        let aggregate = plan
            .aggregate
            .as_ref()
            .ok_or_else(|| unsupported("plan computes no aggregate"))?;
        let selected = self.select(plan)?;
        let Some(column) = aggregate.column() else {
            return Ok(Value::Int(selected.len() as i64));
        };
        let column = field(column);
        let values: Vec<&Value> = selected
            .iter()
            .filter_map(|r| r.get(&column))
            .filter(|v| !v.is_null())
            .collect();
        Ok(match aggregate {
            Aggregate::Count => Value::Int(selected.len() as i64),
            Aggregate::Sum(_) => sum(&values)?,
            Aggregate::Avg(_) => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Aggregate::Min(_) => values.into_iter().min_by(|a, b| a.total_cmp(b)).cloned().unwrap_or(Value::Null),
            Aggregate::Max(_) => values.into_iter().max_by(|a, b| a.total_cmp(b)).cloned().unwrap_or(Value::Null),
        })
    }

    fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        let schema = self.metadata.schema(table)?;
        let mut converted = Record::new();
        for (name, value) in record.fields() {
            converted.set(name.clone(), schema.convert(name, value.clone())?);
        }
        self.store.put(&schema, converted)?;
        Ok(())
    }
}

fn sum(values: &[&Value]) -> Result<Value> {
    let mut total: Option<Value> = None;
    for value in values {
        total = Some(match (total, value) {
            (None, v) => (*v).clone(),
            (Some(Value::Int(a)), Value::Int(b)) => match a.checked_add(*b) {
                Some(s) => Value::Int(s),
                None => Value::Decimal(BigDecimal::from(a) + BigDecimal::from(*b)),
            },
            (Some(Value::Decimal(a)), Value::Decimal(b)) => Value::Decimal(a + b),
            (Some(a), b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Value::Float(a + b),
                _ => return Err(PolystoreError::shape("SUM", format!("cannot add {}", b))),
            },
        });
    }
    Ok(total.unwrap_or(Value::Null))
}
