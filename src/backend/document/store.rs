//! An in-memory document store executing aggregation pipelines.
//!
//! Only the stages and operators the pipeline compiler emits are understood.
//! Ordering follows the document engine's type order: missing and null
//! first, then numbers, strings, objects, arrays and booleans.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{Map, Number, Value as Json, json};
use tracing::trace;

use crate::error::{PolystoreError, Result};
use crate::eval::cached_regex;
use crate::schema::OtherHasher;

const BACKEND: &str = "document";

type Document = Map<String, Json>;

#[derive(Debug, Default)]
pub struct DocumentStore {
    collections: HashMap<String, Vec<Document>, OtherHasher>,
    surrogates: u64,
}

fn unsupported(message: impl Into<String>) -> PolystoreError {
    PolystoreError::unsupported(BACKEND, message)
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `document` to `collection`, which is created on first use. A
    /// document without an `_id` is given a surrogate one, unique across
    /// the store.
    pub fn insert(&mut self, collection: &str, mut document: Document) {
        if document.get("_id").is_none_or(Json::is_null) {
            self.surrogates += 1;
            document.insert("_id".to_string(), json!({ "surrogate": self.surrogates }));
        }
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    pub fn collection(&self, collection: &str) -> &[Document] {
        self.collections
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn aggregate(&self, collection: &str, pipeline: &[Json]) -> Result<Vec<Document>> {
        self.run(self.collection(collection).to_vec(), pipeline)
    }

    fn run(&self, mut documents: Vec<Document>, pipeline: &[Json]) -> Result<Vec<Document>> {
        for stage in pipeline {
            let (name, spec) = stage
                .as_object()
                .filter(|s| s.len() == 1)
                .and_then(|s| s.iter().next())
                .ok_or_else(|| unsupported(format!("malformed stage {}", stage)))?;
            trace!(stage = %name, documents = documents.len(), "running stage");
            documents = match name.as_str() {
                "$match" => {
                    let query = as_object(spec, name)?;
                    let mut kept = Vec::with_capacity(documents.len());
                    for document in documents {
                        if matches(&document, query)? {
                            kept.push(document);
                        }
                    }
                    kept
                }
                "$lookup" => self.lookup(documents, as_object(spec, name)?)?,
                "$unwind" => unwind(documents, as_object(spec, name)?)?,
                "$project" => {
                    let projection = as_object(spec, name)?;
                    documents
                        .iter()
                        .map(|d| project(d, projection))
                        .collect::<Result<Vec<_>>>()?
                }
                "$group" => group(documents, as_object(spec, name)?)?,
                "$replaceRoot" => {
                    let root = as_object(spec, name)?
                        .get("newRoot")
                        .ok_or_else(|| unsupported("$replaceRoot without newRoot"))?;
                    documents
                        .iter()
                        .map(|d| match evaluate(d, root)? {
                            Json::Object(o) => Ok(o),
                            other => Err(unsupported(format!("new root {} is not a document", other))),
                        })
                        .collect::<Result<Vec<_>>>()?
                }
                "$sort" => {
                    let keys = as_object(spec, name)?;
                    documents.sort_by(|a, b| {
                        for (path, direction) in keys {
                            let ordering = compare(resolve(a, path), resolve(b, path));
                            let ordering = if direction.as_i64() == Some(-1) {
                                ordering.reverse()
                            } else {
                                ordering
                            };
                            if ordering != Ordering::Equal {
                                return ordering;
                            }
                        }
                        Ordering::Equal
                    });
                    documents
                }
                "$skip" => documents.into_iter().skip(as_count(spec, name)?).collect(),
                "$limit" => documents.into_iter().take(as_count(spec, name)?).collect(),
                other => return Err(unsupported(format!("unknown stage {}", other))),
            };
        }
        Ok(documents)
    }

    fn lookup(&self, documents: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
        let from = spec
            .get("from")
            .and_then(Json::as_str)
            .ok_or_else(|| unsupported("$lookup without from"))?;
        let alias = spec
            .get("as")
            .and_then(Json::as_str)
            .ok_or_else(|| unsupported("$lookup without as"))?;
        let local = spec.get("localField").and_then(Json::as_str);
        let foreign = spec.get("foreignField").and_then(Json::as_str);
        let pipeline = match spec.get("pipeline") {
            Some(Json::Array(stages)) => stages.as_slice(),
            Some(other) => return Err(unsupported(format!("pipeline {} is not an array", other))),
            None => &[],
        };
        let candidates = self.collection(from);
        let mut linked = Vec::with_capacity(documents.len());
        for mut document in documents {
            let matched: Vec<Document> = match (local, foreign) {
                (Some(local), Some(foreign)) => match resolve(&document, local) {
                    None | Some(Json::Null) => Vec::new(),
                    Some(key) => candidates
                        .iter()
                        .filter(|c| resolve(c, foreign).is_some_and(|f| equal(f, key)))
                        .cloned()
                        .collect(),
                },
                _ => candidates.to_vec(),
            };
            let matched = self.run(matched, pipeline)?;
            document.insert(
                alias.to_string(),
                Json::Array(matched.into_iter().map(Json::Object).collect()),
            );
            linked.push(document);
        }
        Ok(linked)
    }
}

fn as_object<'a>(spec: &'a Json, stage: &str) -> Result<&'a Document> {
    spec.as_object()
        .ok_or_else(|| unsupported(format!("{} expects a document", stage)))
}

fn as_count(spec: &Json, stage: &str) -> Result<usize> {
    spec.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| unsupported(format!("{} expects a non-negative count", stage)))
}

// ------------- Paths -------------
fn resolve<'d>(document: &'d Document, path: &str) -> Option<&'d Json> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn field_reference(expression: &Json) -> Option<&str> {
    expression
        .as_str()
        .filter(|s| s.starts_with('$') && !s.starts_with("$$"))
        .map(|s| &s[1..])
}

// ------------- Stages -------------
fn unwind(documents: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let path = spec
        .get("path")
        .and_then(field_reference)
        .ok_or_else(|| unsupported("$unwind expects a field path"))?
        .to_string();
    let preserve = spec
        .get("preserveNullAndEmptyArrays")
        .and_then(Json::as_bool)
        .unwrap_or(false);
    let mut unwound = Vec::new();
    for mut document in documents {
        match document.remove(&path) {
            Some(Json::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = document.clone();
                    copy.insert(path.clone(), item);
                    unwound.push(copy);
                }
            }
            Some(Json::Array(_)) | Some(Json::Null) | None => {
                if preserve {
                    unwound.push(document);
                }
            }
            Some(single) => {
                document.insert(path.clone(), single);
                unwound.push(document);
            }
        }
    }
    Ok(unwound)
}

fn project(document: &Document, projection: &Document) -> Result<Document> {
    let mut projected = Map::new();
    for (field, spec) in projection {
        match spec {
            Json::Number(n) if n.as_i64() == Some(0) => (),
            Json::Bool(false) => (),
            Json::Number(_) | Json::Bool(true) => {
                if let Some(value) = resolve(document, field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            expression => {
                let value = evaluate(document, expression)?;
                if !value.is_null() || field_reference(expression).is_none() {
                    projected.insert(field.clone(), value);
                }
            }
        }
    }
    Ok(projected)
}

#[derive(Debug)]
enum Accumulator {
    First(Option<Json>),
    Sum(Option<Json>),
    Avg(f64, usize),
    Min(Option<Json>),
    Max(Option<Json>),
}

impl Accumulator {
    fn new(operator: &str) -> Result<Self> {
        Ok(match operator {
            "$first" => Accumulator::First(None),
            "$sum" => Accumulator::Sum(None),
            "$avg" => Accumulator::Avg(0.0, 0),
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            other => return Err(unsupported(format!("unknown accumulator {}", other))),
        })
    }

    fn add(&mut self, value: Json) {
        match self {
            Accumulator::First(first) => {
                first.get_or_insert(value);
            }
            _ if value.is_null() => (),
            Accumulator::Sum(sum) => {
                if value.is_number() {
                    *sum = Some(match sum.take() {
                        Some(total) => arithmetic(&total, &value, |a, b| a.checked_add(b), |a, b| a + b),
                        None => value,
                    });
                }
            }
            Accumulator::Avg(total, count) => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Min(min) => {
                if min.as_ref().is_none_or(|m| compare(Some(&value), Some(m)) == Ordering::Less) {
                    *min = Some(value);
                }
            }
            Accumulator::Max(max) => {
                if max.as_ref().is_none_or(|m| compare(Some(&value), Some(m)) == Ordering::Greater) {
                    *max = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Json {
        match self {
            Accumulator::First(v) | Accumulator::Sum(v) | Accumulator::Min(v) | Accumulator::Max(v) => {
                v.unwrap_or(Json::Null)
            }
            Accumulator::Avg(_, 0) => Json::Null,
            Accumulator::Avg(total, count) => number(total / count as f64),
        }
    }
}

fn group(documents: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expression = spec
        .get("_id")
        .ok_or_else(|| unsupported("$group without _id"))?;
    let mut fields = Vec::new();
    for (field, accumulator) in spec.iter().filter(|(f, _)| *f != "_id") {
        let (operator, argument) = accumulator
            .as_object()
            .filter(|a| a.len() == 1)
            .and_then(|a| a.iter().next())
            .ok_or_else(|| unsupported(format!("malformed accumulator {}", accumulator)))?;
        fields.push((field.clone(), operator.clone(), argument.clone()));
    }
    // groups keep the order in which their keys were first seen
    let mut order: Vec<(Json, Vec<Accumulator>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for document in &documents {
        let key = evaluate(document, key_expression)?;
        let position = match positions.get(&key.to_string()) {
            Some(position) => *position,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, operator, _)| Accumulator::new(operator))
                    .collect::<Result<Vec<_>>>()?;
                positions.insert(key.to_string(), order.len());
                order.push((key, accumulators));
                order.len() - 1
            }
        };
        for ((_, _, argument), accumulator) in fields.iter().zip(order[position].1.iter_mut()) {
            accumulator.add(evaluate(document, argument)?);
        }
    }
    Ok(order
        .into_iter()
        .map(|(key, accumulators)| {
            let mut grouped = Map::new();
            grouped.insert("_id".to_string(), key);
            for ((field, _, _), accumulator) in fields.iter().zip(accumulators) {
                grouped.insert(field.clone(), accumulator.finish());
            }
            grouped
        })
        .collect())
}

// ------------- Expressions -------------
fn evaluate(document: &Document, expression: &Json) -> Result<Json> {
    match expression {
        Json::String(s) if s == "$$ROOT" => Ok(Json::Object(document.clone())),
        Json::String(_) if field_reference(expression).is_some() => Ok(field_reference(expression)
            .and_then(|path| resolve(document, path))
            .cloned()
            .unwrap_or(Json::Null)),
        Json::Array(items) => items
            .iter()
            .map(|i| evaluate(document, i))
            .collect::<Result<Vec<_>>>()
            .map(Json::Array),
        Json::Object(fields) if fields.len() == 1 && fields.keys().all(|k| k.starts_with('$')) => {
            let (operator, arguments) = fields.iter().next().ok_or_else(|| unsupported("empty expression"))?;
            operation(document, operator, arguments)
        }
        Json::Object(fields) => {
            let mut evaluated = Map::new();
            for (field, value) in fields {
                evaluated.insert(field.clone(), evaluate(document, value)?);
            }
            Ok(Json::Object(evaluated))
        }
        literal => Ok(literal.clone()),
    }
}

fn operation(document: &Document, operator: &str, arguments: &Json) -> Result<Json> {
    if operator == "$literal" {
        return Ok(arguments.clone());
    }
    let arguments = match evaluate(document, arguments)? {
        Json::Array(items) => items,
        single => vec![single],
    };
    let binary = || match arguments.as_slice() {
        [a, b] => Ok((a, b)),
        _ => Err(unsupported(format!("{} expects two arguments", operator))),
    };
    Ok(match operator {
        "$add" => arguments.iter().skip(1).fold(
            arguments.first().cloned().unwrap_or(Json::Null),
            |total, v| arithmetic(&total, v, |a, b| a.checked_add(b), |a, b| a + b),
        ),
        "$subtract" => {
            let (a, b) = binary()?;
            arithmetic(a, b, |a, b| a.checked_sub(b), |a, b| a - b)
        }
        "$multiply" => {
            let (a, b) = binary()?;
            arithmetic(a, b, |a, b| a.checked_mul(b), |a, b| a * b)
        }
        "$pow" => {
            let (a, b) = binary()?;
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => number(a.powf(b)),
                _ => Json::Null,
            }
        }
        "$eq" | "$ne" => {
            let (a, b) = binary()?;
            Json::Bool(equal(a, b) == (operator == "$eq"))
        }
        // ordering comparisons only hold between non-null values of one type
        "$lt" | "$lte" | "$gt" | "$gte" => {
            let (a, b) = binary()?;
            if a.is_null() || b.is_null() || !same_class(a, b) {
                return Ok(Json::Bool(false));
            }
            let ordering = compare(Some(a), Some(b));
            Json::Bool(match operator {
                "$lt" => ordering == Ordering::Less,
                "$lte" => ordering != Ordering::Greater,
                "$gt" => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
        other => return Err(unsupported(format!("unknown expression operator {}", other))),
    })
}

fn arithmetic(
    a: &Json,
    b: &Json,
    integer: impl Fn(i64, i64) -> Option<i64>,
    float: impl Fn(f64, f64) -> f64,
) -> Json {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(result) = integer(x, y) {
            return Json::Number(Number::from(result));
        }
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => number(float(x, y)),
        _ => Json::Null,
    }
}

fn number(n: f64) -> Json {
    Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

// ------------- Matching -------------
fn matches(document: &Document, query: &Document) -> Result<bool> {
    for (key, condition) in query {
        let matched = match key.as_str() {
            "$and" => all_of(document, condition, key)?.iter().all(|m| *m),
            "$or" => all_of(document, condition, key)?.iter().any(|m| *m),
            "$expr" => truthy(&evaluate(document, condition)?),
            path => field_matches(resolve(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(document: &Document, conditions: &Json, key: &str) -> Result<Vec<bool>> {
    conditions
        .as_array()
        .ok_or_else(|| unsupported(format!("{} expects an array", key)))?
        .iter()
        .map(|c| matches(document, as_object(c, key)?))
        .collect()
}

fn field_matches(value: Option<&Json>, condition: &Json) -> Result<bool> {
    let operators = match condition {
        Json::Object(o) if !o.is_empty() && o.keys().all(|k| k.starts_with('$')) => o,
        literal => return Ok(equal_or_missing(value, literal)),
    };
    for (operator, argument) in operators {
        let matched = match operator.as_str() {
            "$eq" => equal_or_missing(value, argument),
            "$ne" => !equal_or_missing(value, argument),
            "$gt" | "$gte" | "$lt" | "$lte" => match value {
                Some(v) if !v.is_null() && !argument.is_null() && same_class(v, argument) => {
                    let ordering = compare(Some(v), Some(argument));
                    match operator.as_str() {
                        "$gt" => ordering == Ordering::Greater,
                        "$gte" => ordering != Ordering::Less,
                        "$lt" => ordering == Ordering::Less,
                        _ => ordering != Ordering::Greater,
                    }
                }
                _ => false,
            },
            "$in" | "$nin" => {
                let candidates = argument
                    .as_array()
                    .ok_or_else(|| unsupported(format!("{} expects an array", operator)))?;
                let found = candidates.iter().any(|c| equal_or_missing(value, c));
                if operator == "$in" { found } else { !found }
            }
            "$exists" => value.is_some() == truthy(argument),
            "$regex" => {
                let pattern = argument
                    .as_str()
                    .ok_or_else(|| unsupported("$regex expects a pattern"))?;
                let insensitive = operators
                    .get("$options")
                    .and_then(Json::as_str)
                    .is_some_and(|o| o.contains('i'));
                let regex = cached_regex(pattern, insensitive)?;
                value.and_then(Json::as_str).is_some_and(|s| regex.is_match(s))
            }
            "$options" => true,
            other => return Err(unsupported(format!("unknown query operator {}", other))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality where a missing field equals null.
fn equal_or_missing(value: Option<&Json>, expected: &Json) -> bool {
    match value {
        None => expected.is_null(),
        Some(v) => equal(v, expected),
    }
}

fn equal(a: &Json, b: &Json) -> bool {
    compare(Some(a), Some(b)) == Ordering::Equal && class(a) == class(b)
}

fn class(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Number(_) => 1,
        Json::String(_) => 2,
        Json::Object(_) => 3,
        Json::Array(_) => 4,
        Json::Bool(_) => 5,
    }
}

fn same_class(a: &Json, b: &Json) -> bool {
    class(a) == class(b)
}

/// Total order over optional values; missing sorts with null.
pub fn compare(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    let a = a.unwrap_or(&Json::Null);
    let b = b.unwrap_or(&Json::Null);
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => {
            for (x, y) in x.iter().zip(y) {
                let ordering = compare(Some(x), Some(y));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        (Json::Object(x), Json::Object(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y) {
                let ordering = kx.cmp(ky).then_with(|| compare(Some(vx), Some(vy)));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => class(a).cmp(&class(b)),
    }
}
