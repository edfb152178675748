//! Compiles bound queries into aggregation pipelines.
//!
//! The document engine has no joins and no correlated subqueries, so both
//! are emulated. Every pipeline starts with the same prefix:
//!
//! 1. `$lookup` + `$unwind` per join, keeping documents without a match;
//! 2. `$lookup` + `$unwind` per subquery term ("link"), again keeping
//!    documents without a match;
//! 3. a `$project` that moves the base fields under the base collection's
//!    name, so that every field is addressed as `family.field`;
//! 4. `$match`, where a link is tested for presence;
//! 5. when links were unwound, a `$group` + `$replaceRoot` that folds the
//!    duplicates back into one document per base (and joined) document.
//!
//! Row fetches then group, sort, skip, limit and project the output columns.
//! Aggregates append one terminal `$group` to the same prefix.

use serde_json::{Map, Value as Json, json};

use super::super::{Metadata, OutputColumn};
use crate::datatype::Value;
use crate::error::{PolystoreError, Result};
use crate::eval::like_to_regex;
use crate::operator::Operator;
use crate::part::{Connective, Operand, Part, Predicate, Term};
use crate::query::{Aggregate, BoundQuery, CompiledFilter, Direction, Join};

const BACKEND: &str = "document";

/// The field a one-row aggregate result is reported under.
pub const AGGREGATE_FIELD: &str = "value";

enum Filter<'p> {
    None,
    Part(&'p Part),
    Predicate(&'p Predicate),
    Document(Json),
}

#[derive(Default)]
struct Links {
    lookups: Vec<Json>,
    unwinds: Vec<Json>,
    names: Vec<String>,
}

pub struct PipelineCompiler<'m> {
    metadata: &'m Metadata,
    links: usize,
}

impl<'m> PipelineCompiler<'m> {
    pub fn new(metadata: &'m Metadata) -> Self {
        Self { metadata, links: 0 }
    }

    /// The pipeline fetching the rows of `query`.
    pub fn rows(&mut self, query: &BoundQuery<'_>, outputs: &[OutputColumn]) -> Result<Vec<Json>> {
        let compiled = query.compiled();
        let table = compiled.table();
        let filter = filter(query)?;
        let mut pipeline = self.prefix(table, compiled.joins(), filter)?;
        if !compiled.grouping().is_empty() {
            let mut key = Map::new();
            for column in compiled.grouping() {
                let field = column.rsplit('.').next().unwrap_or(column);
                key.insert(field.to_string(), json!(format!("${}", path(column, table))));
            }
            pipeline.push(json!({ "$group": { "_id": key, "__doc": { "$first": "$$ROOT" } } }));
            pipeline.push(json!({ "$replaceRoot": { "newRoot": "$__doc" } }));
        }
        if !compiled.ordering().is_empty() {
            let mut sort = Map::new();
            for order in compiled.ordering() {
                let direction = match order.direction {
                    Direction::Ascending => 1,
                    Direction::Descending => -1,
                };
                sort.insert(path(&order.column, table), json!(direction));
            }
            pipeline.push(json!({ "$sort": sort }));
        }
        let window = compiled.window();
        if window.from() > 0 {
            pipeline.push(json!({ "$skip": window.from() }));
        }
        if let Some(limit) = window.fetch_limit() {
            pipeline.push(json!({ "$limit": limit }));
        }
        let mut projection = Map::new();
        projection.insert("_id".to_string(), json!(0));
        for output in outputs {
            let family = output.family.as_deref().unwrap_or(table);
            projection.insert(output.name.clone(), json!(format!("${}.{}", family, output.field)));
        }
        pipeline.push(json!({ "$project": projection }));
        Ok(pipeline)
    }

    /// The pipeline computing `aggregate` over every document `query` selects.
    pub fn aggregate(&mut self, query: &BoundQuery<'_>, aggregate: &Aggregate) -> Result<Vec<Json>> {
        let compiled = query.compiled();
        let table = compiled.table();
        let filter = filter(query)?;
        let mut pipeline = self.prefix(table, compiled.joins(), filter)?;
        let accumulator = match aggregate {
            Aggregate::Count => json!({ "$sum": 1 }),
            Aggregate::Sum(c) => json!({ "$sum": format!("${}", path(c, table)) }),
            Aggregate::Avg(c) => json!({ "$avg": format!("${}", path(c, table)) }),
            Aggregate::Min(c) => json!({ "$min": format!("${}", path(c, table)) }),
            Aggregate::Max(c) => json!({ "$max": format!("${}", path(c, table)) }),
        };
        pipeline.push(json!({ "$group": { "_id": null, AGGREGATE_FIELD: accumulator } }));
        Ok(pipeline)
    }

    fn prefix(&mut self, table: &str, joins: &[Join], filter: Filter<'_>) -> Result<Vec<Json>> {
        let mut links = Links::default();
        let matcher = match filter {
            Filter::None => json!({}),
            Filter::Part(part) => self.match_part(part, table, &mut links)?,
            Filter::Predicate(predicate) => self.match_predicate(predicate, table, &mut links)?,
            Filter::Document(document) => document,
        };
        let mut pipeline = Vec::new();
        for join in joins {
            pipeline.push(json!({ "$lookup": {
                "from": join.table,
                "localField": local_path(&join.local_column, table),
                "foreignField": unqualified(&join.foreign_column),
                "as": join.table,
            }}));
            pipeline.push(json!({ "$unwind": {
                "path": format!("${}", join.table),
                "preserveNullAndEmptyArrays": true,
            }}));
        }
        pipeline.append(&mut links.lookups);
        pipeline.append(&mut links.unwinds);

        let schema = self.metadata.schema(table)?;
        let mut base = Map::new();
        for column in schema.columns() {
            base.insert(column.name().to_string(), json!(format!("${}", column.name())));
        }
        let mut projection = Map::new();
        projection.insert("_id".to_string(), json!("$_id"));
        projection.insert(table.to_string(), Json::Object(base));
        for family in joins.iter().map(|j| &j.table).chain(&links.names) {
            projection.insert(family.clone(), json!(format!("${}", family)));
        }
        pipeline.push(json!({ "$project": projection }));
        pipeline.push(json!({ "$match": matcher }));

        if !links.names.is_empty() {
            let mut key = Map::new();
            key.insert("_id".to_string(), json!("$_id"));
            for join in joins {
                key.insert(join.table.clone(), json!(format!("${}._id", join.table)));
            }
            pipeline.push(json!({ "$group": { "_id": key, "__doc": { "$first": "$$ROOT" } } }));
            pipeline.push(json!({ "$replaceRoot": { "newRoot": "$__doc" } }));
        }
        Ok(pipeline)
    }

    fn match_part(&mut self, part: &Part, table: &str, links: &mut Links) -> Result<Json> {
        match part {
            Part::Term(term) => self.match_term(term, table, links),
            Part::Predicate(predicate) => self.match_predicate(predicate, table, links),
        }
    }

    fn match_predicate(&mut self, predicate: &Predicate, table: &str, links: &mut Links) -> Result<Json> {
        let children = predicate
            .parts()
            .iter()
            .map(|p| self.match_part(p, table, links))
            .collect::<Result<Vec<_>>>()?;
        Ok(match predicate.connective() {
            Connective::Or if children.is_empty() => json!({ "$expr": false }),
            _ if children.is_empty() => json!({}),
            _ if children.len() == 1 => children.into_iter().next().unwrap_or_default(),
            Connective::Or => json!({ "$or": children }),
            Connective::And | Connective::None => json!({ "$and": children }),
        })
    }

    fn match_term(&mut self, term: &Term, table: &str, links: &mut Links) -> Result<Json> {
        let operator = term.operator();
        if let Operand::Nested(nested) = term.operand() {
            let link = self.link(term, nested, table, links)?;
            let present = matches!(operator, Operator::Exists | Operator::In);
            return Ok(json!({ link: { "$exists": present } }));
        }
        if operator == Operator::Within {
            return within(term, table);
        }
        let field = path(term.column(), table);
        let condition = match (operator, term.operand()) {
            (Operator::IsNull, _) => json!({ "$eq": null }),
            (Operator::IsNotNull, _) => json!({ "$ne": null }),
            (Operator::Equal, Operand::Scalar(v)) => json!({ "$eq": v.to_json() }),
            (Operator::NotEqual, Operand::Scalar(v)) => json!({ "$nin": [v.to_json(), null] }),
            (Operator::LessThan, Operand::Scalar(v)) => json!({ "$lt": v.to_json() }),
            (Operator::LessOrEqual, Operand::Scalar(v)) => json!({ "$lte": v.to_json() }),
            (Operator::GreaterThan, Operand::Scalar(v)) => json!({ "$gt": v.to_json() }),
            (Operator::GreaterOrEqual, Operand::Scalar(v)) => json!({ "$gte": v.to_json() }),
            (Operator::Like | Operator::ILike, Operand::Scalar(Value::Text(pattern))) => {
                let mut condition = Map::new();
                condition.insert("$regex".to_string(), json!(like_to_regex(pattern, false)));
                if operator == Operator::ILike {
                    condition.insert("$options".to_string(), json!("i"));
                }
                Json::Object(condition)
            }
            (Operator::Between, Operand::Range(low, high)) => {
                json!({ "$gte": low.to_json(), "$lte": high.to_json() })
            }
            (Operator::In, Operand::List(values)) => {
                json!({ "$in": values.iter().map(Value::to_json).collect::<Vec<_>>() })
            }
            (Operator::NotIn, Operand::List(values)) if values.is_empty() => json!({ "$nin": [] }),
            (Operator::NotIn, Operand::List(values)) => {
                let mut excluded: Vec<Json> = values.iter().map(Value::to_json).collect();
                excluded.push(Json::Null);
                json!({ "$nin": excluded })
            }
            (operator, operand) => {
                return Err(PolystoreError::unsupported(
                    BACKEND,
                    format!("{} over {:?}", operator, operand),
                ));
            }
        };
        Ok(json!({ field: condition }))
    }

    /// Registers a link stage for a subquery term and returns the field the
    /// linked documents are unwound into.
    fn link(&mut self, term: &Term, nested: &Part, table: &str, links: &mut Links) -> Result<String> {
        let foreign = term
            .table()
            .ok_or_else(|| PolystoreError::shape(term.operator(), "subquery has no table"))?;
        self.links += 1;
        let name = format!("__link_{}", self.links);
        let inner = self.prefix(foreign, &[], Filter::Part(nested))?;
        links.lookups.push(json!({ "$lookup": {
            "from": foreign,
            "localField": local_path(term.column(), table),
            "foreignField": unqualified(term.nested_column()),
            "pipeline": inner,
            "as": name,
        }}));
        links.unwinds.push(json!({ "$unwind": {
            "path": format!("${}", name),
            "preserveNullAndEmptyArrays": true,
        }}));
        links.names.push(name.clone());
        Ok(name)
    }
}

fn within(term: &Term, table: &str) -> Result<Json> {
    let Operand::Point { x, y, radius } = term.operand() else {
        return Err(PolystoreError::shape(term.operator(), "requires x, y and radius"));
    };
    let axes: Vec<String> = term.column().split(',').map(|a| path(a.trim(), table)).collect();
    let [px, py] = axes.as_slice() else {
        return Err(PolystoreError::shape(term.operator(), "requires an \"x,y\" column pair"));
    };
    let r = radius.as_f64().unwrap_or_default();
    Ok(json!({ "$expr": { "$lte": [
        { "$add": [
            { "$pow": [{ "$subtract": [format!("${}", px), x.to_json()] }, 2] },
            { "$pow": [{ "$subtract": [format!("${}", py), y.to_json()] }, 2] },
        ]},
        r * r,
    ]}}))
}

/// Field path of `column` once the base fields sit under `table`.
fn path(column: &str, table: &str) -> String {
    match column.split_once('.') {
        Some(_) => column.to_string(),
        None => format!("{}.{}", table, column),
    }
}

/// Field path of `column` before the base fields are moved under `table`.
fn local_path(column: &str, table: &str) -> String {
    match column.split_once('.') {
        Some((family, field)) if family == table => field.to_string(),
        _ => column.to_string(),
    }
}

fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

fn filter<'q>(query: &'q BoundQuery<'_>) -> Result<Filter<'q>> {
    Ok(match query.compiled().filter() {
        CompiledFilter::None => Filter::None,
        CompiledFilter::Predicate { predicate, .. } => Filter::Predicate(predicate),
        CompiledFilter::Raw { text } if text.trim().is_empty() => Filter::None,
        CompiledFilter::Raw { text } => Filter::Document(serde_json::from_str(text)?),
        CompiledFilter::Named { text, .. } if text.trim().is_empty() => Filter::None,
        CompiledFilter::Named { text, .. } => {
            let mut document: Json = serde_json::from_str(text)?;
            substitute(&mut document, query)?;
            Filter::Document(document)
        }
    })
}

/// Replaces every `":name"` string of a named-parameter filter document with
/// the bound value of `name`.
fn substitute(document: &mut Json, query: &BoundQuery<'_>) -> Result<()> {
    match document {
        Json::String(s) if s.starts_with(':') => {
            let name = &s[1..];
            let value = query
                .argument(name)
                .ok_or_else(|| PolystoreError::UnknownParameter(name.to_string()))?;
            *document = value.to_json();
        }
        Json::Array(items) => {
            for item in items {
                substitute(item, query)?;
            }
        }
        Json::Object(fields) => {
            for (_, value) in fields.iter_mut() {
                substitute(value, query)?;
            }
        }
        _ => (),
    }
    Ok(())
}
