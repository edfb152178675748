//! The document backend: bound queries become aggregation pipelines run by
//! an in-memory [`DocumentStore`].

use serde_json::{Map, Value as Json};

use super::{Backend, Metadata, aggregate_type, output_columns};
use crate::datatype::{LogicalType, Value};
use crate::error::{PolystoreError, Result};
use crate::query::{Aggregate, BoundQuery};
use crate::record::Record;
use crate::result::ResultSet;

pub mod pipeline;
pub mod store;

pub use pipeline::{AGGREGATE_FIELD, PipelineCompiler};
pub use store::DocumentStore;

/// A pipeline over one collection, with the logical type of every output
/// field it yields.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRequest {
    pub collection: String,
    pub pipeline: Vec<Json>,
    pub columns: Vec<(String, LogicalType)>,
}

impl DocumentRequest {
    /// The stage operator names in pipeline order, e.g. `["$lookup", "$match"]`.
    pub fn stages(&self) -> Vec<&str> {
        self.pipeline
            .iter()
            .filter_map(|stage| stage.as_object()?.keys().next().map(String::as_str))
            .collect()
    }
}

pub struct DocumentBackend {
    store: DocumentStore,
    metadata: Metadata,
}

impl DocumentBackend {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            store: DocumentStore::new(),
            metadata,
        }
    }
    pub fn store(&self) -> &DocumentStore {
        &self.store
    }
}

impl Backend for DocumentBackend {
    type Native = DocumentRequest;

    fn name(&self) -> &'static str {
        "document"
    }

    fn compile(&self, query: &BoundQuery<'_>) -> Result<DocumentRequest> {
        let outputs = output_columns(&self.metadata, query)?;
        let pipeline = PipelineCompiler::new(&self.metadata).rows(query, &outputs)?;
        Ok(DocumentRequest {
            collection: query.compiled().table().to_string(),
            pipeline,
            columns: outputs.into_iter().map(|o| (o.name, o.logical_type)).collect(),
        })
    }

    fn compile_aggregate(&self, query: &BoundQuery<'_>, aggregate: &Aggregate) -> Result<DocumentRequest> {
        let table = query.compiled().table();
        let logical_type = aggregate_type(&self.metadata, query, aggregate)?;
        let pipeline = PipelineCompiler::new(&self.metadata).aggregate(query, aggregate)?;
        Ok(DocumentRequest {
            collection: table.to_string(),
            pipeline,
            columns: vec![(AGGREGATE_FIELD.to_string(), logical_type)],
        })
    }

    fn fetch(&mut self, native: &DocumentRequest) -> Result<ResultSet<Record>> {
        let documents = self.store.aggregate(&native.collection, &native.pipeline)?;
        let mut records = Vec::with_capacity(documents.len());
        for document in documents {
            let mut record = Record::new();
            for (name, logical_type) in &native.columns {
                let value = document.get(name).unwrap_or(&Json::Null);
                record.set(name.clone(), Value::from_json(value, *logical_type)?);
            }
            records.push(record);
        }
        let columns = native.columns.iter().map(|(name, _)| name.clone()).collect();
        Ok(ResultSet::new(columns, records))
    }

    fn fetch_value(&mut self, native: &DocumentRequest) -> Result<Value> {
        let documents = self.store.aggregate(&native.collection, &native.pipeline)?;
        let (name, logical_type) = native.columns.first().ok_or_else(|| PolystoreError::DataCorruption {
            message: "aggregate request without an output field".to_string(),
        })?;
        match documents.first().and_then(|d| d.get(name)) {
            Some(value) => match (value, logical_type) {
                // an integer column's average or a float sum still decodes
                (Json::Number(n), LogicalType::Integer) if n.as_i64().is_none() => {
                    Ok(n.as_f64().map(Value::Float).unwrap_or(Value::Null))
                }
                _ => Value::from_json(value, *logical_type),
            },
            None if *logical_type == LogicalType::Integer && native.pipeline.last().is_some_and(is_count) => {
                Ok(Value::Int(0))
            }
            None => Ok(Value::Null),
        }
    }

    fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        let schema = self.metadata.schema(table)?;
        let mut document = Map::new();
        for (name, value) in record.fields() {
            let value = schema.convert(name, value.clone())?;
            if name == schema.key() && !value.is_null() {
                document.insert("_id".to_string(), value.to_json());
            }
            document.insert(name.clone(), value.to_json());
        }
        self.store.insert(table, document);
        Ok(())
    }
}

fn is_count(stage: &Json) -> bool {
    stage
        .pointer(&format!("/$group/{}/$sum", AGGREGATE_FIELD))
        .is_some_and(|v| v.as_i64() == Some(1))
}
