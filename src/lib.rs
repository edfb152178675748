//! Polystore – a storage-agnostic query and predicate algebra.
//!
//! Application code describes *what* to fetch once, as a tree of conditions
//! over an abstract record/column model, and a backend compiler turns that
//! tree into the native request of a storage engine:
//! * parametrized SQL for a relational engine ([`backend::RelationalBackend`]);
//! * a multi-stage aggregation pipeline for a document engine
//!   ([`backend::DocumentBackend`]);
//! * primary-key and secondary-index scans for a key-value engine
//!   ([`backend::KeyValueBackend`]).
//!
//! ## Building blocks
//! * [`operator::Operator`] – the closed set of comparison, pattern, range,
//!   set-membership, null, existence and spatial operators.
//! * [`part::Term`] and [`part::Predicate`] – the two kinds of
//!   [`part::Part`]. A term is one condition, a predicate joins parts under
//!   a single connective. Both flatten to one positional parameter vector,
//!   depth first and left to right.
//! * [`query::Query`] – projection, joins, grouping, ordering and a row
//!   window around a predicate. A query compiles into a
//!   [`query::CompiledQuery`], which is bound per execution.
//! * [`result::ResultSet`] – the materialized rows, with null-first sorting
//!   and an encoder hook.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use rusqlite::Connection;
//! use polystore::backend::{Backend, RelationalBackend};
//! use polystore::datatype::LogicalType;
//! use polystore::part::Predicate;
//! use polystore::query::Query;
//! use polystore::record::Record;
//! use polystore::schema::{Catalog, Schema};
//! use polystore::operator::Operator;
//!
//! let catalog = Arc::new(Catalog::new());
//! let (people, _) = catalog
//!     .keep(Schema::new("people").column("id", LogicalType::Integer).column("age", LogicalType::Integer))
//!     .unwrap();
//! let connection = Connection::open_in_memory().unwrap();
//! let mut backend = RelationalBackend::new(&connection, catalog.clone()).unwrap();
//! backend.create_table(&people).unwrap();
//! backend.insert("people", &Record::new().with("id", 1).with("age", 42)).unwrap();
//!
//! let adults = people.term("age", Operator::GreaterOrEqual, 18).unwrap();
//! let mut query = Query::new("people").filtered(Predicate::all([adults]));
//! let rows = query.execute(&mut backend).unwrap();
//! assert_eq!(rows.len(), 1);
//! assert!(query.eof());
//! ```

pub mod backend;
pub mod config;
pub mod datatype;
pub mod error;
pub mod eval;
pub mod logging;
pub mod operator;
pub mod part;
pub mod query;
pub mod record;
pub mod result;
pub mod schema;

pub use error::{PolystoreError, Result};
