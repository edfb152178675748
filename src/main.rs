//! Seeds a small dataset into the configured backend, runs a correlated
//! existence query against it and prints the rows as JSON.
//!
//! Usage: `polystore [settings-file]`

use std::process::ExitCode;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{error, info};

use polystore::backend::{Backend, DocumentBackend, KeyValueBackend, RelationalBackend};
use polystore::config::{BackendKind, Settings};
use polystore::datatype::LogicalType;
use polystore::logging;
use polystore::operator::Operator;
use polystore::part::{Predicate, Term};
use polystore::query::{Direction, Query};
use polystore::record::Record;
use polystore::result::{JsonEncoder, Layout};
use polystore::schema::{Catalog, MetadataProvider, Schema};
use polystore::Result;

fn seed<B: Backend>(backend: &mut B) -> Result<()> {
    let people = [(1, "Alice", Some(34)), (2, "Bob", None), (3, "Carol", Some(27)), (4, "Dave", Some(51))];
    for (id, name, age) in people {
        backend.insert("people", &Record::new().with("id", id).with("name", name).with("age", age))?;
    }
    let orders = [(10, 1, 120.0), (11, 1, 35.5), (12, 3, 980.0), (13, 4, 12.0)];
    for (id, person, total) in orders {
        backend.insert(
            "orders",
            &Record::new().with("id", id).with("person_id", person).with("total", total),
        )?;
    }
    Ok(())
}

fn run<B: Backend>(backend: &mut B, catalog: &Catalog, settings: &Settings) -> Result<()> {
    seed(backend)?;
    let people = catalog.schema("people")?;
    let orders = catalog.schema("orders")?;
    let predicate = if backend.name() == "keyvalue" {
        // key-value stores only answer key and index lookups
        Predicate::all([people.term("name", Operator::In, ["Alice", "Carol"])?])
    } else {
        // people with at least one order above 100
        Predicate::all([Term::exists(
            "id",
            "orders",
            Some("person_id"),
            Predicate::all([orders.term("total", Operator::GreaterThan, 100.0)?]),
        )?])
    };
    let mut query = Query::new("people").filtered(predicate);
    query.order_by("name", Direction::Ascending);
    query.set_range(0, Some(settings.page_size))?;
    let rows = query.execute(backend)?;
    info!(backend = backend.name(), rows = rows.len(), eof = query.eof(), "demo query done");
    let encoder = JsonEncoder {
        layout: Layout::Tree,
        pretty: true,
    };
    println!("{}", rows.render(&encoder)?);
    Ok(())
}

fn catalog() -> Result<Catalog> {
    let catalog = Catalog::new();
    catalog.keep(
        Schema::new("people")
            .required("id", LogicalType::Integer)
            .required("name", LogicalType::Text)
            .column("age", LogicalType::Integer)
            .index("name"),
    )?;
    catalog.keep(
        Schema::new("orders")
            .required("id", LogicalType::Integer)
            .required("person_id", LogicalType::Integer)
            .column("total", LogicalType::Float)
            .index("person_id"),
    )?;
    Ok(catalog)
}

fn start() -> Result<()> {
    let path = std::env::args().nth(1);
    let settings = Settings::load(path.as_deref())?;
    logging::init(&settings.log_filter);
    info!(backend = %settings.backend, database = %settings.database, "starting");
    let catalog = Arc::new(catalog()?);
    match settings.backend {
        BackendKind::Relational => {
            let connection = Connection::open(&settings.database)?;
            let mut backend = RelationalBackend::new(&connection, catalog.clone())?;
            for table in ["people", "orders"] {
                let schema = catalog.schema(table)?;
                backend.create_table(&schema)?;
            }
            run(&mut backend, &catalog, &settings)
        }
        BackendKind::Document => run(&mut DocumentBackend::new(catalog.clone()), &catalog, &settings),
        BackendKind::Keyvalue => run(&mut KeyValueBackend::new(catalog.clone()), &catalog, &settings),
    }
}

fn main() -> ExitCode {
    match start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "polystore failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
