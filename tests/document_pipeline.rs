use std::sync::Arc;

use polystore::PolystoreError;
use polystore::backend::{ANSI, Backend, DocumentBackend};
use polystore::datatype::{LogicalType, Value};
use polystore::operator::Operator;
use polystore::part::{Predicate, Term};
use polystore::query::{Aggregate, Direction, Query};
use polystore::record::Record;
use polystore::result::ResultSet;
use polystore::schema::{Catalog, Schema};

fn setup() -> DocumentBackend {
    let catalog = Catalog::new();
    catalog
        .keep(
            Schema::new("people")
                .required("id", LogicalType::Integer)
                .required("name", LogicalType::Text)
                .column("age", LogicalType::Integer),
        )
        .expect("people");
    catalog
        .keep(
            Schema::new("orders")
                .required("id", LogicalType::Integer)
                .required("person_id", LogicalType::Integer)
                .column("total", LogicalType::Float),
        )
        .expect("orders");
    catalog
        .keep(
            Schema::new("places")
                .required("id", LogicalType::Integer)
                .column("x", LogicalType::Float)
                .column("y", LogicalType::Float),
        )
        .expect("places");
    let mut backend = DocumentBackend::new(Arc::new(catalog));
    let people = [
        (1, "Alice", Some(34)),
        (2, "Bob", None),
        (3, "Carol", Some(27)),
        (4, "Dave", Some(51)),
        (5, "eve", Some(19)),
    ];
    for (id, name, age) in people {
        backend
            .insert("people", &Record::new().with("id", id).with("name", name).with("age", age))
            .expect("insert person");
    }
    let orders = [(10, 1, 120.0), (11, 1, 35.5), (12, 3, 980.0), (13, 4, 12.0)];
    for (id, person, total) in orders {
        backend
            .insert(
                "orders",
                &Record::new().with("id", id).with("person_id", person).with("total", total),
            )
            .expect("insert order");
    }
    for (id, x, y) in [(1, 1.0, 1.0), (2, 2.0, 2.0), (3, -0.5, 0.5)] {
        backend
            .insert("places", &Record::new().with("id", id).with("x", x).with("y", y))
            .expect("insert place");
    }
    backend
}

fn ids(result_set: &ResultSet) -> Vec<i64> {
    result_set
        .iter()
        .map(|r| match r.get("id") {
            Some(Value::Int(id)) => *id,
            other => panic!("unexpected id {other:?}"),
        })
        .collect()
}

fn total_above(amount: f64) -> Predicate {
    Predicate::all([Term::new("total", Operator::GreaterThan, amount).unwrap()])
}

fn by_id(part: impl Into<polystore::part::Part>) -> Query {
    let mut query = Query::new("people").filtered(part);
    query.order_by("id", Direction::Ascending);
    query
}

#[test]
fn linked_documents_are_matched_after_projection() {
    // scenario C
    let mut backend = setup();
    let exists = Term::exists("id", "orders", Some("person_id"), total_above(100.0)).unwrap();
    let mut query = Query::new("people").filtered(exists);
    let compiled = query.compile(&ANSI).unwrap();
    let request = backend.compile(&compiled.bind(&[]).unwrap()).unwrap();
    assert_eq!(
        request.stages(),
        vec!["$lookup", "$unwind", "$project", "$match", "$group", "$replaceRoot", "$project"]
    );
    let lookup = &request.pipeline[0]["$lookup"];
    assert_eq!(lookup["from"], "orders");
    assert_eq!(lookup["localField"], "id");
    assert_eq!(lookup["foreignField"], "person_id");
    assert_eq!(lookup["as"], "__link_1");

    let rows = query.execute(&mut backend).unwrap();
    let mut found = ids(&rows);
    found.sort();
    assert_eq!(found, vec![1, 3]);
}

#[test]
fn links_do_not_duplicate_documents() {
    let mut backend = setup();
    let mut query = by_id(Term::exists("id", "orders", Some("person_id"), total_above(0.0)).unwrap());
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![1, 3, 4]);
    assert_eq!(query.count(&mut backend).unwrap(), 3);

    let mut absent = by_id(
        Term::subquery("id", Operator::NotExists, "orders", Some("person_id"), total_above(100.0))
            .unwrap(),
    );
    assert_eq!(ids(&absent.execute(&mut backend).unwrap()), vec![2, 4, 5]);

    let cheap = Predicate::all([Term::new("total", Operator::LessThan, 50.0).unwrap()]);
    let mut within = by_id(Term::subquery("id", Operator::In, "orders", Some("person_id"), cheap).unwrap());
    assert_eq!(ids(&within.execute(&mut backend).unwrap()), vec![1, 4]);
}

#[test]
fn scalar_terms() {
    let mut backend = setup();
    let mut run = |term: Term| ids(&by_id(term).execute(&mut backend).unwrap());
    assert_eq!(run(Term::new("age", Operator::Between, [20, 40]).unwrap()), vec![1, 3]);
    assert_eq!(run(Term::new("name", Operator::NotEqual, "Bob").unwrap()), vec![1, 3, 4, 5]);
    assert_eq!(run(Term::new("age", Operator::NotEqual, 34).unwrap()), vec![3, 4, 5]);
    assert_eq!(run(Term::new("age", Operator::In, [19, 34]).unwrap()), vec![1, 5]);
    assert_eq!(run(Term::new("age", Operator::NotIn, Vec::<i64>::new()).unwrap()), vec![1, 2, 3, 4, 5]);
    assert_eq!(run(Term::is_null("age")), vec![2]);
    assert_eq!(run(Term::is_not_null("age")), vec![1, 3, 4, 5]);
    assert_eq!(run(Term::new("name", Operator::Like, "_a%").unwrap()), vec![3, 4]);
    assert_eq!(run(Term::new("name", Operator::Like, "e%").unwrap()), vec![5]);
    assert_eq!(run(Term::new("name", Operator::ILike, "E%").unwrap()), vec![5]);

    let either = Predicate::any([
        Term::new("age", Operator::LessThan, 20).unwrap(),
        Term::new("name", Operator::Equal, "Dave").unwrap(),
    ]);
    assert_eq!(ids(&by_id(either).execute(&mut backend).unwrap()), vec![4, 5]);
    assert!(by_id(Predicate::any(Vec::<Term>::new())).execute(&mut backend).unwrap().is_empty());
}

#[test]
fn ordering_and_windows() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.order_by("age", Direction::Ascending);
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![2, 5, 3, 1, 4]);
    query.set_ordering("age desc").unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![4, 1, 3, 5, 2]);

    query.set_ordering("id").unwrap();
    query.set_range(0, Some(2)).unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![1, 2]);
    assert!(!query.eof());
    query.set_range(4, Some(6)).unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![5]);
    assert!(query.eof());
}

#[test]
fn joins_and_grouping() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.join("orders", "id", "person_id");
    query.set_ordering("id, orders.id").unwrap();
    let rows = query.execute(&mut backend).unwrap();
    assert_eq!(ids(&rows), vec![1, 1, 2, 3, 4, 5]);
    assert_eq!(rows.get(1).unwrap().get("orders.total"), Some(&Value::Float(35.5)));
    assert_eq!(rows.get(2).unwrap().get("orders.total"), Some(&Value::Null));

    query.set_predicate(Term::new("orders.total", Operator::GreaterThan, 100.0).unwrap());
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![1, 3]);

    let mut grouped = Query::new("orders");
    grouped.select(["person_id"]).group_by("person_id");
    grouped.order_by("person_id", Direction::Ascending);
    let rows = grouped.execute(&mut backend).unwrap();
    let people: Vec<String> = rows.iter().map(|r| r.text("person_id")).collect();
    assert_eq!(people, vec!["1", "3", "4"]);
}

#[test]
fn filter_documents() {
    let mut backend = setup();
    let mut raw = Query::new("people");
    raw.set_filter(r#"{"people.name": "Bob"}"#);
    assert_eq!(ids(&raw.execute(&mut backend).unwrap()), vec![2]);

    let mut named = Query::new("people");
    named.set_filter(r#"{"people.age": {"$gte": ":min"}}"#);
    named.declare_parameters("min").unwrap();
    named.order_by("id", Direction::Ascending);
    let rows = named.execute_with_array(&mut backend, &[Value::Int(30)]).unwrap();
    assert_eq!(ids(&rows), vec![1, 4]);

    let mut pattern = Query::new("people");
    pattern.set_filter(r#"{"people.name": {"$regex": "^[ae]", "$options": "i"}}"#);
    pattern.order_by("id", Direction::Ascending);
    assert_eq!(ids(&pattern.execute(&mut backend).unwrap()), vec![1, 5]);
    assert_eq!(ids(&pattern.execute(&mut backend).unwrap()), vec![1, 5]);

    let mut broken = Query::new("people");
    broken.set_filter("name = 'Bob'");
    assert!(broken.execute(&mut backend).is_err());
}

#[test]
fn points_within_a_radius() {
    let mut backend = setup();
    let mut query =
        Query::new("places").filtered(Term::new("x,y", Operator::Within, [0.0, 0.0, 1.5]).unwrap());
    query.order_by("id", Direction::Ascending);
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![1, 3]);
}

#[test]
fn points_without_coordinates_are_never_within() {
    let mut backend = setup();
    backend.insert("places", &Record::new().with("id", 9)).expect("insert place");
    let mut far = Query::new("places").filtered(Term::new("x,y", Operator::Within, [100.0, 100.0, 1.0]).unwrap());
    assert!(far.execute(&mut backend).unwrap().is_empty());

    let mut near = Query::new("places").filtered(Term::new("x,y", Operator::Within, [0.0, 0.0, 1.5]).unwrap());
    near.order_by("id", Direction::Ascending);
    assert_eq!(ids(&near.execute(&mut backend).unwrap()), vec![1, 3]);
}

#[test]
fn collections_without_a_key_column_keep_every_document() {
    let catalog = Catalog::new();
    catalog
        .keep(Schema::new("people").required("id", LogicalType::Integer).column("name", LogicalType::Text))
        .expect("people");
    catalog
        .keep(
            Schema::new("visits")
                .required("person_id", LogicalType::Integer)
                .column("day", LogicalType::Text),
        )
        .expect("visits");
    let mut backend = DocumentBackend::new(Arc::new(catalog));
    for (id, name) in [(1, "Alice"), (2, "Bob")] {
        backend
            .insert("people", &Record::new().with("id", id).with("name", name))
            .expect("insert person");
    }
    for (person, day) in [(1, "mon"), (1, "tue"), (2, "mon")] {
        backend
            .insert("visits", &Record::new().with("person_id", person).with("day", day))
            .expect("insert visit");
    }

    let known = Term::exists("person_id", "people", Some("id"), Predicate::new()).unwrap();
    let mut visits = Query::new("visits").filtered(known);
    assert_eq!(visits.execute(&mut backend).unwrap().len(), 3);
    assert_eq!(visits.count(&mut backend).unwrap(), 3);

    let visited = Term::exists("id", "visits", Some("person_id"), Predicate::new()).unwrap();
    let mut joined = Query::new("people").filtered(visited);
    joined.join("visits", "id", "person_id");
    joined.set_ordering("id, visits.day").unwrap();
    let rows = joined.execute(&mut backend).unwrap();
    assert_eq!(ids(&rows), vec![1, 1, 2]);
    let days: Vec<String> = rows.iter().map(|r| r.text("visits.day")).collect();
    assert_eq!(days, vec!["mon", "tue", "mon"]);
}

#[test]
fn aggregates_over_joined_columns() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.join("orders", "id", "person_id");
    assert_eq!(query.count(&mut backend).unwrap(), 6);
    assert_eq!(
        query.aggregate(&mut backend, &Aggregate::Sum("orders.total".into())).unwrap(),
        Value::Float(1147.5)
    );
    assert_eq!(
        query.aggregate(&mut backend, &Aggregate::Max("orders.total".into())).unwrap(),
        Value::Float(980.0)
    );
    query.set_predicate(Term::new("age", Operator::GreaterThan, 30).unwrap());
    assert_eq!(
        query.aggregate(&mut backend, &Aggregate::Sum("orders.total".into())).unwrap(),
        Value::Float(167.5)
    );

    let mut unjoined = Query::new("people");
    assert!(matches!(
        unjoined.aggregate(&mut backend, &Aggregate::Sum("orders.total".into())).unwrap_err(),
        PolystoreError::UnknownTable(_)
    ));
}

#[test]
fn aggregates() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.set_range(0, Some(1)).unwrap();
    assert_eq!(query.count(&mut backend).unwrap(), 5);
    let aggregate = |query: &mut Query, backend: &mut DocumentBackend, aggregate: Aggregate| {
        query.aggregate(backend, &aggregate).unwrap()
    };
    assert_eq!(aggregate(&mut query, &mut backend, Aggregate::Sum("age".into())), Value::Int(131));
    assert_eq!(aggregate(&mut query, &mut backend, Aggregate::Avg("age".into())), Value::Float(32.75));
    assert_eq!(aggregate(&mut query, &mut backend, Aggregate::Max("age".into())), Value::Int(51));
    assert_eq!(aggregate(&mut query, &mut backend, Aggregate::Min("name".into())), Value::from("Alice"));
    assert!(matches!(
        query.aggregate(&mut backend, &Aggregate::Sum("name".into())).unwrap_err(),
        PolystoreError::Shape { .. }
    ));

    query.set_predicate(Term::new("age", Operator::GreaterThan, 100).unwrap());
    assert_eq!(query.count(&mut backend).unwrap(), 0);
    assert_eq!(aggregate(&mut query, &mut backend, Aggregate::Avg("age".into())), Value::Null);
}
