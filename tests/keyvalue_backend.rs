use std::ops::Bound;
use std::sync::Arc;

use polystore::PolystoreError;
use polystore::backend::keyvalue::{Access, plan_access};
use polystore::backend::{Backend, KeyValueBackend};
use polystore::datatype::{LogicalType, Value};
use polystore::operator::Operator;
use polystore::part::{Predicate, Term};
use polystore::query::{Aggregate, Direction, Query};
use polystore::record::Record;
use polystore::result::ResultSet;
use polystore::schema::{Catalog, Schema};

fn people() -> Schema {
    Schema::new("people")
        .required("id", LogicalType::Integer)
        .required("name", LogicalType::Text)
        .column("age", LogicalType::Integer)
        .column("city", LogicalType::Text)
        .index("name")
        .index("age")
}

fn setup() -> KeyValueBackend {
    let catalog = Catalog::new();
    catalog.keep(people()).expect("people");
    catalog
        .keep(
            Schema::new("orders")
                .required("id", LogicalType::Integer)
                .required("person_id", LogicalType::Integer)
                .index("person_id"),
        )
        .expect("orders");
    let mut backend = KeyValueBackend::new(Arc::new(catalog));
    let rows = [
        (1, "Alice", Some(34), "Oslo"),
        (2, "Bob", None, "Rome"),
        (3, "Carol", Some(27), "Oslo"),
        (4, "Dave", Some(51), "Lima"),
        (5, "eve", Some(19), "Rome"),
    ];
    for (id, name, age, city) in rows {
        backend
            .insert(
                "people",
                &Record::new().with("id", id).with("name", name).with("age", age).with("city", city),
            )
            .expect("insert person");
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

fn term(column: &str, operator: Operator, value: impl Into<polystore::part::Input>) -> Term {
    Term::new(column, operator, value).expect("term")
}

#[test]
fn disjunction_across_columns_is_unsupported() {
    // scenario D
    let schema = Schema::new("t")
        .column("a", LogicalType::Integer)
        .column("b", LogicalType::Integer)
        .primary_key("a")
        .index("b");
    let either = Predicate::any([term("a", Operator::Equal, 1), term("b", Operator::Equal, 2)]);
    assert!(matches!(
        plan_access(&schema, &either).unwrap_err(),
        PolystoreError::Unsupported { backend: "keyvalue", .. }
    ));

    let mut backend = setup();
    let mut query = Query::new("people").filtered(Predicate::any([
        term("id", Operator::Equal, 1),
        term("name", Operator::Equal, "Bob"),
    ]));
    assert!(matches!(
        query.execute(&mut backend).unwrap_err(),
        PolystoreError::Unsupported { .. }
    ));
}

#[test]
fn access_paths() {
    let schema = people();
    let plan = |predicate: Predicate| plan_access(&schema, &predicate).expect("plans");

    let (access, residual) = plan(Predicate::all([term("id", Operator::Equal, 3)]));
    assert_eq!(access, Access::PrimaryKey(vec![Value::Int(3)]));
    assert_eq!(residual, None);

    let (access, residual) = plan(Predicate::all([
        term("age", Operator::GreaterThan, 30),
        term("name", Operator::Equal, "Alice"),
    ]));
    assert_eq!(
        access,
        Access::IndexEq { column: "name".into(), values: vec![Value::from("Alice")] }
    );
    assert_eq!(residual, Some(Predicate::all([term("age", Operator::GreaterThan, 30)])));

    let (access, _) = plan(Predicate::all([
        term("age", Operator::Equal, 27),
        term("id", Operator::GreaterThan, 1),
    ]));
    assert!(matches!(access, Access::IndexEq { .. }));

    let (access, _) = plan(Predicate::all([term("id", Operator::GreaterThan, 3)]));
    assert_eq!(
        access,
        Access::KeyRange { low: Bound::Excluded(Value::Int(3)), high: Bound::Unbounded }
    );

    let (access, _) = plan(Predicate::all([term("age", Operator::LessThan, 30)]));
    assert_eq!(
        access,
        Access::IndexRange {
            column: "age".into(),
            low: Bound::Excluded(Value::Null),
            high: Bound::Excluded(Value::Int(30)),
        }
    );

    let (access, residual) = plan(Predicate::any([
        term("id", Operator::Equal, 1),
        term("id", Operator::Equal, 4),
    ]));
    assert_eq!(access, Access::PrimaryKey(vec![Value::Int(1), Value::Int(4)]));
    assert_eq!(residual, None);

    let (access, _) = plan(Predicate::new());
    assert_eq!(access, Access::Scan);

    for unusable in [
        Predicate::all([term("city", Operator::Equal, "Oslo")]),
        Predicate::all([term("name", Operator::Like, "A%")]),
        Predicate::all([Term::exists("id", "orders", Some("person_id"), Predicate::new()).unwrap()]),
    ] {
        assert!(matches!(
            plan_access(&schema, &unusable).unwrap_err(),
            PolystoreError::Unsupported { .. }
        ));
    }
}

#[test]
fn lookups_and_residuals() {
    let mut backend = setup();
    let mut run = |predicate: Predicate| {
        ids(&Query::new("people").filtered(predicate).execute(&mut backend).unwrap())
    };
    assert_eq!(run(Predicate::all([term("id", Operator::Equal, 3)])), vec![3]);
    assert_eq!(run(Predicate::all([term("id", Operator::Equal, 9)])), Vec::<i64>::new());
    assert_eq!(run(Predicate::all([term("id", Operator::GreaterThan, 3)])), vec![4, 5]);
    assert_eq!(run(Predicate::all([term("age", Operator::Between, [20, 40])])), vec![1, 3]);
    assert_eq!(run(Predicate::all([term("age", Operator::LessThan, 30)])), vec![3, 5]);
    assert_eq!(run(Predicate::all([term("name", Operator::In, ["Carol", "Alice"])])), vec![1, 3]);
    assert_eq!(
        run(Predicate::all([
            term("name", Operator::In, ["Alice", "Bob", "eve"]),
            term("city", Operator::Equal, "Rome"),
        ])),
        vec![2, 5]
    );
    assert_eq!(
        run(Predicate::all([
            term("age", Operator::GreaterOrEqual, 19),
            term("name", Operator::ILike, "%E"),
        ])),
        vec![1, 4, 5]
    );
}

#[test]
fn repeated_keys_return_each_row_once() {
    let mut backend = setup();
    let mut run = |predicate: Predicate| {
        ids(&Query::new("people").filtered(predicate).execute(&mut backend).unwrap())
    };
    assert_eq!(run(Predicate::all([term("id", Operator::In, [1, 1])])), vec![1]);
    assert_eq!(
        run(Predicate::any([term("id", Operator::Equal, 1), term("id", Operator::Equal, 1)])),
        vec![1]
    );
    assert_eq!(run(Predicate::all([term("id", Operator::In, [4, 2, 4])])), vec![2, 4]);
    assert_eq!(run(Predicate::all([term("name", Operator::In, ["Alice", "Alice"])])), vec![1]);
}

#[test]
fn unsupported_shapes() {
    let mut backend = setup();
    let mut joined = Query::new("people");
    joined.join("orders", "id", "person_id");
    assert!(matches!(joined.execute(&mut backend).unwrap_err(), PolystoreError::Unsupported { .. }));

    let mut grouped = Query::new("people");
    grouped.group_by("city");
    assert!(matches!(grouped.execute(&mut backend).unwrap_err(), PolystoreError::Unsupported { .. }));

    let mut raw = Query::new("people");
    raw.set_filter("id = 1");
    assert!(matches!(raw.execute(&mut backend).unwrap_err(), PolystoreError::Unsupported { .. }));
}

#[test]
fn ordering_and_windows() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.order_by("age", Direction::Ascending);
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![2, 5, 3, 1, 4]);

    query.set_ordering("city, age DESC").unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![4, 1, 3, 5, 2]);

    query.set_ordering("age DESC").unwrap();
    query.set_range(0, Some(2)).unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![4, 1]);
    assert!(!query.eof());
    query.set_range(4, Some(8)).unwrap();
    assert_eq!(ids(&query.execute(&mut backend).unwrap()), vec![2]);
    assert!(query.eof());

    let mut by_name = Query::new("people").filtered(term("age", Operator::GreaterThan, 0));
    by_name.select(["id"]).order_by("name", Direction::Descending);
    assert_eq!(ids(&by_name.execute(&mut backend).unwrap()), vec![5, 4, 3, 1]);
    by_name.set_range(1, Some(3)).unwrap();
    assert_eq!(ids(&by_name.execute(&mut backend).unwrap()), vec![4, 3]);

    let mut projected = Query::new("people").filtered(term("id", Operator::Equal, 1));
    projected.select(["name"]);
    let rows = projected.execute(&mut backend).unwrap();
    assert_eq!(rows.columns(), &["name"]);
    assert_eq!(rows.get(0).unwrap(), &Record::new().with("name", "Alice"));
}

#[test]
fn aggregates() {
    let mut backend = setup();
    let mut query = Query::new("people");
    query.set_range(0, Some(1)).unwrap();
    assert_eq!(query.count(&mut backend).unwrap(), 5);
    assert_eq!(query.aggregate(&mut backend, &Aggregate::Sum("age".into())).unwrap(), Value::Int(131));
    assert_eq!(
        query.aggregate(&mut backend, &Aggregate::Avg("age".into())).unwrap(),
        Value::Float(32.75)
    );
    assert_eq!(query.aggregate(&mut backend, &Aggregate::Min("name".into())).unwrap(), Value::from("Alice"));
    assert_eq!(query.aggregate(&mut backend, &Aggregate::Max("age".into())).unwrap(), Value::Int(51));
    assert!(matches!(
        query.aggregate(&mut backend, &Aggregate::Sum("name".into())).unwrap_err(),
        PolystoreError::Shape { .. }
    ));

    query.set_predicate(term("city", Operator::Equal, "Oslo"));
    assert!(query.count(&mut backend).is_err());
    query.set_predicate(term("age", Operator::GreaterThan, 100));
    assert_eq!(query.count(&mut backend).unwrap(), 0);
    assert_eq!(query.aggregate(&mut backend, &Aggregate::Avg("age".into())).unwrap(), Value::Null);
}

#[test]
fn puts_replace_by_primary_key() {
    let mut backend = setup();
    backend
        .insert("people", &Record::new().with("id", 1).with("name", "Alicia").with("age", 35))
        .expect("upsert");
    assert_eq!(backend.store().len("people"), 5);
    let stored = backend.store().get("people", &Value::Int(1)).expect("stored");
    assert_eq!(stored.get("name"), Some(&Value::from("Alicia")));

    let mut by_name = Query::new("people").filtered(term("name", Operator::Equal, "Alice"));
    assert!(by_name.execute(&mut backend).unwrap().is_empty());
    by_name.set_predicate(term("name", Operator::Equal, "Alicia"));
    assert_eq!(ids(&by_name.execute(&mut backend).unwrap()), vec![1]);

    let err = backend
        .insert("orders", &Record::new().with("id", Value::Null).with("person_id", 1))
        .unwrap_err();
    assert!(matches!(err, PolystoreError::Shape { .. }));
}
