use polystore::PolystoreError;
use polystore::backend::{ANSI, SqlDialect};
use polystore::datatype::{LogicalType, Value};
use polystore::eval::{cached_regex, like_matches};
use polystore::operator::{Arity, Operator};
use polystore::part::{Connective, Dialect, Operand, Part, Predicate, Term, count_placeholders, replace_parameters};
use polystore::record::Record;
use polystore::schema::Schema;

fn scenario_a() -> Predicate {
    Predicate::all([
        Term::new("age", Operator::Between, [18, 30]).expect("between term"),
        Term::new("status", Operator::Equal, "active").expect("equality term"),
    ])
}

#[test]
fn operator_tokens_round_trip() {
    for operator in Operator::ALL {
        let parsed = Operator::from_token(operator.token()).expect("known token");
        assert_eq!(parsed, operator);
    }
    assert_eq!(Operator::from_token("  not   in ").unwrap(), Operator::NotIn);
    assert_eq!(Operator::from_token("!=").unwrap(), Operator::NotEqual);
    assert_eq!(Operator::from_token("is null").unwrap(), Operator::IsNull);
    let err = Operator::from_token("~~").unwrap_err();
    assert!(matches!(err, PolystoreError::UnknownOperator(t) if t == "~~"));
}

#[test]
fn operator_arity() {
    assert_eq!(Operator::Between.arity(), Arity::Two);
    assert_eq!(Operator::Within.arity(), Arity::Three);
    assert_eq!(Operator::IsNull.arity(), Arity::None);
    assert!(Operator::In.accepts_subquery());
    assert!(!Operator::Equal.accepts_subquery());
    assert!(Operator::Between.arity().admits(2));
    assert!(!Operator::Between.arity().admits(3));
}

#[test]
fn between_takes_exactly_two_values() {
    let term = Term::new("age", Operator::Between, [1, 2]).expect("two values");
    assert_eq!(term.value_count(), 2);
    assert_eq!(term.operand(), &Operand::Range(Value::Int(1), Value::Int(2)));
    for values in [vec![], vec![1], vec![1, 2, 3]] {
        let err = Term::new("age", Operator::Between, values).unwrap_err();
        assert!(matches!(err, PolystoreError::Shape { .. }), "got {err:?}");
    }
    assert!(Term::new("age", Operator::Between, 5).is_err());
}

#[test]
fn single_value_operator_rejects_collections() {
    // scenario B
    let err = Term::new("price", Operator::LessThan, [10, 20]).unwrap_err();
    assert!(matches!(err, PolystoreError::Shape { ref operator, .. } if operator == "<"));
}

#[test]
fn shape_checks() {
    assert!(Term::new("tags", Operator::In, 3).is_err());
    assert!(Term::new("name", Operator::Like, 3).is_err());
    assert!(Term::new("name", Operator::IsNull, "x").is_err());
    assert!(Term::new("id", Operator::Exists, Value::Null).is_err());
    assert!(Term::new("x,y", Operator::Within, [1, 2]).is_err());
    assert!(Term::new("x,y", Operator::Within, ["a", "b", "c"]).is_err());
    assert!(Term::new("x,y", Operator::Within, [1.0, 2.0, 0.5]).is_ok());
    assert!(Term::subquery("id", Operator::Equal, "orders", None, Predicate::new()).is_err());

    let empty = Term::new("tags", Operator::In, Value::Null).expect("null means empty list");
    assert_eq!(empty.operand(), &Operand::List(Vec::new()));
    let null_test = Term::is_null("age");
    assert_eq!(null_test.value_count(), 0);
    assert!(null_test.parameters().is_empty());
}

#[test]
fn parse_fails_fast_on_unknown_tokens() {
    assert!(Term::parse("age", ">=", 3).is_ok());
    assert!(matches!(
        Term::parse("age", "=>", 3).unwrap_err(),
        PolystoreError::UnknownOperator(_)
    ));
}

#[test]
fn connectives_do_not_mix() {
    let mut predicate = Predicate::new();
    predicate.and(Term::is_null("a")).expect("first and");
    predicate.and(Term::is_null("b")).expect("second and");
    assert_eq!(predicate.len(), 2);
    assert_eq!(predicate.connective(), Connective::And);
    let err = predicate.or(Term::is_null("c")).unwrap_err();
    assert!(matches!(err, PolystoreError::Connective(_)));
    assert_eq!(predicate.len(), 2);

    let mut disjunction = Predicate::new();
    disjunction.or(Term::is_null("a")).unwrap();
    assert!(disjunction.and(Term::is_null("b")).is_err());

    let mut terminal = Predicate::new();
    assert!(terminal.add(Term::is_null("a")).is_err());
    let mut conjunction = Predicate::all([Term::is_null("a")]);
    conjunction.add(Term::is_not_null("b")).expect("add under and");
    assert_eq!(conjunction.len(), 2);
}

#[test]
fn scenario_a_text_and_parameters() {
    let part = Part::Predicate(scenario_a());
    let text = part.parametrized_text(&ANSI).expect("renders");
    assert_eq!(text, "\"age\" BETWEEN ? AND ? AND \"status\" = ?");
    assert_eq!(count_placeholders(&text), 3);
    assert_eq!(
        part.parameters(),
        vec![Value::Int(18), Value::Int(30), Value::Text("active".into())]
    );
    assert_eq!(
        part.text(&ANSI).unwrap(),
        "\"age\" BETWEEN 18 AND 30 AND \"status\" = 'active'"
    );
}

#[test]
fn parameters_follow_depth_first_order() {
    let nested = Predicate::any([
        Term::new("b", Operator::In, [2, 3]).unwrap(),
        Term::is_null("c"),
        Term::new("d", Operator::Equal, 4).unwrap(),
    ]);
    let orders = Predicate::all([Term::new("total", Operator::GreaterThan, 5).unwrap()]);
    let root = Predicate::all([
        Part::from(Term::new("a", Operator::Equal, 1).unwrap()),
        Part::from(nested),
        Part::from(Term::exists("id", "orders", Some("person_id"), orders).unwrap()),
        Part::from(Term::new("x,y", Operator::Within, [0.0, 0.0, 1.0]).unwrap()),
    ]);
    let parameters = root.parameters();
    assert_eq!(
        parameters,
        vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::Int(5),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(1.0),
        ]
    );
    let part = Part::Predicate(root);
    for dialect in [&ANSI, &SqlDialect::scoped("people")] {
        let text = part.parametrized_text(dialect).unwrap();
        assert_eq!(count_placeholders(&text), parameters.len(), "{text}");
    }
}

#[test]
fn placeholders_inside_literals_are_not_counted() {
    assert_eq!(count_placeholders("a = '?' AND \"b?\" = ?"), 1);
    assert_eq!(
        replace_parameters("a = ? AND b = ?", &[Value::Null, Value::from("it's")]).unwrap(),
        "a = null AND b = 'it''s'"
    );
    assert!(matches!(
        replace_parameters("a = ?", &[]).unwrap_err(),
        PolystoreError::ParameterCount { expected: 1, found: 0 }
    ));
}

#[test]
fn scoped_rendering() {
    let orders = Predicate::all([Term::new("total", Operator::GreaterThan, 100).unwrap()]);
    let part = Part::Predicate(Predicate::all([
        Term::new("name", Operator::ILike, "a%").unwrap(),
        Term::exists("id", "orders", Some("person_id"), orders).unwrap(),
        Term::new("tags", Operator::In, Vec::<i64>::new()).unwrap(),
    ]));
    let text = SqlDialect::scoped("people").parametrized(&part).unwrap();
    assert_eq!(
        text,
        "LOWER(\"people\".\"name\") LIKE LOWER(?) AND EXISTS (SELECT 1 FROM \"orders\" AS \"s1\" \
         WHERE \"people\".\"id\" = \"s1\".\"person_id\" AND (\"s1\".\"total\" > ?)) AND 1 = 0"
    );
}

#[test]
fn schema_terms_convert_values() {
    let schema = Schema::new("people")
        .column("id", LogicalType::Integer)
        .column("born", LogicalType::Date)
        .column("score", LogicalType::Float);
    let term = schema.term("born", Operator::GreaterOrEqual, "2000-01-31").unwrap();
    assert!(matches!(term.operand(), Operand::Scalar(Value::Date(_))));
    let term = schema.term("score", Operator::Between, [1, 2]).unwrap();
    assert_eq!(term.operand(), &Operand::Range(Value::Float(1.0), Value::Float(2.0)));
    assert!(matches!(
        schema.term("missing", Operator::Equal, 1).unwrap_err(),
        PolystoreError::UnknownColumn { .. }
    ));
    assert!(schema.term("id", Operator::Equal, "not a number").is_err());
}

#[test]
fn in_memory_evaluation() {
    let row = Record::new()
        .with("name", "Alice")
        .with("age", 34)
        .with("nickname", Value::Null)
        .with("x", 1.0)
        .with("y", 1.0);
    let matches = |term: Term| term.matches(&row).expect("evaluates");
    assert!(matches(Term::new("name", Operator::Like, "A%e").unwrap()));
    assert!(!matches(Term::new("name", Operator::Like, "a%").unwrap()));
    assert!(matches(Term::new("name", Operator::ILike, "a_ice").unwrap()));
    assert!(matches(Term::new("age", Operator::Between, [30, 40]).unwrap()));
    assert!(matches(Term::new("age", Operator::NotIn, [1, 2]).unwrap()));
    assert!(matches(Term::is_null("nickname")));
    assert!(!matches(Term::new("nickname", Operator::NotEqual, "x").unwrap()));
    assert!(matches(Term::new("nickname", Operator::NotIn, Vec::<i64>::new()).unwrap()));
    assert!(matches(Term::new("x,y", Operator::Within, [0.0, 0.0, 1.5]).unwrap()));
    assert!(!matches(Term::new("x,y", Operator::Within, [0.0, 0.0, 1.0]).unwrap()));

    assert!(Predicate::all(Vec::<Term>::new()).matches(&row).unwrap());
    assert!(!Predicate::any(Vec::<Term>::new()).matches(&row).unwrap());
    let nested = Term::exists("id", "orders", None, Predicate::new()).unwrap();
    assert!(matches!(
        nested.matches(&row).unwrap_err(),
        PolystoreError::Unsupported { .. }
    ));
}

#[test]
fn compiled_patterns_are_cached_per_case_mode() {
    let sensitive = cached_regex("^ab", false).unwrap();
    assert!(!sensitive.is_match("ABC"));
    assert!(cached_regex("^ab", true).unwrap().is_match("ABC"));
    assert!(cached_regex("^ab", false).unwrap().is_match("abc"));
    assert!(matches!(cached_regex("(", false).unwrap_err(), PolystoreError::Shape { .. }));

    assert!(like_matches("a_c%", "abcd", false).unwrap());
    assert!(!like_matches("a_c%", "ABCD", false).unwrap());
    assert!(like_matches("a_c%", "ABCD", true).unwrap());
}
