// ironlinq-core/tests/end_to_end.rs
// Translate, execute against the in-memory store, materialize

use ironlinq_core::expr::builder::*;
use ironlinq_core::{
    translate, Expr, ExprType, Grouping, LinqError, MemoryDatabase, QueryProvider, StageKind,
};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize, PartialEq)]
struct Person {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Age")]
    age: i64,
    #[serde(rename = "Dept")]
    dept: String,
}

#[derive(Debug, Deserialize, PartialEq)]
struct DeptTotal {
    #[serde(rename = "Dept")]
    dept: String,
    #[serde(rename = "Total")]
    total: i64,
}

fn setup() -> (Arc<MemoryDatabase>, QueryProvider) {
    let db = Arc::new(MemoryDatabase::new());
    db.load_json(&json!({
        "people": [
            {"Name": "Ann", "Age": 31, "Dept": "A", "Sal": 10, "DeptId": 1},
            {"Name": "Bob", "Age": 22, "Dept": "B", "Sal": 5, "DeptId": 2},
            {"Name": "Cid", "Age": 45, "Dept": "A", "Sal": 20, "DeptId": 7}
        ],
        "depts": [
            {"_id": 1, "Title": "Ops"},
            {"_id": 2, "Title": "Dev"}
        ]
    }))
    .unwrap();
    let provider = QueryProvider::new(db.clone());
    (db, provider)
}

fn people() -> Expr {
    collection("people", "Person")
}

fn p() -> Expr {
    param("p", ExprType::entity("Person"))
}

fn by_name() -> Expr {
    lambda(&["p"], p().member("Name", ExprType::String))
}

#[test]
fn sort_skip_take_keep_emission_order() {
    let query = people()
        .order_by(lambda(&["p"], p().member("Age", ExprType::Int)))
        .skip(1)
        .take(2);
    let translated = translate(&query).unwrap();
    assert_eq!(
        translated.stage_kinds(),
        vec![StageKind::Sort, StageKind::Skip, StageKind::Limit]
    );

    let (_, provider) = setup();
    let found: Vec<Person> = provider.to_list(&query).unwrap();
    let names: Vec<&str> = found.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Ann", "Cid"]);
}

#[test]
fn filter_then_select_names() {
    let (db, provider) = setup();
    let query = people()
        .filter(lambda(&["p"], p().member("Age", ExprType::Int).gt(int(25))))
        .select(by_name());
    let names: Vec<String> = provider.to_list(&query).unwrap();
    assert_eq!(names, vec!["Ann", "Cid"]);
    assert_eq!(db.open_cursors(), 0);
}

#[test]
fn group_sum_per_key() {
    let (_, provider) = setup();
    let g = param(
        "g",
        ExprType::grouping(ExprType::String, ExprType::entity("Person")),
    );
    let query = people()
        .group_by(lambda(&["p"], p().member("Dept", ExprType::String)))
        .select(lambda(
            &["g"],
            new_object(vec![
                ("Dept", g.member("Key", ExprType::String)),
                (
                    "Total",
                    g.seq(
                        "Sum",
                        vec![lambda(&["p"], p().member("Sal", ExprType::Int))],
                        ExprType::Int,
                    ),
                ),
            ]),
        ));
    let totals: Vec<DeptTotal> = provider.to_list(&query).unwrap();
    assert_eq!(
        totals,
        vec![
            DeptTotal {
                dept: "A".to_string(),
                total: 30
            },
            DeptTotal {
                dept: "B".to_string(),
                total: 5
            },
        ]
    );
}

#[test]
fn plain_group_by_carries_members() {
    let (_, provider) = setup();
    let query = people().group_by(lambda(&["p"], p().member("Dept", ExprType::String)));
    let groups: Vec<Grouping<String, Person>> = provider.to_list(&query).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].key, "A");
    let names: Vec<&str> = groups[0].values.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Ann", "Cid"]);
}

#[test]
fn group_keys_only() {
    let (_, provider) = setup();
    let g = param(
        "g",
        ExprType::grouping(ExprType::String, ExprType::entity("Person")),
    );
    let query = people()
        .group_by(lambda(&["p"], p().member("Dept", ExprType::String)))
        .select(lambda(&["g"], g.member("Key", ExprType::String)));
    let keys: Vec<String> = provider.to_list(&query).unwrap();
    assert_eq!(keys, vec!["A", "B"]);
}

#[test]
fn distinct_departments() {
    let (_, provider) = setup();
    let query = people()
        .select(lambda(&["p"], p().member("Dept", ExprType::String)))
        .distinct();
    let mut depts: Vec<String> = provider.to_list(&query).unwrap();
    depts.sort();
    assert_eq!(depts, vec!["A", "B"]);
}

#[test]
fn join_drops_unmatched_rows() {
    let (_, provider) = setup();
    let d = param("d", ExprType::entity("Dept"));
    let query = people().join(
        collection("depts", "Dept"),
        lambda(&["p"], p().member("DeptId", ExprType::Int)),
        lambda(&["d"], d.id_member("Id", ExprType::Int)),
        lambda(
            &["p", "d"],
            new_object(vec![
                ("Name", p().member("Name", ExprType::String)),
                ("Title", d.member("Title", ExprType::String)),
            ]),
        ),
    );
    let rows: Vec<serde_json::Value> = provider.to_list(&query).unwrap();
    assert_eq!(
        rows,
        vec![
            json!({"Name": "Ann", "Title": "Ops"}),
            json!({"Name": "Bob", "Title": "Dev"}),
        ]
    );

    let nowhere = people()
        .filter(lambda(&["p"], p().member("DeptId", ExprType::Int).equals(int(7))))
        .join(
            collection("depts", "Dept"),
            lambda(&["p"], p().member("DeptId", ExprType::Int)),
            lambda(&["d"], d.id_member("Id", ExprType::Int)),
            lambda(&["p", "d"], p()),
        );
    let rows: Vec<serde_json::Value> = provider.to_list(&nowhere).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn element_operators_report_cardinality() {
    let (_, provider) = setup();
    let nobody = people().filter(lambda(&["p"], p().member("Age", ExprType::Int).gt(int(90))));

    assert!(matches!(
        provider.first::<Person>(&nobody).unwrap_err(),
        LinqError::NoElements
    ));
    assert!(matches!(
        provider.single::<Person>(&people()).unwrap_err(),
        LinqError::MoreThanOneElement
    ));
    assert_eq!(provider.first_or_default::<Person>(&nobody).unwrap(), None);
    assert_eq!(provider.single_or_default::<Person>(&nobody).unwrap(), None);

    let youngest: Person = provider
        .first(&people().order_by(lambda(&["p"], p().member("Age", ExprType::Int))))
        .unwrap();
    assert_eq!(youngest.name, "Bob");
    assert_eq!(youngest.dept, "B");
}

#[test]
fn take_zero_is_always_empty() {
    let (_, provider) = setup();
    let query = people().take(0);
    assert!(translate(&query).unwrap().is_always_empty());
    let found: Vec<Person> = provider.to_list(&query).unwrap();
    assert!(found.is_empty());
}

#[test]
fn scalar_aggregates_over_whole_collection() {
    let (_, provider) = setup();
    let age = lambda(&["p"], p().member("Age", ExprType::Int));
    assert_eq!(provider.count(&people()).unwrap(), 3);
    let oldest: Option<i64> = provider.scalar(&people().max(Some(age.clone()))).unwrap();
    assert_eq!(oldest, Some(45));
    let mean: Option<f64> = provider.scalar(&people().average(Some(age))).unwrap();
    assert!((mean.unwrap() - 98.0 / 3.0).abs() < 1e-9);
}

/// (born, hired) in epoch milliseconds
const TIMELINE: [(i64, i64); 2] = [(0, 90_000_000), (86_400_000, 261_000_000)];

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

#[test]
fn projections_match_plain_evaluation() {
    let db = Arc::new(MemoryDatabase::new());
    db.insert_many(
        "people",
        vec![
            json!({"First": "Ann", "Age": 31, "Born": {"$date": TIMELINE[0].0},
                   "Hired": {"$date": TIMELINE[0].1}, "Nick": null, "Tags": ["a", "b"]}),
            json!({"Age": 12, "Born": {"$date": TIMELINE[1].0},
                   "Hired": {"$date": TIMELINE[1].1}, "Tags": []}),
        ],
    )
    .unwrap();
    let provider = QueryProvider::new(db);

    let age = p().member("Age", ExprType::Int);
    let born = p().member("Born", ExprType::DateTime);
    let hired = p().member("Hired", ExprType::DateTime);
    let tags = p().member("Tags", ExprType::array(ExprType::String));
    let query = people().select(lambda(
        &["p"],
        new_object(vec![
            ("Next", age.plus(int(1))),
            (
                "Label",
                condition(
                    age.gt(int(17)),
                    string("adult"),
                    p().member("Nick", ExprType::String).coalesce(string("kid")),
                ),
            ),
            (
                "Greeting",
                p().member("First", ExprType::String)
                    .plus(string(" "))
                    .plus(age.clone()),
            ),
            ("BornYear", born.member("Year", ExprType::Int)),
            (
                "Later",
                born.call("AddDays", vec![int(2)], ExprType::DateTime),
            ),
            (
                "HoursIn",
                hired
                    .minus(born.clone())
                    .member("TotalHours", ExprType::Double),
            ),
            (
                "ClockMinutes",
                hired
                    .member("TimeOfDay", ExprType::Duration)
                    .member("TotalMinutes", ExprType::Double),
            ),
            (
                "NoTags",
                tags.seq("Take", vec![int(-1)], ExprType::array(ExprType::String)),
            ),
            (
                "FirstTag",
                tags.seq("Take", vec![int(1)], ExprType::array(ExprType::String)),
            ),
        ]),
    ));

    let rows: Vec<serde_json::Value> = provider.to_list(&query).unwrap();
    assert_eq!(rows.len(), 2);

    let expected_text = [
        ("adult", "Ann 31", 32),
        ("kid", " 12", 13),
    ];
    let expected_tags = [json!(["a"]), json!([])];
    for (i, row) in rows.iter().enumerate() {
        let (born_ms, hired_ms) = TIMELINE[i];
        let (label, greeting, next) = expected_text[i];
        let (born_at, hired_at) = (at(born_ms), at(hired_ms));
        let hours = (hired_at - born_at).num_milliseconds() as f64 / 3_600_000.0;
        let clock = hired_at.time().num_seconds_from_midnight() as f64 / 60.0;
        let later = born_at + Duration::days(2);

        assert_eq!(row["Next"], json!(next));
        assert_eq!(row["Label"], json!(label));
        assert_eq!(row["Greeting"], json!(greeting));
        assert_eq!(row["BornYear"], json!(born_at.year()));
        assert_eq!(row["Later"], json!({"$date": later.timestamp_millis()}));
        assert_eq!(row["HoursIn"].as_f64(), Some(hours));
        assert_eq!(row["ClockMinutes"].as_f64(), Some(clock));
        assert_eq!(row["NoTags"], json!([]));
        assert_eq!(row["FirstTag"], expected_tags[i]);
    }
}

#[test]
fn membership_in_null_list_is_argument_null() {
    let (_, provider) = setup();
    let nothing = null(ExprType::array(ExprType::String));
    let contains = nothing.seq(
        "Contains",
        vec![p().member("Name", ExprType::String)],
        ExprType::Bool,
    );

    for body in [contains.clone(), contains.logical_not()] {
        let query = people().filter(lambda(&["p"], body));
        let err = provider.to_list::<Person>(&query).unwrap_err();
        assert!(matches!(err, LinqError::ArgumentNull(_)), "{:?}", err);
    }
}

#[test]
fn grouping_projected_values_keeps_plain_members() {
    let (_, provider) = setup();
    let x = param("x", ExprType::String);
    let query = people()
        .select(lambda(&["p"], p().member("Dept", ExprType::String)))
        .group_by(lambda(&["x"], x));
    let groups: Vec<Grouping<String, String>> = provider.to_list(&query).unwrap();
    assert_eq!(
        groups,
        vec![
            Grouping {
                key: "A".to_string(),
                values: vec!["A".to_string(), "A".to_string()],
            },
            Grouping {
                key: "B".to_string(),
                values: vec!["B".to_string()],
            },
        ]
    );
}
