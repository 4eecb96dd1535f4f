// ironlinq-core/tests/properties.rs
// Property checks: comparison mirroring and filter equivalence against a plain evaluation

use ironlinq_core::expr::builder::*;
use ironlinq_core::{BinaryOp, Expr, ExprType, MemoryDatabase, QueryProvider};
use proptest::prelude::*;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Row {
    #[serde(rename = "Seq")]
    seq: i64,
}

fn comparison() -> impl Strategy<Value = BinaryOp> {
    prop_oneof![
        Just(BinaryOp::Equal),
        Just(BinaryOp::NotEqual),
        Just(BinaryOp::GreaterThan),
        Just(BinaryOp::GreaterThanOrEqual),
        Just(BinaryOp::LessThan),
        Just(BinaryOp::LessThanOrEqual),
    ]
}

fn holds(op: BinaryOp, left: i64, right: i64) -> bool {
    match op {
        BinaryOp::Equal => left == right,
        BinaryOp::NotEqual => left != right,
        BinaryOp::GreaterThan => left > right,
        BinaryOp::GreaterThanOrEqual => left >= right,
        BinaryOp::LessThan => left < right,
        BinaryOp::LessThanOrEqual => left <= right,
        other => panic!("not a comparison: {:?}", other),
    }
}

fn age() -> Expr {
    param("p", ExprType::entity("Person")).member("Age", ExprType::Int)
}

/// Runs `filter` over the ages and returns the positions of the documents that passed
fn matching_positions(ages: &[i64], filter: Expr) -> Vec<i64> {
    let db = Arc::new(MemoryDatabase::new());
    let docs = ages
        .iter()
        .enumerate()
        .map(|(i, age)| json!({"Seq": i as i64, "Age": age}))
        .collect();
    db.insert_many("people", docs).unwrap();
    let provider = QueryProvider::new(db);
    let query = collection("people", "Person").filter(lambda(&["p"], filter));
    let rows: Vec<Row> = provider.to_list(&query).unwrap();
    rows.into_iter().map(|row| row.seq).collect()
}

proptest! {
    #[test]
    fn flip_is_an_involution(op in comparison()) {
        prop_assert_eq!(op.flip().flip(), op);
    }

    #[test]
    fn flipped_comparison_agrees(op in comparison(), a in -50i64..50, b in -50i64..50) {
        prop_assert_eq!(holds(op, a, b), holds(op.flip(), b, a));
    }

    #[test]
    fn member_on_left_matches_reference(
        ages in prop::collection::vec(0i64..100, 0..12),
        op in comparison(),
        k in 0i64..100,
    ) {
        let expected: Vec<i64> = ages
            .iter()
            .enumerate()
            .filter(|(_, age)| holds(op, **age, k))
            .map(|(i, _)| i as i64)
            .collect();
        prop_assert_eq!(matching_positions(&ages, age().compare(op, int(k))), expected);
    }

    #[test]
    fn constant_on_left_matches_reference(
        ages in prop::collection::vec(0i64..100, 0..12),
        op in comparison(),
        k in 0i64..100,
    ) {
        let expected: Vec<i64> = ages
            .iter()
            .enumerate()
            .filter(|(_, age)| holds(op, k, **age))
            .map(|(i, _)| i as i64)
            .collect();
        prop_assert_eq!(matching_positions(&ages, int(k).compare(op, age())), expected);
    }

    #[test]
    fn conjunction_matches_reference(
        ages in prop::collection::vec(0i64..100, 0..12),
        low in 0i64..50,
        high in 50i64..100,
    ) {
        let expected: Vec<i64> = ages
            .iter()
            .enumerate()
            .filter(|(_, age)| **age >= low && **age < high)
            .map(|(i, _)| i as i64)
            .collect();
        let filter = age().ge(int(low)).and(age().lt(int(high)));
        prop_assert_eq!(matching_positions(&ages, filter), expected);
    }
}
