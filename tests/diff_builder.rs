use relevance_sim::diff::{build_diff, DiffRow, RankingDiff, ACCUMULATOR_EPSILON};
use relevance_sim::results::{dcg_weight, RankedResults};
use relevance_sim::SimulationError;

fn find_row<'a>(diff: &'a RankingDiff, query_id: &str, document_id: &str) -> &'a DiffRow {
    diff.rows
        .iter()
        .find(|row| row.query_id == query_id && row.document_id == document_id)
        .unwrap()
}

const W1: f64 = 1.0;

fn w2() -> f64 {
    1.0 / 3f64.log2()
}

#[test]
fn single_swap_produces_opposite_weight_deltas() {
    let before = RankedResults::from_pairs([("1", "1234"), ("1", "5678")]);
    let after = RankedResults::from_pairs([("1", "5678"), ("1", "1234")]);
    let diff = build_diff(Some(&before), &after).unwrap();

    assert_eq!(diff.rows.len(), 2);
    assert_eq!(diff.num_changed, 2);
    assert_eq!(diff.num_queries, 1);

    let up = find_row(&diff, "1", "5678");
    let down = find_row(&diff, "1", "1234");
    assert!((up.weight_delta - (W1 - w2())).abs() < 1e-12);
    assert!((down.weight_delta + (W1 - w2())).abs() < 1e-12);
    assert_eq!(up.position_delta, Some(-1));
    assert_eq!(down.position_delta, Some(1));
    assert!((diff.best_case_dcg_delta - (W1 - w2())).abs() < 1e-12);

    for row in &diff.rows {
        assert_eq!(row.rels, ACCUMULATOR_EPSILON);
        assert_eq!(row.not_rels, ACCUMULATOR_EPSILON);
    }
}

#[test]
fn rows_follow_before_order_then_after_only_rows() {
    let before = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
    let after = RankedResults::from_pairs([("1", "c"), ("1", "a")]);
    let diff = build_diff(Some(&before), &after).unwrap();

    let docs: Vec<&str> = diff.rows.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(docs, vec!["a", "b", "c"]);

    let dropped = find_row(&diff, "1", "b");
    assert_eq!(dropped.position_after, None);
    assert_eq!(dropped.position_delta, None);
    assert!((dropped.weight_delta + w2()).abs() < 1e-12);

    let added = find_row(&diff, "1", "c");
    assert_eq!(added.position_before, None);
    assert_eq!(added.position_delta, None);
    assert!((added.weight_delta - W1).abs() < 1e-12);
}

#[test]
fn single_result_against_empty_baseline() {
    let after = RankedResults::from_pairs([("Query1", "1234"), ("Query1", "5678")]);
    let diff = build_diff(None, &after).unwrap();

    assert!((find_row(&diff, "Query1", "1234").weight_delta - 1.0).abs() < 1e-12);
    assert!((find_row(&diff, "Query1", "5678").weight_delta - 0.63093).abs() < 1e-5);
    assert!((diff.best_case_dcg_delta - (1.0 + w2())).abs() < 1e-12);
    assert!(diff.rows.iter().all(|r| r.position_delta.is_none()));
}

#[test]
fn unchanged_positions_carry_no_weight_delta() {
    let before = RankedResults::from_pairs([("1", "a"), ("1", "b"), ("1", "c")]);
    let after = RankedResults::from_pairs([("1", "a"), ("1", "c"), ("1", "b")]);
    let diff = build_diff(Some(&before), &after).unwrap();

    let same = find_row(&diff, "1", "a");
    assert_eq!(same.position_delta, Some(0));
    assert_eq!(same.weight_delta, 0.0);
    assert!(!same.is_changed());
    assert_eq!(diff.num_changed, 2);
    assert_eq!(diff.changed_rows().count(), 2);
}

#[test]
fn lists_are_truncated_to_top_five_per_query() {
    let before = RankedResults::from_pairs((0..6).map(|i| ("1", format!("d{i}"))));
    let after = RankedResults::from_pairs([5, 1, 2, 3, 4, 0].map(|i| ("1", format!("d{i}"))));
    let diff = build_diff(Some(&before), &after).unwrap();

    // d5 enters at position 1, d0 falls out of the top five.
    assert_eq!(diff.rows.len(), 6);
    assert_eq!(find_row(&diff, "1", "d0").position_after, None);
    assert!((find_row(&diff, "1", "d5").weight_delta - dcg_weight(1)).abs() < 1e-12);
}

#[test]
fn mismatched_lengths_are_rejected() {
    let before = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
    let after = RankedResults::from_pairs([("1", "a")]);
    let err = build_diff(Some(&before), &after).unwrap_err();
    assert!(matches!(err, SimulationError::InputShape { .. }));
}

#[test]
fn duplicate_rows_are_rejected() {
    let before = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
    let after = RankedResults::from_pairs([("1", "a"), ("1", "a")]);
    let err = build_diff(Some(&before), &after).unwrap_err();
    assert!(matches!(err, SimulationError::InputShape { .. }));
}
