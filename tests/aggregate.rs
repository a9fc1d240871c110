use relevance_sim::aggregate::{
    check_pair_postconditions, grade_judgments, plan_pairs, pooled_rows, run_diffs,
    simulate_judgments, top_k_submission, AggregatorConfig, GradingConfig, PairingStrategy,
};
use relevance_sim::cache::MemoryDiffCache;
use relevance_sim::estimator::EstimatorConfig;
use relevance_sim::results::{RankedResults, Submission, IDEAL_DCG_AT_5};
use relevance_sim::SimulationError;

fn w2() -> f64 {
    1.0 / 3f64.log2()
}

fn submission(name: &str, pairs: &[(&str, &str)], metric: f64) -> Submission {
    Submission::new(name, RankedResults::from_pairs(pairs.iter().copied()), metric)
}

/// NDCG@5 of one query whose only relevant doc sits at `position`.
fn single_relevant_metric(position: usize) -> f64 {
    (1.0 / (position as f64 + 1.0).log2()) / IDEAL_DCG_AT_5
}

fn best_case_pair() -> Vec<Submission> {
    vec![
        submission(
            "before",
            &[("1", "1234"), ("1", "5678")],
            single_relevant_metric(2),
        ),
        submission(
            "after",
            &[("1", "5678"), ("1", "1234")],
            single_relevant_metric(1),
        ),
    ]
}

fn seeded_config(seed: u64) -> AggregatorConfig {
    AggregatorConfig {
        parallel: 2,
        estimator: EstimatorConfig::default().with_seed(seed),
        ..AggregatorConfig::default()
    }
}

#[test]
fn chain_pairs_sorted_neighbours_and_skips_ties() {
    let subs = vec![
        submission("c", &[("1", "a")], 0.3),
        submission("a", &[("1", "a")], 0.1),
        submission("b", &[("1", "a")], 0.2),
        submission("b2", &[("1", "a")], 0.2),
    ];
    let pairs = plan_pairs(&subs, PairingStrategy::Chain, false);
    let names: Vec<(Option<&str>, &str)> = pairs
        .iter()
        .map(|p| (p.before_name(), p.after.name.as_str()))
        .collect();
    assert_eq!(names, vec![(Some("a"), "b"), (Some("b2"), "c")]);
}

#[test]
fn all_pairs_orients_lower_metric_as_before() {
    let subs = vec![
        submission("c", &[("1", "a")], 0.3),
        submission("a", &[("1", "a")], 0.1),
        submission("b", &[("1", "a")], 0.2),
    ];
    let pairs = plan_pairs(&subs, PairingStrategy::AllPairs, false);
    assert_eq!(pairs.len(), 3);
    for pair in &pairs {
        assert!(pair.metric_delta() > 0.0);
    }

    let with_baseline = plan_pairs(&subs, PairingStrategy::AllPairs, true);
    assert_eq!(with_baseline.len(), 6);
    assert_eq!(
        with_baseline.iter().filter(|p| p.before.is_none()).count(),
        3
    );
}

#[tokio::test]
async fn best_case_pair_yields_decisive_judgments() {
    let subs = best_case_pair();
    let cfg = seeded_config(21);
    let (estimates, judgments) = simulate_judgments(&subs, &cfg, None, None).await.unwrap();

    assert_eq!(estimates.len(), 1);
    let summary = &estimates[0].summary;
    assert!((summary.actual_dcg_delta - (1.0 - w2())).abs() < 1e-9);
    assert!((summary.likelihood_not_random - 1.0).abs() < 1e-6);
    // The swap shifts the same weight up and down.
    assert!((summary.weight_moved - 2.0 * summary.best_case_dcg_delta).abs() < 1e-12);

    let up = judgments.iter().find(|j| j.document_id == "5678").unwrap();
    let down = judgments.iter().find(|j| j.document_id == "1234").unwrap();
    assert!(up.grade > 0.95);
    assert!(down.grade < 0.05);

    let top = top_k_submission(&judgments, 1);
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].document_id, "5678");
}

#[tokio::test]
async fn every_estimated_pair_passes_postconditions() {
    // b and d are the relevant docs; each query's metric is averaged over two queries.
    let two_queries = |p1: usize, p2: usize| {
        (single_relevant_metric(p1) + single_relevant_metric(p2)) / 2.0
    };
    let subs = vec![
        submission(
            "s0",
            &[("1", "a"), ("1", "b"), ("2", "c"), ("2", "d")],
            two_queries(2, 2),
        ),
        submission(
            "s1",
            &[("1", "b"), ("1", "a"), ("2", "c"), ("2", "d")],
            two_queries(1, 2),
        ),
        submission(
            "s2",
            &[("1", "b"), ("1", "a"), ("2", "d"), ("2", "c")],
            two_queries(1, 1),
        ),
    ];
    let cfg = AggregatorConfig {
        strategy: PairingStrategy::AllPairs,
        ..seeded_config(22)
    };
    let estimates = run_diffs(&subs, &cfg, None, None).await.unwrap();
    assert_eq!(estimates.len(), 3);
    for estimate in &estimates {
        for row in &estimate.rows {
            assert!(row.is_changed());
            assert!(row.rels + row.not_rels > 0.95);
        }
    }
    assert!(pooled_rows(&estimates).count() >= 6);
}

#[tokio::test]
async fn cached_pairs_are_reused() {
    let subs = best_case_pair();
    let cfg = seeded_config(23);
    let cache = MemoryDiffCache::new();

    let first = run_diffs(&subs, &cfg, Some(&cache), None).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert!(!first[0].cached);

    let second = run_diffs(&subs, &cfg, Some(&cache), None).await.unwrap();
    assert!(second[0].cached);
    assert_eq!(first[0].rows, second[0].rows);
    assert_eq!(first[0].estimate, second[0].estimate);
}

#[tokio::test]
async fn cached_pair_with_changed_rankings_is_recomputed() {
    let cfg = seeded_config(29);
    let cache = MemoryDiffCache::new();
    let first = run_diffs(&best_case_pair(), &cfg, Some(&cache), None)
        .await
        .unwrap();
    assert!(!first[0].cached);

    // Same submission names, different documents.
    let changed = vec![
        submission(
            "before",
            &[("1", "1234"), ("1", "9999")],
            single_relevant_metric(2),
        ),
        submission(
            "after",
            &[("1", "9999"), ("1", "1234")],
            single_relevant_metric(1),
        ),
    ];
    let second = run_diffs(&changed, &cfg, Some(&cache), None).await.unwrap();
    assert!(!second[0].cached);
    assert!(second[0].rows.iter().any(|r| r.document_id == "9999"));
    assert!(second[0].rows.iter().all(|r| r.document_id != "5678"));

    let third = run_diffs(&changed, &cfg, Some(&cache), None).await.unwrap();
    assert!(third[0].cached);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn failing_pair_is_named_in_the_error() {
    let subs = vec![
        submission("short", &[("1", "a")], 0.1),
        submission("long", &[("1", "a"), ("1", "b")], 0.2),
    ];
    let err = run_diffs(&subs, &seeded_config(24), None, None)
        .await
        .unwrap_err();
    match err {
        SimulationError::PairFailed { before, after, source } => {
            assert_eq!(before, "short");
            assert_eq!(after, "long");
            assert!(matches!(*source, SimulationError::InputShape { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_metric_delta_surfaces_as_degenerate() {
    let subs = vec![
        submission("before", &[("1", "1234"), ("1", "5678")], 0.0),
        submission("after", &[("1", "5678"), ("1", "1234")], 1.0),
    ];
    let mut cfg = seeded_config(25);
    cfg.estimator.min_rounds = 50;
    cfg.estimator.max_rounds = 50;
    let err = run_diffs(&subs, &cfg, None, None).await.unwrap_err();
    match err {
        SimulationError::PairFailed { source, .. } => {
            assert!(matches!(*source, SimulationError::DegenerateProbability { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn uninformative_pairs_are_skipped() {
    let subs = best_case_pair();
    let cfg = AggregatorConfig {
        min_likelihood_not_random: 1.5,
        ..seeded_config(26)
    };
    let estimates = run_diffs(&subs, &cfg, None, None).await.unwrap();
    assert!(estimates.is_empty());
}

#[tokio::test]
async fn duplicate_diffs_keep_grade_order_and_sharpen_confidence() {
    let subs = best_case_pair();
    let estimates = run_diffs(&subs, &seeded_config(27), None, None)
        .await
        .unwrap();
    let grading = GradingConfig::default();

    let once = grade_judgments(pooled_rows(&estimates), &grading);
    let twice = grade_judgments(
        pooled_rows(&estimates).chain(pooled_rows(&estimates)),
        &grading,
    );

    let order = |js: &[relevance_sim::Judgment]| {
        top_k_submission(js, 5)
            .into_iter()
            .map(|r| r.document_id)
            .collect::<Vec<_>>()
    };
    assert_eq!(order(&once[..]), order(&twice[..]));
    for (a, b) in once.iter().zip(&twice) {
        assert!((a.grade - b.grade).abs() < 1e-12);
        assert!(b.grade_std_dev <= a.grade_std_dev);
    }
}

#[test]
fn postconditions_reject_unnormalized_rows() {
    let before = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
    let after = RankedResults::from_pairs([("1", "b"), ("1", "a")]);
    let diff = relevance_sim::build_diff(Some(&before), &after).unwrap();
    let err = check_pair_postconditions(&diff).unwrap_err();
    assert!(matches!(err, SimulationError::InvariantViolation { .. }));
}
