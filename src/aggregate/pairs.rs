//! Which (before, after) submission pairs to diff, and how informative each is.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::diff::{DiffRow, RankingDiff};
use crate::results::{Submission, IDEAL_DCG_AT_5};
use crate::universe::likelihood_not_random;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStrategy {
    /// Sort by metric and diff neighbours only: O(n) diffs.
    #[default]
    Chain,
    /// Diff every pair with distinct metrics, lower metric as `before`: O(n^2) diffs.
    AllPairs,
}

/// One improving pair. `before = None` is the virtual empty ranking with metric 0.
#[derive(Debug, Clone, Copy)]
pub struct DiffPair<'a> {
    pub before: Option<&'a Submission>,
    pub after: &'a Submission,
}

impl<'a> DiffPair<'a> {
    pub fn before_name(&self) -> Option<&'a str> {
        self.before.map(|s| s.name.as_str())
    }

    pub fn metric_before(&self) -> f64 {
        self.before.map(|s| s.metric).unwrap_or(0.0)
    }

    pub fn metric_delta(&self) -> f64 {
        self.after.metric - self.metric_before()
    }
}

/// Plan the improving pairs for `strategy`. Pairs whose metric does not go up
/// carry no evidence and are skipped.
pub fn plan_pairs(
    submissions: &[Submission],
    strategy: PairingStrategy,
    from_scratch_baseline: bool,
) -> Vec<DiffPair<'_>> {
    let mut order: Vec<&Submission> = submissions.iter().collect();
    order.sort_by(|a, b| a.metric.partial_cmp(&b.metric).unwrap_or(Ordering::Equal));

    let mut pairs = Vec::new();
    match strategy {
        PairingStrategy::Chain => {
            if from_scratch_baseline {
                if let Some(first) = order.first() {
                    push_if_improving(&mut pairs, None, *first);
                }
            }
            for window in order.windows(2) {
                push_if_improving(&mut pairs, Some(window[0]), window[1]);
            }
        }
        PairingStrategy::AllPairs => {
            if from_scratch_baseline {
                for after in &order {
                    push_if_improving(&mut pairs, None, *after);
                }
            }
            for (i, before) in order.iter().enumerate() {
                for after in &order[i + 1..] {
                    push_if_improving(&mut pairs, Some(*before), *after);
                }
            }
        }
    }
    pairs
}

fn push_if_improving<'a>(
    pairs: &mut Vec<DiffPair<'a>>,
    before: Option<&'a Submission>,
    after: &'a Submission,
) {
    let pair = DiffPair { before, after };
    if pair.metric_delta() > 0.0 {
        pairs.push(pair);
    } else {
        debug!(
            before = pair.before_name().unwrap_or("<empty>"),
            after = %pair.after.name,
            delta = pair.metric_delta(),
            "skipping non-improving pair"
        );
    }
}

/// Aggregate DCG delta implied by a mean NDCG@5 delta over `num_queries`.
pub fn actual_dcg_delta(num_queries: usize, metric_before: f64, metric_after: f64) -> f64 {
    num_queries as f64 * (metric_after - metric_before) * IDEAL_DCG_AT_5
}

/// How much a pair's diff can tell us, before running any simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSummary {
    pub before: Option<String>,
    pub after: String,
    pub metric_before: f64,
    pub metric_after: f64,
    pub ndcg_delta: f64,
    pub num_queries: usize,
    pub num_changed: usize,
    pub likelihood_not_random: f64,
    pub actual_dcg_delta: f64,
    pub dcg_delta_per_changed: f64,
    pub best_case_dcg_delta: f64,
    /// DCG weight shifted in either direction, summed over rows.
    pub weight_moved: f64,
}

pub fn summarize_pair(pair: &DiffPair<'_>, diff: &RankingDiff) -> PairSummary {
    let metric_before = pair.metric_before();
    let metric_after = pair.after.metric;
    let actual = actual_dcg_delta(diff.num_queries, metric_before, metric_after);
    let per_changed = if diff.num_changed > 0 {
        actual / diff.num_changed as f64
    } else {
        0.0
    };
    PairSummary {
        before: pair.before_name().map(str::to_string),
        after: pair.after.name.clone(),
        metric_before,
        metric_after,
        ndcg_delta: metric_after - metric_before,
        num_queries: diff.num_queries,
        num_changed: diff.num_changed,
        likelihood_not_random: likelihood_not_random(diff, actual),
        actual_dcg_delta: actual,
        dcg_delta_per_changed: per_changed,
        best_case_dcg_delta: diff.best_case_dcg_delta,
        weight_moved: diff.rows.iter().map(DiffRow::weight_delta_abs).sum(),
    }
}
