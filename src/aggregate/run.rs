//! Run the estimator over every planned pair, in parallel, with caching.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::grading::{grade_judgments, GradingConfig, Judgment};
use super::pairs::{plan_pairs, summarize_pair, DiffPair, PairSummary, PairingStrategy};
use crate::cache::{CachedDiff, DiffCache, DiffCacheKey};
use crate::diff::{build_diff, DiffRow, RankingDiff};
use crate::error::{SimResult, SimulationError};
use crate::estimator::{estimate_relevance, EstimateSummary, EstimatorConfig};
use crate::results::Submission;
use crate::trace::{now_epoch_ms, PairOutcome, PairTrace, TraceSink};

/// Changed rows must carry at least this much normalized mass.
const MIN_NORMALIZED_MASS: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub strategy: PairingStrategy,
    /// Pairs estimated concurrently.
    pub parallel: usize,
    /// Skip pairs whose `likelihood_not_random` is below this.
    pub min_likelihood_not_random: f64,
    /// Also diff against the virtual empty ranking (metric 0).
    pub from_scratch_baseline: bool,
    pub estimator: EstimatorConfig,
    pub grading: GradingConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            strategy: PairingStrategy::default(),
            parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            min_likelihood_not_random: 0.0,
            from_scratch_baseline: false,
            estimator: EstimatorConfig::default(),
            grading: GradingConfig::default(),
        }
    }
}

/// Estimated rows of one pair, restricted to rows whose rank changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairEstimate {
    pub summary: PairSummary,
    pub estimate: EstimateSummary,
    pub rows: Vec<DiffRow>,
    pub cached: bool,
}

/// Every changed row of every pair, in plan order.
pub fn pooled_rows(estimates: &[PairEstimate]) -> impl Iterator<Item = &DiffRow> {
    estimates.iter().flat_map(|e| e.rows.iter())
}

/// Diff and estimate every improving pair of `submissions`.
///
/// Pairs run concurrently (up to `cfg.parallel`), each on the blocking pool.
/// The first failing pair in plan order is returned as `PairFailed`.
pub async fn run_diffs(
    submissions: &[Submission],
    cfg: &AggregatorConfig,
    cache: Option<&dyn DiffCache>,
    trace: Option<&dyn TraceSink>,
) -> SimResult<Vec<PairEstimate>> {
    let plan = plan_pairs(submissions, cfg.strategy, cfg.from_scratch_baseline);
    info!(
        pairs = plan.len(),
        submissions = submissions.len(),
        strategy = ?cfg.strategy,
        parallel = cfg.parallel,
        "planned diffs"
    );

    let mut results: Vec<(usize, SimResult<Option<PairEstimate>>)> = stream::iter(
        plan.into_iter().enumerate().map(|(idx, pair)| async move {
            (idx, run_pair(idx, pair, cfg, cache, trace).await)
        }),
    )
    .buffer_unordered(cfg.parallel.max(1))
    .collect()
    .await;
    results.sort_by_key(|(idx, _)| *idx);

    let mut estimates = Vec::with_capacity(results.len());
    for (_, result) in results {
        if let Some(estimate) = result? {
            estimates.push(estimate);
        }
    }
    Ok(estimates)
}

/// `run_diffs` followed by `grade_judgments` over the pooled rows.
pub async fn simulate_judgments(
    submissions: &[Submission],
    cfg: &AggregatorConfig,
    cache: Option<&dyn DiffCache>,
    trace: Option<&dyn TraceSink>,
) -> SimResult<(Vec<PairEstimate>, Vec<Judgment>)> {
    let estimates = run_diffs(submissions, cfg, cache, trace).await?;
    let judgments = grade_judgments(pooled_rows(&estimates), &cfg.grading);
    Ok((estimates, judgments))
}

async fn run_pair(
    idx: usize,
    pair: DiffPair<'_>,
    cfg: &AggregatorConfig,
    cache: Option<&dyn DiffCache>,
    trace: Option<&dyn TraceSink>,
) -> SimResult<Option<PairEstimate>> {
    let started = Instant::now();
    let key = DiffCacheKey::new(pair.before_name(), &pair.after.name);

    let diff = build_diff(pair.before.map(|s| &s.results), &pair.after.results);
    let diff = match diff {
        Ok(diff) => diff,
        Err(err) => {
            record(trace, failed_trace(idx, &pair, &key, &err, started));
            return Err(err.for_pair(pair.before_name(), &pair.after.name));
        }
    };
    let summary = summarize_pair(&pair, &diff);

    if summary.likelihood_not_random < cfg.min_likelihood_not_random {
        info!(
            before = pair.before_name().unwrap_or("<empty>"),
            after = %pair.after.name,
            likelihood_not_random = summary.likelihood_not_random,
            "skipping uninformative pair"
        );
        record(
            trace,
            pair_trace(idx, &key, &summary, None, PairOutcome::Skipped, started),
        );
        return Ok(None);
    }

    match estimate_pair(&pair, diff, &summary, cfg, cache, &key).await {
        Ok((diff, estimate, cached)) => {
            info!(
                before = pair.before_name().unwrap_or("<empty>"),
                after = %pair.after.name,
                cached,
                rounds = estimate.rounds,
                converged = estimate.converged,
                plausible = estimate.plausible_universes,
                prob_not_random = estimate.prob_not_random,
                "pair estimated"
            );
            let outcome = if cached {
                PairOutcome::Cached
            } else {
                PairOutcome::Estimated
            };
            record(
                trace,
                pair_trace(idx, &key, &summary, Some(&estimate), outcome, started),
            );
            Ok(Some(PairEstimate {
                summary,
                estimate,
                rows: diff.rows.into_iter().filter(|r| r.is_changed()).collect(),
                cached,
            }))
        }
        Err(err) => {
            record(trace, failed_trace(idx, &pair, &key, &err, started));
            Err(err.for_pair(pair.before_name(), &pair.after.name))
        }
    }
}

async fn estimate_pair(
    pair: &DiffPair<'_>,
    mut diff: RankingDiff,
    summary: &PairSummary,
    cfg: &AggregatorConfig,
    cache: Option<&dyn DiffCache>,
    key: &DiffCacheKey,
) -> SimResult<(RankingDiff, EstimateSummary, bool)> {
    if let Some(cache) = cache {
        match cache.get(key).await {
            Ok(Some(hit)) if same_rankings(&hit.diff, &diff) => {
                check_pair_postconditions(&hit.diff)?;
                return Ok((hit.diff, hit.summary, true));
            }
            Ok(Some(_)) => warn!(
                key = %key.key_hash,
                "Cached diff does not match the submissions; recomputing"
            ),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Cache read failed; recomputing diff"),
        }
    }

    let mut est_cfg = cfg.estimator.clone();
    est_cfg.rng_seed = cfg
        .estimator
        .rng_seed
        .map(|seed| pair_seed(seed, pair.before_name(), &pair.after.name));
    let actual = summary.actual_dcg_delta;

    let (diff, estimate) = tokio::task::spawn_blocking(move || {
        let estimate = estimate_relevance(&mut diff, actual, &est_cfg)?;
        Ok::<_, SimulationError>((diff, estimate))
    })
    .await
    .map_err(|e| SimulationError::Join(e.to_string()))??;

    check_pair_postconditions(&diff)?;

    if let Some(cache) = cache {
        let entry = CachedDiff {
            diff: diff.clone(),
            summary: estimate.clone(),
        };
        if let Err(err) = cache.put(key, &entry).await {
            warn!(error = %err, "Cache write failed; continuing without caching");
        }
    }
    Ok((diff, estimate, false))
}

/// Position invariant plus near-normalized mass on every changed row.
pub fn check_pair_postconditions(diff: &RankingDiff) -> SimResult<()> {
    diff.check_position_invariant()?;
    for row in diff.changed_rows() {
        let mass = row.rels + row.not_rels;
        if !(mass > MIN_NORMALIZED_MASS) {
            return Err(SimulationError::invariant(format!(
                "query {} doc {}: rels + not_rels = {mass:.4} after normalization",
                row.query_id, row.document_id
            )));
        }
    }
    Ok(())
}

/// Cache keys only name the submissions, so a hit is reused only when its rows
/// carry the same documents at the same positions as a fresh diff.
fn same_rankings(cached: &RankingDiff, fresh: &RankingDiff) -> bool {
    cached.rows.len() == fresh.rows.len()
        && cached.rows.iter().zip(&fresh.rows).all(|(a, b)| {
            a.query_id == b.query_id
                && a.document_id == b.document_id
                && a.position_before == b.position_before
                && a.position_after == b.position_after
        })
}

/// Seed for one pair, stable across scheduling order.
fn pair_seed(seed: u64, before: Option<&str>, after: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    before.hash(&mut hasher);
    after.hash(&mut hasher);
    hasher.finish()
}

fn record(trace: Option<&dyn TraceSink>, event: PairTrace) {
    if let Some(trace) = trace {
        if let Err(err) = trace.record(event) {
            warn!(error = %err, "Failed to record pair trace");
        }
    }
}

fn pair_trace(
    idx: usize,
    key: &DiffCacheKey,
    summary: &PairSummary,
    estimate: Option<&EstimateSummary>,
    outcome: PairOutcome,
    started: Instant,
) -> PairTrace {
    PairTrace {
        timestamp_ms: now_epoch_ms(),
        pair_index: idx,
        before: summary.before.clone(),
        after: summary.after.clone(),
        cache_key_hash: key.key_hash.clone(),
        metric_before: summary.metric_before,
        metric_after: summary.metric_after,
        actual_dcg_delta: summary.actual_dcg_delta,
        best_case_dcg_delta: summary.best_case_dcg_delta,
        num_changed: summary.num_changed,
        likelihood_not_random: summary.likelihood_not_random,
        prob_not_random: estimate.map(|e| e.prob_not_random),
        plausible_universes: estimate.map(|e| e.plausible_universes),
        rounds: estimate.map(|e| e.rounds),
        converged: estimate.map(|e| e.converged),
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

fn failed_trace(
    idx: usize,
    pair: &DiffPair<'_>,
    key: &DiffCacheKey,
    err: &SimulationError,
    started: Instant,
) -> PairTrace {
    PairTrace {
        timestamp_ms: now_epoch_ms(),
        pair_index: idx,
        before: pair.before_name().map(str::to_string),
        after: pair.after.name.clone(),
        cache_key_hash: key.key_hash.clone(),
        metric_before: pair.metric_before(),
        metric_after: pair.after.metric,
        actual_dcg_delta: 0.0,
        best_case_dcg_delta: 0.0,
        num_changed: 0,
        likelihood_not_random: 0.0,
        prob_not_random: None,
        plausible_universes: None,
        rounds: None,
        converged: None,
        outcome: PairOutcome::Failed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: Some(err.to_string()),
    }
}
