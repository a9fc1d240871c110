//! Monte-Carlo relevance estimator.
//!
//! Given one ranking diff and the observed aggregate DCG delta, repeatedly
//! sample binary labels for the changed rows ("universes"), weigh each
//! universe by how well it reproduces the observed delta, and accumulate that
//! weight into each row's `rels` (labelled relevant) or `not_rels` (labelled
//! not relevant). The sampling bias `prob_positive` (chance that a row which
//! moved up is relevant) is nudged every round toward whichever direction
//! closes the gap between simulated and observed deltas.
//!
//! Stops once every changed row's Beta(rels, not_rels) standard deviation is
//! at or below `converge_std_dev` and at least `min_rounds` have run, or at
//! the `max_rounds` ceiling.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diff::RankingDiff;
use crate::error::{SimResult, SimulationError};
use crate::universe::{beta_variance, likelihood_not_random, UniverseProbabilityCache};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Floor on rounds before convergence may stop the loop.
    pub min_rounds: usize,
    /// Hard ceiling; the loop stops here even if not converged.
    pub max_rounds: usize,
    /// Target Beta standard deviation for every changed row.
    pub converge_std_dev: f64,
    /// Spread of the observed delta. `None` means `0.01 * sqrt(#queries)`.
    pub dcg_diff_std_dev: Option<f64>,
    /// Step size for nudging `prob_positive`.
    pub learning_rate: f64,
    /// Universes at or below this probability are neither accumulated into the
    /// rows nor counted in the normalizing denominator.
    pub accumulate_threshold: f64,
    /// Upper bound on memoized universe probabilities.
    pub memo_capacity: usize,
    /// Fixed seed for reproducible runs; entropy when `None`.
    pub rng_seed: Option<u64>,
    /// Emit a progress line every N rounds (0 disables).
    pub progress_every: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_rounds: 1000,
            max_rounds: 2_000_000,
            converge_std_dev: 0.02,
            dcg_diff_std_dev: None,
            learning_rate: 0.001,
            accumulate_threshold: 0.0,
            memo_capacity: 200_000,
            rng_seed: None,
            progress_every: 100,
        }
    }
}

impl EstimatorConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Standard deviation used for this diff.
    pub fn dcg_diff_std_dev_for(&self, diff: &RankingDiff) -> f64 {
        self.dcg_diff_std_dev
            .unwrap_or_else(|| 0.01 * (diff.num_queries as f64).sqrt())
    }
}

/// Per-diff outcome of one estimation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateSummary {
    pub actual_dcg_delta: f64,
    pub best_case_dcg_delta: f64,
    pub dcg_diff_std_dev: f64,
    /// Closed-form prior strength, see `likelihood_not_random`.
    pub likelihood_not_random: f64,
    /// `(final prob_positive - 0.5) * 2`.
    pub prob_not_random: f64,
    /// Total probability of the accumulated universes; the normalizing denominator.
    pub plausible_universes: f64,
    pub best_universe_prob: f64,
    pub rounds: usize,
    pub converged: bool,
    /// Largest Beta standard deviation across changed rows at stop time.
    pub max_std_dev: f64,
}

/// Run the Monte-Carlo loop over `diff`, filling `rels`, `not_rels` and
/// `std_dev` on every changed row.
///
/// On return `rels + not_rels` is close to 1 for each changed row.
pub fn estimate_relevance(
    diff: &mut RankingDiff,
    actual_dcg_delta: f64,
    cfg: &EstimatorConfig,
) -> SimResult<EstimateSummary> {
    let changed: Vec<usize> = diff
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.is_changed())
        .map(|(idx, _)| idx)
        .collect();
    if changed.is_empty() {
        return Err(SimulationError::EmptyDiff);
    }

    let mut rng = match cfg.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut memo = UniverseProbabilityCache::new(cfg.memo_capacity);
    let std_dev = cfg.dcg_diff_std_dev_for(diff);
    let likelihood = likelihood_not_random(diff, actual_dcg_delta);
    let converge_var = cfg.converge_std_dev * cfg.converge_std_dev;

    // likelihood 0 -> ~0.5 (uninformative), 1 -> ~0.99
    let mut prob_positive = ((likelihood / 2.0) + 0.5) - 0.01;
    let mut plausible_universe_prob = 0.0;
    let mut best_universe_prob: f64 = 0.0;
    let mut max_var = changed
        .iter()
        .map(|&idx| beta_variance(diff.rows[idx].rels, diff.rows[idx].not_rels))
        .fold(0.0, f64::max);

    let start = Instant::now();
    let mut rounds = 0usize;
    let converged = loop {
        let mut simulated_dcg_delta = 0.0;
        for &idx in &changed {
            let row = &mut diff.rows[idx];
            let p_relevant = if row.moved_up() {
                prob_positive
            } else {
                1.0 - prob_positive
            };
            row.grade = rng.gen::<f64>() < p_relevant;
            if row.grade {
                simulated_dcg_delta += row.weight_delta;
            }
        }

        let universe_prob = memo.probability(actual_dcg_delta, simulated_dcg_delta, std_dev);

        if universe_prob > cfg.accumulate_threshold {
            max_var = 0.0;
            for &idx in &changed {
                let row = &mut diff.rows[idx];
                if row.grade {
                    row.rels += universe_prob;
                } else {
                    row.not_rels += universe_prob;
                }
                max_var = max_var.max(beta_variance(row.rels, row.not_rels));
            }
            plausible_universe_prob += universe_prob;
        }

        let step = cfg.learning_rate
            * (1.0 - universe_prob)
            * sign(actual_dcg_delta - simulated_dcg_delta);
        prob_positive = (prob_positive + step).clamp(0.0, 1.0);
        best_universe_prob = best_universe_prob.max(universe_prob);

        if cfg.progress_every > 0 && rounds % cfg.progress_every == 0 {
            debug!(
                rounds,
                simulated = simulated_dcg_delta,
                actual = actual_dcg_delta,
                std_dev,
                universe_prob,
                plausible = plausible_universe_prob,
                max_std_dev = max_var.sqrt(),
                prob_positive,
                changed = changed.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "estimate round"
            );
        }
        rounds += 1;

        if rounds >= cfg.min_rounds && max_var <= converge_var {
            break true;
        }
        if rounds >= cfg.max_rounds.max(cfg.min_rounds) {
            warn!(
                rounds,
                max_std_dev = max_var.sqrt(),
                target = cfg.converge_std_dev,
                "round ceiling reached before convergence"
            );
            break false;
        }
    };

    if plausible_universe_prob <= 0.0 {
        return Err(SimulationError::DegenerateProbability {
            actual_dcg_delta,
            std_dev,
            rounds,
        });
    }

    for row in diff.rows.iter_mut() {
        row.std_dev = beta_variance(row.rels, row.not_rels).sqrt();
        row.rels /= plausible_universe_prob;
        row.not_rels /= plausible_universe_prob;
        row.grade = false;
    }

    debug!(
        memo_entries = memo.len(),
        memo_hits = memo.hits(),
        memo_misses = memo.misses(),
        "universe probability memo"
    );

    Ok(EstimateSummary {
        actual_dcg_delta,
        best_case_dcg_delta: diff.best_case_dcg_delta,
        dcg_diff_std_dev: std_dev,
        likelihood_not_random: likelihood,
        prob_not_random: (prob_positive - 0.5) * 2.0,
        plausible_universes: plausible_universe_prob,
        best_universe_prob,
        rounds,
        converged,
        max_std_dev: max_var.sqrt(),
    })
}

fn sign(x: f64) -> f64 {
    if x < 0.0 {
        -1.0
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::build_diff;
    use crate::results::RankedResults;

    #[test]
    fn sign_treats_zero_as_positive() {
        assert_eq!(sign(0.0), 1.0);
        assert_eq!(sign(-1e-9), -1.0);
    }

    #[test]
    fn unreachable_delta_is_degenerate() {
        let before = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
        let after = RankedResults::from_pairs([("1", "b"), ("1", "a")]);
        let mut diff = build_diff(Some(&before), &after).unwrap();
        let cfg = EstimatorConfig {
            min_rounds: 50,
            max_rounds: 50,
            ..EstimatorConfig::default()
        }
        .with_seed(7);
        let err = estimate_relevance(&mut diff, 25.0, &cfg).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::DegenerateProbability { rounds: 50, .. }
        ));
    }

    #[test]
    fn unchanged_diff_is_rejected() {
        let same = RankedResults::from_pairs([("1", "a"), ("1", "b")]);
        let mut diff = build_diff(Some(&same), &same).unwrap();
        let err = estimate_relevance(&mut diff, 0.1, &EstimatorConfig::default()).unwrap_err();
        assert!(matches!(err, SimulationError::EmptyDiff));
    }
}
