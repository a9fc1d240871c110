//! Universe probability model.
//!
//! A "universe" is one full assignment of binary relevance labels to the
//! changed rows of a diff. Its plausibility is the overlap between two normal
//! distributions with a shared standard deviation, one centred on the
//! observed DCG delta and one on the delta that universe would produce.

use std::collections::HashMap;
use std::f64::consts::SQRT_2;

use statrs::function::erf::erf;

use crate::diff::RankingDiff;

/// Beyond this many standard deviations the overlap is treated as zero.
const CUTOFF_STD_DEVS: f64 = 3.0;

/// Overlapping coefficient of N(actual, sd) and N(simulated, sd).
///
/// 1.0 when the means coincide, decaying toward 0 as they diverge.
pub fn universe_probability(actual_delta: f64, simulated_delta: f64, std_dev: f64) -> f64 {
    let gap = (actual_delta - simulated_delta).abs();
    if std_dev <= 0.0 {
        return if gap == 0.0 { 1.0 } else { 0.0 };
    }
    if gap > CUTOFF_STD_DEVS * std_dev {
        return 0.0;
    }
    // OVL = 2 * Phi(-gap / (2 sd)) = 1 - erf(gap / (2 sd sqrt 2))
    (1.0 - erf(gap / (2.0 * std_dev * SQRT_2))).clamp(0.0, 1.0)
}

/// Memo over `universe_probability`, keyed by the exact bits of its arguments.
///
/// One instance per estimation task; it is not shared across threads.
#[derive(Debug)]
pub struct UniverseProbabilityCache {
    memo: HashMap<(u64, u64, u64), f64>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl UniverseProbabilityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            memo: HashMap::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    pub fn probability(&mut self, actual_delta: f64, simulated_delta: f64, std_dev: f64) -> f64 {
        let key = (
            actual_delta.to_bits(),
            simulated_delta.to_bits(),
            std_dev.to_bits(),
        );
        if let Some(&p) = self.memo.get(&key) {
            self.hits += 1;
            return p;
        }
        self.misses += 1;
        let p = universe_probability(actual_delta, simulated_delta, std_dev);
        // Full memo: keep computing, stop inserting.
        if self.memo.len() < self.capacity {
            self.memo.insert(key, p);
        }
        p
    }

    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// Closed-form guess at how far the observed delta is from a random labelling:
/// `num_changed ^ (actual / best_case) / num_changed`, clamped to [0, 1].
///
/// 1.0 when the observed delta equals the best case, approaching
/// `1 / num_changed` as the observed delta approaches zero.
pub fn likelihood_not_random(diff: &RankingDiff, actual_delta: f64) -> f64 {
    if diff.num_changed == 0 || diff.best_case_dcg_delta <= 0.0 {
        return 0.0;
    }
    let n = diff.num_changed as f64;
    let likelihood = n.powf(actual_delta / diff.best_case_dcg_delta) / n;
    if likelihood.is_finite() {
        likelihood.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Variance of a Beta(rels, not_rels) posterior.
pub fn beta_variance(rels: f64, not_rels: f64) -> f64 {
    let total = rels + not_rels;
    if total <= 0.0 {
        return 0.0;
    }
    (rels * not_rels) / (total * total * (1.0 + total))
}
