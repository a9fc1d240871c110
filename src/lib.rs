#![forbid(unsafe_code)]

//! # relevance-sim
//!
//! Infer per-(query, document) relevance judgments from nothing but ranked
//! submissions and their aggregate NDCG@5 scores.
//!
//! Two submissions that differ only in a few top-5 positions, and whose NDCG@5
//! differs by a known amount, constrain which of the moved documents can be
//! relevant. This crate diffs such pairs, samples binary relevance labels for
//! the changed rows by Monte-Carlo ("universes"), weighs each universe by how
//! well it reproduces the observed DCG delta, and pools the evidence from many
//! pairs into graded judgments with uncertainty.
//!
//! Entry points: [`build_diff`] + [`estimate_relevance`] for one pair,
//! [`run_diffs`] / [`simulate_judgments`] for a set of submissions.

pub mod aggregate;
pub mod cache;
pub mod diff;
pub mod error;
pub mod estimator;
pub mod evaluation;
pub mod results;
pub mod trace;
pub mod universe;

pub use aggregate::{
    grade_judgments, plan_pairs, run_diffs, simulate_judgments, top_k_submission,
    AggregatorConfig, GradingConfig, Judgment, PairEstimate, PairSummary, PairingStrategy,
};
pub use cache::{
    CachedDiff, DiffCache, DiffCacheKey, MemoryDiffCache, SqliteDiffCache, ALGORITHM_VERSION,
};
pub use diff::{build_diff, DiffRow, RankingDiff};
pub use error::{SimResult, SimulationError};
pub use estimator::{estimate_relevance, EstimateSummary, EstimatorConfig};
pub use results::{
    load_results_csv, parse_results_csv, RankedResult, RankedResults, Submission,
    IDEAL_DCG_AT_5, TOP_K,
};
pub use trace::{JsonlTraceSink, PairOutcome, PairTrace, TraceError, TraceSink, TraceWorker};
pub use universe::{
    beta_variance, likelihood_not_random, universe_probability, UniverseProbabilityCache,
};
