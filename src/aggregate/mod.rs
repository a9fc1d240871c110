//! Multi-run aggregation.
//!
//! Given several submissions with known NDCG@5, diff each improving pair,
//! estimate relevance per diff, and pool every diff's rows into one graded
//! judgment per (query, document):
//! - `pairs`: which pairs to diff and how informative each one is
//! - `run`: parallel, cached, traced estimation over the planned pairs
//! - `grading`: information-weighted pooling and top-k extraction

pub mod grading;
pub mod pairs;
pub mod run;

pub use grading::{grade_judgments, information_amount, top_k_submission, GradingConfig, Judgment};
pub use pairs::{
    actual_dcg_delta, plan_pairs, summarize_pair, DiffPair, PairSummary, PairingStrategy,
};
pub use run::{
    check_pair_postconditions, pooled_rows, run_diffs, simulate_judgments, AggregatorConfig,
    PairEstimate,
};
