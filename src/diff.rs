//! Ranking diff builder.
//!
//! For a (before, after) pair of ranked lists, every (query, document) in the
//! union of both top-5 lists gets its DCG weight on each side and the delta.
//! Documents missing from a side contribute weight 0 there.
//!
//! The delta of the aggregate DCG between the two rankings is, for binary
//! grades g:
//!
//! ```text
//! delta_dcg = sum over changed rows of weight_delta * g
//! ```
//!
//! so the best case (everything that moved up is relevant, everything that
//! moved down is not) is the sum of the positive weight deltas.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{SimResult, SimulationError};
use crate::results::{dcg_weight, RankedResults, TOP_K};

/// Starting value of the rels / not_rels accumulators.
pub const ACCUMULATOR_EPSILON: f64 = 0.001;

/// One (query, document) row of a ranking diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRow {
    pub query_id: String,
    pub document_id: String,
    /// 1-based position in the before list, `None` when not ranked.
    pub position_before: Option<usize>,
    /// 1-based position in the after list, `None` when not ranked.
    pub position_after: Option<usize>,
    pub weight_before: f64,
    pub weight_after: f64,
    pub weight_delta: f64,
    /// `position_after - position_before`, defined only when ranked on both sides.
    pub position_delta: Option<i64>,
    /// Scratch label for the current Monte-Carlo round.
    #[serde(skip)]
    pub grade: bool,
    pub rels: f64,
    pub not_rels: f64,
    /// Final convergence statistic (Beta standard deviation before normalization).
    pub std_dev: f64,
}

impl DiffRow {
    fn new(
        query_id: String,
        document_id: String,
        position_before: Option<usize>,
        position_after: Option<usize>,
    ) -> Self {
        let weight_before = position_before.map(dcg_weight).unwrap_or(0.0);
        let weight_after = position_after.map(dcg_weight).unwrap_or(0.0);
        let position_delta = match (position_before, position_after) {
            (Some(b), Some(a)) => Some(a as i64 - b as i64),
            _ => None,
        };
        Self {
            query_id,
            document_id,
            position_before,
            position_after,
            weight_before,
            weight_after,
            weight_delta: weight_after - weight_before,
            position_delta,
            grade: false,
            rels: ACCUMULATOR_EPSILON,
            not_rels: ACCUMULATOR_EPSILON,
            std_dev: 0.0,
        }
    }

    pub fn weight_delta_abs(&self) -> f64 {
        self.weight_delta.abs()
    }

    pub fn is_changed(&self) -> bool {
        self.weight_delta != 0.0
    }

    pub fn moved_up(&self) -> bool {
        self.weight_delta > 0.0
    }
}

/// All rows of one (before, after) diff plus the per-diff constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingDiff {
    pub rows: Vec<DiffRow>,
    /// Aggregate DCG delta if every upward move were relevant and every downward move not.
    pub best_case_dcg_delta: f64,
    /// Rows with a non-zero weight delta.
    pub num_changed: usize,
    /// Distinct queries folded into the aggregate metric.
    pub num_queries: usize,
}

impl RankingDiff {
    pub fn changed_rows(&self) -> impl Iterator<Item = &DiffRow> {
        self.rows.iter().filter(|row| row.is_changed())
    }

    /// Position unchanged must mean weight unchanged.
    pub fn check_position_invariant(&self) -> SimResult<()> {
        for row in &self.rows {
            if row.position_delta == Some(0) && row.weight_delta != 0.0 {
                return Err(SimulationError::invariant(format!(
                    "query {} doc {}: position unchanged but weight delta {}",
                    row.query_id, row.document_id, row.weight_delta
                )));
            }
        }
        Ok(())
    }
}

/// Build the diff between two rankings. `before = None` diffs `after` against
/// an empty ranking, so every weight delta equals the after weight.
pub fn build_diff(before: Option<&RankedResults>, after: &RankedResults) -> SimResult<RankingDiff> {
    let after = after.truncated(TOP_K);
    let before = before.map(|b| b.truncated(TOP_K));

    if let Some(before) = &before {
        if before.len() != after.len() {
            return Err(SimulationError::input_shape(format!(
                "before has {} top-{TOP_K} rows, after has {}",
                before.len(),
                after.len()
            )));
        }
    }

    let after_positions = positions(&after)?;
    let before_positions = match &before {
        Some(before) => positions(before)?,
        None => HashMap::new(),
    };

    let mut rows = Vec::with_capacity(after.len() * 2);
    if let Some(before) = &before {
        for (row, position) in before.with_positions() {
            let key = (row.query_id.as_str(), row.document_id.as_str());
            rows.push(DiffRow::new(
                row.query_id.clone(),
                row.document_id.clone(),
                Some(position),
                after_positions.get(&key).copied(),
            ));
        }
    }
    for (row, position) in after.with_positions() {
        let key = (row.query_id.as_str(), row.document_id.as_str());
        if before_positions.contains_key(&key) {
            continue;
        }
        rows.push(DiffRow::new(
            row.query_id.clone(),
            row.document_id.clone(),
            None,
            Some(position),
        ));
    }

    let best_case_dcg_delta = rows
        .iter()
        .filter(|row| row.moved_up())
        .map(|row| row.weight_delta)
        .sum();
    let num_changed = rows.iter().filter(|row| row.is_changed()).count();
    let num_queries = rows
        .iter()
        .map(|row| row.query_id.as_str())
        .collect::<HashSet<_>>()
        .len();

    let diff = RankingDiff {
        rows,
        best_case_dcg_delta,
        num_changed,
        num_queries,
    };
    diff.check_position_invariant()?;
    Ok(diff)
}

fn positions(results: &RankedResults) -> SimResult<HashMap<(&str, &str), usize>> {
    let mut map = HashMap::with_capacity(results.len());
    for (row, position) in results.with_positions() {
        let key = (row.query_id.as_str(), row.document_id.as_str());
        if map.insert(key, position).is_some() {
            return Err(SimulationError::input_shape(format!(
                "document {} listed twice for query {}",
                row.document_id, row.query_id
            )));
        }
    }
    Ok(map)
}
