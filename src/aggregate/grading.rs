//! Pool per-pair estimates into one graded judgment per (query, document).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diff::DiffRow;
use crate::results::RankedResult;
use crate::universe::beta_variance;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingConfig {
    /// Base of the information weight. Large values make ambiguous rows negligible.
    pub skew: f64,
    /// |rels - not_rels| at which a row gets weight 1.
    pub midpoint: f64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            skew: 1e6,
            midpoint: 0.6,
        }
    }
}

/// `skew ^ (|rels - not_rels| - midpoint)`.
pub fn information_amount(row: &DiffRow, cfg: &GradingConfig) -> f64 {
    cfg.skew.powf((row.rels - row.not_rels).abs() - cfg.midpoint)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub query_id: String,
    pub document_id: String,
    pub rels: f64,
    pub not_rels: f64,
    pub grade: f64,
    pub grade_std_dev: f64,
}

/// Weight each row by `information_amount`, sum per (query, document), and
/// derive grade and its Beta standard deviation. Output is sorted by key.
pub fn grade_judgments<'a>(
    rows: impl IntoIterator<Item = &'a DiffRow>,
    cfg: &GradingConfig,
) -> Vec<Judgment> {
    let mut pooled: BTreeMap<(&'a str, &'a str), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let weight = information_amount(row, cfg);
        let entry = pooled
            .entry((row.query_id.as_str(), row.document_id.as_str()))
            .or_insert((0.0, 0.0));
        entry.0 += row.rels * weight;
        entry.1 += row.not_rels * weight;
    }

    pooled
        .into_iter()
        .map(|((query_id, document_id), (rels, not_rels))| {
            let total = rels + not_rels;
            let grade = if total > 0.0 { rels / total } else { 0.0 };
            Judgment {
                query_id: query_id.to_string(),
                document_id: document_id.to_string(),
                rels,
                not_rels,
                grade,
                grade_std_dev: beta_variance(rels, not_rels).sqrt(),
            }
        })
        .collect()
}

/// Per query, the `k` documents with the highest grade (ties by document id).
pub fn top_k_submission(judgments: &[Judgment], k: usize) -> Vec<RankedResult> {
    let mut by_query: BTreeMap<&str, Vec<&Judgment>> = BTreeMap::new();
    for judgment in judgments {
        by_query
            .entry(judgment.query_id.as_str())
            .or_default()
            .push(judgment);
    }

    let mut out = Vec::new();
    for (query_id, mut docs) in by_query {
        docs.sort_by(|a, b| {
            b.grade
                .partial_cmp(&a.grade)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        out.extend(docs.into_iter().take(k).map(|j| RankedResult {
            query_id: query_id.to_string(),
            document_id: j.document_id.clone(),
        }));
    }
    out
}
