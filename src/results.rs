//! Ranked result lists and named submissions.
//!
//! A `RankedResults` list is an ordered sequence of (QueryId, DocumentId) rows.
//! List order is rank order within each query; any rank column in the source
//! file is ignored.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SimResult, SimulationError};

/// Results per query considered by the DCG@5 weighting.
pub const TOP_K: usize = 5;

/// DCG@5 of a perfect top-5 ranking under `1 / log2(position + 1)`.
pub const IDEAL_DCG_AT_5: f64 = 2.948459119;

/// DCG weight of a 1-based position.
pub fn dcg_weight(position: usize) -> f64 {
    1.0 / (position as f64 + 1.0).log2()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankedResult {
    pub query_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedResults {
    rows: Vec<RankedResult>,
}

impl RankedResults {
    pub fn new(rows: Vec<RankedResult>) -> Self {
        Self { rows }
    }

    pub fn from_pairs<Q, D>(pairs: impl IntoIterator<Item = (Q, D)>) -> Self
    where
        Q: Into<String>,
        D: Into<String>,
    {
        Self {
            rows: pairs
                .into_iter()
                .map(|(q, d)| RankedResult {
                    query_id: q.into(),
                    document_id: d.into(),
                })
                .collect(),
        }
    }

    pub fn rows(&self) -> &[RankedResult] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep the first `k` rows of every query, preserving list order.
    pub fn truncated(&self, k: usize) -> Self {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut rows = Vec::with_capacity(self.rows.len().min(k * 64));
        for row in &self.rows {
            let count = seen.entry(row.query_id.as_str()).or_insert(0);
            *count += 1;
            if *count <= k {
                rows.push(row.clone());
            }
        }
        Self { rows }
    }

    /// Iterate rows with their 1-based position inside their query.
    pub fn with_positions(&self) -> impl Iterator<Item = (&RankedResult, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        self.rows.iter().map(move |row| {
            let count = counts.entry(row.query_id.as_str()).or_insert(0);
            *count += 1;
            (row, *count)
        })
    }
}

/// A named ranking plus its externally computed aggregate metric (NDCG@5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub name: String,
    pub results: RankedResults,
    pub metric: f64,
}

impl Submission {
    pub fn new(name: impl Into<String>, results: RankedResults, metric: f64) -> Self {
        Self {
            name: name.into(),
            results,
            metric,
        }
    }
}

pub fn load_results_csv(path: impl AsRef<Path>) -> SimResult<RankedResults> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    parse_results_csv(&raw).map_err(|err| match err {
        SimulationError::InputShape { message } => {
            SimulationError::input_shape(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

/// Parse a submission CSV with a header naming `QueryId` and `DocumentId` columns.
///
/// Fields may be quoted; inside quotes a doubled `""` is a literal quote and
/// commas or line breaks are part of the field. Unquoted fields are trimmed.
pub fn parse_results_csv(raw: &str) -> SimResult<RankedResults> {
    let mut records = split_csv_records(raw)?.into_iter();

    let (_, header) = records
        .next()
        .ok_or_else(|| SimulationError::input_shape("empty results file"))?;
    let columns: Vec<String> = header.into_iter().map(|c| c.to_ascii_lowercase()).collect();
    let find = |name: &str| {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SimulationError::input_shape(format!("missing column {name}")))
    };
    let query_col = find("queryid")?;
    let doc_col = find("documentid")?;

    let mut rows = Vec::new();
    for (line, mut fields) in records {
        if fields.len() != columns.len() {
            return Err(SimulationError::input_shape(format!(
                "line {line}: expected {} fields, found {}",
                columns.len(),
                fields.len()
            )));
        }
        rows.push(RankedResult {
            document_id: std::mem::take(&mut fields[doc_col]),
            query_id: std::mem::take(&mut fields[query_col]),
        });
    }
    Ok(RankedResults::new(rows))
}

/// Render one CSV field, quoting it when it would not read back verbatim.
pub fn csv_field(value: &str) -> Cow<'_, str> {
    let needs_quotes = value.contains([',', '"', '\n', '\r'])
        || value.trim() != value
        || value.is_empty();
    if needs_quotes {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Split CSV text into records of fields, each tagged with its 1-based start line.
/// Blank lines are skipped.
fn split_csv_records(raw: &str) -> SimResult<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut line = 1;
    let mut record_line = 1;

    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if !was_quoted && field.trim().is_empty() => {
                field.clear();
                in_quotes = true;
                was_quoted = true;
            }
            ',' => fields.push(finish_field(&mut field, &mut was_quoted)),
            '\r' => {}
            '\n' => {
                end_record(&mut records, &mut fields, &mut field, &mut was_quoted, record_line);
                line += 1;
                record_line = line;
            }
            c if was_quoted && c.is_whitespace() => {}
            c if was_quoted || c == '"' => {
                return Err(SimulationError::input_shape(format!(
                    "line {line}: stray {c:?} outside a quoted field"
                )));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(SimulationError::input_shape(format!(
            "line {record_line}: unterminated quoted field"
        )));
    }
    end_record(&mut records, &mut fields, &mut field, &mut was_quoted, record_line);
    Ok(records)
}

fn finish_field(field: &mut String, was_quoted: &mut bool) -> String {
    let value = if *was_quoted {
        std::mem::take(field)
    } else {
        let trimmed = field.trim().to_string();
        field.clear();
        trimmed
    };
    *was_quoted = false;
    value
}

fn end_record(
    records: &mut Vec<(usize, Vec<String>)>,
    fields: &mut Vec<String>,
    field: &mut String,
    was_quoted: &mut bool,
    line: usize,
) {
    let blank = fields.is_empty() && !*was_quoted && field.trim().is_empty();
    if blank {
        field.clear();
        return;
    }
    fields.push(finish_field(field, was_quoted));
    records.push((line, std::mem::take(fields)));
}
