//! Per-pair trace capture for aggregation runs.
//!
//! Every planned (before, after) pair yields exactly one [`PairTrace`], whether
//! it was estimated, served from the diff cache, skipped as uninformative, or
//! failed. [`JsonlTraceSink`] hands events to a writer thread that appends one
//! JSON object per line. Pairs finish in any order, so readers should key on
//! `pair_index` rather than line order.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

/// What the aggregator did with a planned pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairOutcome {
    Estimated,
    Cached,
    /// `likelihood_not_random` fell below the configured floor.
    Skipped,
    Failed,
}

/// One planned (before, after) pair and what happened to it.
///
/// Estimate fields are `None` unless the outcome is `Estimated` or `Cached`.
#[derive(Debug, Clone, Serialize)]
pub struct PairTrace {
    pub timestamp_ms: i64,
    pub pair_index: usize,
    pub before: Option<String>,
    pub after: String,
    pub cache_key_hash: String,
    pub metric_before: f64,
    pub metric_after: f64,
    pub actual_dcg_delta: f64,
    pub best_case_dcg_delta: f64,
    pub num_changed: usize,
    pub likelihood_not_random: f64,
    pub prob_not_random: Option<f64>,
    pub plausible_universes: Option<f64>,
    pub rounds: Option<usize>,
    pub converged: Option<bool>,
    pub outcome: PairOutcome,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: PairTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<PairTrace>,
}

/// Handle on the writer thread. The thread exits once every sink clone is dropped.
pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<usize, TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer to drain and flush; returns the number of events written.
    pub fn join(mut self) -> Result<usize, TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(0),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<PairTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: PairTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<PairTrace>,
) -> Result<usize, TraceError> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
