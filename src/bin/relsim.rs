#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use relevance_sim::aggregate::{simulate_judgments, top_k_submission, AggregatorConfig};
use relevance_sim::cache::{DiffCache, SqliteDiffCache};
use relevance_sim::results::{csv_field, load_results_csv, Submission, TOP_K};
use relevance_sim::trace::{JsonlTraceSink, TraceSink};
use relevance_sim::PairingStrategy;

#[derive(Parser)]
#[command(name = "relsim", version, about = "Relevance judgments from ranking diffs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Infer judgments from a manifest of scored submissions
    Simulate {
        #[arg(long)]
        manifest: PathBuf,
        /// Judgments CSV
        #[arg(long)]
        out: PathBuf,
        /// SQLite diff cache (defaults to RELSIM_CACHE_PATH or .relsim_diff_cache.sqlite)
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        no_cache: bool,
        /// Per-pair JSONL trace
        #[arg(long)]
        trace: Option<PathBuf>,
        /// Also write a top-5 submission built from the inferred grades
        #[arg(long)]
        submission_out: Option<PathBuf>,
        #[arg(long, value_enum)]
        strategy: Option<CliStrategy>,
        #[arg(long)]
        parallel: Option<usize>,
        #[arg(long)]
        rng_seed: Option<u64>,
    },
    /// Run synthetic evaluation suite
    Eval {
        #[arg(long)]
        case: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Export SQLite cache metadata to JSONL
    CacheExport {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Prune SQLite cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CliStrategy {
    Chain,
    AllPairs,
}

impl From<CliStrategy> for PairingStrategy {
    fn from(s: CliStrategy) -> Self {
        match s {
            CliStrategy::Chain => PairingStrategy::Chain,
            CliStrategy::AllPairs => PairingStrategy::AllPairs,
        }
    }
}

#[derive(Deserialize)]
struct Manifest {
    submissions: Vec<ManifestEntry>,
    #[serde(flatten)]
    config: AggregatorConfig,
}

#[derive(Deserialize)]
struct ManifestEntry {
    name: String,
    path: PathBuf,
    metric: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            manifest,
            out,
            cache,
            no_cache,
            trace,
            submission_out,
            strategy,
            parallel,
            rng_seed,
        } => {
            let Manifest {
                submissions,
                mut config,
            } = read_json(&manifest)?;
            if let Some(strategy) = strategy {
                config.strategy = strategy.into();
            }
            if let Some(parallel) = parallel {
                config.parallel = parallel;
            }
            if let Some(seed) = rng_seed {
                config.estimator.rng_seed = Some(seed);
            }

            let base = manifest.parent().unwrap_or_else(|| Path::new("."));
            let mut loaded = Vec::with_capacity(submissions.len());
            for entry in submissions {
                let path = if entry.path.is_absolute() {
                    entry.path
                } else {
                    base.join(entry.path)
                };
                loaded.push(Submission::new(entry.name, load_results_csv(&path)?, entry.metric));
            }

            let sqlite = if no_cache {
                None
            } else {
                let path = cache.unwrap_or_else(SqliteDiffCache::default_path);
                Some(SqliteDiffCache::new(path)?)
            };
            let cache_ref = sqlite.as_ref().map(|c| c as &dyn DiffCache);

            let (trace_sink, trace_worker) = if let Some(path) = trace {
                let (sink, worker) = JsonlTraceSink::new(path)?;
                (Some(sink), Some(worker))
            } else {
                (None, None)
            };
            let trace_ref = trace_sink.as_ref().map(|sink| sink as &dyn TraceSink);

            let (estimates, judgments) =
                simulate_judgments(&loaded, &config, cache_ref, trace_ref).await?;

            drop(trace_sink);
            if let Some(worker) = trace_worker {
                let events = worker.join()?;
                tracing::info!(events, "trace written");
            }

            let mut csv = BufWriter::new(File::create(&out)?);
            writeln!(csv, "QueryId,DocumentId,rels,not_rels,grade,grade_std_dev")?;
            for j in &judgments {
                writeln!(
                    csv,
                    "{},{},{},{},{},{}",
                    csv_field(&j.query_id),
                    csv_field(&j.document_id),
                    j.rels,
                    j.not_rels,
                    j.grade,
                    j.grade_std_dev
                )?;
            }
            csv.flush()?;

            if let Some(path) = submission_out {
                let mut sub = BufWriter::new(File::create(path)?);
                writeln!(sub, "QueryId,DocumentId")?;
                for row in top_k_submission(&judgments, TOP_K) {
                    writeln!(
                        sub,
                        "{},{}",
                        csv_field(&row.query_id),
                        csv_field(&row.document_id)
                    )?;
                }
                sub.flush()?;
            }

            let cached = estimates.iter().filter(|e| e.cached).count();
            println!(
                "{} pairs estimated ({} cached); {} judgments written",
                estimates.len(),
                cached,
                judgments.len()
            );
        }
        Commands::Eval { case, out } => {
            let results = relevance_sim::evaluation::run_synthetic_suite(case.as_deref()).await?;
            if results.is_empty() {
                return Err(format!("no synthetic case named {}", case.unwrap_or_default()).into());
            }
            let mut file = File::create(out)?;
            for result in &results {
                let line = serde_json::to_string(result)?;
                writeln!(file, "{line}")?;
            }
        }
        Commands::CacheExport { db, out } => {
            let path = db.unwrap_or_else(SqliteDiffCache::default_path);
            let cache = SqliteDiffCache::new(path)?;
            cache.export_jsonl(out).await?;
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteDiffCache::default_path);
            let cache = SqliteDiffCache::new(path)?;
            let _lock = cache.lock_exclusive()?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!(
                "pruned {} rows; {} rows remain",
                stats.deleted, stats.remaining
            );
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
