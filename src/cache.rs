//! Per-pair cache of estimated diffs.
//!
//! Keys combine both submission names with `ALGORITHM_VERSION`, so changing
//! the diff or estimation semantics never reuses stale entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::diff::RankingDiff;
use crate::estimator::EstimateSummary;

/// Bump whenever diff building or estimation changes what a cached entry means.
pub const ALGORITHM_VERSION: &str = "diffsim-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffCacheKey {
    pub before_name: Option<String>,
    pub after_name: String,
    pub algorithm_version: String,
    pub key_hash: String,
}

impl DiffCacheKey {
    pub fn new(before_name: Option<&str>, after_name: &str) -> Self {
        Self::with_version(before_name, after_name, ALGORITHM_VERSION)
    }

    pub fn with_version(before_name: Option<&str>, after_name: &str, version: &str) -> Self {
        // The virtual empty baseline hashes differently from any real name.
        let before_field = match before_name {
            Some(name) => format!("some:{name}"),
            None => "none".to_string(),
        };
        let key_hash = hash_fields(&[&before_field, after_name, version]);
        Self {
            before_name: before_name.map(str::to_string),
            after_name: after_name.to_string(),
            algorithm_version: version.to_string(),
            key_hash,
        }
    }
}

/// An estimated diff as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDiff {
    pub diff: RankingDiff,
    pub summary: EstimateSummary,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait DiffCache: Send + Sync {
    async fn get(&self, key: &DiffCacheKey) -> Result<Option<CachedDiff>, CacheError>;
    async fn put(&self, key: &DiffCacheKey, value: &CachedDiff) -> Result<(), CacheError>;
}

/// In-process cache, mainly for tests and one-shot runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryDiffCache {
    entries: Arc<Mutex<HashMap<String, CachedDiff>>>,
}

impl MemoryDiffCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DiffCache for MemoryDiffCache {
    async fn get(&self, key: &DiffCacheKey) -> Result<Option<CachedDiff>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(&key.key_hash).cloned())
    }

    async fn put(&self, key: &DiffCacheKey, value: &CachedDiff) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.key_hash.clone(), value.clone());
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteDiffCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDiffCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS diff_cache (\
               key_hash TEXT PRIMARY KEY,\
               before_name TEXT,\
               after_name TEXT NOT NULL,\
               algorithm_version TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               num_changed INTEGER NOT NULL,\
               rounds INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RELSIM_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".relsim_diff_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl DiffCache for SqliteDiffCache {
    async fn get(&self, key: &DiffCacheKey) -> Result<Option<CachedDiff>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT payload FROM diff_cache WHERE key_hash = ?1")?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let payload: String = row.get(0)?;
                    let entry: CachedDiff = serde_json::from_str(&payload)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    conn.execute(
                        "UPDATE diff_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &DiffCacheKey, value: &CachedDiff) -> Result<(), CacheError> {
        let key = key.clone();
        let payload = serde_json::to_string(value).map_err(|e| CacheError::Serde(e.to_string()))?;
        let num_changed = value.diff.num_changed as i64;
        let rounds = value.summary.rounds as i64;
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO diff_cache (\
                        key_hash, before_name, after_name, algorithm_version,\
                        payload, num_changed, rounds, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        payload = excluded.payload,\
                        num_changed = excluded.num_changed,\
                        rounds = excluded.rounds,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.before_name,
                        key.after_name,
                        key.algorithm_version,
                        payload,
                        num_changed,
                        rounds,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// Cache metadata without the payload.
#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub before_name: Option<String>,
    pub after_name: String,
    pub algorithm_version: String,
    pub num_changed: i64,
    pub rounds: i64,
    pub payload_bytes: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteDiffCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, before_name, after_name, algorithm_version,\
                            num_changed, rounds, length(payload),\
                            created_at, updated_at, hit_count \
                     FROM diff_cache ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        before_name: row.get(1)?,
                        after_name: row.get(2)?,
                        algorithm_version: row.get(3)?,
                        num_changed: row.get(4)?,
                        rounds: row.get(5)?,
                        payload_bytes: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                        hit_count: row.get(9)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Drop entries older than `max_age_days` and/or beyond the `max_rows` most recent.
    /// Entries from other algorithm versions are always dropped.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted = conn.execute(
                    "DELETE FROM diff_cache WHERE algorithm_version != ?1",
                    params![ALGORITHM_VERSION],
                )?;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM diff_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM diff_cache", [], |row| row.get(0))?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM diff_cache WHERE key_hash IN (\
                                SELECT key_hash FROM diff_cache \
                                ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM diff_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
