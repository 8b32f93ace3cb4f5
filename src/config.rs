//! Engine configuration

use crate::request::BackendKind;
use std::path::PathBuf;
use std::time::Duration;

/// Tuning and placement knobs for the cache engine.
///
/// Database files are disposable caches rebuildable from the source, so the
/// engine defaults trade durability for speed.
#[derive(Debug, Clone)]
pub struct TableCacheConfig {
    /// Directory holding every database file the engine creates
    pub work_dir: PathBuf,
    /// Backend used when neither an existing file nor a request hint decides
    pub default_backend: BackendKind,
    /// SQLite page-cache size, in KiB
    pub sqlite_cache_kb: i64,
    /// DuckDB memory limit, e.g. "512MB"; engine default when unset
    pub duckdb_memory_limit: Option<String>,
    /// Handles idle longer than this are closed by the next sweep
    pub idle_timeout: Duration,
    /// Maximum wait on a build lock; unbounded when unset
    pub lock_timeout: Option<Duration>,
}

impl TableCacheConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            default_backend: BackendKind::Sqlite,
            sqlite_cache_kb: 64 * 1024,
            duckdb_memory_limit: None,
            idle_timeout: Duration::from_secs(15 * 60),
            lock_timeout: None,
        }
    }

    pub fn default_backend(mut self, backend: BackendKind) -> Self {
        self.default_backend = backend;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn sqlite_cache_kb(mut self, kb: i64) -> Self {
        self.sqlite_cache_kb = kb;
        self
    }

    pub fn duckdb_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.duckdb_memory_limit = Some(limit.into());
        self
    }
}
