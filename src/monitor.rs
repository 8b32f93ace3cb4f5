//! Database handle lifecycle
//!
//! The monitor is the process-scoped registry of open database handles. A
//! path maps to exactly one handle while open, handles are refcounted by
//! in-flight requests, and eviction (idle sweep, explicit close, file
//! deletion) only ever touches handles nobody holds. Deletions that cannot
//! run yet — live references, files pinned by the OS — are parked and
//! retried on the next sweep instead of surfacing to requests.

use crate::adapter::{DbAdapter, DbConn};
use crate::config::TableCacheConfig;
use crate::Result;
use ahash::AHashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One open database file bound to its adapter
pub struct DbEntry {
    path: PathBuf,
    adapter: Arc<dyn DbAdapter>,
    conn: Mutex<Box<dyn DbConn>>,
    /// Live table names in this database
    tables: Mutex<HashSet<String>>,
    last_access: Mutex<Instant>,
    refs: AtomicUsize,
}

impl DbEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn adapter(&self) -> &Arc<dyn DbAdapter> {
        &self.adapter
    }

    /// Exclusive use of the underlying connection
    pub fn conn(&self) -> MutexGuard<'_, Box<dyn DbConn>> {
        self.conn.lock()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.lock().contains(name)
    }

    /// Record a table that finished building
    pub fn track_table(&self, name: &str) {
        self.tables.lock().insert(name.to_string());
    }

    pub fn untrack_table(&self, name: &str) {
        self.tables.lock().remove(name);
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Refcounted lease on a handle; releases on drop
pub struct HandleRef {
    entry: Arc<DbEntry>,
}

impl std::ops::Deref for HandleRef {
    type Target = DbEntry;

    fn deref(&self) -> &DbEntry {
        &self.entry
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.entry.touch();
        self.entry.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Work the monitor could not complete yet
struct Pending {
    path: PathBuf,
    adapter: Arc<dyn DbAdapter>,
    /// Handle still waiting for its last reference; `None` once only file
    /// deletion remains
    entry: Option<Arc<DbEntry>>,
    delete_file: bool,
}

/// Per-handle stats snapshot
#[derive(Debug, Clone)]
pub struct HandleStats {
    pub path: PathBuf,
    pub tables: usize,
    pub refs: usize,
}

/// Registry and reaper of open database handles
pub struct DbMonitor {
    entries: Mutex<AHashMap<PathBuf, Arc<DbEntry>>>,
    pending: Mutex<Vec<Pending>>,
    idle_timeout: Duration,
}

impl DbMonitor {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            pending: Mutex::new(Vec::new()),
            idle_timeout,
        }
    }

    /// The unique handle for a path, opening the database if needed. The
    /// returned lease gates eviction until dropped.
    pub fn checkout(
        &self,
        path: &Path,
        adapter: Arc<dyn DbAdapter>,
        config: &TableCacheConfig,
    ) -> Result<HandleRef> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(path) {
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry.touch();
            return Ok(HandleRef {
                entry: entry.clone(),
            });
        }

        let mut conn = adapter.open(path, config)?;
        let existing = adapter.table_names(conn.as_mut())?;
        let entry = Arc::new(DbEntry {
            path: path.to_path_buf(),
            adapter,
            conn: Mutex::new(conn),
            tables: Mutex::new(existing.into_iter().collect()),
            last_access: Mutex::new(Instant::now()),
            refs: AtomicUsize::new(1),
        });
        entries.insert(path.to_path_buf(), entry.clone());
        Ok(HandleRef { entry })
    }

    /// Close a handle and optionally delete its file plus engine siblings.
    /// With live references the work is parked for the next sweep; new
    /// checkouts of the path start fresh either way.
    pub fn close(&self, path: &Path, adapter: Arc<dyn DbAdapter>, delete_file: bool) {
        let removed = self.entries.lock().remove(path);
        match removed {
            Some(entry) => self.shutdown(entry, delete_file),
            None if delete_file => {
                // never opened in this process, or already closed; the files
                // may still be on disk
                if let Err(e) = delete_db_files(path, adapter.as_ref()) {
                    log::warn!("cannot delete {}: {}; will retry", path.display(), e);
                    self.pending.lock().push(Pending {
                        path: path.to_path_buf(),
                        adapter,
                        entry: None,
                        delete_file: true,
                    });
                }
            }
            None => {}
        }
    }

    fn shutdown(&self, entry: Arc<DbEntry>, delete_file: bool) {
        if entry.ref_count() > 0 {
            log::info!(
                "{} still referenced; deferring close",
                entry.path().display()
            );
            self.pending.lock().push(Pending {
                path: entry.path.clone(),
                adapter: entry.adapter.clone(),
                entry: Some(entry),
                delete_file,
            });
            return;
        }
        match Arc::try_unwrap(entry) {
            Ok(owned) => {
                let path = owned.path.clone();
                let adapter = owned.adapter.clone();
                drop(owned); // closes the engine connection
                if delete_file {
                    if let Err(e) = delete_db_files(&path, adapter.as_ref()) {
                        log::warn!("cannot delete {}: {}; will retry", path.display(), e);
                        self.pending.lock().push(Pending {
                            path,
                            adapter,
                            entry: None,
                            delete_file: true,
                        });
                    }
                }
            }
            Err(entry) => {
                // raced a checkout-in-progress; park it
                self.pending.lock().push(Pending {
                    path: entry.path.clone(),
                    adapter: entry.adapter.clone(),
                    entry: Some(entry),
                    delete_file,
                });
            }
        }
    }

    /// Close idle unreferenced handles and retry parked work. Returns the
    /// number of handles closed.
    pub fn sweep(&self) -> usize {
        let mut closed = 0;

        let idle: Vec<Arc<DbEntry>> = {
            let mut entries = self.entries.lock();
            let idle_keys: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, e)| {
                    e.ref_count() == 0 && e.last_access.lock().elapsed() >= self.idle_timeout
                })
                .map(|(k, _)| k.clone())
                .collect();
            idle_keys
                .into_iter()
                .filter_map(|k| entries.remove(&k))
                .collect()
        };
        for entry in idle {
            log::info!("closing idle database {}", entry.path().display());
            self.shutdown(entry, false);
            closed += 1;
        }

        let parked: Vec<Pending> = std::mem::take(&mut *self.pending.lock());
        for p in parked {
            let Pending {
                path,
                adapter,
                entry,
                delete_file,
            } = p;
            match entry {
                Some(entry) => self.shutdown(entry, delete_file),
                None => {
                    if let Err(e) = delete_db_files(&path, adapter.as_ref()) {
                        log::warn!("cannot delete {}: {}; will retry", path.display(), e);
                        self.pending.lock().push(Pending {
                            path,
                            adapter,
                            entry: None,
                            delete_file,
                        });
                    }
                }
            }
        }

        closed
    }

    /// Close every handle without deleting files. Used at shutdown.
    pub fn close_all(&self) {
        let all: Vec<Arc<DbEntry>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in all {
            self.shutdown(entry, false);
        }
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot for the statistics sink
    pub fn stats(&self) -> Vec<HandleStats> {
        self.entries
            .lock()
            .values()
            .map(|e| HandleStats {
                path: e.path.clone(),
                tables: e.table_count(),
                refs: e.ref_count(),
            })
            .collect()
    }
}

/// Delete a database file and the sibling files its engine leaves behind.
/// Missing files are fine; the first real failure is returned.
fn delete_db_files(path: &Path, adapter: &dyn DbAdapter) -> std::io::Result<()> {
    let mut result = Ok(());
    let mut targets = vec![path.to_path_buf()];
    targets.extend(adapter.sibling_files(path));
    for target in targets {
        let outcome = if target.is_dir() {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_file(&target)
        };
        if let Err(e) = outcome {
            if e.kind() != std::io::ErrorKind::NotFound && result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}
