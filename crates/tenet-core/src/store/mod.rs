//! Persistent key-value databases.
//!
//! Every piece of state that must survive an agent run lives in one of a
//! small family of named databases: promise locks, persistent classes,
//! last-seen peers, change tracking, software inventory and so on. Each
//! database is a single `SQLite` file holding one `kv` table with BLOB keys
//! and values.
//!
//! # Handle lifecycle
//!
//! The registry keeps one long-lived handle per database id. `open` either
//! opens the backing file on first use or increments the handle's reference
//! count; dropping (or explicitly closing) the returned [`Db`] decrements
//! it, and the underlying connection is closed when the count reaches zero.
//! A handle that hits an unrecoverable error is *frozen*: further opens
//! fail, but outstanding users can still drop their guards.
//!
//! # Corruption recovery
//!
//! If the backing file cannot be opened as a database it is renamed to
//! `<name>.broken` and a fresh database is created in its place. A second
//! failure freezes the handle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, error, warn};

/// File extension shared by all database files.
const DB_FILE_EXTENSION: &str = "db";

/// Flag file in the state directory that requests an integrity check of
/// every known database on the next daemon start-up. Removed once processed.
pub const REPAIR_FLAG_FILE: &str = "cf_repair";

/// How long a database open waits on a busy backend before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shutdown drain: poll interval and maximum number of polls while waiting
/// for outstanding references.
const DRAIN_POLL: Duration = Duration::from_millis(10);
const DRAIN_POLL_MAX: u32 = 1000;

/// Identifiers of the known databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbId {
    /// Persistent classes with expiry timestamps.
    Classes,
    /// Persistent variable state.
    Variables,
    /// Per-promise execution timing.
    Performance,
    /// Content digests for change tracking.
    Checksums,
    /// File stat snapshots.
    Filestats,
    /// Recorded content changes.
    Changes,
    /// Monitoring observations.
    Observations,
    /// Miscellaneous agent state.
    State,
    /// Last-seen peer bookkeeping.
    Lastseen,
    /// Audit trail.
    Audit,
    /// Promise lock registry.
    Locks,
    /// Long-term history.
    History,
    /// Installed-package inventory.
    PackagesInstalled,
}

impl DbId {
    /// Every known database id, in a stable order.
    pub const ALL: [Self; 13] = [
        Self::Classes,
        Self::Variables,
        Self::Performance,
        Self::Checksums,
        Self::Filestats,
        Self::Changes,
        Self::Observations,
        Self::State,
        Self::Lastseen,
        Self::Audit,
        Self::Locks,
        Self::History,
        Self::PackagesInstalled,
    ];

    /// File stem of this database under the state directory.
    #[must_use]
    pub const fn state_file(self) -> &'static str {
        match self {
            Self::Classes => "classes",
            Self::Variables => "variables",
            Self::Performance => "performance",
            Self::Checksums => "checksum_digests",
            Self::Filestats => "stats",
            Self::Changes => "changes",
            Self::Observations => "observations",
            Self::State => "state",
            Self::Lastseen => "lastseen",
            Self::Audit => "audit",
            Self::Locks => "locks",
            Self::History => "history",
            Self::PackagesInstalled => "packages_installed",
        }
    }

    /// File stem of this database under the legacy work directory, for the
    /// ids that historically lived there. A legacy file is honoured only
    /// when it already exists; new databases are never created at the old
    /// path.
    #[must_use]
    pub const fn legacy_file(self) -> Option<&'static str> {
        match self {
            Self::Classes => Some("classes"),
            Self::Performance => Some("performance"),
            Self::Checksums => Some("checksum_digests"),
            Self::Filestats => Some("stats"),
            Self::Lastseen => Some("lastseen"),
            Self::Audit => Some("audit"),
            _ => None,
        }
    }
}

impl std::fmt::Display for DbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state_file())
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The handle was frozen after an unrecoverable error.
    #[error("database '{0}' is frozen")]
    Frozen(String),

    /// The database file was broken and could not be recreated.
    #[error("database '{path}' is broken beyond repair")]
    Broken {
        /// Path of the broken file.
        path: String,
    },

    /// The `<db>.lock` file could not be acquired.
    #[error("failed to lock database file '{path}': {source}")]
    PathLock {
        /// Path of the lock file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An operation was attempted on a handle that is not open.
    #[error("database '{0}' is not open")]
    NotOpen(String),

    /// The backend reported an error.
    #[error("backend error on '{path}': {source}")]
    Backend {
        /// Path of the database file.
        path: String,
        /// Underlying backend error.
        source: rusqlite::Error,
    },

    /// A handle mutex was poisoned by a panicking thread.
    #[error("database handle lock poisoned")]
    Poisoned,
}

/// Encode a string key including its terminator byte, so that string-keyed
/// and binary-keyed operations on the same database never collide.
#[must_use]
pub fn string_key(key: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(key.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(0);
    bytes
}

struct HandleInner {
    conn: Option<Connection>,
    refcount: u32,
    open_tstamp: i64,
}

struct DbHandle {
    id: DbId,
    path: PathBuf,
    frozen: AtomicBool,
    inner: Mutex<HandleInner>,
}

impl DbHandle {
    fn new(id: DbId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            frozen: AtomicBool::new(false),
            inner: Mutex::new(HandleInner {
                conn: None,
                refcount: 0,
                open_tstamp: -1,
            }),
        }
    }

    fn lock_inner(&self) -> Result<MutexGuard<'_, HandleInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Registry of database handles, keyed by [`DbId`].
pub struct StoreRegistry {
    state_dir: PathBuf,
    work_dir: PathBuf,
    handles: Mutex<HashMap<DbId, Arc<DbHandle>>>,
}

impl StoreRegistry {
    /// Create a registry rooted at the given state and work directories.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            work_dir: work_dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// The state directory this registry writes new databases under.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Resolve the on-disk path of a database. The legacy work-directory
    /// path wins only when a file already exists there.
    #[must_use]
    pub fn db_path(&self, id: DbId) -> PathBuf {
        if let Some(legacy) = id.legacy_file() {
            let old = self
                .work_dir
                .join(format!("{legacy}.{DB_FILE_EXTENSION}"));
            if old.exists() {
                return old;
            }
        }
        self.state_dir
            .join(format!("{}.{}", id.state_file(), DB_FILE_EXTENSION))
    }

    fn handle_for(&self, id: DbId) -> Result<Arc<DbHandle>, StoreError> {
        let mut handles = self.handles.lock().map_err(|_| StoreError::Poisoned)?;
        let handle = handles
            .entry(id)
            .or_insert_with(|| Arc::new(DbHandle::new(id, self.db_path(id))));
        Ok(Arc::clone(handle))
    }

    /// Open a database, creating the backing file on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Frozen`] when the handle was frozen by an
    /// earlier unrecoverable failure, [`StoreError::Broken`] when the file
    /// is corrupt and recreation failed too, and backend errors otherwise.
    pub fn open(&self, id: DbId) -> Result<Db, StoreError> {
        let handle = self.handle_for(id)?;
        Self::open_instance(&handle)
    }

    fn open_instance(handle: &Arc<DbHandle>) -> Result<Db, StoreError> {
        if handle.frozen.load(Ordering::Relaxed) {
            warn!(db = %handle.id, "attempt to open a frozen database");
            return Err(StoreError::Frozen(handle.id.to_string()));
        }

        let mut inner = handle.lock_inner()?;
        if inner.refcount == 0 {
            let _path_lock = PathLock::acquire(&handle.path)?;

            let conn = match open_backend(&handle.path) {
                Ok(conn) => conn,
                Err(first) => {
                    warn!(
                        db = %handle.id,
                        error = %first,
                        "database broken, moving aside and recreating"
                    );
                    move_broken(&handle.path);
                    match open_backend(&handle.path) {
                        Ok(conn) => conn,
                        Err(second) => {
                            error!(
                                db = %handle.id,
                                error = %second,
                                "database broken after recreation, freezing handle"
                            );
                            handle.frozen.store(true, Ordering::Relaxed);
                            return Err(StoreError::Broken {
                                path: handle.path.display().to_string(),
                            });
                        }
                    }
                }
            };

            inner.conn = Some(conn);
            inner.open_tstamp = chrono::Utc::now().timestamp();
        }
        inner.refcount += 1;
        drop(inner);

        Ok(Db {
            handle: Arc::clone(handle),
        })
    }

    /// Close every known database, waiting briefly for outstanding
    /// references to drain before forcing the close.
    pub fn close_all(&self) {
        let handles: Vec<Arc<DbHandle>> = match self.handles.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return,
        };
        for handle in handles {
            close_instance(&handle);
        }
    }

    /// Materialise a database into an in-memory map of string keys. Entries
    /// whose keys are not NUL-terminated UTF-8 are skipped.
    ///
    /// # Errors
    ///
    /// Propagates open and backend errors.
    pub fn load_into_map(&self, id: DbId) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let db = self.open(id)?;
        let mut map = HashMap::new();
        let mut cursor = db.cursor()?;
        while let Some((key, value)) = cursor.advance() {
            let Some(stripped) = key.strip_suffix(&[0u8]) else {
                continue;
            };
            if let Ok(name) = std::str::from_utf8(stripped) {
                map.insert(name.to_string(), value);
            }
        }
        Ok(map)
    }

    /// Run an integrity pass: open and close every known database so that
    /// broken files are moved aside and recreated.
    pub fn repair_all(&self) {
        for id in DbId::ALL {
            match self.open(id) {
                Ok(db) => db.close(),
                Err(e) => warn!(db = %id, error = %e, "integrity check failed"),
            }
        }
    }
}

/// Check for the repair flag file in the state directory and remove it.
///
/// Returns whether the flag was present. Best-effort by design: a missed
/// flag is picked up on the next start, a doubled check is harmless.
#[must_use]
pub fn check_repair_flag(state_dir: &Path) -> bool {
    let flag = state_dir.join(REPAIR_FLAG_FILE);
    if flag.exists() {
        if let Err(e) = std::fs::remove_file(&flag) {
            warn!(path = %flag.display(), error = %e, "failed to remove repair flag file");
        }
        true
    } else {
        false
    }
}

fn open_backend(path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Also acts as the corruption probe: a garbage file fails here.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
        [],
    )?;
    Ok(conn)
}

fn move_broken(path: &Path) {
    let mut broken = path.as_os_str().to_os_string();
    broken.push(".broken");
    if let Err(e) = std::fs::rename(path, &broken) {
        error!(path = %path.display(), error = %e, "failed moving broken database out of the way");
    }
}

fn close_instance(handle: &Arc<DbHandle>) {
    if handle.frozen.load(Ordering::Relaxed) {
        return;
    }

    let mut polls = 0;
    loop {
        let Ok(mut inner) = handle.inner.lock() else {
            return;
        };
        if inner.refcount == 0 {
            inner.conn.take();
            inner.open_tstamp = -1;
            return;
        }
        if polls >= DRAIN_POLL_MAX {
            error!(
                db = %handle.id,
                refcount = inner.refcount,
                "database refcount still not zero, forcing close"
            );
            inner.conn.take();
            inner.open_tstamp = -1;
            return;
        }
        drop(inner);
        std::thread::sleep(DRAIN_POLL);
        polls += 1;
    }
}

/// Exclusive advisory lock on `<db>.lock`, held around the open protocol so
/// concurrent processes serialise broken-file recovery.
struct PathLock {
    file: File,
}

impl PathLock {
    fn acquire(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.as_os_str().to_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        if let Some(parent) = lock_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::PathLock {
                path: lock_path.display().to_string(),
                source: e,
            })?;
        file.lock_exclusive().map_err(|e| StoreError::PathLock {
            path: lock_path.display().to_string(),
            source: e,
        })?;
        Ok(Self { file })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// An open database. Dropping the guard decrements the handle's reference
/// count; the connection closes when the count reaches zero.
pub struct Db {
    handle: Arc<DbHandle>,
}

impl Db {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        if self.handle.frozen.load(Ordering::Relaxed) {
            return Err(StoreError::Frozen(self.handle.id.to_string()));
        }
        let inner = self.handle.lock_inner()?;
        let conn = inner
            .conn
            .as_ref()
            .ok_or_else(|| StoreError::NotOpen(self.handle.id.to_string()))?;
        f(conn).map_err(|e| StoreError::Backend {
            path: self.handle.path.display().to_string(),
            source: e,
        })
    }

    /// Read a string-keyed entry.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_complex(&string_key(key))
    }

    /// Read a binary-keyed entry.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn read_complex(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Write a string-keyed entry, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.write_complex(&string_key(key), value)
    }

    /// Write a binary-keyed entry, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn write_complex(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    /// Delete a string-keyed entry.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delete_complex(&string_key(key))
    }

    /// Delete a binary-keyed entry.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn delete_complex(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .map(|_| ())
        })
    }

    /// Whether a string-keyed entry exists.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn has(&self, key: &str) -> Result<bool, StoreError> {
        self.has_complex(&string_key(key))
    }

    /// Whether a binary-keyed entry exists.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn has_complex(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM kv WHERE key = ?1",
                params![key],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    /// Size in bytes of the value stored under a string key, if present.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn value_size(&self, key: &str) -> Result<Option<usize>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT length(value) FROM kv WHERE key = ?1",
                params![string_key(key)],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .map(|len| len.map(|l| usize::try_from(l).unwrap_or(0)))
    }

    /// Replace the value under a string key only when `cond` accepts the
    /// current value. Runs in a transaction; returns whether the write
    /// happened.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn overwrite(
        &self,
        key: &str,
        value: &[u8],
        cond: impl FnOnce(Option<&[u8]>) -> bool,
    ) -> Result<bool, StoreError> {
        let key = string_key(key);
        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let current: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            if !cond(current.as_deref()) {
                conn.execute_batch("ROLLBACK")?;
                return Ok(false);
            }
            conn.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            conn.execute_batch("COMMIT")?;
            Ok(true)
        })
    }

    /// Open a cursor over a snapshot of the database, ordered by key.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub fn cursor(&self) -> Result<DbCursor<'_>, StoreError> {
        let entries = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(DbCursor {
            db: self,
            entries,
            pos: 0,
        })
    }

    /// Close the database, committing pending writes. Equivalent to
    /// dropping the guard, spelled out for call sites that close early.
    pub fn close(self) {
        drop(self);
    }

    /// Unix time at which the underlying connection was opened, `-1` when
    /// closed.
    #[must_use]
    pub fn open_timestamp(&self) -> i64 {
        self.handle
            .lock_inner()
            .map(|inner| inner.open_tstamp)
            .unwrap_or(-1)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.handle.frozen.load(Ordering::Relaxed) {
            return;
        }
        let Ok(mut inner) = self.handle.inner.lock() else {
            return;
        };
        if inner.refcount < 1 {
            error!(db = %self.handle.id, "closing a database that is not open");
            return;
        }
        inner.refcount -= 1;
        if inner.refcount == 0 {
            inner.conn.take();
            inner.open_tstamp = -1;
            debug!(db = %self.handle.id, "database closed");
        }
    }
}

/// Cursor over a database snapshot. `advance` yields entries in key order;
/// `delete_current` and `write_current` act on the entry most recently
/// yielded.
pub struct DbCursor<'a> {
    db: &'a Db,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl DbCursor<'_> {
    /// Advance to the next entry, returning its key and value. Owned
    /// copies, so the cursor can be mutated mid-walk.
    pub fn advance(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let (key, value) = self.entries.get(self.pos)?;
        self.pos += 1;
        Some((key.clone(), value.clone()))
    }

    fn current_key(&self) -> Option<&[u8]> {
        if self.pos == 0 {
            return None;
        }
        self.entries.get(self.pos - 1).map(|(k, _)| k.as_slice())
    }

    /// Delete the entry most recently yielded by `advance`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors; no-op when nothing was yielded yet.
    pub fn delete_current(&mut self) -> Result<(), StoreError> {
        if let Some(key) = self.current_key().map(<[u8]>::to_vec) {
            self.db.delete_complex(&key)?;
        }
        Ok(())
    }

    /// Replace the value of the entry most recently yielded by `advance`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors; no-op when nothing was yielded yet.
    pub fn write_current(&mut self, value: &[u8]) -> Result<(), StoreError> {
        if let Some(key) = self.current_key().map(<[u8]>::to_vec) {
            self.db.write_complex(&key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, StoreRegistry) {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let work = dir.path().join("work");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::create_dir_all(&work).unwrap();
        let reg = StoreRegistry::new(&state, &work);
        (dir, reg)
    }

    #[test]
    fn test_write_then_read_back() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("alpha", b"one").unwrap();
        assert_eq!(db.read("alpha").unwrap().unwrap(), b"one");
        assert!(db.read("beta").unwrap().is_none());
    }

    #[test]
    fn test_second_write_wins() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("key", b"first").unwrap();
        db.write("key", b"second").unwrap();
        assert_eq!(db.read("key").unwrap().unwrap(), b"second");
        assert!(db.has("key").unwrap());
        assert_eq!(db.value_size("key").unwrap(), Some(6));
    }

    #[test]
    fn test_string_and_binary_keys_do_not_collide() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("k", b"with-terminator").unwrap();
        db.write_complex(b"k", b"raw").unwrap();
        assert_eq!(db.read("k").unwrap().unwrap(), b"with-terminator");
        assert_eq!(db.read_complex(b"k").unwrap().unwrap(), b"raw");
    }

    #[test]
    fn test_delete_and_has() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("gone", b"x").unwrap();
        db.delete("gone").unwrap();
        assert!(!db.has("gone").unwrap());
        assert_eq!(db.value_size("gone").unwrap(), None);
    }

    #[test]
    fn test_refcount_open_close() {
        let (_dir, reg) = registry();
        let a = reg.open(DbId::Performance).unwrap();
        let b = reg.open(DbId::Performance).unwrap();
        a.write("k", b"v").unwrap();
        drop(a);
        // Second reference keeps the connection alive.
        assert_eq!(b.read("k").unwrap().unwrap(), b"v");
        drop(b);
        // Reopening works after the count drains to zero.
        let c = reg.open(DbId::Performance).unwrap();
        assert_eq!(c.read("k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_broken_file_moved_aside_and_recreated() {
        let (_dir, reg) = registry();
        let path = reg.db_path(DbId::Checksums);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"this is not a database at all").unwrap();

        let db = reg.open(DbId::Checksums).unwrap();
        db.write("fresh", b"start").unwrap();
        assert_eq!(db.read("fresh").unwrap().unwrap(), b"start");

        let mut broken = path.as_os_str().to_os_string();
        broken.push(".broken");
        assert!(PathBuf::from(broken).exists());
    }

    #[test]
    fn test_legacy_workdir_path_honoured_only_when_present() {
        let (_dir, reg) = registry();
        // Nothing in the work directory: state-dir path is used.
        let fresh = reg.db_path(DbId::Lastseen);
        assert!(fresh.starts_with(reg.state_dir()));

        // Plant a legacy file and resolve again.
        let legacy = reg
            .work_dir
            .join(format!("lastseen.{DB_FILE_EXTENSION}"));
        std::fs::write(&legacy, b"").unwrap();
        assert_eq!(reg.db_path(DbId::Lastseen), legacy);
    }

    #[test]
    fn test_overwrite_predicate() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("n", b"1").unwrap();
        let wrote = db.overwrite("n", b"2", |cur| cur == Some(b"1".as_ref())).unwrap();
        assert!(wrote);
        let refused = db.overwrite("n", b"3", |cur| cur == Some(b"1".as_ref())).unwrap();
        assert!(!refused);
        assert_eq!(db.read("n").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_cursor_iteration_and_mutation() {
        let (_dir, reg) = registry();
        let db = reg.open(DbId::State).unwrap();
        db.write("a", b"1").unwrap();
        db.write("b", b"2").unwrap();
        db.write("c", b"3").unwrap();

        let mut seen = Vec::new();
        let mut cursor = db.cursor().unwrap();
        while let Some((key, _)) = cursor.advance() {
            if key == string_key("b") {
                cursor.delete_current().unwrap();
            }
            seen.push(key);
        }
        assert_eq!(seen.len(), 3);
        assert!(!db.has("b").unwrap());
    }

    #[test]
    fn test_load_into_map() {
        let (_dir, reg) = registry();
        {
            let db = reg.open(DbId::Classes).unwrap();
            db.write("linux", b"1").unwrap();
            db.write("verbose_mode", b"1").unwrap();
        }
        let map = reg.load_into_map(DbId::Classes).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("linux").unwrap(), b"1");
    }

    #[test]
    fn test_repair_flag_checked_and_removed() {
        let dir = TempDir::new().unwrap();
        assert!(!check_repair_flag(dir.path()));
        std::fs::write(dir.path().join(REPAIR_FLAG_FILE), b"").unwrap();
        assert!(check_repair_flag(dir.path()));
        assert!(!dir.path().join(REPAIR_FLAG_FILE).exists());
        assert!(!check_repair_flag(dir.path()));
    }

    #[test]
    fn test_repair_all_touches_every_database() {
        let (_dir, reg) = registry();
        reg.repair_all();
        for id in DbId::ALL {
            assert!(reg.db_path(id).exists(), "missing {id}");
        }
    }
}
