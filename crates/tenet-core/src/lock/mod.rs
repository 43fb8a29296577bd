//! Promise lock registry.
//!
//! Rate-limits and serialises promise actuation across processes. Every
//! promise has a stable lock identifier derived from its expanded form; the
//! `locks` database stores two entries per identifier:
//!
//! - `last<id>`: unix time of the last successful actuation, read by the
//!   `ifelapsed` constraint (minutes),
//! - `lock<id>`: unix time at which the currently-held lock was acquired,
//!   read by the `expireafter` constraint (minutes).
//!
//! A holder that crashes inside its critical section leaves a stale
//! `lock<id>` entry behind; the next caller observes it and steals the lock
//! once `expireafter` has passed. Cross-process mutual exclusion for the
//! critical section itself is an exclusive advisory lock on the database's
//! `.lock` file; same-process serialisation falls out of the store handle's
//! mutex.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{Db, DbId, StoreError, StoreRegistry};

/// Lock acquisition errors. The dispatcher maps all of these to a
/// `SKIPPED` outcome; only the verbose log carries the detail.
#[derive(Debug, Error)]
pub enum LockError {
    /// The promise ran too recently for its `ifelapsed` constraint.
    #[error("promise ran {elapsed}s ago, ifelapsed requires {required}s")]
    TooSoon {
        /// Seconds since the last successful actuation.
        elapsed: i64,
        /// Seconds required by `ifelapsed`.
        required: i64,
    },

    /// Another process holds the lock and it has not expired.
    #[error("lock held by another process since unix time {since}")]
    HeldByOther {
        /// Unix time the other holder acquired the lock.
        since: i64,
    },

    /// The `.lock` file could not be opened or locked.
    #[error("failed to take critical-section lock '{path}': {source}")]
    CriticalSection {
        /// Path of the lock file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The locks database failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything that identifies and constrains one promise lock.
pub struct LockRequest<'a> {
    /// Policy namespace of the owning bundle.
    pub namespace: &'a str,
    /// Owning bundle name.
    pub bundle: &'a str,
    /// Promise type (`commands`, `files`, ...).
    pub promise_type: &'a str,
    /// The promiser, after variable expansion.
    pub promiser: &'a str,
    /// Selected constraints that distinguish otherwise-identical promises.
    pub attributes: &'a [(String, String)],
    /// Minimum minutes between actuations.
    pub ifelapsed: i64,
    /// Minutes after which a held lock is considered abandoned.
    pub expireafter: i64,
    /// Bypass `ifelapsed` (the `--no-lock` flag).
    pub ignore_locks: bool,
}

/// Compute the stable lock identifier for a promise. Deterministic across
/// processes so that concurrent runs of the same promise collide.
#[must_use]
pub fn lock_id(
    namespace: &str,
    bundle: &str,
    promise_type: &str,
    promiser: &str,
    attributes: &[(String, String)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0]);
    hasher.update(bundle.as_bytes());
    hasher.update([0]);
    hasher.update(promise_type.as_bytes());
    hasher.update([0]);
    hasher.update(promiser.as_bytes());
    for (lval, rval) in attributes {
        hasher.update([0]);
        hasher.update(lval.as_bytes());
        hasher.update([1]);
        hasher.update(rval.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Key of the last-actuated entry for a lock identifier.
#[must_use]
pub fn last_key(id: &str) -> String {
    format!("last{id}")
}

/// Key of the held-lock entry for a lock identifier.
#[must_use]
pub fn lock_key(id: &str) -> String {
    format!("lock{id}")
}

/// A held promise lock. Release through [`LockService::release`]; dropping
/// without releasing leaves the `lock<id>` entry behind for the next caller
/// to steal, which is exactly the crash-recovery path.
#[derive(Debug)]
pub struct PromiseLock {
    id: String,
    file: File,
}

impl PromiseLock {
    /// The lock identifier this lock was acquired under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to the locks database plus the critical-section lock file.
pub struct LockService {
    db: Db,
    critical_path: PathBuf,
}

impl LockService {
    /// Open the locks database and remember the critical-section path.
    ///
    /// # Errors
    ///
    /// Propagates store open errors.
    pub fn open(registry: &StoreRegistry) -> Result<Self, StoreError> {
        let db = registry.open(DbId::Locks)?;
        let mut critical_path = registry.db_path(DbId::Locks).into_os_string();
        critical_path.push(".lock");
        Ok(Self {
            db,
            critical_path: PathBuf::from(critical_path),
        })
    }

    /// Acquire the lock for a promise at the given wall-clock time.
    ///
    /// # Errors
    ///
    /// [`LockError::TooSoon`] when `ifelapsed` has not passed,
    /// [`LockError::HeldByOther`] when another unexpired holder exists, and
    /// store or I/O errors otherwise.
    pub fn acquire(&self, req: &LockRequest<'_>, now: i64) -> Result<PromiseLock, LockError> {
        let id = lock_id(
            req.namespace,
            req.bundle,
            req.promise_type,
            req.promiser,
            req.attributes,
        );

        let last = self.read_time(&last_key(&id))?;
        let required = req.ifelapsed * 60;
        if last != 0 && now - last < required && !req.ignore_locks {
            return Err(LockError::TooSoon {
                elapsed: now - last,
                required,
            });
        }

        let held_since = self.read_time(&lock_key(&id))?;
        if held_since != 0 {
            if now - held_since >= req.expireafter * 60 {
                info!(
                    promiser = req.promiser,
                    held_since, "stealing expired lock from crashed holder"
                );
            } else {
                return Err(LockError::HeldByOther { since: held_since });
            }
        }

        let file = self.take_critical_section()?;
        self.write_time(&lock_key(&id), now)?;
        debug!(promiser = req.promiser, id = %id, "lock acquired");
        Ok(PromiseLock { id, file })
    }

    /// Release a lock after a completed critical section: records the
    /// actuation time and clears the held-lock entry.
    ///
    /// # Errors
    ///
    /// Propagates store errors; the advisory file lock is dropped
    /// regardless.
    pub fn release(&self, lock: PromiseLock, now: i64) -> Result<(), LockError> {
        self.write_time(&last_key(&lock.id), now)?;
        self.db.delete(&lock_key(&lock.id))?;
        if let Err(e) = fs2::FileExt::unlock(&lock.file) {
            warn!(error = %e, "failed to drop critical-section file lock");
        }
        debug!(id = %lock.id, "lock released");
        Ok(())
    }

    fn take_critical_section(&self) -> Result<File, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.critical_path)
            .map_err(|e| LockError::CriticalSection {
                path: self.critical_path.display().to_string(),
                source: e,
            })?;
        file.try_lock_exclusive()
            .map_err(|e| LockError::CriticalSection {
                path: self.critical_path.display().to_string(),
                source: e,
            })?;
        Ok(file)
    }

    fn read_time(&self, key: &str) -> Result<i64, LockError> {
        let Some(bytes) = self.db.read(key)? else {
            return Ok(0);
        };
        let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) else {
            warn!(key, "malformed timestamp entry in locks database");
            return Ok(0);
        };
        Ok(i64::from_le_bytes(raw))
    }

    fn write_time(&self, key: &str, value: i64) -> Result<(), LockError> {
        self.db.write(key, &value.to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, StoreRegistry) {
        let dir = TempDir::new().unwrap();
        let reg = StoreRegistry::new(dir.path().join("state"), dir.path().join("work"));
        (dir, reg)
    }

    fn request<'a>(attributes: &'a [(String, String)]) -> LockRequest<'a> {
        LockRequest {
            namespace: "default",
            bundle: "main",
            promise_type: "commands",
            promiser: "/bin/true",
            attributes,
            ifelapsed: 1,
            expireafter: 1,
            ignore_locks: false,
        }
    }

    #[test]
    fn test_lock_id_is_deterministic() {
        let attrs = vec![("args".to_string(), "-v".to_string())];
        let a = lock_id("default", "main", "commands", "/bin/true", &attrs);
        let b = lock_id("default", "main", "commands", "/bin/true", &attrs);
        assert_eq!(a, b);
        let c = lock_id("default", "main", "commands", "/bin/false", &attrs);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ifelapsed_blocks_second_acquisition() {
        let (_dir, reg) = service();
        let locks = LockService::open(&reg).unwrap();
        let attrs = Vec::new();
        let req = request(&attrs);

        let now = 1_000_000;
        let lock = locks.acquire(&req, now).unwrap();
        locks.release(lock, now).unwrap();

        // 30 seconds later: too soon for ifelapsed=1.
        let err = locks.acquire(&req, now + 30).unwrap_err();
        assert!(matches!(err, LockError::TooSoon { .. }));

        // 61 seconds later: allowed again.
        let lock = locks.acquire(&req, now + 61).unwrap();
        locks.release(lock, now + 61).unwrap();
    }

    #[test]
    fn test_ignore_locks_bypasses_ifelapsed() {
        let (_dir, reg) = service();
        let locks = LockService::open(&reg).unwrap();
        let attrs = Vec::new();
        let mut req = request(&attrs);
        req.ignore_locks = true;

        let now = 2_000_000;
        let lock = locks.acquire(&req, now).unwrap();
        locks.release(lock, now).unwrap();
        let lock = locks.acquire(&req, now + 5).unwrap();
        locks.release(lock, now + 5).unwrap();
    }

    #[test]
    fn test_stale_lock_stolen_after_expireafter() {
        let (_dir, reg) = service();
        let locks = LockService::open(&reg).unwrap();
        let attrs = Vec::new();
        let req = request(&attrs);
        let id = lock_id(
            req.namespace,
            req.bundle,
            req.promise_type,
            req.promiser,
            req.attributes,
        );

        let t0 = 3_000_000;
        // Simulate a crashed holder: lock entry present, never released.
        locks.write_time(&lock_key(&id), t0).unwrap();

        // Before expiry: held by other.
        let err = locks.acquire(&req, t0 + 30).unwrap_err();
        assert!(matches!(err, LockError::HeldByOther { since } if since == t0));

        // After expiry: stolen.
        let lock = locks.acquire(&req, t0 + 61).unwrap();
        locks.release(lock, t0 + 61).unwrap();

        // Release cleared the held entry and recorded the actuation.
        assert_eq!(locks.read_time(&lock_key(&id)).unwrap(), 0);
        assert_eq!(locks.read_time(&last_key(&id)).unwrap(), t0 + 61);
    }

    #[test]
    fn test_crash_leaves_stealable_entry() {
        let (_dir, reg) = service();
        let locks = LockService::open(&reg).unwrap();
        let attrs = Vec::new();
        let req = request(&attrs);
        let id = lock_id(
            req.namespace,
            req.bundle,
            req.promise_type,
            req.promiser,
            req.attributes,
        );

        let now = 4_000_000;
        let lock = locks.acquire(&req, now).unwrap();
        // Drop without release: the lock entry survives for the next caller.
        drop(lock);
        assert_eq!(locks.read_time(&lock_key(&id)).unwrap(), now);
    }
}
