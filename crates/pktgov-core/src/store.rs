//! Atomic file replacement and advisory locking.
//!
//! Every durable write in the system goes through [`atomic_write_json`]:
//! write to a temp sibling, fsync, rename over the target, fsync the parent
//! directory. A partially written target is therefore never observable;
//! the file is either absent or complete.
//!
//! Mutation is serialized through [`DirLock`], an OS-advisory exclusive
//! lock on a `.lock` file. The lock is released on all exit paths:
//! explicitly on drop, and by the OS if the holder dies.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{GovernanceError, Result};

/// Retry attempts for transient I/O failures per write phase.
const IO_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for the exponential I/O retry backoff.
const IO_RETRY_BASE: Duration = Duration::from_millis(20);

/// Lock acquisition attempts before escalating to `ConcurrencyConflict`.
const LOCK_RETRY_ATTEMPTS: u32 = 200;

/// Poll interval between lock acquisition attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A held exclusive advisory lock.
///
/// Dropping the guard releases the lock. The lock file itself is left in
/// place; only the `flock` is released, so a crashed holder never leaves a
/// lock that survives its process.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquires an exclusive lock on `lock_path`, creating the file if
    /// needed. Retries with a fixed poll interval up to the retry budget.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` when the budget is exhausted, or `Io`
    /// when the lock file cannot be opened.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GovernanceError::io(parent.display().to_string(), false, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| GovernanceError::io(lock_path.display().to_string(), false, e))?;

        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                    });
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if attempt + 1 < LOCK_RETRY_ATTEMPTS {
                        std::thread::sleep(LOCK_RETRY_INTERVAL);
                    }
                },
                Err(e) => {
                    return Err(GovernanceError::io(lock_path.display().to_string(), false, e));
                },
            }
        }
        Err(GovernanceError::ConcurrencyConflict {
            path: lock_path.display().to_string(),
        })
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Errors on unlock are unrecoverable here; the OS drops the lock
        // with the file handle regardless.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Classifies an I/O error as transient (worth retrying) or fatal.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Runs a write phase with bounded exponential backoff on transient errors.
fn with_io_retries<T>(
    path: &Path,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let mut delay = IO_RETRY_BASE;
    let mut last_err: Option<io::Error> = None;
    for attempt in 0..IO_RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < IO_RETRY_ATTEMPTS => {
                tracing::debug!(
                    path = %path.display(),
                    attempt,
                    error = %e,
                    "transient I/O failure, retrying"
                );
                std::thread::sleep(delay);
                delay *= 2;
                last_err = Some(e);
            },
            Err(e) => {
                let transient = is_transient(&e);
                return Err(GovernanceError::io(path.display().to_string(), transient, e));
            },
        }
    }
    let err = last_err.unwrap_or_else(|| io::Error::other("retry budget exhausted"));
    Err(GovernanceError::io(path.display().to_string(), true, err))
}

/// Fsyncs the parent directory of `path` so a rename is durable.
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("path has no parent"))?;
    File::open(parent)?.sync_all()
}

/// Writes bytes atomically: temp sibling, fsync, rename, fsync parent.
///
/// # Errors
///
/// Returns `Io` after exhausting the transient retry budget.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        GovernanceError::io(
            path.display().to_string(),
            false,
            io::Error::other("path has no parent"),
        )
    })?;
    with_io_retries(path, || fs::create_dir_all(parent))?;
    with_io_retries(path, || {
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        sync_parent_dir(path)
    })
}

/// Serializes `value` as pretty JSON (trailing newline) and writes it
/// atomically.
///
/// The on-disk form is for humans; hashing always goes through the
/// canonical serializer, never through these bytes.
///
/// # Errors
///
/// Returns `Io` on write failure or `SchemaInvalid` if the value cannot be
/// serialized.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body =
        serde_json::to_vec_pretty(value).map_err(|e| GovernanceError::SchemaInvalid {
            message: format!("cannot serialize {}: {e}", path.display()),
        })?;
    body.push(b'\n');
    atomic_write_bytes(path, &body)
}

/// Reads and deserializes a JSON document, returning `None` if the file
/// does not exist.
///
/// # Errors
///
/// Returns `Io` on read failure or `SchemaInvalid` on malformed content.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GovernanceError::io(path.display().to_string(), false, e)),
    };
    let value = serde_json::from_slice(&body).map_err(|e| GovernanceError::SchemaInvalid {
        message: format!("malformed JSON in {}: {e}", path.display()),
    })?;
    Ok(Some(value))
}

/// Reads and deserializes a JSON document that must exist.
///
/// # Errors
///
/// Returns `NotFound` if absent, `Io` or `SchemaInvalid` otherwise.
pub fn read_json<T: DeserializeOwned>(path: &Path, kind: &'static str) -> Result<T> {
    read_json_opt(path)?.ok_or_else(|| GovernanceError::NotFound {
        kind,
        id: path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &serde_json::json!({"a": 1})).unwrap();
        let value: serde_json::Value = read_json(&path, "doc").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &serde_json::json!({"v": 1})).unwrap();
        atomic_write_json(&path, &serde_json::json!({"v": 2})).unwrap();
        let value: serde_json::Value = read_json(&path, "doc").unwrap();
        assert_eq!(value["v"], 2);
    }

    #[test]
    fn test_read_json_opt_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        let value: Option<serde_json::Value> = read_json_opt(&path).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_read_json_malformed_is_schema_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        let result: Result<serde_json::Value> = read_json(&path, "doc");
        assert!(matches!(
            result,
            Err(GovernanceError::SchemaInvalid { .. })
        ));
    }

    #[test]
    fn test_lock_exclusion_within_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join(".lock");
        let _held = DirLock::acquire(&lock_path).unwrap();
        // A second handle in the same process: flock is per-open-file, so
        // a fresh open must block. We only verify the non-blocking probe.
        let probe = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .unwrap();
        assert!(matches!(
            probe.try_lock_exclusive(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        ));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join(".lock");
        drop(DirLock::acquire(&lock_path).unwrap());
        let reacquired = DirLock::acquire(&lock_path).unwrap();
        assert_eq!(reacquired.path(), lock_path);
    }
}
