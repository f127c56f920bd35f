//! One in-flight pipeline operation per repository.
//!
//! The lock file lives outside the repository
//! (`$TMPDIR/selfpatch-locks/<hash>.lock`) so taking it never dirties the
//! working tree. Released on drop.

use crate::util::hash_str;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const LOCK_DIR: &str = "selfpatch-locks";
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another selfpatch operation is running on {repo} (lock {lock})")]
    Busy { repo: String, lock: String },
    #[error("failed to take repository lock: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    pub fn lock_path(repo_root: &Path) -> PathBuf {
        let key = repo_root
            .canonicalize()
            .unwrap_or_else(|_| repo_root.to_path_buf());
        std::env::temp_dir()
            .join(LOCK_DIR)
            .join(format!("{}.lock", hash_str(&key.to_string_lossy())))
    }

    /// Take the lock, waiting up to `wait` for a concurrent holder.
    pub fn acquire(repo_root: &Path, wait: Duration) -> Result<Self, LockError> {
        let (file, path) = Self::open(repo_root)?;
        let start = Instant::now();
        while !try_take(&file)? {
            if start.elapsed() >= wait {
                return Err(busy(repo_root, &path));
            }
            std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
        }
        tracing::debug!(lock = %path.display(), "repository lock acquired");
        Ok(Self { file, path })
    }

    /// Same as [`RepoLock::acquire`], but waits on the tokio timer so a
    /// contended lock does not park a runtime worker.
    pub async fn acquire_async(repo_root: &Path, wait: Duration) -> Result<Self, LockError> {
        let (file, path) = Self::open(repo_root)?;
        let start = Instant::now();
        while !try_take(&file)? {
            if start.elapsed() >= wait {
                return Err(busy(repo_root, &path));
            }
            tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)).await;
        }
        tracing::debug!(lock = %path.display(), "repository lock acquired");
        Ok(Self { file, path })
    }

    fn open(repo_root: &Path) -> Result<(File, PathBuf), LockError> {
        let path = Self::lock_path(repo_root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// `Ok(false)` when someone else holds the lock.
fn try_take(file: &File) -> Result<bool, LockError> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::WouldBlock || is_contended(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn busy(repo_root: &Path, path: &Path) -> LockError {
    LockError::Busy {
        repo: repo_root.display().to_string(),
        lock: path.display().to_string(),
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
