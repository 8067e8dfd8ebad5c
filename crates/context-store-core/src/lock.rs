//! Two-level mutual exclusion: an in-process mutex per application, then an
//! OS-level lock scoped to the file being rewritten.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;
use ulid::Ulid;

use crate::config::{LockConfig, LockStrategy};
use crate::error::{ContextError, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const CAPABILITY_FILE: &str = ".lock-capability";

/// A lock usable by unrelated processes on the same machine.
pub trait CrossProcessLock: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Make a single non-blocking attempt to lock `target`.
    ///
    /// # Errors
    /// Returns an error when the attempt fails for a reason other than contention.
    fn try_acquire(&self, target: &Path) -> Result<Option<LockGuard>>;
}

#[derive(Debug)]
enum Held {
    Dir,
    File(File),
    Marker,
}

/// Releases the held lock on drop.
#[derive(Debug)]
pub struct LockGuard {
    held: Held,
    path: PathBuf,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let released = match &self.held {
            Held::Dir => fs::remove_dir(&self.path),
            Held::File(file) => FileExt::unlock(file),
            Held::Marker => fs::remove_file(&self.path),
        };
        if let Err(err) = released {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

/// `mkdir` mutex on `<stem>.lockdir`: directory creation succeeds for exactly one caller.
///
/// Used where readers may hold the target open, since nothing is opened on the target itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirMutexLock;

impl CrossProcessLock for DirMutexLock {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn try_acquire(&self, target: &Path) -> Result<Option<LockGuard>> {
        let path = target.with_extension("lockdir");
        match fs::create_dir(&path) {
            Ok(()) => Ok(Some(LockGuard { held: Held::Dir, path })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(ContextError::io(path, err)),
        }
    }
}

/// Exclusive advisory lock on the sibling `<file>.lock`.
///
/// The sibling keeps a stable identity while the target itself is replaced by
/// rename. Filesystems without advisory locking fall back to exclusive creation
/// of `<file>.lck`, removed on release.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvisoryFileLock;

impl CrossProcessLock for AdvisoryFileLock {
    fn name(&self) -> &'static str {
        "file"
    }

    fn try_acquire(&self, target: &Path) -> Result<Option<LockGuard>> {
        let path = sibling(target, "lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| ContextError::io(&path, err))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard { held: Held::File(file), path })),
            Err(err) if is_contention(&err) => Ok(None),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "advisory lock unsupported; using marker file");
                try_marker(&sibling(target, "lck"))
            }
        }
    }
}

fn try_marker(path: &Path) -> Result<Option<LockGuard>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            // Owner pid helps when clearing a marker left by a crashed process.
            let _ = writeln!(file, "{}", std::process::id());
            Ok(Some(LockGuard { held: Held::Marker, path: path.to_path_buf() }))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(ContextError::io(path, err)),
    }
}

fn is_contention(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = target.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    target.with_file_name(name)
}

/// Pick the backend for `strategy`, probing `dir` when asked to detect.
#[must_use]
pub fn select_backend(strategy: LockStrategy, dir: &Path) -> Box<dyn CrossProcessLock> {
    match strategy {
        LockStrategy::DirMutex => Box::new(DirMutexLock),
        LockStrategy::AdvisoryFile => Box::new(AdvisoryFileLock),
        LockStrategy::Auto if cfg!(windows) => Box::new(DirMutexLock),
        LockStrategy::Auto => {
            if advisory_locks_supported(dir) {
                Box::new(AdvisoryFileLock)
            } else {
                Box::new(DirMutexLock)
            }
        }
    }
}

fn advisory_locks_supported(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    // Unique per check so concurrent starters never contend on it.
    let scratch = dir.join(format!("{CAPABILITY_FILE}.{}.{}", std::process::id(), Ulid::new()));
    let supported = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&scratch)
        .and_then(|file| {
            file.try_lock_exclusive()?;
            FileExt::unlock(&file)
        })
        .is_ok();
    let _ = fs::remove_file(&scratch);
    supported
}

/// Retry `lock` on `target` with exponential backoff until it succeeds, the
/// retry budget is spent, or the timeout elapses.
///
/// # Errors
/// Returns [`ContextError::LockTimeout`] when the lock is not acquired in budget.
pub fn acquire(lock: &dyn CrossProcessLock, target: &Path, config: &LockConfig) -> Result<LockGuard> {
    let deadline = Instant::now().checked_add(config.timeout);
    let max_attempts = config.max_retries.max(1);
    let mut attempts = 0;
    while attempts < max_attempts {
        attempts += 1;
        if let Some(guard) = lock.try_acquire(target)? {
            return Ok(guard);
        }
        let remaining = deadline.map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(Instant::now()));
        if attempts == max_attempts || remaining.is_zero() {
            break;
        }
        let backoff = BACKOFF_BASE.saturating_mul(1 << (attempts - 1).min(16)).min(BACKOFF_MAX);
        thread::sleep(backoff.min(remaining));
    }
    tracing::warn!(path = %target.display(), attempts, backend = lock.name(), "lock acquisition timed out");
    Err(ContextError::LockTimeout { path: target.to_path_buf(), attempts })
}

/// Serializes writers per application within this process, then across processes.
#[derive(Debug)]
pub struct LockManager {
    backend: Box<dyn CrossProcessLock>,
    config: LockConfig,
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    #[must_use]
    pub fn new(config: LockConfig, lock_dir: &Path) -> Self {
        let backend = select_backend(config.strategy, lock_dir);
        tracing::debug!(backend = backend.name(), "selected cross-process lock backend");
        Self::with_backend(config, backend)
    }

    #[must_use]
    pub fn with_backend(config: LockConfig, backend: Box<dyn CrossProcessLock>) -> Self {
        Self { backend, config, app_locks: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Run `work` while holding the in-process lock for `app` and the
    /// cross-process lock for `target`. Calls must not nest for the same app.
    ///
    /// # Errors
    /// Returns [`ContextError::LockTimeout`] when either lock is not acquired in
    /// time, or whatever `work` returns.
    pub fn with_lock<R>(&self, app: &str, target: &Path, work: impl FnOnce() -> Result<R>) -> Result<R> {
        let app_lock = {
            let mut locks = self.app_locks.lock();
            Arc::clone(locks.entry(app.to_string()).or_default())
        };
        let Some(_thread_guard) = app_lock.try_lock_for(self.config.timeout) else {
            tracing::warn!(app, path = %target.display(), "in-process app lock timed out");
            return Err(ContextError::LockTimeout { path: target.to_path_buf(), attempts: 1 });
        };
        let _process_guard = acquire(self.backend.as_ref(), target, &self.config)?;
        work()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use ulid::Ulid;

    use super::*;

    fn temp_dir(prefix: &str) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("{prefix}-{}", Ulid::new()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn quick(max_retries: u32) -> LockConfig {
        LockConfig { timeout: Duration::from_millis(200), max_retries, strategy: LockStrategy::Auto }
    }

    #[test]
    fn dir_mutex_is_exclusive_and_released_on_drop() -> Result<()> {
        let dir = temp_dir("ctx-lockdir")?;
        let target = dir.join("state.json");
        let lock = DirMutexLock;

        let guard = lock.try_acquire(&target)?.ok_or_else(|| anyhow!("first acquire should succeed"))?;
        assert!(dir.join("state.lockdir").is_dir());
        assert!(lock.try_acquire(&target)?.is_none());
        drop(guard);
        assert!(!dir.join("state.lockdir").exists());
        assert!(lock.try_acquire(&target)?.is_some());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn advisory_lock_uses_sibling_file() -> Result<()> {
        let dir = temp_dir("ctx-flock")?;
        let target = dir.join("state.json");
        let lock = AdvisoryFileLock;

        let guard = lock.try_acquire(&target)?.ok_or_else(|| anyhow!("first acquire should succeed"))?;
        assert_eq!(guard.path(), dir.join("state.json.lock"));
        assert!(lock.try_acquire(&target)?.is_none());
        drop(guard);
        assert!(lock.try_acquire(&target)?.is_some());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn exhausted_retries_raise_lock_timeout() -> Result<()> {
        let dir = temp_dir("ctx-timeout")?;
        let target = dir.join("state.json");
        let held = DirMutexLock.try_acquire(&target)?;

        let err = acquire(&DirMutexLock, &target, &quick(3));
        match err {
            Err(ContextError::LockTimeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => return Err(anyhow!("expected lock timeout, got {other:?}")),
        }

        drop(held);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn unbounded_timeout_is_limited_by_retries() -> Result<()> {
        let dir = temp_dir("ctx-timeout-max")?;
        let target = dir.join("state.json");
        let held = DirMutexLock.try_acquire(&target)?;

        let config = LockConfig { timeout: Duration::MAX, max_retries: 2, strategy: LockStrategy::DirMutex };
        match acquire(&DirMutexLock, &target, &config) {
            Err(ContextError::LockTimeout { attempts, .. }) => assert_eq!(attempts, 2),
            other => return Err(anyhow!("expected lock timeout, got {other:?}")),
        }

        drop(held);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn with_lock_serializes_threads_of_one_app() -> Result<()> {
        let dir = temp_dir("ctx-threads")?;
        let manager = Arc::new(LockManager::new(
            LockConfig { timeout: Duration::from_secs(10), max_retries: 50, strategy: LockStrategy::Auto },
            &dir,
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let target = dir.join("state.json");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            let target = target.clone();
            handles.push(thread::spawn(move || -> crate::error::Result<bool> {
                let mut overlapped = false;
                for _ in 0..10 {
                    manager.with_lock("app", &target, || {
                        overlapped |= inside.fetch_add(1, Ordering::SeqCst) != 0;
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })?;
                }
                Ok(overlapped)
            }));
        }
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("lock thread panicked"));
            };
            assert!(!result?);
        }

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
