//! Terminal access guard
//!
//! The terminal is a single-reader, single-writer device: frames from two
//! logical operations must never interleave. [`TerminalGuard`] serializes
//! callers within the process and, when given a lock file, across processes.
//! Acquisition is always bounded so an interactive caller gets a prompt
//! [`SigmaError::Busy`] instead of queueing behind a customer's purchase.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::protocol::SigmaError;

/// Poll interval while waiting on a lock file held by another process
const LOCK_FILE_POLL: Duration = Duration::from_millis(10);

/// Serializes access to one terminal
#[derive(Debug, Default)]
pub struct TerminalGuard {
    held: Mutex<bool>,
    released: Condvar,
    lock_file: Option<PathBuf>,
}

/// Proof of exclusive access; released on drop
#[derive(Debug)]
pub struct GuardToken<'a> {
    guard: &'a TerminalGuard,
    file: Option<LockFile>,
}

impl TerminalGuard {
    /// In-process guard only
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard that also takes an exclusive lock on `path`
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            lock_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Lock file in use, if any
    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    /// Whether some caller in this process holds the guard
    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the guard, waiting at most `timeout`
    pub fn acquire(&self, timeout: Duration) -> Result<GuardToken<'_>, SigmaError> {
        let start = Instant::now();
        let deadline = start + timeout;

        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            while *held {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    tracing::debug!("terminal guard busy after {:?}", start.elapsed());
                    return Err(SigmaError::Busy {
                        waited: start.elapsed(),
                    });
                }
                held = self
                    .released
                    .wait_timeout(held, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            *held = true;
        }

        let file = match &self.lock_file {
            Some(path) => match LockFile::acquire(path, start, deadline) {
                Ok(file) => Some(file),
                Err(e) => {
                    self.release();
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(GuardToken {
            guard: self,
            file,
        })
    }

    /// Acquire only if nobody holds the guard right now
    pub fn try_acquire(&self) -> Result<GuardToken<'_>, SigmaError> {
        self.acquire(Duration::ZERO)
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.released.notify_one();
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        // Cross-process lock goes first so an in-process waiter never finds it taken
        drop(self.file.take());
        self.guard.release();
    }
}

/// Exclusive advisory lock on a file
#[derive(Debug)]
struct LockFile {
    file: File,
}

impl LockFile {
    fn acquire(path: &Path, start: Instant, deadline: Instant) -> Result<Self, SigmaError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "lock file acquired");
                    return Ok(Self { file });
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!(path = %path.display(), "lock file held by another process");
                return Err(SigmaError::Busy {
                    waited: start.elapsed(),
                });
            }
            std::thread::sleep(remaining.min(LOCK_FILE_POLL));
        }
    }
}

/// Whether a failed lock attempt only means someone else holds the lock
fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("releasing lock file failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_release() {
        let guard = TerminalGuard::new();
        {
            let _token = guard.try_acquire().unwrap();
            assert!(guard.is_held());
            assert!(matches!(guard.try_acquire(), Err(SigmaError::Busy { .. })));
        }
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_ok());
    }

    #[test]
    fn test_busy_after_timeout() {
        let guard = TerminalGuard::new();
        let _token = guard.acquire(Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        match guard.acquire(Duration::from_millis(50)) {
            Err(SigmaError::Busy { waited }) => assert!(waited >= Duration::from_millis(50)),
            other => panic!("expected busy, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let guard = Arc::new(TerminalGuard::new());
        let token = guard.acquire(Duration::ZERO).unwrap();

        let waiter = {
            let guard = Arc::clone(&guard);
            std::thread::spawn(move || guard.acquire(Duration::from_secs(5)).map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(token);

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_lock_file_excludes_other_guards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigma.lock");

        // Two guards stand in for two processes sharing one lock file
        let first = TerminalGuard::with_lock_file(&path);
        let second = TerminalGuard::with_lock_file(&path);

        let token = first.acquire(Duration::ZERO).unwrap();
        assert!(matches!(
            second.acquire(Duration::from_millis(30)),
            Err(SigmaError::Busy { .. })
        ));
        assert!(!second.is_held());

        drop(token);
        assert!(second.acquire(Duration::from_millis(30)).is_ok());
    }

    #[test]
    fn test_waits_on_lock_held_outside_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigma.lock");
        let other = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .unwrap();
        FileExt::lock_exclusive(&other).unwrap();

        let guard = TerminalGuard::with_lock_file(&path);
        assert!(matches!(
            guard.acquire(Duration::from_millis(30)),
            Err(SigmaError::Busy { .. })
        ));
        assert!(!guard.is_held());

        FileExt::unlock(&other).unwrap();
        let token = guard.acquire(Duration::from_millis(30)).unwrap();
        assert!(guard.is_held());
        drop(token);
        assert!(FileExt::try_lock_exclusive(&other).is_ok());
    }
}
