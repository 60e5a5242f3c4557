//! Advisory file locks scoped to a single file handle.
//!
//! `FileLock` owns the handle it locks. Dropping the guard (or calling
//! [`FileLock::release`]) unlocks and closes it, so the lock is released on
//! every exit path.

use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Result, SoloError};

/// How a lock should be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMode {
    pub exclusive: bool,
    pub blocking: bool,
}

impl LockMode {
    pub const EXCLUSIVE_NONBLOCKING: Self = Self {
        exclusive: true,
        blocking: false,
    };
    pub const SHARED_NONBLOCKING: Self = Self {
        exclusive: false,
        blocking: false,
    };
}

#[derive(Debug)]
pub struct FileLock {
    file: Option<File>,
    path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// Lock `file`. Non-blocking attempts that lose against another holder
    /// return [`SoloError::Locked`]; any other OS failure is
    /// [`SoloError::Locking`].
    pub fn acquire(file: File, path: &Path, mode: LockMode) -> Result<Self> {
        let outcome = match (mode.exclusive, mode.blocking) {
            (true, true) => FileExt::lock_exclusive(&file),
            (true, false) => FileExt::try_lock_exclusive(&file),
            (false, true) => FileExt::lock_shared(&file),
            (false, false) => FileExt::try_lock_shared(&file),
        };
        match outcome {
            Ok(()) => Ok(Self {
                file: Some(file),
                path: path.to_path_buf(),
                mode,
            }),
            Err(e) if is_contention(&e) => Err(SoloError::Locked(path.to_path_buf())),
            Err(source) => Err(SoloError::Locking {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// The locked handle, `None` once released.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    /// Unlock and close the handle. Calling this again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        FileExt::unlock(&file).map_err(|source| SoloError::Unlocking {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("{e}");
        }
    }
}

fn is_contention(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open(path: &Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn exclusive_lock_excludes_second_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let mut held =
            FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
        let err =
            FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap_err();
        assert!(err.is_contended());
        let err = FileLock::acquire(open(&path), &path, LockMode::SHARED_NONBLOCKING).unwrap_err();
        assert!(err.is_contended());

        held.release().unwrap();
        FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
    }

    #[test]
    fn shared_locks_coexist_but_exclude_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let _a = FileLock::acquire(open(&path), &path, LockMode::SHARED_NONBLOCKING).unwrap();
        let _b = FileLock::acquire(open(&path), &path, LockMode::SHARED_NONBLOCKING).unwrap();
        let err =
            FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap_err();
        assert_eq!(err.code(), "locked");
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let mut lock =
            FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held());
        assert!(lock.file().is_none());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.lock");

        {
            let _lock =
                FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
        }
        FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.lock");

        let held = FileLock::acquire(open(&path), &path, LockMode::EXCLUSIVE_NONBLOCKING).unwrap();
        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let mode = LockMode {
                exclusive: true,
                blocking: true,
            };
            FileLock::acquire(open(&waiter_path), &waiter_path, mode).map(|_| ())
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(held);
        waiter.join().unwrap().unwrap();
    }
}
