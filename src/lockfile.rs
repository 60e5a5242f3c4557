//! Per-identity instance lock files.
//!
//! A lock file lists the `(pid, port)` records of every running instance that
//! claims an application identity. Bookkeeping here is advisory: I/O failures
//! are logged and never abort the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::lock::{FileLock, LockMode};
use crate::record::{self, LockRecord};

const REOPEN_ATTEMPTS: usize = 3;

/// How the underlying file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read and append, creating the file when absent.
    Append,
    /// Read an existing file.
    Read,
    /// Read and write an existing file.
    ReadWrite,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            Self::Append => options.read(true).append(true).create(true),
            Self::Read => options.read(true),
            Self::ReadWrite => options.read(true).write(true),
        };
        options
    }
}

/// Result of [`InstanceLockFile::rewrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewritten {
    /// The file now holds this many records.
    Updated(usize),
    /// No records were left; the file was deleted and the lock released.
    Removed,
}

#[derive(Debug)]
pub struct InstanceLockFile {
    path: PathBuf,
    open_mode: OpenMode,
    lock_mode: LockMode,
    lock: Option<FileLock>,
}

impl InstanceLockFile {
    /// Open `path` and lock it. `None` means the file could not be opened or
    /// locked; contention is the expected case and is not logged as a
    /// warning.
    pub fn open(path: &Path, open_mode: OpenMode, exclusive: bool, blocking: bool) -> Option<Self> {
        let mut lockfile = Self {
            path: path.to_path_buf(),
            open_mode,
            lock_mode: LockMode {
                exclusive,
                blocking,
            },
            lock: None,
        };
        lockfile.relock().then_some(lockfile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(FileLock::is_held)
    }

    /// Reopen the file with the same modes and take the lock again.
    /// Returns whether the lock is now held.
    pub fn relock(&mut self) -> bool {
        if self.is_locked() {
            return true;
        }
        if let Some(parent) = self.path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            log::warn!("could not create lock directory {}: {e}", parent.display());
            return false;
        }
        for _ in 0..REOPEN_ATTEMPTS {
            let file = match self.open_mode.options().open(&self.path) {
                Ok(file) => file,
                Err(e) => {
                    if self.open_mode == OpenMode::Append || e.kind() != io::ErrorKind::NotFound {
                        log::warn!("could not open lockfile {}: {e}", self.path.display());
                    }
                    return false;
                }
            };
            let lock = match FileLock::acquire(file, &self.path, self.lock_mode) {
                Ok(lock) => lock,
                Err(e) if e.is_contended() => {
                    log::debug!("{e}");
                    return false;
                }
                Err(e) => {
                    log::warn!("{e}");
                    return false;
                }
            };
            // The previous holder may have deleted the file while we waited,
            // leaving us with a lock nobody else can see.
            if lock.file().is_some_and(|file| is_current(file, &self.path)) {
                self.lock = Some(lock);
                return true;
            }
            log::debug!("lockfile {} was replaced, reopening", self.path.display());
        }
        false
    }

    /// Close the handle and release the lock. Safe to call repeatedly.
    pub fn unlock(&mut self) {
        if let Some(mut lock) = self.lock.take()
            && let Err(e) = lock.release()
        {
            log::warn!("{e}");
        }
    }

    fn file(&mut self) -> Option<&mut File> {
        self.lock.as_mut().and_then(FileLock::file_mut)
    }

    /// All records in the file, in order. Unreadable files yield no records.
    pub fn read_records(&mut self) -> Vec<LockRecord> {
        self.try_read_records().unwrap_or_else(|e| {
            log::warn!("could not read lockfile {}: {e}", self.path.display());
            Vec::new()
        })
    }

    pub fn try_read_records(&mut self) -> io::Result<Vec<LockRecord>> {
        let path = self.path.clone();
        let Some(file) = self.file() else {
            return Err(io::Error::other("lock not held"));
        };
        let mut contents = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut contents)?;
        Ok(record::parse_records(&path, &contents))
    }

    /// Replace the contents with the non-empty `records`. When none remain,
    /// release the lock and delete the file instead of leaving it empty.
    pub fn rewrite(&mut self, records: &[LockRecord]) -> Rewritten {
        let kept: Vec<LockRecord> = records.iter().copied().filter(|r| !r.is_empty()).collect();
        if kept.is_empty() {
            // Unlink before unlocking so no waiter can lock the removed inode
            // and then see the path as its own.
            if let Err(e) = fs::remove_file(&self.path)
                && e.kind() != io::ErrorKind::NotFound
            {
                log::warn!("could not remove lockfile {}: {e}", self.path.display());
            }
            self.unlock();
            return Rewritten::Removed;
        }

        let path = self.path.clone();
        let contents = record::render_records(&kept);
        if let Some(file) = self.file() {
            let written = file
                .set_len(0)
                .and_then(|_| file.seek(SeekFrom::Start(0)))
                .and_then(|_| file.write_all(contents.as_bytes()))
                .and_then(|_| file.flush());
            if let Err(e) = written {
                log::warn!("could not update lockfile {}: {e}", path.display());
            }
        }
        Rewritten::Updated(kept.len())
    }

    /// Clear the file without deleting it.
    pub fn truncate(&mut self) {
        let path = self.path.clone();
        if let Some(file) = self.file()
            && let Err(e) = file.set_len(0).and_then(|_| file.seek(SeekFrom::Start(0)))
        {
            log::warn!("could not truncate lockfile {}: {e}", path.display());
        }
    }

    /// Append one line.
    pub fn write(&mut self, payload: &str) {
        let path = self.path.clone();
        if let Some(file) = self.file() {
            let written = file
                .seek(SeekFrom::End(0))
                .and_then(|_| file.write_all(format!("{payload}\n").as_bytes()))
                .and_then(|_| file.flush());
            if let Err(e) = written {
                log::warn!("could not write to lockfile {}: {e}", path.display());
            }
        }
    }
}

/// Whether `file` is still the file found at `path`.
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

/// Open files cannot be deleted on this platform.
#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> bool {
    path.is_file()
}
