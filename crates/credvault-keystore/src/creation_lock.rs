//! Cross-process lock serializing first-time device key creation.
//!
//! The keyring is last-writer-wins, so two processes racing through
//! "read, miss, generate, write" would each keep a different key under one
//! alias. Holding an exclusive file lock around the re-read and write makes
//! the second process observe the first one's key instead.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use crate::key_provider::KeyError;

/// Exclusive lock backed by a file (`flock` on Unix, `LockFileEx` on Windows).
#[derive(Debug, Clone)]
pub struct CreationLock {
    path: PathBuf,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct CreationGuard {
    file: File,
}

impl CreationLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held.
    pub fn acquire(&self) -> Result<CreationGuard, KeyError> {
        let file = self.open()?;
        file.lock().map_err(|e| lock_err(&self.path, e))?;
        Ok(CreationGuard { file })
    }

    /// Take the lock if nobody else holds it.
    pub fn try_acquire(&self) -> Result<Option<CreationGuard>, KeyError> {
        let file = self.open()?;
        match file.try_lock() {
            Ok(()) => Ok(Some(CreationGuard { file })),
            Err(fs::TryLockError::WouldBlock) => Ok(None),
            Err(fs::TryLockError::Error(e)) => Err(lock_err(&self.path, e)),
        }
    }

    fn open(&self) -> Result<File, KeyError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| lock_err(&self.path, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| lock_err(&self.path, e))
    }
}

impl Drop for CreationGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_err(path: &Path, err: std::io::Error) -> KeyError {
    KeyError::Unavailable(format!("key creation lock {}: {err}", path.display()))
}
